//! Application state shared across request handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio::time::Instant;

use crate::config::HubConfig;
use crate::hub::Hub;

/// Outbox of one long-polling connection; the lock admits one poll at a time.
pub struct PollSession {
    queue: Mutex<mpsc::UnboundedReceiver<String>>,
    last_seen: std::sync::Mutex<Instant>,
}

impl PollSession {
    pub fn new(queue: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            queue: Mutex::new(queue),
            last_seen: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        match self.last_seen.lock() {
            Ok(mut last_seen) => *last_seen = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, mpsc::UnboundedReceiver<String>> {
        self.queue.lock().await
    }

    /// No poll in flight and no activity for `max_age`.
    fn is_stale(&self, max_age: Duration) -> bool {
        if self.queue.try_lock().is_err() {
            return false;
        }
        let last_seen = match self.last_seen.lock() {
            Ok(last_seen) => *last_seen,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last_seen.elapsed() >= max_age
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub hub: Arc<Hub>,
    /// Connection id -> session drained by `GET` polls.
    pub long_polls: Arc<RwLock<HashMap<String, Arc<PollSession>>>>,
}

impl AppState {
    pub fn new(config: HubConfig) -> Self {
        let hub = Hub::new(config.transports.clone(), config.keep_alive_interval);
        Self {
            config: Arc::new(config),
            hub: Arc::new(hub),
            long_polls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop unopened negotiations and long-poll sessions whose client went
    /// away without `DELETE`. Returns how many entries were removed.
    pub async fn reap_stale(&self) -> usize {
        let max_age = self.config.stale_after;
        let mut reaped = self.hub.reap_pending(max_age).await;

        let stale: Vec<String> = self
            .long_polls
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.is_stale(max_age))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.long_polls.write().await.remove(&id);
            self.hub.disconnect(&id).await;
            tracing::info!("Reaped idle long polling connection {}", id);
            reaped += 1;
        }
        reaped
    }

    /// Run [`AppState::reap_stale`] periodically until the task is aborted.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        let period = (self.config.stale_after / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                state.reap_stale().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Caller;
    use fitchat_shared::ParticipantRole;

    fn client() -> Caller {
        Caller {
            user_id: "client-1".to_string(),
            role: ParticipantRole::Client,
        }
    }

    async fn open_long_poll(state: &AppState) -> String {
        let negotiated = state.hub.negotiate(client()).await;
        let (id, outbox) = state
            .hub
            .connect(Some(&negotiated.connection_id), client())
            .await
            .expect("open");
        state
            .long_polls
            .write()
            .await
            .insert(id.clone(), Arc::new(PollSession::new(outbox)));
        id
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_long_poll_clients_are_reaped() {
        let state = AppState::new(HubConfig::default().with_stale_after(Duration::from_secs(60)));
        let abandoned = open_long_poll(&state).await;
        let active = open_long_poll(&state).await;
        state.hub.negotiate(client()).await;

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(state.reap_stale().await, 0);
        let session = state.long_polls.read().await.get(&active).cloned().expect("session");
        session.touch();

        tokio::time::advance(Duration::from_secs(30)).await;
        // The unopened negotiation and the silent session go; the touched one stays.
        assert_eq!(state.reap_stale().await, 2);
        assert!(state.hub.caller(&abandoned).await.is_none());
        assert!(state.hub.caller(&active).await.is_some());
        assert!(!state.long_polls.read().await.contains_key(&abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_in_flight_is_never_stale() {
        let state = AppState::new(HubConfig::default().with_stale_after(Duration::from_secs(1)));
        let id = open_long_poll(&state).await;
        let session = state.long_polls.read().await.get(&id).cloned().expect("session");

        let _poll = session.lock().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(state.reap_stale().await, 0);
        assert!(state.hub.caller(&id).await.is_some());
    }
}
