//! Fitchat Client - command line chat
//!
//! Connects to the hub named by `FITCHAT_HUB_URL` with the token in
//! `FITCHAT_ACCESS_TOKEN`, joins the conversation given as the first
//! argument, prints incoming events and sends each stdin line.

use anyhow::Context;
use fitchat_client::{
    init_logging, logging::DEFAULT_FILTER, ChatConfig, ChatEventHandlers, ChatService,
    MessageType,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(DEFAULT_FILTER);

    let conversation_id = std::env::args()
        .nth(1)
        .context("usage: fitchat-client <conversation-id>")?;
    let config = ChatConfig::from_env()?;
    let service = ChatService::new(config);

    service.on_connection_state_change(|change| {
        println!("[{:?} -> {:?}]", change.previous, change.current);
    });
    service.set_event_handlers(
        ChatEventHandlers::new()
            .on_receive_message(|m| {
                println!("{} ({}): {}", m.sender_id, m.sender_role.as_str(), m.content);
                Ok(())
            })
            .on_user_online(|p| {
                println!("* {} is online", p.user_id);
                Ok(())
            })
            .on_user_offline(|p| {
                println!("* {} went offline", p.user_id);
                Ok(())
            })
            .on_user_typing(|t| {
                println!("* {} is typing", t.user_name.as_deref().unwrap_or(&t.user_id));
                Ok(())
            })
            .on_messages_read(|r| {
                println!("* {} read the conversation", r.user_id);
                Ok(())
            }),
    );

    service
        .start_with_token_provider(|| std::env::var("FITCHAT_ACCESS_TOKEN").ok())
        .await?;
    service.join_conversation(&conversation_id).await?;
    println!("joined {conversation_id}; type to send, ctrl-d to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = service
            .send_message(&conversation_id, line, MessageType::Text)
            .await
        {
            eprintln!("not sent: {e}");
        }
    }

    service.leave_conversation(&conversation_id).await;
    service.stop().await;
    Ok(())
}
