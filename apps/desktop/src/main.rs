use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ChatClient, ClientEvent, Settings};
use shared::domain::UserId;
use storage::ClientStore;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Interlocutor to open after login.
    #[arg(long)]
    peer: Option<i64>,
    /// Message to send to the opened peer.
    #[arg(long)]
    message: Option<String>,
    /// How long to keep tailing incoming messages, in seconds.
    #[arg(long, default_value_t = 30)]
    tail_seconds: u64,
    #[arg(long, default_value = "sqlite://./data/client.db")]
    state_db: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let settings: Settings = load_settings();

    let store = ClientStore::new(&args.state_db).await?;
    let client = ChatClient::new(settings, Arc::new(store));

    let session = client.login(&args.username, &args.password).await?;
    println!(
        "Logged in as {} (user_id={})",
        session.username, session.user_id.0
    );

    client.load_chats().await?;
    println!("Conversations:");
    for entry in client.directory().entries().await {
        println!(
            "  [{}] {}{}",
            entry.interlocutor_id.0,
            entry.display_name,
            if entry.has_unread { " (unread)" } else { "" }
        );
    }

    let Some(peer) = args.peer.map(UserId) else {
        client.logout().await;
        return Ok(());
    };

    client.open_conversation(peer).await?;
    let history = client.history().items().await;
    println!("Last {} messages:", history.len());
    for message in history.iter().rev() {
        println!(
            "  {} [{}] {}",
            message.created_at.format("%H:%M"),
            message.sender_id.0,
            message.text
        );
    }

    if let Some(text) = &args.message {
        client.send_message(peer, text).await?;
        println!("Sent.");
    }

    let mut events = client.subscribe_events();
    let tail = tokio::time::sleep(Duration::from_secs(args.tail_seconds));
    tokio::pin!(tail);
    loop {
        tokio::select! {
            _ = &mut tail => break,
            event = events.recv() => match event {
                Ok(ClientEvent::MessageReceived { message }) => {
                    println!(
                        "  {} [{}] {}",
                        message.created_at.format("%H:%M"),
                        message.sender_id.0,
                        message.text
                    );
                }
                Ok(ClientEvent::UnreadChanged { interlocutor_id, has_unread: true }) => {
                    println!("  (new message from {})", interlocutor_id.0);
                }
                Ok(ClientEvent::SessionExpired) => {
                    println!("Session expired, exiting.");
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    client.logout().await;
    Ok(())
}
