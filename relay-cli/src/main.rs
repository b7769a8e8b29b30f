mod client;
mod decoder;

use anyhow::Result;
use clap::Parser;
use client::RelayClient;
use futures_util::StreamExt;
use relay_shared::{ChatMessage, MessageRole};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Chat with a language model through the relay server")]
struct Args {
    /// Base URL of the relay server
    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8000")]
    backend_url: String,
}

/// Conversation held on the caller's side; the server never remembers turns.
#[derive(Default)]
struct Session {
    messages: Vec<ChatMessage>,
}

impl Session {
    fn add_user_message(&mut self, content: String) {
        self.messages.push(ChatMessage::new(MessageRole::User, content));
    }

    fn add_assistant_message(&mut self, content: String) {
        if !content.is_empty() {
            self.messages.push(ChatMessage::new(MessageRole::Assistant, content));
        }
    }

    fn clear(&mut self) {
        self.messages.clear();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Log to a file so the conversation on stdout stays readable
    if let Ok(file) = std::fs::File::create("relay-cli.log") {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(file)
            .with_ansi(false)
            .init();
    }

    let client = RelayClient::new(args.backend_url);
    if !client.check_health().await {
        error!("Backend at {} is not healthy", client.base_url());
        anyhow::bail!("backend at {} is not reachable, is the server running?", client.base_url());
    }
    info!("Connected to backend at {}", client.base_url());

    println!("Connected to {}. Type a message, /clear to start over, /quit to exit.", client.base_url());

    let mut session = Session::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                session.clear();
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        session.add_user_message(input.to_string());

        let mut reply = String::new();
        let mut fragments = Box::pin(client.send(&session.messages));
        while let Some(fragment) = fragments.next().await {
            print!("{fragment}");
            stdout.flush()?;
            reply.push_str(&fragment);
        }
        println!();

        session.add_assistant_message(reply);
    }

    info!("Session ended after {} messages", session.messages.len());
    Ok(())
}
