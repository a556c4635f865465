//! Talkback - spoken conversation with a remote dialogue backend
//!
//! Streams microphone audio to a transcription service, sends each finished
//! utterance with the conversation log to a dialogue service, and plays the
//! synthesized reply as it arrives.
//!
//! Controls (stdin): Enter toggles listening, `p` pauses, `r` resets the
//! conversation, `q` quits.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::io::Write;
use std::time::Duration;
use talkback::capture::CaptureState;
use talkback::connection::ChannelState;
use talkback::history::Role;
use talkback::{Command, Session, SessionConfig, SessionUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONNECT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting talkback");

    let config = SessionConfig::from_env().context("Failed to read configuration")?;
    info!("📡 Transcription: {}", config.transcription_url);
    info!("📡 Dialogue: {}", config.dialogue_url);

    let (session, mut updates) = Session::open_default(&config).context("Failed to open session")?;
    for message in session.history() {
        print_message(message.role, &message.content);
    }

    match tokio::time::timeout(CONNECT_WAIT, session.wait_ready()).await {
        Ok((ChannelState::Open, ChannelState::Open)) => info!("✅ Both channels open"),
        Ok((stt, dialogue)) => warn!("Channels not ready: transcription {:?}, dialogue {:?}", stt, dialogue),
        Err(_) => warn!("⏱️ Channels still connecting after {:?}", CONNECT_WAIT),
    }

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let session_task = tokio::spawn(session.run(commands_rx));

    // Print updates
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            render(update);
        }
    });

    println!("Press Enter to talk, p to pause, r to reset, q to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let command = match line.context("Failed to read stdin")? {
                    Some(line) => match line.trim() {
                        "" => Command::ToggleCapture,
                        "p" => Command::PauseCapture,
                        "r" => Command::Reset,
                        "q" => Command::Shutdown,
                        other => {
                            println!("Unknown command {:?}", other);
                            continue;
                        }
                    },
                    None => Command::Shutdown,
                };
                let quit = command == Command::Shutdown;
                if commands_tx.send(command).await.is_err() || quit {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                let _ = commands_tx.send(Command::Shutdown).await;
                break;
            }
        }
    }

    session_task.await.context("Session task failed")?;
    info!("Goodbye");
    Ok(())
}

fn render(update: SessionUpdate) {
    match update {
        SessionUpdate::Pending(Some(text)) => println!("… {}", text),
        SessionUpdate::Pending(None) => {}
        SessionUpdate::Utterance(text) => {
            print_message(Role::User, &text);
            print!("🤖 ");
            let _ = std::io::stdout().flush();
        }
        SessionUpdate::ReplyChunk(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        SessionUpdate::Committed(message) => {
            // the reply text was already streamed; just end its line
            if message.role == Role::Assistant {
                println!();
            }
        }
        SessionUpdate::Capture(state) => match state {
            CaptureState::Starting => println!("🎤 Opening microphone…"),
            CaptureState::Recording => println!("🎤 Listening"),
            CaptureState::Paused => println!("⏸️ Paused"),
            CaptureState::Idle => println!("⏹️ Stopped"),
        },
        SessionUpdate::CaptureFailed(reason) => println!("❌ Microphone unavailable: {}", reason),
        SessionUpdate::ChannelDown { kind, state } => {
            warn!("{} channel {:?}", kind, state);
            let hint = if state == ChannelState::Errored {
                "could not reach the service"
            } else {
                "the service closed the connection"
            };
            println!("❌ {} channel down: {}. Restart to reconnect.", kind, hint);
        }
        SessionUpdate::HistoryCleared => println!("🧹 Conversation cleared"),
    }
}

fn print_message(role: Role, content: &str) {
    match role {
        Role::User => println!("🗣️ You: {}", content),
        Role::Assistant => println!("🤖 Assistant: {}", content),
    }
}
