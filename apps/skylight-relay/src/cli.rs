use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use skylight_proto::{ClientMessage, PeerRole, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "skylight-relay")]
#[command(about = "Skylight session broker and relay probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a relay room and tail its traffic
    Probe {
        /// Relay base URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session id or room id to join
        #[arg(short, long)]
        room: String,

        /// Role to claim in the room
        #[arg(long, value_enum, default_value_t = ProbeRole::Controller)]
        role: ProbeRole,

        /// How long to keep listening after joining, in seconds
        #[arg(long, default_value_t = 30)]
        watch: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ProbeRole {
    Owner,
    Controller,
}

impl From<ProbeRole> for PeerRole {
    fn from(role: ProbeRole) -> Self {
        match role {
            ProbeRole::Owner => PeerRole::Owner,
            ProbeRole::Controller => PeerRole::Controller,
        }
    }
}

pub async fn run_probe(url: String, room: String, role: PeerRole, watch: u64) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {} for room {}", ws_url, room);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinRoom {
        session_id_or_room: room.clone(),
        role,
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;

    let joined = timeout(Duration::from_secs(5), async {
        while let Some(message) = read.next().await {
            if let Message::Text(text) = message? {
                match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::RoomJoined {
                        room_id,
                        conn_id,
                        peers,
                        ..
                    } => {
                        println!(
                            "joined {} as {} ({} peer(s) already present)",
                            room_id,
                            conn_id,
                            peers.len()
                        );
                        return Ok::<_, anyhow::Error>(());
                    }
                    ServerMessage::Error { message } => {
                        return Err(anyhow::anyhow!("join failed: {message}"));
                    }
                    _ => {}
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before join completed"))
    })
    .await;

    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "timeout waiting for join acknowledgement - does the session exist?"
            ));
        }
    }

    let deadline = Instant::now() + Duration::from_secs(watch);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => print_event(&text),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => {
                eprintln!("socket error: {err}");
                break;
            }
            Ok(None) => {
                println!("relay closed the connection");
                break;
            }
            Err(_) => break,
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn print_event(text: &str) {
    let Ok(message) = serde_json::from_str::<ServerMessage>(text) else {
        println!("?? unrecognized frame: {text}");
        return;
    };
    match message {
        ServerMessage::UserJoined { conn_id, role } => {
            println!("-> {conn_id} joined as {role:?}");
        }
        ServerMessage::PeerLeft { conn_id } => {
            println!("<- {conn_id} left");
        }
        ServerMessage::Offer { from, .. } => println!("[{from}] offer"),
        ServerMessage::Answer { from, .. } => println!("[{from}] answer"),
        ServerMessage::IceCandidate { from, .. } => println!("[{from}] ice-candidate"),
        ServerMessage::ControlEvent { from, event } => {
            println!("[{from}] control {event:?}");
        }
        ServerMessage::QualityChange { from, quality } => {
            println!("[{from}] quality-change {quality}");
        }
        ServerMessage::ConnectionStats { from, stats } => {
            println!("[{from}] connection-stats {stats}");
        }
        ServerMessage::SessionEnded { from } => {
            println!("[{from}] session ended");
        }
        ServerMessage::Error { message } => eprintln!("relay error: {message}"),
        ServerMessage::RoomJoined { .. } => {}
    }
}
