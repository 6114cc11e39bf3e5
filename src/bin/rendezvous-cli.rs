use std::error::Error;

use clap::Parser;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rendezvous::config::DEFAULT_PORT;
use rendezvous::hub::{BROADCAST, PeerId, RoomId, ServerMessage};
use serde_json::json;
use tokio::io::{self, AsyncBufReadExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Interactive client: joins a room, prints hub events, offers typed lines
#[derive(Parser)]
#[command(name = "rendezvous-cli")]
struct Args {
    /// Hub WebSocket URL
    #[arg(long, default_value_t = format!("ws://127.0.0.1:{DEFAULT_PORT}"))]
    url: String,

    /// Room to join (random if omitted)
    #[arg(long)]
    room: Option<String>,

    /// Peer id to join as (random if omitted)
    #[arg(long)]
    peer_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let url = args.url;
    let room = args.room.map(RoomId::from).unwrap_or_else(RoomId::generate);
    let peer_id = args.peer_id.map(PeerId::from).unwrap_or_else(PeerId::generate);

    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut ws_tx, ws_rx) = ws.split();
    println!("Connected to {} as {} in room {}", url, peer_id, room);

    let join = json!({ "type": "join-room", "room": room, "peerId": peer_id });
    ws_tx.send(Message::text(join.to_string())).await?;

    tokio::spawn(listen(ws_rx));

    println!("Type a line to offer it to the room, /to <peer> <text> for one peer, /leave to quit");
    let mut stdin = io::BufReader::new(io::stdin()).lines();
    while let Ok(Some(line)) = stdin.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg = if line == "/leave" {
            let leave = json!({ "type": "leave-room", "peerId": peer_id });
            ws_tx.send(Message::text(leave.to_string())).await?;
            break;
        } else if let Some(rest) = line.strip_prefix("/to ") {
            let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
            offer(&peer_id, &room, target, text)
        } else {
            offer(&peer_id, &room, BROADCAST, line)
        };
        ws_tx.send(Message::text(msg.to_string())).await?;
    }

    ws_tx.close().await?;
    Ok(())
}

fn offer(from: &PeerId, room: &RoomId, target: &str, text: &str) -> serde_json::Value {
    json!({
        "type": "offer",
        "fromPeer": from,
        "room": room,
        "targetPeer": target,
        "payload": text,
    })
}

async fn listen(mut ws_rx: WsReader) {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                eprintln!("Read error: {}", e);
                break;
            }
        };

        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::RoomJoined { peers, peer_count, .. }) => {
                println!("\n> joined, {} in room, others: {:?}", peer_count, peers);
            }
            Ok(ServerMessage::PeerJoined { peer_id, peer_count, .. }) => {
                println!("\n> {} joined ({} in room)", peer_id, peer_count);
            }
            Ok(ServerMessage::PeerLeft { peer_id, peer_count, .. }) => {
                println!("\n> {} left ({} in room)", peer_id, peer_count);
            }
            Ok(ServerMessage::Error { error, .. }) => println!("\n> error: {}", error),
            Ok(other) => println!("\n> {:?}", other),
            // relayed negotiation frames arrive exactly as the sender wrote them
            Err(_) => println!("\n> relay: {}", text.as_str()),
        }
    }
    println!("Hub closed the connection");
}
