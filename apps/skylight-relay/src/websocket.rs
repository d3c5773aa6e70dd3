//! WebSocket signaling relay.
//!
//! A room is the in-process multicast group for one session, keyed by the
//! session's room identifier. Membership is an owned record per
//! connection, created on `join-room` and removed on disconnect; nothing
//! here survives a restart. Delivery is best-effort, at-most-once: each
//! member gets an unbounded channel drained by its own writer task, which
//! preserves every sender's emission order per recipient.

use anyhow::{anyhow, bail, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use skylight_proto::{ClientMessage, PeerInfo, PeerRole, Permissions, ServerMessage};

use crate::session::SessionEngine;

/// A connection's place in a room, held by the relay for as long as the
/// connection stays joined. The permission set is copied from the session
/// at join time; it is immutable for the session's lifetime, so the copy
/// never goes stale.
#[derive(Clone)]
pub struct Membership {
    room_id: String,
    role: PeerRole,
    permissions: Permissions,
}

struct Member {
    role: PeerRole,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Relay-wide state: room membership maps plus the engine used to vet
/// joins. Rooms share nothing with each other.
#[derive(Clone)]
pub struct RelayState {
    rooms: Arc<DashMap<String, DashMap<String, Member>>>,
    engine: SessionEngine,
}

impl RelayState {
    pub fn new(engine: SessionEngine) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            engine,
        }
    }

    /// Handle one client message. An `Err` is reported back to the sender
    /// as an `error` event and never touches the rest of the room.
    async fn handle_message(
        &self,
        message: ClientMessage,
        conn_id: &str,
        membership: &mut Option<Membership>,
        tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<()> {
        match message {
            ClientMessage::JoinRoom {
                session_id_or_room,
                role,
            } => {
                if membership.is_some() {
                    bail!("already joined a room");
                }

                // One store read per join attempt; it runs in this
                // connection's task and cannot stall other rooms.
                let record = self
                    .engine
                    .resolve_room(&session_id_or_room)
                    .await
                    .map_err(|_| anyhow!("invalid session"))?;
                let valid = self
                    .engine
                    .is_valid(&record)
                    .await
                    .map_err(|err| anyhow!("session validation failed: {err}"))?;
                if !valid {
                    bail!("invalid session");
                }

                let peers: Vec<PeerInfo>;
                {
                    let room = self.rooms.entry(record.room_id.clone()).or_default();
                    peers = room
                        .iter()
                        .map(|entry| PeerInfo {
                            conn_id: entry.key().clone(),
                            role: entry.value().role,
                        })
                        .collect();
                    room.insert(
                        conn_id.to_string(),
                        Member {
                            role,
                            tx: tx.clone(),
                        },
                    );
                    // guard dropped here; broadcasts below re-lock the map
                }

                *membership = Some(Membership {
                    room_id: record.room_id.clone(),
                    role,
                    permissions: record.permissions,
                });

                debug!(
                    conn = %conn_id,
                    room = %record.room_id,
                    ?role,
                    "connection joined room"
                );

                tx.send(ServerMessage::RoomJoined {
                    room_id: record.room_id.clone(),
                    conn_id: conn_id.to_string(),
                    role,
                    peers,
                })?;

                self.broadcast_except(
                    &record.room_id,
                    conn_id,
                    ServerMessage::UserJoined {
                        conn_id: conn_id.to_string(),
                        role,
                    },
                );
            }

            ClientMessage::Offer { offer } => {
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::Offer {
                        offer,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::Answer { answer } => {
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::Answer {
                        answer,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::IceCandidate { candidate } => {
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::IceCandidate {
                        candidate,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::ControlEvent { event } => {
                let joined = require_joined(membership)?;
                if joined.role != PeerRole::Controller {
                    bail!("only the controller may send control events");
                }
                event
                    .validate()
                    .map_err(|err| anyhow!("malformed control event: {err}"))?;
                if !joined.permissions.allows(event.input_class()) {
                    bail!("control event not permitted for this session");
                }
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::ControlEvent {
                        event,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::QualityChange { quality } => {
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::QualityChange {
                        quality,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::ConnectionStats { stats } => {
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::ConnectionStats {
                        stats,
                        from: conn_id.to_string(),
                    },
                );
            }

            ClientMessage::EndSession => {
                // Tears the room down for the peers; the persisted record
                // is ended separately through the authorized HTTP call.
                let joined = require_joined(membership)?;
                self.broadcast_except(
                    &joined.room_id,
                    conn_id,
                    ServerMessage::SessionEnded {
                        from: conn_id.to_string(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Remove a connection's membership and tell the remaining members.
    fn disconnect(&self, membership: &Membership, conn_id: &str) {
        self.remove_member(&membership.room_id, conn_id);
        self.broadcast_except(
            &membership.room_id,
            conn_id,
            ServerMessage::PeerLeft {
                conn_id: conn_id.to_string(),
            },
        );
        debug!(conn = %conn_id, room = %membership.room_id, "connection left room");
    }

    fn remove_member(&self, room_id: &str, conn_id: &str) {
        let mut remove_room = false;
        if let Some(room) = self.rooms.get(room_id) {
            room.remove(conn_id);
            // decide outside the guard to avoid re-locking the shard
            remove_room = room.is_empty();
        }
        if remove_room {
            self.rooms.remove(room_id);
        }
    }

    fn broadcast_except(&self, room_id: &str, sender_id: &str, message: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            for member in room.iter() {
                if member.key() != sender_id {
                    let _ = member.value().tx.send(message.clone());
                }
            }
        }
    }
}

fn require_joined<'a>(membership: &'a Option<Membership>) -> Result<&'a Membership> {
    membership.as_ref().ok_or_else(|| anyhow!("join a room first"))
}

/// WebSocket upgrade handler for `/ws`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(relay): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: RelayState) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer task: drains this connection's channel in order.
    let writer_conn = conn_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(conn = %writer_conn, "writer task ended");
    });

    debug!(conn = %conn_id, "websocket connected");

    let mut membership: Option<Membership> = None;

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(conn = %conn_id, error = %err, "websocket receive error");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_message) => {
                    if let Err(err) = relay
                        .handle_message(client_message, &conn_id, &mut membership, &tx)
                        .await
                    {
                        let _ = tx.send(ServerMessage::Error {
                            message: err.to_string(),
                        });
                    }
                }
                Err(err) => {
                    warn!(conn = %conn_id, error = %err, "unparseable relay message");
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("invalid message: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/Pong are handled by the transport; binary frames are
            // not part of the relay protocol.
            _ => {}
        }
    }

    if let Some(membership) = membership.take() {
        relay.disconnect(&membership, &conn_id);
    }
    debug!(conn = %conn_id, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::store::{DeviceRecord, Store};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use skylight_proto::ControlEvent;

    struct Peer {
        conn_id: String,
        membership: Option<Membership>,
        tx: mpsc::UnboundedSender<ServerMessage>,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Peer {
        fn new(conn_id: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                conn_id: conn_id.to_string(),
                membership: None,
                tx,
                rx,
            }
        }

        async fn send(&mut self, relay: &RelayState, message: ClientMessage) -> Result<()> {
            relay
                .handle_message(message, &self.conn_id, &mut self.membership, &self.tx)
                .await
        }

        fn recv(&mut self) -> ServerMessage {
            self.rx.try_recv().expect("expected a pending message")
        }

        fn assert_empty(&mut self) {
            assert!(self.rx.try_recv().is_err(), "expected no pending message");
        }
    }

    async fn relay_with_session(view_only: bool) -> (RelayState, String) {
        let store = Store::memory();
        let engine = SessionEngine::new(store.clone());
        store
            .put_device(&DeviceRecord {
                id: "dev-o".into(),
                user_id: "owner-1".into(),
                fingerprint: "fp-o".into(),
                name: "Desktop".into(),
                user_agent: "tests".into(),
                online: true,
                last_active: Utc::now(),
            })
            .await
            .unwrap();
        let identity = Identity {
            user_id: "owner-1".into(),
            email: "o@e.com".into(),
        };
        let permissions = Permissions {
            view_only,
            mouse_control: true,
            keyboard_control: true,
        };
        let record = engine
            .create_instant(&identity, "dev-o", permissions, Duration::seconds(600))
            .await
            .unwrap();
        (RelayState::new(engine), record.room_id)
    }

    fn join(room: &str, role: PeerRole) -> ClientMessage {
        ClientMessage::JoinRoom {
            session_id_or_room: room.to_string(),
            role,
        }
    }

    #[tokio::test]
    async fn join_then_relay_reaches_only_the_other_member() {
        let (relay, room) = relay_with_session(false).await;
        let mut a = Peer::new("conn-a");
        let mut b = Peer::new("conn-b");

        a.send(&relay, join(&room, PeerRole::Owner)).await.unwrap();
        match a.recv() {
            ServerMessage::RoomJoined { room_id, peers, .. } => {
                assert_eq!(room_id, room);
                assert!(peers.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        b.send(&relay, join(&room, PeerRole::Controller))
            .await
            .unwrap();
        match b.recv() {
            ServerMessage::RoomJoined { peers, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].conn_id, "conn-a");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match a.recv() {
            ServerMessage::UserJoined { conn_id, role } => {
                assert_eq!(conn_id, "conn-b");
                assert_eq!(role, PeerRole::Controller);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        a.send(
            &relay,
            ClientMessage::Offer {
                offer: json!({"sdp": "v=0..."}),
            },
        )
        .await
        .unwrap();
        match b.recv() {
            ServerMessage::Offer { offer, from } => {
                assert_eq!(offer["sdp"], "v=0...");
                assert_eq!(from, "conn-a");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        // never echoed back to the sender
        a.assert_empty();

        b.send(
            &relay,
            ClientMessage::Answer {
                answer: json!({"sdp": "v=0...answer"}),
            },
        )
        .await
        .unwrap();
        assert!(matches!(a.recv(), ServerMessage::Answer { .. }));

        b.send(
            &relay,
            ClientMessage::IceCandidate {
                candidate: json!({"candidate": "candidate:0"}),
            },
        )
        .await
        .unwrap();
        assert!(matches!(a.recv(), ServerMessage::IceCandidate { .. }));
    }

    #[tokio::test]
    async fn join_unknown_room_fails_and_leaves_connection_unjoined() {
        let (relay, _) = relay_with_session(false).await;
        let mut a = Peer::new("conn-a");

        let err = a
            .send(&relay, join("room_does_not_exist", PeerRole::Owner))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid session");
        assert!(a.membership.is_none());

        // messages before joining are rejected, not dropped silently
        let err = a
            .send(
                &relay,
                ClientMessage::Offer {
                    offer: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "join a room first");
    }

    #[tokio::test]
    async fn join_terminal_session_is_rejected() {
        let store = Store::memory();
        let engine = SessionEngine::new(store.clone());
        store
            .put_device(&DeviceRecord {
                id: "dev-o".into(),
                user_id: "owner-1".into(),
                fingerprint: "fp-o".into(),
                name: "Desktop".into(),
                user_agent: "tests".into(),
                online: true,
                last_active: Utc::now(),
            })
            .await
            .unwrap();
        let identity = Identity {
            user_id: "owner-1".into(),
            email: "o@e.com".into(),
        };
        let record = engine
            .create_instant(&identity, "dev-o", Permissions::default(), Duration::seconds(600))
            .await
            .unwrap();
        engine.end(&identity, &record.id).await.unwrap();

        let relay = RelayState::new(engine);
        let mut a = Peer::new("conn-a");
        let err = a
            .send(&relay, join(&record.room_id, PeerRole::Owner))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid session");
    }

    #[tokio::test]
    async fn control_events_respect_roles_and_permissions() {
        let (relay, room) = relay_with_session(false).await;
        let mut owner = Peer::new("conn-owner");
        let mut controller = Peer::new("conn-ctrl");

        owner.send(&relay, join(&room, PeerRole::Owner)).await.unwrap();
        controller
            .send(&relay, join(&room, PeerRole::Controller))
            .await
            .unwrap();
        owner.recv(); // RoomJoined
        owner.recv(); // UserJoined
        controller.recv(); // RoomJoined

        // controller input flows to the owner
        controller
            .send(
                &relay,
                ClientMessage::ControlEvent {
                    event: ControlEvent::MouseMove { x: 0.5, y: 0.5 },
                },
            )
            .await
            .unwrap();
        assert!(matches!(owner.recv(), ServerMessage::ControlEvent { .. }));

        // the owner side never emits input
        let err = owner
            .send(
                &relay,
                ClientMessage::ControlEvent {
                    event: ControlEvent::MouseMove { x: 0.5, y: 0.5 },
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "only the controller may send control events"
        );
        controller.assert_empty();

        // out-of-range coordinates are stopped at the boundary
        let err = controller
            .send(
                &relay,
                ClientMessage::ControlEvent {
                    event: ControlEvent::MouseMove { x: 7.0, y: 0.5 },
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("malformed control event"));
        owner.assert_empty();
    }

    #[tokio::test]
    async fn view_only_sessions_drop_all_control_events() {
        let (relay, room) = relay_with_session(true).await;
        let mut owner = Peer::new("conn-owner");
        let mut controller = Peer::new("conn-ctrl");

        owner.send(&relay, join(&room, PeerRole::Owner)).await.unwrap();
        controller
            .send(&relay, join(&room, PeerRole::Controller))
            .await
            .unwrap();
        owner.recv();
        owner.recv();
        controller.recv();

        let err = controller
            .send(
                &relay,
                ClientMessage::ControlEvent {
                    event: ControlEvent::KeyDown {
                        key: "a".into(),
                        code: None,
                        key_code: None,
                        ctrl_key: false,
                        alt_key: false,
                        shift_key: false,
                        meta_key: false,
                    },
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "control event not permitted for this session"
        );
        owner.assert_empty();
    }

    #[tokio::test]
    async fn end_session_broadcast_and_disconnect_notify_the_peer() {
        let (relay, room) = relay_with_session(false).await;
        let mut owner = Peer::new("conn-owner");
        let mut controller = Peer::new("conn-ctrl");

        owner.send(&relay, join(&room, PeerRole::Owner)).await.unwrap();
        controller
            .send(&relay, join(&room, PeerRole::Controller))
            .await
            .unwrap();
        owner.recv();
        owner.recv();
        controller.recv();

        controller
            .send(&relay, ClientMessage::EndSession)
            .await
            .unwrap();
        match owner.recv() {
            ServerMessage::SessionEnded { from } => assert_eq!(from, "conn-ctrl"),
            other => panic!("unexpected message: {other:?}"),
        }
        controller.assert_empty();

        let membership = controller.membership.take().unwrap();
        relay.disconnect(&membership, &controller.conn_id);
        match owner.recv() {
            ServerMessage::PeerLeft { conn_id } => assert_eq!(conn_id, "conn-ctrl"),
            other => panic!("unexpected message: {other:?}"),
        }

        // the last member leaving releases the room
        let membership = owner.membership.take().unwrap();
        relay.disconnect(&membership, &owner.conn_id);
        assert!(relay.rooms.get(&room).is_none());
    }
}
