//! WebSocket edge of the server. One task per connection reads client
//! events; a paired writer task drains that connection's outbound queue so
//! a slow socket never blocks a game tick. Room-scoped fan-out goes through
//! [`Broadcaster`] groups keyed by room code.

use crate::auth::TokenKeys;
use crate::error::{GameError, Result};
use crate::room::{ConnId, DisconnectReport, RoomManager};
use crate::session::spawn_session;
use crate::store::SessionStore;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::{ClientEvent, GameMode, ServerEvent, FIELD_HEIGHT, PADDLE_HEIGHT};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Bound on store lookups during code allocation.
const MAX_CODE_STORE_CHECKS: usize = 16;

#[derive(Default)]
struct BroadcasterInner {
    conns: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
    groups: HashMap<String, HashSet<ConnId>>,
}

/// Connection registry plus room-keyed fan-out groups. Cloneable; all
/// clones share the same registry. Failed sends mean the connection is
/// gone or hopelessly behind and are dropped with a debug log.
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<RwLock<BroadcasterInner>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnId, tx: mpsc::UnboundedSender<Message>) {
        self.inner.write().await.conns.insert(conn, tx);
    }

    pub async fn unregister(&self, conn: ConnId) {
        let mut inner = self.inner.write().await;
        inner.conns.remove(&conn);
        for members in inner.groups.values_mut() {
            members.remove(&conn);
        }
    }

    pub async fn join_group(&self, group: &str, conn: ConnId) {
        self.inner
            .write()
            .await
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(conn);
    }

    pub async fn leave_group(&self, group: &str, conn: ConnId) {
        if let Some(members) = self.inner.write().await.groups.get_mut(group) {
            members.remove(&conn);
        }
    }

    pub async fn drop_group(&self, group: &str) {
        self.inner.write().await.groups.remove(group);
    }

    pub async fn send_to<T: Serialize>(&self, conn: ConnId, event: &T) {
        if let Some(msg) = encode(event) {
            if let Some(tx) = self.inner.read().await.conns.get(&conn) {
                if tx.send(msg).is_err() {
                    debug!("dropping message for stale connection {}", conn);
                }
            }
        }
    }

    pub async fn broadcast<T: Serialize>(&self, group: &str, event: &T) {
        self.broadcast_filtered(group, event, None).await;
    }

    pub async fn broadcast_except<T: Serialize>(&self, group: &str, except: ConnId, event: &T) {
        self.broadcast_filtered(group, event, Some(except)).await;
    }

    async fn broadcast_filtered<T: Serialize>(
        &self,
        group: &str,
        event: &T,
        except: Option<ConnId>,
    ) {
        let Some(msg) = encode(event) else { return };
        let inner = self.inner.read().await;
        let Some(members) = inner.groups.get(group) else {
            return;
        };
        for &conn in members {
            if Some(conn) == except {
                continue;
            }
            if let Some(tx) = inner.conns.get(&conn) {
                if tx.send(msg.clone()).is_err() {
                    debug!("dropping message for stale connection {}", conn);
                }
            }
        }
    }
}

fn encode<T: Serialize>(event: &T) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::text(json)),
        Err(err) => {
            error!("failed to serialize outbound event: {}", err);
            None
        }
    }
}

/// The realtime gateway: accepts WebSocket connections, authenticates
/// mutating events and routes them to the room manager and sessions.
pub struct Gateway {
    manager: Arc<RwLock<RoomManager>>,
    store: Arc<dyn SessionStore>,
    broadcaster: Broadcaster,
    keys: TokenKeys,
    next_conn: AtomicU64,
}

impl Gateway {
    pub fn new(store: Arc<dyn SessionStore>, secret: &str) -> Self {
        Self {
            manager: Arc::new(RwLock::new(RoomManager::new())),
            store,
            broadcaster: Broadcaster::new(),
            keys: TokenKeys::new(secret),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn manager(&self) -> &Arc<RwLock<RoomManager>> {
        &self.manager
    }

    /// Issues a credential token for `username`. Token issuance normally
    /// lives at the account edge; this is the hook it goes through.
    pub fn issue_token(&self, username: &str) -> Result<String> {
        self.keys.issue(username, crate::auth::DEFAULT_TOKEN_TTL)
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("gateway listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener, split out so tests can
    /// bind an ephemeral port first.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!("websocket handshake with {} failed: {}", peer, err);
                return;
            }
        };
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        info!("connection {} opened from {}", conn, peer);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        self.broadcaster.register(conn, out_tx).await;

        while let Some(incoming) = ws_rx.next().await {
            match incoming {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if let Err(err) = self.dispatch(conn, event).await {
                            self.broadcaster
                                .send_to(
                                    conn,
                                    &ServerEvent::Error {
                                        message: err.to_string(),
                                    },
                                )
                                .await;
                        }
                    }
                    Err(err) => {
                        debug!("connection {} sent unparseable event: {}", conn, err);
                        self.broadcaster
                            .send_to(
                                conn,
                                &ServerEvent::Error {
                                    message: "unrecognized event".to_string(),
                                },
                            )
                            .await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("connection {} read error: {}", conn, err);
                    break;
                }
            }
        }

        self.handle_disconnect(conn).await;
        self.broadcaster.unregister(conn).await;
        writer.abort();
        info!("connection {} closed", conn);
    }

    async fn dispatch(&self, conn: ConnId, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::CreateRoom {
                username,
                token,
                mode,
                max_rounds,
            } => {
                self.create_room(conn, &username, &token, mode, max_rounds)
                    .await
            }
            ClientEvent::JoinRoom {
                room,
                username,
                token,
            } => self.join_room(conn, &room, &username, &token).await,
            ClientEvent::UpdateGameSettings {
                room,
                username,
                token,
                mode,
                max_rounds,
            } => {
                self.update_settings(&room, &username, &token, mode, max_rounds)
                    .await
            }
            ClientEvent::KickPlayer {
                room,
                username,
                token,
                target,
            } => self.kick_player(&room, &username, &token, &target).await,
            ClientEvent::StartGame {
                room,
                username,
                token,
            } => self.start_game(&room, &username, &token).await,
            ClientEvent::PlayerMove {
                room,
                username,
                offset,
            } => {
                self.player_move(conn, &room, &username, offset).await;
                Ok(())
            }
        }
    }

    async fn create_room(
        &self,
        conn: ConnId,
        username: &str,
        token: &str,
        mode: GameMode,
        max_rounds: u32,
    ) -> Result<()> {
        self.keys.verify_identity(token, username)?;
        let mut store_checks = 0;
        let code = loop {
            let candidate = self.manager.read().await.generate_code();
            // Codes must also be free of stored mirrors. The registry
            // stays authoritative though: a store that errors, or keeps
            // reporting stale collisions, cannot block creation.
            if store_checks < MAX_CODE_STORE_CHECKS
                && matches!(self.store.room_exists(&candidate).await, Ok(true))
            {
                debug!("room code {} collides with a stored record", candidate);
                store_checks += 1;
                continue;
            }
            let mut guard = self.manager.write().await;
            if guard.create_room_with_code(&candidate, username, conn, mode, max_rounds) {
                break candidate;
            }
        };
        self.broadcaster.join_group(&code, conn).await;
        self.announce_room(&code).await;
        self.persist_room(&code).await;
        Ok(())
    }

    async fn join_room(&self, conn: ConnId, room: &str, username: &str, token: &str) -> Result<()> {
        self.keys.verify_identity(token, username)?;
        self.manager.write().await.join_room(room, username, conn)?;
        self.broadcaster.join_group(room, conn).await;
        self.announce_room(room).await;
        self.persist_room(room).await;
        Ok(())
    }

    async fn update_settings(
        &self,
        room: &str,
        username: &str,
        token: &str,
        mode: Option<GameMode>,
        max_rounds: Option<u32>,
    ) -> Result<()> {
        self.keys.verify_identity(token, username)?;
        self.manager
            .write()
            .await
            .update_settings(room, username, mode, max_rounds)?;
        self.announce_room(room).await;
        self.persist_room(room).await;
        Ok(())
    }

    async fn kick_player(
        &self,
        room: &str,
        username: &str,
        token: &str,
        target: &str,
    ) -> Result<()> {
        self.keys.verify_identity(token, username)?;
        let kicked_conn = self
            .manager
            .write()
            .await
            .kick_player(room, username, target)?;
        if let Some(kicked) = kicked_conn {
            self.broadcaster
                .send_to(
                    kicked,
                    &ServerEvent::Kicked {
                        room: room.to_string(),
                    },
                )
                .await;
            self.broadcaster.leave_group(room, kicked).await;
        }
        self.announce_room(room).await;
        self.persist_room(room).await;
        Ok(())
    }

    async fn start_game(&self, room: &str, username: &str, token: &str) -> Result<()> {
        self.keys.verify_identity(token, username)?;
        {
            let mut guard = self.manager.write().await;
            let seats = guard.ensure_can_start(room, username)?;
            let max_rounds = guard
                .get(room)
                .map(|r| r.max_rounds)
                .ok_or(GameError::RoomNotFound)?;
            let handle = spawn_session(
                room.to_string(),
                max_rounds,
                seats,
                self.manager.clone(),
                self.store.clone(),
                self.broadcaster.clone(),
            );
            guard.install_session(room, handle);
        }
        self.broadcaster
            .broadcast(
                room,
                &ServerEvent::GameStarted {
                    room: room.to_string(),
                },
            )
            .await;
        self.persist_room(room).await;
        Ok(())
    }

    /// Tolerant by contract: unknown rooms and unseated identities are
    /// ignored without an error reply.
    async fn player_move(&self, conn: ConnId, room: &str, username: &str, offset: f32) {
        let offset = offset.clamp(0.0, FIELD_HEIGHT - PADDLE_HEIGHT);
        let (seat, session) = {
            let mut guard = self.manager.write().await;
            let seat = guard.set_paddle_offset(room, username, offset);
            let session = guard.get(room).and_then(|r| r.session.clone());
            (seat, session)
        };
        let Some((team, position)) = seat else { return };
        if let Some(session) = session {
            session.send_move(team, position, offset);
        }
        self.broadcaster
            .broadcast_except(
                room,
                conn,
                &ServerEvent::PlayerMoved {
                    username: username.to_string(),
                    team,
                    position,
                    offset,
                },
            )
            .await;
    }

    async fn handle_disconnect(&self, conn: ConnId) {
        let report: DisconnectReport = self.manager.write().await.handle_disconnect(conn);
        for code in &report.updated {
            self.announce_room(code).await;
            self.persist_room(code).await;
        }
        for code in report.destroyed {
            self.broadcaster.drop_group(&code).await;
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.delete_room(&code).await {
                    warn!("failed to delete room {} from store: {}", code, err);
                }
            });
        }
    }

    /// Broadcasts the room's full snapshot to its group.
    async fn announce_room(&self, code: &str) {
        let snapshot = self.manager.read().await.get(code).map(|r| r.snapshot());
        if let Some(snapshot) = snapshot {
            self.broadcaster
                .broadcast(code, &ServerEvent::RoomUpdate(snapshot))
                .await;
        }
    }

    /// Fire-and-forget mirror write; the in-memory state stays
    /// authoritative whether or not it succeeds.
    async fn persist_room(&self, code: &str) {
        let record = self.manager.read().await.get(code).map(|r| r.record());
        let Some(record) = record else { return };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save_room(&record).await {
                warn!("failed to persist room {}: {}", record.code, err);
            }
        });
    }
}
