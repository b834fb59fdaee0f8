//! Room lifecycle and seat management. The manager is the authoritative
//! in-memory registry of rooms (insert on create, remove on destroy); the
//! session store only ever sees flushed mirrors of this state. All methods
//! are synchronous so the whole lifecycle can be tested without a runtime.

use crate::error::{GameError, Result};
use crate::session::SessionHandle;
use crate::store::{RoomRecord, StoredSeat};
use log::info;
use rand::Rng;
use shared::{GameMode, MatchState, RoomSnapshot, SeatInfo, FIELD_HEIGHT, PADDLE_HEIGHT};
use std::collections::HashMap;

/// Transient identifier for one realtime connection.
pub type ConnId = u64;

const CODE_LEN: usize = 6;
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A seat. `conn == None` means the player disconnected but the seat is
/// retained for reconnection under the same identity.
pub struct Player {
    pub username: String,
    pub conn: Option<ConnId>,
    pub team: u8,
    pub position: u8,
    pub paddle_offset: f32,
}

impl Player {
    fn new(username: &str, conn: ConnId, team: u8, position: u8) -> Self {
        Self {
            username: username.to_string(),
            conn: Some(conn),
            team,
            position,
            paddle_offset: (FIELD_HEIGHT - PADDLE_HEIGHT) / 2.0,
        }
    }
}

pub struct Room {
    pub code: String,
    pub mode: GameMode,
    pub host: String,
    pub max_rounds: u32,
    /// Seated players in join order.
    pub players: Vec<Player>,
    pub spectators: Vec<ConnId>,
    pub match_state: MatchState,
    pub session: Option<SessionHandle>,
}

impl Room {
    pub fn team_count(&self, team: u8) -> usize {
        self.players.iter().filter(|p| p.team == team).count()
    }

    /// Next open seat: the team with the fewest occupied seats among teams
    /// with free capacity, ties resolving to team 0. Positions stay
    /// contiguous.
    fn free_seat(&self) -> Option<(u8, u8)> {
        let counts = [self.team_count(0), self.team_count(1)];
        let mut best: Option<u8> = None;
        for team in 0..2u8 {
            if counts[team as usize] < self.mode.team_capacity(team) {
                match best {
                    Some(current) if counts[team as usize] >= counts[current as usize] => {}
                    _ => best = Some(team),
                }
            }
        }
        best.map(|team| (team, counts[team as usize] as u8))
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            code: self.code.clone(),
            mode: self.mode,
            host: self.host.clone(),
            max_rounds: self.max_rounds,
            players: self
                .players
                .iter()
                .map(|p| SeatInfo {
                    username: p.username.clone(),
                    team: p.team,
                    position: p.position,
                    paddle_offset: p.paddle_offset,
                    connected: p.conn.is_some(),
                })
                .collect(),
            spectator_count: self.spectators.len(),
            match_state: self.match_state,
        }
    }

    pub fn record(&self) -> RoomRecord {
        RoomRecord {
            code: self.code.clone(),
            mode: self.mode,
            host: self.host.clone(),
            max_rounds: self.max_rounds,
            seats: self
                .players
                .iter()
                .map(|p| StoredSeat {
                    username: p.username.clone(),
                    team: p.team,
                    position: p.position,
                })
                .collect(),
            match_state: self.match_state,
        }
    }

    pub fn team_usernames(&self, team: u8) -> Vec<String> {
        self.players
            .iter()
            .filter(|p| p.team == team)
            .map(|p| p.username.clone())
            .collect()
    }
}

/// How a join request was resolved. Overflow joins become spectators; that
/// is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Seated { team: u8, position: u8 },
    Reconnected { team: u8, position: u8 },
    Spectator,
}

/// Rooms touched by one disconnect.
#[derive(Debug, Default)]
pub struct DisconnectReport {
    pub updated: Vec<String>,
    pub destroyed: Vec<String>,
}

#[derive(Default)]
pub struct RoomManager {
    rooms: HashMap<String, Room>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: &str) -> Option<&Room> {
        self.rooms.get(code)
    }

    pub fn get_mut(&mut self, code: &str) -> Option<&mut Room> {
        self.rooms.get_mut(code)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Draws a code free in the live registry; collisions are retried,
    /// never surfaced. Callers that mirror rooms durably check the store
    /// too before committing to the code.
    pub fn generate_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..CODE_LEN)
                .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
                .collect();
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    /// Inserts a room under a caller-chosen code, host seated at team 0,
    /// position 0. Returns false if the code is already taken.
    pub fn create_room_with_code(
        &mut self,
        code: &str,
        host: &str,
        conn: ConnId,
        mode: GameMode,
        max_rounds: u32,
    ) -> bool {
        if self.rooms.contains_key(code) {
            return false;
        }
        let room = Room {
            code: code.to_string(),
            mode,
            host: host.to_string(),
            max_rounds,
            players: vec![Player::new(host, conn, 0, 0)],
            spectators: Vec::new(),
            match_state: MatchState::default(),
            session: None,
        };
        info!("room {} created by {} ({:?})", code, host, mode);
        self.rooms.insert(code.to_string(), room);
        true
    }

    /// Creates a room under a freshly drawn code.
    pub fn create_room(&mut self, host: &str, conn: ConnId, mode: GameMode, max_rounds: u32) -> String {
        let code = self.generate_code();
        self.create_room_with_code(&code, host, conn, mode, max_rounds);
        code
    }

    /// Seats `username`, rebinding an existing seat on reconnection. When
    /// every seat is taken the connection joins as a spectator.
    pub fn join_room(&mut self, code: &str, username: &str, conn: ConnId) -> Result<JoinOutcome> {
        let room = self.rooms.get_mut(code).ok_or(GameError::RoomNotFound)?;

        if let Some(player) = room.players.iter_mut().find(|p| p.username == username) {
            player.conn = Some(conn);
            info!("{} reconnected to room {}", username, code);
            return Ok(JoinOutcome::Reconnected {
                team: player.team,
                position: player.position,
            });
        }

        match room.free_seat() {
            Some((team, position)) => {
                room.players.push(Player::new(username, conn, team, position));
                info!(
                    "{} joined room {} (team {}, position {})",
                    username, code, team, position
                );
                Ok(JoinOutcome::Seated { team, position })
            }
            None => {
                room.spectators.push(conn);
                info!("{} joined room {} as spectator", username, code);
                Ok(JoinOutcome::Spectator)
            }
        }
    }

    /// Host-only settings update, rejected while a game runs: the live
    /// session fixed its seat layout and round count at start. A mode
    /// change re-partitions seats in join order: earliest joiners keep
    /// their team's seats, the rest are demoted to spectators and
    /// positions are renumbered contiguously.
    pub fn update_settings(
        &mut self,
        code: &str,
        requester: &str,
        mode: Option<GameMode>,
        max_rounds: Option<u32>,
    ) -> Result<()> {
        let room = self.rooms.get_mut(code).ok_or(GameError::RoomNotFound)?;
        if room.host != requester {
            return Err(GameError::NotHost);
        }
        if room.session.is_some() {
            return Err(GameError::GameInProgress);
        }

        if let Some(rounds) = max_rounds {
            room.max_rounds = rounds;
        }

        if let Some(new_mode) = mode {
            room.mode = new_mode;
            let mut counts = [0usize; 2];
            let mut kept = Vec::with_capacity(room.players.len());
            for mut player in room.players.drain(..) {
                let team = player.team as usize;
                if counts[team] < new_mode.team_capacity(player.team) {
                    player.position = counts[team] as u8;
                    counts[team] += 1;
                    kept.push(player);
                } else {
                    info!("{} demoted to spectator in room {}", player.username, code);
                    if let Some(conn) = player.conn {
                        room.spectators.push(conn);
                    }
                }
            }
            room.players = kept;
        }
        Ok(())
    }

    /// Host-only, rejected while a game runs (the session simulates the
    /// seats it started with). Returns the kicked player's connection (if
    /// connected) so the gateway can deliver the targeted notice and leave
    /// the group.
    pub fn kick_player(
        &mut self,
        code: &str,
        requester: &str,
        target: &str,
    ) -> Result<Option<ConnId>> {
        let room = self.rooms.get_mut(code).ok_or(GameError::RoomNotFound)?;
        if room.host != requester {
            return Err(GameError::NotHost);
        }
        if room.session.is_some() {
            return Err(GameError::GameInProgress);
        }
        let index = room
            .players
            .iter()
            .position(|p| p.username == target)
            .ok_or(GameError::PlayerNotFound)?;

        let kicked = room.players.remove(index);
        info!("{} kicked from room {} by {}", target, code, requester);

        if room.host == target {
            if let Some(next) = room.players.first() {
                room.host = next.username.clone();
            }
        }
        Ok(kicked.conn)
    }

    /// Seats survive a disconnect with their connection nulled out so the
    /// same identity can reconnect. The host migrates to the first
    /// remaining connected player in join order; a room with no connected
    /// players left is destroyed. Spectator connections are dropped
    /// outright.
    pub fn handle_disconnect(&mut self, conn: ConnId) -> DisconnectReport {
        let mut report = DisconnectReport::default();

        for (code, room) in self.rooms.iter_mut() {
            let mut touched = false;

            if let Some(index) = room.spectators.iter().position(|&c| c == conn) {
                room.spectators.remove(index);
                touched = true;
            }

            if let Some(index) = room.players.iter().position(|p| p.conn == Some(conn)) {
                room.players[index].conn = None;
                let was_host = room.players[index].username == room.host;
                touched = true;

                if room.players.iter().all(|p| p.conn.is_none()) {
                    report.destroyed.push(code.clone());
                    continue;
                }

                if was_host {
                    if let Some(next) = room.players.iter().find(|p| p.conn.is_some()) {
                        info!("host of room {} migrated to {}", code, next.username);
                        room.host = next.username.clone();
                    }
                }
            }

            if touched {
                report.updated.push(code.clone());
            }
        }

        for code in &report.destroyed {
            if let Some(mut room) = self.rooms.remove(code) {
                if let Some(handle) = room.session.take() {
                    handle.stop();
                }
                info!("room {} destroyed (no connected players left)", code);
            }
        }

        report
    }

    /// Updates the cached paddle offset for a seat. Unknown rooms and
    /// unseated identities are ignored, matching the tolerant `playerMove`
    /// contract.
    pub fn set_paddle_offset(
        &mut self,
        code: &str,
        username: &str,
        offset: f32,
    ) -> Option<(u8, u8)> {
        let room = self.rooms.get_mut(code)?;
        let player = room.players.iter_mut().find(|p| p.username == username)?;
        player.paddle_offset = offset.clamp(0.0, FIELD_HEIGHT - PADDLE_HEIGHT);
        Some((player.team, player.position))
    }

    /// Validates a start request: host only, no session already running,
    /// every team seated to exact capacity. Returns the seat layout for the
    /// controller.
    pub fn ensure_can_start(&self, code: &str, requester: &str) -> Result<Vec<(u8, u8)>> {
        let room = self.rooms.get(code).ok_or(GameError::RoomNotFound)?;
        if room.host != requester {
            return Err(GameError::NotHost);
        }
        if room.session.is_some() {
            return Err(GameError::GameInProgress);
        }
        for team in 0..2u8 {
            if room.team_count(team) != room.mode.team_capacity(team) {
                return Err(GameError::InsufficientPlayers);
            }
        }
        Ok(room.players.iter().map(|p| (p.team, p.position)).collect())
    }

    pub fn install_session(&mut self, code: &str, handle: SessionHandle) {
        if let Some(room) = self.rooms.get_mut(code) {
            room.match_state.active = true;
            room.session = Some(handle);
        }
    }

    /// Records the final snapshot and drops the live session handle.
    pub fn finish_session(&mut self, code: &str, final_state: MatchState) {
        if let Some(room) = self.rooms.get_mut(code) {
            room.match_state = final_state;
            room.match_state.active = false;
            room.session = None;
        }
    }

    /// Evicts the finished match from the cache, returning the room to a
    /// fresh lobby state. Called after the post-game grace window.
    pub fn reset_match(&mut self, code: &str) {
        if let Some(room) = self.rooms.get_mut(code) {
            if room.session.is_none() {
                room.match_state = MatchState::default();
            }
        }
    }
}
