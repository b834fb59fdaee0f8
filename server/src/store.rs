//! Durable persistence boundary. The server treats the store as a shadow of
//! the in-memory authoritative state: it is read on room creation/lookup and
//! written on a fixed cadence plus state transitions, with at-least-once
//! semantics. A store failure must never take down an in-progress match.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{GameMode, MatchState};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username already registered")]
    DuplicateUsername,
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Account record with cumulative result counters. The password hash is
/// opaque to the server core; hashing happens at the edge that registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub username: String,
    pub password_hash: String,
    pub wins: u32,
    pub games_played: u32,
}

/// A seat as persisted; connection ids are transient and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSeat {
    pub username: String,
    pub team: u8,
    pub position: u8,
}

/// Durable mirror of a room, keyed by its code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub code: String,
    pub mode: GameMode,
    pub host: String,
    pub max_rounds: u32,
    pub seats: Vec<StoredSeat>,
    pub match_state: MatchState,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn register(&self, username: &str, password_hash: &str) -> Result<(), StoreError>;
    async fn load_identity(&self, username: &str) -> Result<Option<IdentityRecord>, StoreError>;
    /// Increments `wins` and `games_played` for the winners and only
    /// `games_played` for the losers.
    async fn record_result(&self, winners: &[String], losers: &[String])
        -> Result<(), StoreError>;

    async fn room_exists(&self, code: &str) -> Result<bool, StoreError>;
    async fn load_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError>;
    async fn save_room(&self, record: &RoomRecord) -> Result<(), StoreError>;
    async fn delete_room(&self, code: &str) -> Result<(), StoreError>;
}

/// Reference implementation backing the binary and the test suite.
#[derive(Default)]
pub struct MemoryStore {
    identities: RwLock<HashMap<String, IdentityRecord>>,
    rooms: RwLock<HashMap<String, RoomRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn register(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let mut identities = self.identities.write().await;
        if identities.contains_key(username) {
            return Err(StoreError::DuplicateUsername);
        }
        identities.insert(
            username.to_string(),
            IdentityRecord {
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                wins: 0,
                games_played: 0,
            },
        );
        Ok(())
    }

    async fn load_identity(&self, username: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.identities.read().await.get(username).cloned())
    }

    async fn record_result(
        &self,
        winners: &[String],
        losers: &[String],
    ) -> Result<(), StoreError> {
        let mut identities = self.identities.write().await;
        for username in winners {
            let record = identities
                .entry(username.clone())
                .or_insert_with(|| IdentityRecord {
                    username: username.clone(),
                    password_hash: String::new(),
                    wins: 0,
                    games_played: 0,
                });
            record.wins += 1;
            record.games_played += 1;
        }
        for username in losers {
            let record = identities
                .entry(username.clone())
                .or_insert_with(|| IdentityRecord {
                    username: username.clone(),
                    password_hash: String::new(),
                    wins: 0,
                    games_played: 0,
                });
            record.games_played += 1;
        }
        Ok(())
    }

    async fn room_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.rooms.read().await.contains_key(code))
    }

    async fn load_room(&self, code: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.rooms.read().await.get(code).cloned())
    }

    async fn save_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        self.rooms
            .write()
            .await
            .insert(record.code.clone(), record.clone());
        Ok(())
    }

    async fn delete_room(&self, code: &str) -> Result<(), StoreError> {
        self.rooms.write().await.remove(code);
        Ok(())
    }
}
