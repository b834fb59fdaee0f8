use crate::store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GameError>;

/// User-facing error taxonomy. Every variant maps to an `error` event sent
/// to the originating connection only, never broadcast to the room.
/// Room-code collisions are retried internally and have no variant here.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("only the host can do that")]
    NotHost,
    #[error("room not found")]
    RoomNotFound,
    #[error("not enough players seated to start")]
    InsufficientPlayers,
    #[error("no such player in this room")]
    PlayerNotFound,
    #[error("a game is already running in this room")]
    GameInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
}
