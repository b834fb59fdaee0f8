use serde::{Deserialize, Serialize};

pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 600.0;
pub const PADDLE_WIDTH: f32 = 10.0;
pub const PADDLE_HEIGHT: f32 = 100.0;
pub const BALL_RADIUS: f32 = 8.0;
pub const INITIAL_BALL_SPEED: f32 = 240.0;
pub const SPEED_INCREMENT: f32 = 20.0;
pub const MAX_BALL_SPEED: f32 = 480.0;
pub const MAX_DEFLECT: f32 = 300.0;
pub const SERVE_DRIFT: f32 = 90.0;
pub const TICK_RATE: u32 = 30;
pub const POINTS_PER_ROUND: u32 = 3;
pub const ROUND_PAUSE_SECS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Team layout of a room. Team 0 defends the left edge, team 1 the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
    #[serde(rename = "1v1")]
    OneVsOne,
    #[serde(rename = "2v1")]
    TwoVsOne,
    #[serde(rename = "2v2")]
    TwoVsTwo,
}

impl GameMode {
    /// Number of playing seats on the given team.
    pub fn team_capacity(&self, team: u8) -> usize {
        match self {
            GameMode::OneVsOne => 1,
            GameMode::TwoVsOne => {
                if team == 0 {
                    2
                } else {
                    1
                }
            }
            GameMode::TwoVsTwo => 2,
        }
    }

    /// Seats that must be filled before a match can start.
    pub fn min_players(&self) -> usize {
        self.team_capacity(0) + self.team_capacity(1)
    }
}

/// Authoritative match snapshot. Owned by the session controller while
/// `active`; a read-only persisted record once the game has ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    pub active: bool,
    #[serde(rename = "ballPos")]
    pub ball_pos: Vec2,
    #[serde(rename = "ballVel")]
    pub ball_vel: Vec2,
    pub scores: [u32; 2],
    pub round: u32,
    #[serde(rename = "roundWins")]
    pub round_wins: [u32; 2],
}

impl Default for MatchState {
    fn default() -> Self {
        Self {
            active: false,
            ball_pos: Vec2::new(FIELD_WIDTH / 2.0, FIELD_HEIGHT / 2.0),
            ball_vel: Vec2::default(),
            scores: [0, 0],
            round: 1,
            round_wins: [0, 0],
        }
    }
}

/// A player's seat as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatInfo {
    pub username: String,
    pub team: u8,
    pub position: u8,
    #[serde(rename = "paddleOffset")]
    pub paddle_offset: f32,
    pub connected: bool,
}

/// Full room state broadcast on every lobby mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub code: String,
    pub mode: GameMode,
    pub host: String,
    #[serde(rename = "maxRounds")]
    pub max_rounds: u32,
    pub players: Vec<SeatInfo>,
    #[serde(rename = "spectatorCount")]
    pub spectator_count: usize,
    #[serde(rename = "match")]
    pub match_state: MatchState,
}

/// One paddle's authoritative offset (top edge, field coordinates).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaddleState {
    pub team: u8,
    pub position: u8,
    pub offset: f32,
}

/// Per-tick authoritative state broadcast during a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateUpdate {
    #[serde(flatten)]
    pub state: MatchState,
    pub paddles: Vec<PaddleState>,
}

/// Events sent by clients. Names and payload keys are part of the wire
/// contract and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "createRoom")]
    CreateRoom {
        username: String,
        token: String,
        mode: GameMode,
        #[serde(rename = "maxRounds")]
        max_rounds: u32,
    },
    #[serde(rename = "joinRoom")]
    JoinRoom {
        room: String,
        username: String,
        token: String,
    },
    #[serde(rename = "updateGameSettings")]
    UpdateGameSettings {
        room: String,
        username: String,
        token: String,
        #[serde(default)]
        mode: Option<GameMode>,
        #[serde(rename = "maxRounds", default)]
        max_rounds: Option<u32>,
    },
    #[serde(rename = "kickPlayer")]
    KickPlayer {
        room: String,
        username: String,
        token: String,
        target: String,
    },
    #[serde(rename = "startGame")]
    StartGame {
        room: String,
        username: String,
        token: String,
    },
    #[serde(rename = "playerMove")]
    PlayerMove {
        room: String,
        username: String,
        offset: f32,
    },
}

/// Events sent by the server. `kicked` and `error` go to a single
/// connection; everything else is a room broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "room-update")]
    RoomUpdate(RoomSnapshot),
    #[serde(rename = "game-started")]
    GameStarted { room: String },
    #[serde(rename = "game-state-update")]
    GameStateUpdate(GameStateUpdate),
    /// Low-latency relay of a client-reported paddle move. A render hint
    /// only; `game-state-update` remains the source of truth.
    #[serde(rename = "player-moved")]
    PlayerMoved {
        username: String,
        team: u8,
        position: u8,
        offset: f32,
    },
    #[serde(rename = "round-ended")]
    RoundEnded {
        winner: u8,
        #[serde(rename = "roundWins")]
        round_wins: [u32; 2],
        round: u32,
    },
    #[serde(rename = "paused")]
    Paused { seconds: u32 },
    #[serde(rename = "resumed")]
    Resumed,
    #[serde(rename = "ended")]
    Ended {
        winner: u8,
        #[serde(rename = "roundWins")]
        round_wins: [u32; 2],
    },
    #[serde(rename = "kicked")]
    Kicked { room: String },
    #[serde(rename = "error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_capacities() {
        assert_eq!(GameMode::OneVsOne.team_capacity(0), 1);
        assert_eq!(GameMode::OneVsOne.team_capacity(1), 1);
        assert_eq!(GameMode::TwoVsOne.team_capacity(0), 2);
        assert_eq!(GameMode::TwoVsOne.team_capacity(1), 1);
        assert_eq!(GameMode::TwoVsTwo.team_capacity(0), 2);
        assert_eq!(GameMode::TwoVsTwo.team_capacity(1), 2);

        assert_eq!(GameMode::OneVsOne.min_players(), 2);
        assert_eq!(GameMode::TwoVsOne.min_players(), 3);
        assert_eq!(GameMode::TwoVsTwo.min_players(), 4);
    }

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&GameMode::OneVsOne).unwrap(),
            "\"1v1\""
        );
        assert_eq!(
            serde_json::to_string(&GameMode::TwoVsOne).unwrap(),
            "\"2v1\""
        );
        assert_eq!(
            serde_json::to_string(&GameMode::TwoVsTwo).unwrap(),
            "\"2v2\""
        );

        let mode: GameMode = serde_json::from_str("\"2v1\"").unwrap();
        assert_eq!(mode, GameMode::TwoVsOne);
    }

    #[test]
    fn test_client_event_names_are_stable() {
        let event = ClientEvent::JoinRoom {
            room: "ABC123".into(),
            username: "alice".into(),
            token: "tok".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"joinRoom\""), "got {}", json);

        let event = ClientEvent::UpdateGameSettings {
            room: "ABC123".into(),
            username: "alice".into(),
            token: "tok".into(),
            mode: Some(GameMode::TwoVsTwo),
            max_rounds: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"updateGameSettings\""));

        let event = ClientEvent::PlayerMove {
            room: "ABC123".into(),
            username: "alice".into(),
            offset: 250.0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"playerMove\""));
    }

    #[test]
    fn test_client_event_parses_without_optional_settings() {
        let json = r#"{"event":"updateGameSettings","data":{"room":"ABC123","username":"alice","token":"tok"}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::UpdateGameSettings {
                mode, max_rounds, ..
            } => {
                assert!(mode.is_none());
                assert!(max_rounds.is_none());
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn test_server_event_names_are_stable() {
        let cases: Vec<(ServerEvent, &str)> = vec![
            (
                ServerEvent::GameStarted {
                    room: "ABC123".into(),
                },
                "game-started",
            ),
            (
                ServerEvent::RoundEnded {
                    winner: 0,
                    round_wins: [1, 0],
                    round: 2,
                },
                "round-ended",
            ),
            (ServerEvent::Paused { seconds: 3 }, "paused"),
            (ServerEvent::Resumed, "resumed"),
            (
                ServerEvent::Ended {
                    winner: 1,
                    round_wins: [1, 3],
                },
                "ended",
            ),
            (
                ServerEvent::Kicked {
                    room: "ABC123".into(),
                },
                "kicked",
            ),
            (
                ServerEvent::Error {
                    message: "room not found".into(),
                },
                "error",
            ),
        ];

        for (event, name) in cases {
            let json = serde_json::to_string(&event).unwrap();
            assert!(
                json.contains(&format!("\"event\":\"{}\"", name)),
                "expected {} in {}",
                name,
                json
            );
        }
    }

    #[test]
    fn test_snapshot_payload_keys() {
        let snapshot = RoomSnapshot {
            code: "ABC123".into(),
            mode: GameMode::OneVsOne,
            host: "alice".into(),
            max_rounds: 5,
            players: vec![SeatInfo {
                username: "alice".into(),
                team: 0,
                position: 0,
                paddle_offset: 250.0,
                connected: true,
            }],
            spectator_count: 2,
            match_state: MatchState::default(),
        };

        let json = serde_json::to_string(&ServerEvent::RoomUpdate(snapshot)).unwrap();
        assert!(json.contains("\"event\":\"room-update\""));
        assert!(json.contains("\"maxRounds\":5"));
        assert!(json.contains("\"spectatorCount\":2"));
        assert!(json.contains("\"paddleOffset\":250.0"));
        assert!(json.contains("\"roundWins\":[0,0]"));
        assert!(json.contains("\"match\":"));
    }

    #[test]
    fn test_game_state_update_flattens_match_state() {
        let update = GameStateUpdate {
            state: MatchState {
                active: true,
                ..MatchState::default()
            },
            paddles: vec![PaddleState {
                team: 0,
                position: 0,
                offset: 100.0,
            }],
        };
        let json = serde_json::to_string(&ServerEvent::GameStateUpdate(update.clone())).unwrap();
        assert!(json.contains("\"event\":\"game-state-update\""));
        assert!(json.contains("\"active\":true"));
        assert!(json.contains("\"ballPos\""));
        assert!(json.contains("\"paddles\""));

        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ServerEvent::GameStateUpdate(update));
    }

    #[test]
    fn test_default_match_state_is_centered_and_inactive() {
        let state = MatchState::default();
        assert!(!state.active);
        assert_eq!(
            state.ball_pos,
            Vec2::new(FIELD_WIDTH / 2.0, FIELD_HEIGHT / 2.0)
        );
        assert_eq!(state.round, 1);
        assert_eq!(state.scores, [0, 0]);
        assert_eq!(state.round_wins, [0, 0]);
    }
}
