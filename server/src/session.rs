//! Per-room game sessions. `MatchController` is the synchronous rules layer
//! on top of the physics engine (scoring, rounds, pauses, game end) and is
//! tested tick by tick with a seeded rng. `spawn_session` wraps one
//! controller in a tokio task that owns the room's fixed-rate loop.

use crate::gateway::Broadcaster;
use crate::physics::{self, Ball, PaddleSet, PhysicsEvent};
use crate::room::RoomManager;
use crate::store::SessionStore;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    GameStateUpdate, MatchState, PaddleState, ServerEvent, FIELD_HEIGHT, PADDLE_HEIGHT,
    POINTS_PER_ROUND, ROUND_PAUSE_SECS, SERVE_DRIFT, TICK_RATE,
};
#[cfg(any(test, feature = "test-util"))]
use shared::Vec2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;

pub const ROUND_PAUSE_TICKS: u32 = ROUND_PAUSE_SECS * TICK_RATE;
/// Periodic persistence cadence, in ticks (3 s at 30 Hz).
pub const SNAPSHOT_INTERVAL_TICKS: u64 = 90;
/// How long a finished match stays visible before the room returns to the
/// lobby state.
pub const END_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    RoundPause,
    Ended,
}

/// Rule-level transitions surfaced by one controller tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    PointScored { team: u8 },
    RoundEnded { winner: u8 },
    Paused { seconds: u32 },
    Resumed,
    GameEnded { winner: u8 },
}

pub struct MatchController {
    max_rounds: u32,
    state: MatchState,
    ball: Ball,
    paddles: PaddleSet,
    seats: Vec<(u8, u8)>,
    phase: Phase,
    pause_ticks_left: u32,
}

impl MatchController {
    /// `seats` lists `(team, position)` pairs; every listed paddle starts
    /// centered.
    pub fn new(max_rounds: u32, seats: &[(u8, u8)]) -> Self {
        let mut paddles = PaddleSet::default();
        for &(team, position) in seats {
            paddles.set(team, position, (FIELD_HEIGHT - PADDLE_HEIGHT) / 2.0);
        }
        Self {
            max_rounds,
            state: MatchState::default(),
            ball: Ball::serve(1, 0.0),
            paddles,
            seats: seats.to_vec(),
            phase: Phase::Idle,
            pause_ticks_left: 0,
        }
    }

    /// Opens the match. The first serve always travels toward team 1's
    /// side; only the vertical drift is randomized.
    pub fn start(&mut self, rng: &mut impl Rng) {
        self.state.active = true;
        self.ball = Ball::serve(1, serve_drift(rng));
        self.phase = Phase::Active;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_paddle(&mut self, team: u8, position: u8, offset: f32) {
        self.paddles.set(team, position, offset);
    }

    /// Replaces the ball state directly so scenario tests can script
    /// rallies without simulating the full exchange. Not part of the
    /// production surface; only compiled with the `test-util` feature.
    #[cfg(any(test, feature = "test-util"))]
    pub fn force_ball(&mut self, pos: Vec2, vel: Vec2) {
        self.ball.pos = pos;
        self.ball.vel = vel;
    }

    /// Current authoritative state, ball synced from the engine.
    pub fn snapshot(&self) -> MatchState {
        let mut state = self.state;
        state.ball_pos = self.ball.pos;
        state.ball_vel = self.ball.vel;
        state
    }

    /// Per-tick broadcast payload: the match snapshot plus every seated
    /// paddle.
    pub fn update(&self) -> GameStateUpdate {
        GameStateUpdate {
            state: self.snapshot(),
            paddles: self
                .seats
                .iter()
                .map(|&(team, position)| PaddleState {
                    team,
                    position,
                    offset: self
                        .paddles
                        .get(team, position)
                        .unwrap_or((FIELD_HEIGHT - PADDLE_HEIGHT) / 2.0),
                })
                .collect(),
        }
    }

    /// Advances the match by one fixed tick.
    pub fn tick(&mut self, dt: f32, rng: &mut impl Rng) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match self.phase {
            Phase::Active => {
                for event in physics::step(&mut self.ball, &self.paddles, dt) {
                    if let PhysicsEvent::OutOfBounds { scored_by } = event {
                        self.score_point(scored_by, rng, &mut out);
                        break;
                    }
                }
            }
            Phase::RoundPause => {
                self.pause_ticks_left = self.pause_ticks_left.saturating_sub(1);
                if self.pause_ticks_left == 0 {
                    self.phase = Phase::Active;
                    out.push(MatchEvent::Resumed);
                }
            }
            Phase::Idle | Phase::Ended => {}
        }
        out
    }

    fn score_point(&mut self, team: u8, rng: &mut impl Rng, out: &mut Vec<MatchEvent>) {
        let team_idx = team as usize;
        self.state.scores[team_idx] += 1;
        out.push(MatchEvent::PointScored { team });

        if self.state.scores[team_idx] >= POINTS_PER_ROUND {
            self.finish_round(team, rng, out);
        } else {
            // Next rally serves toward the scorer's opponent.
            self.ball = Ball::serve(1 - team, serve_drift(rng));
        }
    }

    fn finish_round(&mut self, winner: u8, rng: &mut impl Rng, out: &mut Vec<MatchEvent>) {
        let winner_idx = winner as usize;
        self.state.round_wins[winner_idx] += 1;
        self.state.scores = [0, 0];
        out.push(MatchEvent::RoundEnded { winner });

        // An unassailable lead ends the match before all rounds are played.
        if self.state.round_wins[winner_idx] * 2 > self.max_rounds {
            self.end_game(winner, out);
            return;
        }

        self.state.round += 1;
        if self.state.round > self.max_rounds {
            let wins = self.state.round_wins;
            let overall = if wins[1] > wins[0] { 1 } else { 0 };
            self.end_game(overall, out);
            return;
        }

        // Between rounds the ball sits served toward the winner's side but
        // frozen until the pause elapses.
        self.ball = Ball::serve(winner, serve_drift(rng));
        self.phase = Phase::RoundPause;
        self.pause_ticks_left = ROUND_PAUSE_TICKS;
        out.push(MatchEvent::Paused {
            seconds: ROUND_PAUSE_SECS,
        });
    }

    fn end_game(&mut self, winner: u8, out: &mut Vec<MatchEvent>) {
        self.phase = Phase::Ended;
        self.state.active = false;
        out.push(MatchEvent::GameEnded { winner });
    }
}

fn serve_drift(rng: &mut impl Rng) -> f32 {
    rng.gen_range(-SERVE_DRIFT..=SERVE_DRIFT)
}

/// Commands accepted by a running session task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    Move { team: u8, position: u8, offset: f32 },
    Stop,
}

/// Cheaply cloneable handle to a session's command channel. Sends to a
/// session that already exited are silently dropped, so `stop` is
/// idempotent.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send_move(&self, team: u8, position: u8, offset: f32) {
        let _ = self.cmd_tx.send(SessionCommand::Move {
            team,
            position,
            offset,
        });
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Stop);
    }

    /// A handle with no task behind it, for lifecycle tests that only need
    /// a room to look in-game.
    #[cfg(test)]
    pub(crate) fn stub() -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (SessionHandle { cmd_tx }, cmd_rx)
    }
}

/// Spawns the fixed-rate tick task for one room and returns its handle.
/// The task is the sole writer of the match state; everything else reaches
/// it through the command channel.
pub fn spawn_session(
    code: String,
    max_rounds: u32,
    seats: Vec<(u8, u8)>,
    manager: Arc<RwLock<RoomManager>>,
    store: Arc<dyn SessionStore>,
    broadcaster: Broadcaster,
) -> SessionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle { cmd_tx };

    tokio::spawn(async move {
        let mut controller = MatchController::new(max_rounds, &seats);
        {
            // Seed paddles from the offsets players set while in the lobby.
            let guard = manager.read().await;
            if let Some(room) = guard.get(&code) {
                for player in &room.players {
                    controller.set_paddle(player.team, player.position, player.paddle_offset);
                }
            }
        }

        let mut rng = StdRng::from_entropy();
        controller.start(&mut rng);
        info!("session started in room {} ({} seats)", code, seats.len());

        let dt = 1.0 / TICK_RATE as f32;
        let mut interval =
            tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(TICK_RATE)));
        // A stalled task drops ticks instead of bursting to catch up.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        let write_in_flight = Arc::new(AtomicBool::new(false));
        let mut ticks: u64 = 0;

        'run: loop {
            interval.tick().await;
            ticks += 1;

            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    SessionCommand::Move {
                        team,
                        position,
                        offset,
                    } => controller.set_paddle(team, position, offset),
                    SessionCommand::Stop => {
                        info!("session in room {} stopped", code);
                        break 'run;
                    }
                }
            }

            let events = controller.tick(dt, &mut rng);
            let mut flush = ticks % SNAPSHOT_INTERVAL_TICKS == 0;
            let mut ended_winner = None;

            for event in events {
                match event {
                    MatchEvent::PointScored { .. } => flush = true,
                    MatchEvent::RoundEnded { winner } => {
                        flush = true;
                        let snap = controller.snapshot();
                        broadcaster
                            .broadcast(
                                &code,
                                &ServerEvent::RoundEnded {
                                    winner,
                                    round_wins: snap.round_wins,
                                    round: snap.round,
                                },
                            )
                            .await;
                    }
                    MatchEvent::Paused { seconds } => {
                        broadcaster
                            .broadcast(&code, &ServerEvent::Paused { seconds })
                            .await;
                    }
                    MatchEvent::Resumed => {
                        broadcaster.broadcast(&code, &ServerEvent::Resumed).await;
                    }
                    MatchEvent::GameEnded { winner } => ended_winner = Some(winner),
                }
            }

            broadcaster
                .broadcast(&code, &ServerEvent::GameStateUpdate(controller.update()))
                .await;

            if let Some(winner) = ended_winner {
                finish(
                    &code,
                    winner,
                    &controller,
                    &manager,
                    &store,
                    &broadcaster,
                    &write_in_flight,
                )
                .await;
                break;
            }

            if flush {
                spawn_flush(&code, controller.snapshot(), &manager, &store, &write_in_flight);
            }
        }
    });

    handle
}

/// Records the result, persists the final state and announces the winner,
/// then schedules the post-game reset after the grace window. The final
/// save goes through the same in-flight flag as the periodic flushes, so
/// it always lands after any write already pending.
async fn finish(
    code: &str,
    winner: u8,
    controller: &MatchController,
    manager: &Arc<RwLock<RoomManager>>,
    store: &Arc<dyn SessionStore>,
    broadcaster: &Broadcaster,
    write_in_flight: &Arc<AtomicBool>,
) {
    let final_state = controller.snapshot();
    info!(
        "game over in room {}: team {} wins {:?}",
        code, winner, final_state.round_wins
    );

    let (winners, losers, record) = {
        let mut guard = manager.write().await;
        guard.finish_session(code, final_state);
        match guard.get(code) {
            Some(room) => (
                room.team_usernames(winner),
                room.team_usernames(1 - winner),
                Some(room.record()),
            ),
            None => (Vec::new(), Vec::new(), None),
        }
    };

    if let Err(err) = store.record_result(&winners, &losers).await {
        error!("failed to record result for room {}: {}", code, err);
    }
    if let Some(record) = record {
        // Wait out any flush still in flight; the final record must be the
        // last room write for this session.
        while write_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if let Err(err) = store.save_room(&record).await {
            error!("failed to persist final state of room {}: {}", code, err);
        }
        write_in_flight.store(false, Ordering::SeqCst);
    }

    broadcaster
        .broadcast(
            code,
            &ServerEvent::Ended {
                winner,
                round_wins: final_state.round_wins,
            },
        )
        .await;

    let manager = manager.clone();
    let code = code.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(END_GRACE).await;
        manager.write().await.reset_match(&code);
    });
}

/// Fire-and-forget persistence. At most one write per room is in flight;
/// while one is pending further flushes are skipped, not queued.
fn spawn_flush(
    code: &str,
    snapshot: MatchState,
    manager: &Arc<RwLock<RoomManager>>,
    store: &Arc<dyn SessionStore>,
    write_in_flight: &Arc<AtomicBool>,
) {
    if write_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("room {} snapshot skipped, previous write still pending", code);
        return;
    }

    let code = code.to_string();
    let manager = manager.clone();
    let store = store.clone();
    let write_in_flight = write_in_flight.clone();
    tokio::spawn(async move {
        let record = {
            let mut guard = manager.write().await;
            guard.get_mut(&code).and_then(|room| {
                // Once the session is gone the ended-game path owns the
                // final write; a flush that lost that race must not
                // clobber it.
                if room.session.is_none() {
                    return None;
                }
                room.match_state = snapshot;
                Some(room.record())
            })
        };
        if let Some(record) = record {
            if let Err(err) = store.save_room(&record).await {
                warn!("room {} snapshot write failed: {}", code, err);
            }
        }
        write_in_flight.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use assert_approx_eq::assert_approx_eq;
    use shared::{GameMode, Vec2, BALL_RADIUS, FIELD_WIDTH, INITIAL_BALL_SPEED};

    const DT: f32 = 1.0 / 30.0;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn one_v_one() -> MatchController {
        MatchController::new(5, &[(0, 0), (1, 0)])
    }

    /// Forces the ball past the given team's edge so the next tick scores
    /// for the other team.
    fn force_miss(controller: &mut MatchController, past_team: u8) {
        controller.ball.vel = Vec2::new(0.0, 0.0);
        controller.ball.pos = if past_team == 0 {
            Vec2::new(-BALL_RADIUS - 1.0, 300.0)
        } else {
            Vec2::new(FIELD_WIDTH + BALL_RADIUS + 1.0, 300.0)
        };
    }

    fn score_for(controller: &mut MatchController, team: u8, rng: &mut StdRng) -> Vec<MatchEvent> {
        force_miss(controller, 1 - team);
        controller.tick(DT, rng)
    }

    #[test]
    fn test_start_serves_toward_team_one() {
        let mut controller = one_v_one();
        let mut rng = rng();
        assert_eq!(controller.phase(), Phase::Idle);

        controller.start(&mut rng);
        assert_eq!(controller.phase(), Phase::Active);
        let snap = controller.snapshot();
        assert!(snap.active);
        assert!(snap.ball_vel.x > 0.0);
        assert_approx_eq!(snap.ball_vel.x, INITIAL_BALL_SPEED);
        assert!(snap.ball_vel.y.abs() <= SERVE_DRIFT);
    }

    #[test]
    fn test_idle_controller_does_not_simulate() {
        let mut controller = one_v_one();
        let mut rng = rng();
        let before = controller.snapshot();
        assert!(controller.tick(DT, &mut rng).is_empty());
        assert_eq!(controller.snapshot(), before);
    }

    #[test]
    fn test_point_serves_toward_scorers_opponent() {
        let mut controller = one_v_one();
        let mut rng = rng();
        controller.start(&mut rng);

        let events = score_for(&mut controller, 0, &mut rng);
        assert_eq!(events, vec![MatchEvent::PointScored { team: 0 }]);
        assert_eq!(controller.snapshot().scores, [1, 0]);
        // Team 0 scored, so the next serve travels toward team 1.
        assert!(controller.snapshot().ball_vel.x > 0.0);
        assert_eq!(controller.phase(), Phase::Active);
    }

    #[test]
    fn test_round_win_pauses_and_serves_toward_winner() {
        let mut controller = one_v_one();
        let mut rng = rng();
        controller.start(&mut rng);

        score_for(&mut controller, 0, &mut rng);
        score_for(&mut controller, 0, &mut rng);
        let events = score_for(&mut controller, 0, &mut rng);

        assert_eq!(
            events,
            vec![
                MatchEvent::PointScored { team: 0 },
                MatchEvent::RoundEnded { winner: 0 },
                MatchEvent::Paused {
                    seconds: ROUND_PAUSE_SECS
                },
            ]
        );
        let snap = controller.snapshot();
        assert_eq!(snap.scores, [0, 0]);
        assert_eq!(snap.round_wins, [1, 0]);
        assert_eq!(snap.round, 2);
        assert_eq!(controller.phase(), Phase::RoundPause);
        // Winner of the round receives the next serve.
        assert!(snap.ball_vel.x < 0.0);
    }

    #[test]
    fn test_pause_freezes_ball_then_resumes() {
        let mut controller = one_v_one();
        let mut rng = rng();
        controller.start(&mut rng);
        for _ in 0..3 {
            score_for(&mut controller, 0, &mut rng);
        }
        assert_eq!(controller.phase(), Phase::RoundPause);

        let frozen = controller.snapshot().ball_pos;
        for _ in 0..(ROUND_PAUSE_TICKS - 1) {
            assert!(controller.tick(DT, &mut rng).is_empty());
        }
        assert_eq!(controller.snapshot().ball_pos, frozen);

        let events = controller.tick(DT, &mut rng);
        assert_eq!(events, vec![MatchEvent::Resumed]);
        assert_eq!(controller.phase(), Phase::Active);
    }

    #[test]
    fn test_majority_clinch_ends_early() {
        // Best of 5: three round wins clinch at round 3.
        let mut controller = one_v_one();
        let mut rng = rng();
        controller.start(&mut rng);

        for round in 0..3 {
            score_for(&mut controller, 0, &mut rng);
            score_for(&mut controller, 0, &mut rng);
            let events = score_for(&mut controller, 0, &mut rng);
            if round < 2 {
                assert!(events.contains(&MatchEvent::Paused {
                    seconds: ROUND_PAUSE_SECS
                }));
                // Skip the inter-round pause.
                for _ in 0..ROUND_PAUSE_TICKS {
                    controller.tick(DT, &mut rng);
                }
            } else {
                assert!(events.contains(&MatchEvent::GameEnded { winner: 0 }));
            }
        }

        let snap = controller.snapshot();
        assert_eq!(snap.round_wins, [3, 0]);
        assert_eq!(snap.round, 3);
        assert!(!snap.active);
        assert_eq!(controller.phase(), Phase::Ended);
    }

    #[test]
    fn test_all_rounds_played_when_no_clinch() {
        // Best of 3 where the teams trade rounds; decided at round 3.
        let mut controller = MatchController::new(3, &[(0, 0), (1, 0)]);
        let mut rng = rng();
        controller.start(&mut rng);

        let winners = [0u8, 1, 1];
        let mut final_events = Vec::new();
        for (i, &winner) in winners.iter().enumerate() {
            for _ in 0..POINTS_PER_ROUND {
                final_events = score_for(&mut controller, winner, &mut rng);
            }
            if i < 2 {
                for _ in 0..ROUND_PAUSE_TICKS {
                    controller.tick(DT, &mut rng);
                }
            }
        }

        assert!(final_events.contains(&MatchEvent::GameEnded { winner: 1 }));
        assert_eq!(controller.snapshot().round_wins, [1, 2]);
    }

    #[test]
    fn test_tied_rounds_resolve_to_team_zero() {
        // maxRounds 2, one round each: the tie goes to team 0.
        let mut controller = MatchController::new(2, &[(0, 0), (1, 0)]);
        let mut rng = rng();
        controller.start(&mut rng);

        for _ in 0..POINTS_PER_ROUND {
            score_for(&mut controller, 0, &mut rng);
        }
        for _ in 0..ROUND_PAUSE_TICKS {
            controller.tick(DT, &mut rng);
        }
        let mut last = Vec::new();
        for _ in 0..POINTS_PER_ROUND {
            last = score_for(&mut controller, 1, &mut rng);
        }

        assert!(last.contains(&MatchEvent::GameEnded { winner: 0 }));
        assert_eq!(controller.snapshot().round_wins, [1, 1]);
    }

    #[test]
    fn test_ended_controller_is_inert() {
        let mut controller = MatchController::new(1, &[(0, 0), (1, 0)]);
        let mut rng = rng();
        controller.start(&mut rng);
        for _ in 0..POINTS_PER_ROUND {
            score_for(&mut controller, 1, &mut rng);
        }
        assert_eq!(controller.phase(), Phase::Ended);

        let before = controller.snapshot();
        for _ in 0..50 {
            assert!(controller.tick(DT, &mut rng).is_empty());
        }
        assert_eq!(controller.snapshot(), before);
    }

    #[test]
    fn test_update_lists_every_seat() {
        let mut controller = MatchController::new(3, &[(0, 0), (0, 1), (1, 0)]);
        controller.set_paddle(0, 1, 420.0);

        let update = controller.update();
        assert_eq!(update.paddles.len(), 3);
        let second = update
            .paddles
            .iter()
            .find(|p| p.team == 0 && p.position == 1)
            .unwrap();
        assert_approx_eq!(second.offset, 420.0);
    }

    #[test]
    fn test_stop_is_idempotent_after_session_exit() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { cmd_tx };
        drop(cmd_rx);
        handle.stop();
        handle.stop();
        handle.send_move(0, 0, 100.0);
    }

    async fn persistence_env() -> (
        String,
        Arc<RwLock<RoomManager>>,
        Arc<dyn SessionStore>,
        Arc<MemoryStore>,
    ) {
        let mut rooms = RoomManager::new();
        let code = rooms.create_room("alice", 1, GameMode::OneVsOne, 1);
        rooms.join_room(&code, "bob", 2).unwrap();
        let manager = Arc::new(RwLock::new(rooms));
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn SessionStore> = memory.clone();
        (code, manager, store, memory)
    }

    fn mid_game_snapshot() -> MatchState {
        let mut snapshot = MatchState::default();
        snapshot.active = true;
        snapshot.scores = [2, 0];
        snapshot
    }

    #[tokio::test]
    async fn test_flush_persists_while_session_live() {
        let (code, manager, store, memory) = persistence_env().await;
        let (handle, _cmd_rx) = SessionHandle::stub();
        manager.write().await.install_session(&code, handle);
        let flag = Arc::new(AtomicBool::new(false));

        spawn_flush(&code, mid_game_snapshot(), &manager, &store, &flag);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = memory.load_room(&code).await.unwrap().unwrap();
        assert_eq!(record.match_state.scores, [2, 0]);
        let guard = manager.read().await;
        assert_eq!(guard.get(&code).unwrap().match_state.scores, [2, 0]);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_flush_cannot_clobber_finished_game() {
        // A flush spawned while the game was live runs only after the
        // session is gone; it must leave both copies untouched.
        let (code, manager, store, memory) = persistence_env().await;
        let flag = Arc::new(AtomicBool::new(false));

        let mut final_state = MatchState::default();
        final_state.round_wins = [1, 0];
        manager.write().await.finish_session(&code, final_state);

        spawn_flush(&code, mid_game_snapshot(), &manager, &store, &flag);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(memory.load_room(&code).await.unwrap().is_none());
        let guard = manager.read().await;
        let cached = guard.get(&code).unwrap().match_state;
        assert!(!cached.active);
        assert_eq!(cached.round_wins, [1, 0]);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finish_waits_out_pending_write_and_lands_last() {
        let (code, manager, store, memory) = persistence_env().await;
        let broadcaster = Broadcaster::new();
        let mut rng = rng();

        let mut controller = MatchController::new(1, &[(0, 0), (1, 0)]);
        controller.start(&mut rng);
        for _ in 0..POINTS_PER_ROUND {
            score_for(&mut controller, 0, &mut rng);
        }
        assert_eq!(controller.phase(), Phase::Ended);

        // A write is still in flight when the game ends; it finishes with a
        // stale mid-game record shortly after.
        let flag = Arc::new(AtomicBool::new(true));
        {
            let store = store.clone();
            let flag = flag.clone();
            let stale = {
                let mut guard = manager.write().await;
                let room = guard.get_mut(&code).unwrap();
                room.match_state = mid_game_snapshot();
                room.record()
            };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.save_room(&stale).await.unwrap();
                flag.store(false, Ordering::SeqCst);
            });
        }

        finish(
            &code,
            0,
            &controller,
            &manager,
            &store,
            &broadcaster,
            &flag,
        )
        .await;

        // The stored mirror holds the final state, not the stale snapshot.
        let record = memory.load_room(&code).await.unwrap().unwrap();
        assert!(!record.match_state.active);
        assert_eq!(record.match_state.round_wins, [1, 0]);
        assert!(!flag.load(Ordering::SeqCst));

        let alice = memory.load_identity("alice").await.unwrap().unwrap();
        assert_eq!((alice.wins, alice.games_played), (1, 1));
        let bob = memory.load_identity("bob").await.unwrap().unwrap();
        assert_eq!((bob.wins, bob.games_played), (0, 1));
    }
}
