//! Pure fixed-tick ball simulation. No scores, rounds or persistence here;
//! the engine is a state transform plus an event list so it can be tested
//! without any room or session machinery.

use shared::{
    Vec2, BALL_RADIUS, FIELD_HEIGHT, FIELD_WIDTH, INITIAL_BALL_SPEED, MAX_BALL_SPEED, MAX_DEFLECT,
    PADDLE_HEIGHT, PADDLE_WIDTH, SPEED_INCREMENT,
};

/// Ball state advanced by [`step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ball {
    pub pos: Vec2,
    pub vel: Vec2,
}

impl Ball {
    /// A fresh serve from the field center toward the given team's side,
    /// with the caller-supplied vertical drift. Team 0 defends the left
    /// edge, so serving toward team 0 means negative x velocity.
    pub fn serve(toward_team: u8, drift_y: f32) -> Self {
        let dir = if toward_team == 0 { -1.0 } else { 1.0 };
        Ball {
            pos: Vec2::new(FIELD_WIDTH / 2.0, FIELD_HEIGHT / 2.0),
            vel: Vec2::new(dir * INITIAL_BALL_SPEED, drift_y),
        }
    }
}

/// Paddle offsets (top edge) indexed by `[team][position]`. `None` means
/// the seat does not exist in the current mode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaddleSet {
    pub offsets: [[Option<f32>; 2]; 2],
}

impl PaddleSet {
    pub fn set(&mut self, team: u8, position: u8, offset: f32) {
        if team < 2 && position < 2 {
            let clamped = offset.clamp(0.0, FIELD_HEIGHT - PADDLE_HEIGHT);
            self.offsets[team as usize][position as usize] = Some(clamped);
        }
    }

    pub fn get(&self, team: u8, position: u8) -> Option<f32> {
        self.offsets[team as usize][position as usize]
    }
}

/// Events produced by one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicsEvent {
    WallBounce,
    PaddleHit { team: u8 },
    /// The ball is fully past an edge; the caller must reset it before the
    /// next step.
    OutOfBounds { scored_by: u8 },
}

/// Advances the ball by one fixed tick. Deterministic: identical inputs
/// produce identical output.
pub fn step(ball: &mut Ball, paddles: &PaddleSet, dt: f32) -> Vec<PhysicsEvent> {
    let mut events = Vec::new();

    ball.pos.x += ball.vel.x * dt;
    ball.pos.y += ball.vel.y * dt;

    // Horizontal walls: reflect and clamp inside the field so a fast ball
    // cannot tunnel through in a single tick.
    if ball.pos.y - BALL_RADIUS < 0.0 {
        ball.pos.y = BALL_RADIUS;
        ball.vel.y = ball.vel.y.abs();
        events.push(PhysicsEvent::WallBounce);
    } else if ball.pos.y + BALL_RADIUS > FIELD_HEIGHT {
        ball.pos.y = FIELD_HEIGHT - BALL_RADIUS;
        ball.vel.y = -ball.vel.y.abs();
        events.push(PhysicsEvent::WallBounce);
    }

    if ball.vel.x < 0.0 {
        if let Some(hit_top) = paddle_hit(ball, paddles, 0) {
            ball.pos.x = PADDLE_WIDTH + BALL_RADIUS;
            ball.vel.x = ball.vel.x.abs() + SPEED_INCREMENT;
            ball.vel.y = deflection(ball.pos.y, hit_top);
            events.push(PhysicsEvent::PaddleHit { team: 0 });
        }
    } else if ball.vel.x > 0.0 {
        if let Some(hit_top) = paddle_hit(ball, paddles, 1) {
            ball.pos.x = FIELD_WIDTH - PADDLE_WIDTH - BALL_RADIUS;
            ball.vel.x = -(ball.vel.x.abs() + SPEED_INCREMENT);
            ball.vel.y = deflection(ball.pos.y, hit_top);
            events.push(PhysicsEvent::PaddleHit { team: 1 });
        }
    }

    ball.vel.x = ball.vel.x.clamp(-MAX_BALL_SPEED, MAX_BALL_SPEED);
    ball.vel.y = ball.vel.y.clamp(-MAX_BALL_SPEED, MAX_BALL_SPEED);

    if ball.pos.x + BALL_RADIUS < 0.0 {
        events.push(PhysicsEvent::OutOfBounds { scored_by: 1 });
    } else if ball.pos.x - BALL_RADIUS > FIELD_WIDTH {
        events.push(PhysicsEvent::OutOfBounds { scored_by: 0 });
    }

    events
}

/// Angle off the paddle face: hitting the top of the paddle deflects the
/// ball upward, the bottom downward, the center near-straight.
fn deflection(hit_y: f32, paddle_top: f32) -> f32 {
    ((hit_y - paddle_top) / PADDLE_HEIGHT - 0.5) * MAX_DEFLECT
}

/// A hit requires the ball's leading edge to have crossed the defending
/// team's paddle plane while the ball center is inside a seated paddle's
/// y-span. Seats are checked in position order so the outcome is
/// deterministic when both paddles of a team overlap.
fn paddle_hit(ball: &Ball, paddles: &PaddleSet, team: u8) -> Option<f32> {
    let crossed = if team == 0 {
        ball.pos.x - BALL_RADIUS <= PADDLE_WIDTH && ball.pos.x > 0.0
    } else {
        ball.pos.x + BALL_RADIUS >= FIELD_WIDTH - PADDLE_WIDTH && ball.pos.x < FIELD_WIDTH
    };
    if !crossed {
        return None;
    }

    for position in 0..2 {
        if let Some(top) = paddles.get(team, position) {
            if ball.pos.y + BALL_RADIUS >= top && ball.pos.y - BALL_RADIUS <= top + PADDLE_HEIGHT {
                return Some(top);
            }
        }
    }
    None
}
