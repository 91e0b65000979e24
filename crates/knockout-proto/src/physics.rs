use crate::Shot;

/// Distance from the centre beyond which a puck has fallen off the table.
pub const PLATFORM_RADIUS: f64 = 0.45;
pub const PUCK_RADIUS: f64 = 0.05;

const SHOT_POWER: f64 = 0.015;
const FRICTION: f64 = 0.98;
const MAX_STEPS: usize = 50;
const REST_SPEED: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Puck {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub vx: f64,
    pub vy: f64,
}

impl Puck {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            radius: PUCK_RADIUS,
            vx: 0.0,
            vy: 0.0,
        }
    }

    pub fn strike(&mut self, shot: Shot) {
        self.vx = shot.dx * SHOT_POWER;
        self.vy = shot.dy * SHOT_POWER;
    }

    pub fn is_out(&self) -> bool {
        self.x.hypot(self.y) > PLATFORM_RADIUS
    }

    fn at_rest(&self) -> bool {
        self.vx.abs() <= REST_SPEED && self.vy.abs() <= REST_SPEED
    }

    fn advance(&mut self) {
        self.x += self.vx;
        self.y += self.vy;
        self.vx *= FRICTION;
        self.vy *= FRICTION;
    }
}

/// Runs the fixed-step simulation until both pucks settle or the step budget
/// is spent. Both sides of a match run this so predictions line up with the
/// authoritative result.
pub fn simulate(pucks: &mut [Puck; 2]) {
    for _ in 0..MAX_STEPS {
        for puck in pucks.iter_mut() {
            puck.advance();
        }
        resolve_collision(pucks);
        if pucks.iter().all(Puck::at_rest) {
            break;
        }
    }
}

fn resolve_collision(pucks: &mut [Puck; 2]) {
    let [a, b] = pucks;
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let distance = dx.hypot(dy);
    let min_distance = a.radius + b.radius;
    if distance >= min_distance || distance <= 0.0 {
        return;
    }

    let nx = dx / distance;
    let ny = dy / distance;
    let closing = (a.vx - b.vx) * nx + (a.vy - b.vy) * ny;
    if closing > 0.0 {
        // equal masses: exchange the normal component
        a.vx -= closing * nx;
        a.vy -= closing * ny;
        b.vx += closing * nx;
        b.vy += closing * ny;
    }

    let overlap = (min_distance - distance) / 2.0;
    a.x -= overlap * nx;
    a.y -= overlap * ny;
    b.x += overlap * nx;
    b.y += overlap * ny;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> [Puck; 2] {
        [Puck::at(-0.3, 0.0), Puck::at(0.3, 0.0)]
    }

    #[test]
    fn resting_pucks_stay_put() {
        let mut pucks = start();
        simulate(&mut pucks);
        assert_eq!(pucks, start());
    }

    #[test]
    fn friction_slows_a_lone_puck() {
        let mut pucks = start();
        pucks[0].strike(Shot::new(0.0, 1.0));
        simulate(&mut pucks);
        assert!(pucks[0].y > 0.0);
        assert!(pucks[0].vy < 0.015);
        assert_eq!(pucks[1], Puck::at(0.3, 0.0));
    }

    #[test]
    fn head_on_hit_transfers_momentum() {
        let mut pucks = start();
        pucks[0].strike(Shot::new(3.0, 0.0));
        simulate(&mut pucks);
        assert!(pucks[1].x > 0.3, "target should be pushed right");
        assert!(pucks[0].x < pucks[1].x);
        let gap = pucks[1].x - pucks[0].x;
        assert!(gap >= PUCK_RADIUS * 2.0 - 1e-9);
    }

    #[test]
    fn out_of_bounds_uses_platform_radius() {
        assert!(!Puck::at(0.3, 0.0).is_out());
        assert!(!Puck::at(0.45, 0.0).is_out());
        assert!(Puck::at(0.4, 0.3).is_out());
    }
}
