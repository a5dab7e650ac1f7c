//! Ramp ("zoid") math for forward planning: given entry, cruise and exit
//! velocities and a block length, carve the block into head (accelerate),
//! body (cruise) and tail (decelerate) sections whose quintic-Bézier
//! integrated distance equals the block length without exceeding the block's
//! jerk.
//!
//! Ramp length derives from the velocity curve whose peak jerk equals the
//! configured limit:
//!
//!     T = q * sqrt(|v1 - v0| / J)     with q = sqrt(10)/3^(1/4)
//!     L = (v0 + v1)/2 * T = (v0 + v1) * sqrt(|v1 - v0|) * q/(2 sqrt(J))
//!
//! The q/(2 sqrt(J)) factor is cached per block as `q_recip_2_sqrt_j`.

use crate::math::{velocity_eq, EPSILON, EPSILON_LENGTH};
use crate::planner::{Block, BlockHint, BlockRuntime};

/// Distance needed to change velocity from `v0` to `v1` at the block's jerk.
pub fn get_target_length(v0: f64, v1: f64, bf: &Block) -> f64 {
    (v0 + v1) * (v1 - v0).abs().sqrt() * bf.q_recip_2_sqrt_j
}

/// Highest velocity reachable from `v0` over `length` while accelerating.
/// Inverse of [`get_target_length`] in the accelerating direction; solved by
/// Newton iteration from a guaranteed over-estimate.
pub fn get_target_velocity(v0: f64, length: f64, bf: &Block) -> f64 {
    if length < EPSILON {
        return v0;
    }
    let target = length / bf.q_recip_2_sqrt_j; // (v0+v) * sqrt(v-v0)
    // (v-v0)^(3/2) <= (v0+v) sqrt(v-v0), so this bounds the root from above
    let mut v = v0 + target.powf(2.0 / 3.0);
    for _ in 0..32 {
        let dv = v - v0;
        if dv <= 0.0 {
            return v0;
        }
        let s = dv.sqrt();
        let f = (v0 + v) * s - target;
        let df = s + (v0 + v) / (2.0 * s);
        let next = (v - f / df).max(v0 + 1e-12);
        if (next - v).abs() < 1e-10 {
            return next;
        }
        v = next;
    }
    v
}

/// Velocity remaining after decelerating as hard as the jerk allows over
/// exactly `length`. Returns `None` for degenerate inputs.
pub fn get_decel_velocity(v0: f64, length: f64, bf: &Block) -> Option<f64> {
    if v0 < EPSILON || length < 0.0 {
        return None;
    }
    let k = bf.q_recip_2_sqrt_j;
    let stop_length = v0 * v0.sqrt() * k;
    if length >= stop_length {
        return Some(0.0);
    }
    // The ramp-length curve peaks at v1 = v0/3; the physical solution lies on
    // the steep branch between there and v0.
    let f = |v1: f64| (v0 + v1) * (v0 - v1).max(0.0).sqrt() * k - length;
    let mut lo = v0 / 3.0;
    let mut hi = v0;
    if f(lo) < 0.0 {
        return None;
    }
    for _ in 0..48 {
        let mid = 0.5 * (lo + hi);
        if f(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(0.5 * (lo + hi))
}

/// Peak velocity for a head+tail move with no body: the cruise point where
/// the two ramps exactly consume `length`.
pub fn get_meet_velocity(v0: f64, v1: f64, length: f64, bf: &Block) -> f64 {
    let k = bf.q_recip_2_sqrt_j;
    let lo_base = v0.max(v1);
    let f = |vc: f64| {
        (v0 + vc) * (vc - v0).max(0.0).sqrt() * k + (v1 + vc) * (vc - v1).max(0.0).sqrt() * k
            - length
    };
    let mut lo = lo_base;
    if f(lo) >= 0.0 {
        return lo; // ramp between the endpoints already covers the length
    }
    let mut hi = get_target_velocity(v0.min(v1), length, bf);
    if f(hi) < 0.0 {
        return hi; // numerical corner; hi is the best reachable peak
    }
    for _ in 0..48 {
        let mid = 0.5 * (lo + hi);
        if f(mid) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Ceiling on the entry velocity of a block given its exit velocity: the
/// speed from which the block can still brake to that exit within its
/// length. Used by back-planning.
pub fn max_entry_velocity(bf: &Block, exit_velocity: f64) -> f64 {
    bf.cruise_vmax
        .min(get_target_velocity(exit_velocity, bf.length, bf))
}

/// Compute the ramp shape for one block. `entry_velocity` is fixed by the
/// previous block; `bf.exit_velocity` is the back-planned request. Fills the
/// runtime block and updates the buffer's plan results and hint.
///
/// Returns true when the exit velocity had to change from the request, which
/// invalidates the next block's hint.
pub fn calculate_ramps(block: &mut BlockRuntime, bf: &mut Block, entry_velocity: f64) -> bool {
    let length = bf.length;
    let requested_exit = bf.exit_velocity.min(bf.exit_vmax);
    let mut exit = requested_exit;
    let mut cruise = bf.cruise_vmax.max(entry_velocity).max(exit);

    let mut head = 0.0;
    let mut body = 0.0;
    let mut tail = 0.0;
    let hint;

    if velocity_eq(entry_velocity, cruise) && velocity_eq(exit, cruise) {
        body = length;
        hint = BlockHint::PerfectCruise;
    } else {
        let head_len = get_target_length(entry_velocity, cruise, bf);
        let tail_len = get_target_length(exit, cruise, bf);

        if head_len + tail_len <= length + EPSILON_LENGTH {
            // requested cruise is reachable; the rest is body
            head = if velocity_eq(entry_velocity, cruise) { 0.0 } else { head_len };
            tail = if velocity_eq(exit, cruise) { 0.0 } else { tail_len };
            body = (length - head - tail).max(0.0);
            let has_head = head > EPSILON_LENGTH;
            let has_tail = tail > EPSILON_LENGTH;
            hint = match (has_head, has_tail) {
                (false, false) => BlockHint::PerfectCruise,
                (true, false) => {
                    if body > EPSILON_LENGTH {
                        BlockHint::MixedAcceleration
                    } else {
                        BlockHint::PerfectAcceleration
                    }
                }
                (false, true) => {
                    if body > EPSILON_LENGTH {
                        BlockHint::MixedDeceleration
                    } else {
                        BlockHint::PerfectDeceleration
                    }
                }
                (true, true) => BlockHint::NoHint,
            };
        } else if velocity_eq(entry_velocity, exit) {
            // symmetric bump: peak at the half-way point
            let peak = get_target_velocity(entry_velocity, length * 0.5, bf).min(cruise);
            if peak <= entry_velocity + EPSILON {
                cruise = entry_velocity.max(exit);
                body = length;
                hint = BlockHint::PerfectCruise;
            } else {
                cruise = peak;
                head = length * 0.5;
                tail = length * 0.5;
                hint = if entry_velocity < EPSILON {
                    BlockHint::ZeroBump
                } else {
                    BlockHint::SymmetricBump
                };
            }
        } else {
            let lo = entry_velocity.min(exit);
            let hi_v = entry_velocity.max(exit);
            let direct = get_target_length(lo, hi_v, bf);
            if exit > entry_velocity && direct >= length - EPSILON_LENGTH {
                // acceleration-limited: exit is as high as the length allows
                exit = exit.min(get_target_velocity(entry_velocity, length, bf));
                cruise = exit;
                head = length;
                hint = BlockHint::PerfectAcceleration;
            } else if exit < entry_velocity && direct >= length - EPSILON_LENGTH {
                // deceleration-limited: exit is as low as the length allows
                if let Some(reachable) = get_decel_velocity(entry_velocity, length, bf) {
                    exit = exit.max(reachable);
                }
                cruise = entry_velocity;
                tail = length;
                hint = BlockHint::PerfectDeceleration;
            } else {
                let meet = get_meet_velocity(entry_velocity, exit, length, bf).min(cruise);
                cruise = meet.max(entry_velocity).max(exit);
                head = get_target_length(entry_velocity, cruise, bf).min(length);
                tail = (length - head).max(0.0);
                hint = BlockHint::AsymmetricBump;
            }
        }
    }

    block.head_length = head;
    block.body_length = body;
    block.tail_length = tail;
    block.head_time = if head > EPSILON_LENGTH {
        2.0 * head / (entry_velocity + cruise)
    } else {
        0.0
    };
    block.body_time = if body > EPSILON_LENGTH && cruise > EPSILON {
        body / cruise
    } else {
        0.0
    };
    block.tail_time = if tail > EPSILON_LENGTH {
        2.0 * tail / (cruise + exit)
    } else {
        0.0
    };
    block.cruise_velocity = cruise;
    block.exit_velocity = exit;

    bf.cruise_velocity = cruise;
    bf.exit_velocity = exit;
    bf.block_time = block.head_time + block.body_time + block.tail_time;
    bf.hint = hint;

    !velocity_eq(exit, requested_exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Block;
    use float_cmp::assert_approx_eq;

    fn test_block(length: f64, cruise_vmax: f64, exit_velocity: f64) -> Block {
        let mut bf = Block {
            length,
            cruise_vmax,
            absolute_vmax: cruise_vmax,
            exit_vmax: cruise_vmax,
            exit_velocity,
            ..Default::default()
        };
        bf.set_jerk(5000.0 * 1.0e6); // 5000 Mmm/min^3
        bf
    }

    #[test]
    fn target_length_grows_with_delta_v() {
        let bf = test_block(100.0, 6000.0, 0.0);
        let l1 = get_target_length(0.0, 3000.0, &bf);
        let l2 = get_target_length(0.0, 6000.0, &bf);
        assert!(l2 > l1 * 2.0);
        // symmetric in direction of change
        assert_approx_eq!(
            f64,
            get_target_length(0.0, 6000.0, &bf),
            get_target_length(6000.0, 0.0, &bf),
            epsilon = 1e-9
        );
    }

    #[test]
    fn target_velocity_inverts_target_length() {
        let bf = test_block(100.0, 6000.0, 0.0);
        let length = get_target_length(1000.0, 5000.0, &bf);
        let v = get_target_velocity(1000.0, length, &bf);
        assert_approx_eq!(f64, v, 5000.0, epsilon = 1e-3);
    }

    #[test]
    fn decel_velocity_full_stop_when_length_allows() {
        let bf = test_block(100.0, 6000.0, 0.0);
        let stop = get_target_length(6000.0, 0.0, &bf);
        assert_eq!(get_decel_velocity(6000.0, stop * 1.01, &bf), Some(0.0));
    }

    #[test]
    fn decel_velocity_partial_braking() {
        let bf = test_block(100.0, 6000.0, 0.0);
        let stop = get_target_length(6000.0, 0.0, &bf);
        let v1 = get_decel_velocity(6000.0, stop * 0.5, &bf).unwrap();
        assert!(v1 > 0.0 && v1 < 6000.0);
        // decelerating over that length lands within tolerance of the answer
        let check = get_target_length(v1, 6000.0, &bf);
        assert_approx_eq!(f64, check, stop * 0.5, epsilon = 1e-3);
    }

    #[test]
    fn meet_velocity_consumes_whole_length(){
        let bf = test_block(10.0, 60000.0, 0.0);
        let meet = get_meet_velocity(1000.0, 2000.0, 10.0, &bf);
        assert!(meet >= 2000.0);
        let used = get_target_length(1000.0, meet, &bf) + get_target_length(2000.0, meet, &bf);
        assert_approx_eq!(f64, used, 10.0, epsilon = 1e-3);
    }

    #[test]
    fn ramps_long_move_has_body() {
        // 100mm at 6000 mm/min from rest to rest
        let mut bf = test_block(100.0, 6000.0, 0.0);
        let mut block = BlockRuntime::default();
        let changed = calculate_ramps(&mut block, &mut bf, 0.0);
        assert!(!changed);
        assert!(block.head_length > 0.0);
        assert!(block.body_length > 0.0);
        assert!(block.tail_length > 0.0);
        assert_approx_eq!(
            f64,
            block.head_length + block.body_length + block.tail_length,
            100.0,
            epsilon = 1e-3
        );
        // symmetric because entry == exit == 0
        assert_approx_eq!(f64, block.head_length, block.tail_length, epsilon = 1e-6);
        assert_approx_eq!(f64, block.cruise_velocity, 6000.0, epsilon = 1e-6);
        // ramp takes at least the minimum-time bound 2*sqrt(dv/J)
        let t_min = 2.0 * (6000.0_f64 / 5.0e9).sqrt();
        assert!(block.head_time >= t_min * 0.99);
    }

    #[test]
    fn ramps_short_move_bumps() {
        // too short to reach cruise: symmetric bump
        let mut bf = test_block(1.0, 20000.0, 0.0);
        let mut block = BlockRuntime::default();
        calculate_ramps(&mut block, &mut bf, 0.0);
        assert_eq!(bf.hint, BlockHint::ZeroBump);
        assert!(block.cruise_velocity < 20000.0);
        assert!(block.body_length < 1e-6);
        assert_approx_eq!(f64, block.head_length, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn ramps_acceleration_limited_exit_clamps() {
        // short block asked to exit far faster than jerk allows
        let mut bf = test_block(0.5, 30000.0, 30000.0);
        let mut block = BlockRuntime::default();
        let changed = calculate_ramps(&mut block, &mut bf, 0.0);
        assert!(changed);
        assert_eq!(bf.hint, BlockHint::PerfectAcceleration);
        assert!(block.exit_velocity < 30000.0);
        assert_approx_eq!(f64, block.head_length, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn ramps_pure_cruise() {
        let mut bf = test_block(10.0, 6000.0, 6000.0);
        let mut block = BlockRuntime::default();
        calculate_ramps(&mut block, &mut bf, 6000.0);
        assert_eq!(bf.hint, BlockHint::PerfectCruise);
        assert_approx_eq!(f64, block.body_length, 10.0);
        assert_approx_eq!(f64, block.body_time, 10.0 / 6000.0);
    }

    #[test]
    fn ramps_velocity_invariants_hold() {
        let mut bf = test_block(25.0, 12000.0, 3000.0);
        let mut block = BlockRuntime::default();
        calculate_ramps(&mut block, &mut bf, 1000.0);
        assert!(1000.0 <= block.cruise_velocity + 1e-9);
        assert!(block.exit_velocity <= block.cruise_velocity + 1e-9);
        assert_approx_eq!(
            f64,
            block.head_length + block.body_length + block.tail_length,
            25.0,
            epsilon = 1e-3
        );
    }
}
