//! Arc generator: decomposes G2/G3 arcs (center-offset or radius form, with
//! helical and full-circle variants) into short planner lines. Segments are
//! spooled out cooperatively as planner buffers free up, so long arcs never
//! deadlock the queue.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::canon::{DistanceMode, FeedRateMode, GcodeState, MotionMode};
use crate::machine::Machine;
use crate::math::{self, AxisVec};
use crate::planner::{MoveProfile, MIN_BLOCK_TIME};
use crate::status::Status;
use crate::AXES;

/// In-flight arc being spooled into the planner.
#[derive(Debug, Clone)]
pub struct ArcState {
    gm: GcodeState,
    p1: usize,
    p2: usize,
    center: (f64, f64),
    radius_start: f64,
    radius_end: f64,
    start_angle: f64,
    /// Signed total angle; negative is clockwise in the plane.
    sweep: f64,
    start: AxisVec,
    target: AxisVec,
    segments: u32,
    emitted: u32,
}

/// Allowed radius disagreement between the two arc endpoints, mm. Within
/// the band the radius is interpolated (spiral); beyond it the arc is
/// malformed.
const ARC_RADIUS_TOLERANCE: f64 = 0.25;

impl Machine {
    /// Validate an arc and stage it for spooling. The first batch of chords
    /// is emitted immediately.
    pub fn cm_arc_feed(
        &mut self,
        target_words: &[Option<f64>; AXES],
        offset_words: &[Option<f64>; 3],
        radius_word: Option<f64>,
        p_word: Option<f64>,
        cw: bool,
    ) -> Result<(), Status> {
        if self.cm.arc.is_some() {
            return Err(Status::MachineIsBusy);
        }
        if self.cm.gm.feed_rate < math::EPSILON {
            return Err(Status::FeedRateNotSpecified);
        }

        let (p1, p2, _) = self.cm.gm.select_plane.axes();
        let start = self.cm.position;
        let target = self.cm.compute_target(target_words);

        let (center, radius_start, radius_end) = if let Some(r_word) = radius_word {
            let r = self.cm.to_internal_units(p1, r_word);
            let x = target[p1] - start[p1];
            let y = target[p2] - start[p2];
            let d2 = x * x + y * y;
            if d2 < math::EPSILON {
                // a radius-form arc cannot describe a full circle
                return Err(Status::ArcSpecificationError);
            }
            let disc = 4.0 * r * r - d2;
            if disc < 0.0 {
                return Err(Status::ArcSpecificationError);
            }
            let mut h_x2_div_d = -disc.sqrt() / d2.sqrt();
            if !cw {
                h_x2_div_d = -h_x2_div_d;
            }
            let r_mag = if r < 0.0 {
                h_x2_div_d = -h_x2_div_d;
                -r
            } else {
                r
            };
            let i = 0.5 * (x - y * h_x2_div_d);
            let j = 0.5 * (y + x * h_x2_div_d);
            ((start[p1] + i, start[p2] + j), r_mag, r_mag)
        } else {
            if offset_words.iter().all(|o| o.is_none()) {
                return Err(Status::ArcSpecificationError);
            }
            let off1 = self.cm.to_internal_units(p1, offset_words[p1].unwrap_or(0.0));
            let off2 = self.cm.to_internal_units(p2, offset_words[p2].unwrap_or(0.0));
            let center = if self.cm.gm.arc_distance_mode == DistanceMode::Incremental {
                (start[p1] + off1, start[p2] + off2)
            } else {
                // absolute IJK are given in the work frame
                (
                    off1 + self.cm.offset_total(p1),
                    off2 + self.cm.offset_total(p2),
                )
            };
            let rs = ((start[p1] - center.0).powi(2) + (start[p2] - center.1).powi(2)).sqrt();
            let re = ((target[p1] - center.0).powi(2) + (target[p2] - center.1).powi(2)).sqrt();
            if (rs - re).abs() > ARC_RADIUS_TOLERANCE || rs < math::EPSILON {
                return Err(Status::ArcSpecificationError);
            }
            (center, rs, re)
        };

        let start_angle = (start[p2] - center.1).atan2(start[p1] - center.0);
        let end_angle = (target[p2] - center.1).atan2(target[p1] - center.0);
        let mut sweep = end_angle - start_angle;
        if cw {
            if sweep > -math::EPSILON {
                sweep -= 2.0 * PI;
            }
        } else if sweep < math::EPSILON {
            sweep += 2.0 * PI;
        }
        // P adds whole extra turns beyond the first
        let turns = p_word.map(|p| p.max(1.0).trunc() as u32).unwrap_or(1);
        let extra = (turns - 1) as f64 * 2.0 * PI;
        sweep += if cw { -extra } else { extra };

        // chord flattening: (1 - cos(theta/2)) * r stays under the tolerance
        let tol = self.cfg.chordal_tolerance;
        let mean_radius = 0.5 * (radius_start + radius_end);
        let max_step = if mean_radius > tol {
            ((1.0 - tol / mean_radius).acos() * 2.0).min(FRAC_PI_2)
        } else {
            FRAC_PI_2
        };
        let mut segments = ((sweep.abs() / max_step).ceil() as u32).max(1);

        // keep each chord above the minimum block time
        let arc_length = sweep.abs() * mean_radius;
        let arc_time = match self.cm.gm.feed_rate_mode {
            FeedRateMode::InverseTime => 1.0 / self.cm.gm.feed_rate,
            FeedRateMode::UnitsPerMinute => arc_length / self.cm.gm.feed_rate,
        };
        let max_segments = ((arc_time / MIN_BLOCK_TIME) as u32).max(1);
        segments = segments.min(max_segments);

        self.cm.gm.motion_mode = if cw {
            MotionMode::CwArc
        } else {
            MotionMode::CcwArc
        };
        let gm = self.motion_gm(target, self.cm.gm.motion_mode);

        self.cm.arc = Some(ArcState {
            gm,
            p1,
            p2,
            center,
            radius_start,
            radius_end,
            start_angle,
            sweep,
            start,
            target,
            segments,
            emitted: 0,
        });
        self.cm.position = target;
        self.cm_arc_callback()
    }

    /// Spool pending arc chords while the planner has room. Called from the
    /// main loop; line admission waits until the arc has fully drained.
    pub fn cm_arc_callback(&mut self) -> Result<(), Status> {
        loop {
            let Some(arc) = self.cm.arc.as_ref() else {
                return Ok(());
            };
            if !self.planner().has_room() {
                return Ok(());
            }
            let i = arc.emitted + 1;
            let point = arc_point(arc, i);
            let mut gm = arc.gm.clone();
            gm.target = point;
            let done = i >= arc.segments;
            if let Err(status) = self.mp_aline(&gm, MoveProfile::Feed) {
                self.cm.arc = None; // abandon a malformed arc
                return Err(status);
            }
            if let Some(arc) = self.cm.arc.as_mut() {
                arc.emitted = i;
            }
            if done {
                self.cm.arc = None;
                return Ok(());
            }
        }
    }

    /// True while an arc is still spooling into the planner.
    pub fn arc_active(&self) -> bool {
        self.cm.arc.is_some()
    }
}

fn arc_point(arc: &ArcState, i: u32) -> AxisVec {
    if i >= arc.segments {
        return arc.target;
    }
    let progress = i as f64 / arc.segments as f64;
    let angle = arc.start_angle + arc.sweep * progress;
    let radius = arc.radius_start + (arc.radius_end - arc.radius_start) * progress;
    let mut point = [0.0; AXES];
    for a in 0..AXES {
        point[a] = arc.start[a] + (arc.target[a] - arc.start[a]) * progress;
    }
    point[arc.p1] = arc.center.0 + radius * angle.cos();
    point[arc.p2] = arc.center.1 + radius * angle.sin();
    point
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn arc_for_test(sweep: f64, radius: f64) -> ArcState {
        ArcState {
            gm: GcodeState::default(),
            p1: 0,
            p2: 1,
            center: (0.0, 0.0),
            radius_start: radius,
            radius_end: radius,
            start_angle: 0.0,
            sweep,
            start: {
                let mut v = [0.0; AXES];
                v[0] = radius;
                v
            },
            target: {
                let mut v = [0.0; AXES];
                v[0] = radius * sweep.cos();
                v[1] = radius * sweep.sin();
                v
            },
            segments: 8,
            emitted: 0,
        }
    }

    #[test]
    fn points_stay_on_the_circle() {
        let arc = arc_for_test(PI, 10.0);
        for i in 1..8 {
            let p = arc_point(&arc, i);
            let r = (p[0] * p[0] + p[1] * p[1]).sqrt();
            assert_approx_eq!(f64, r, 10.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn final_point_is_exact_target() {
        let arc = arc_for_test(PI, 10.0);
        let p = arc_point(&arc, 8);
        assert_eq!(p, arc.target);
    }

    #[test]
    fn helical_axis_interpolates() {
        let mut arc = arc_for_test(PI, 10.0);
        arc.target[2] = 4.0; // climb 4mm over the arc
        let p = arc_point(&arc, 4);
        assert_approx_eq!(f64, p[2], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn radius_mode_finds_center() {
        // quarter circle from (0,0) to (10,10) with r=10: CCW about (0,10)
        let mut machine = Machine::sim();
        machine.cm.gm.feed_rate = 1200.0;
        let mut words = [None; AXES];
        words[0] = Some(10.0);
        words[1] = Some(10.0);
        machine
            .cm_arc_feed(&words, &[None, None, None], Some(10.0), None, false)
            .unwrap();
        // the arc spools immediately; its chords live in the planner
        assert!(machine.mp1.has_runnable_buffer());
        assert_approx_eq!(f64, machine.cm.position[0], 10.0);
        assert_approx_eq!(f64, machine.cm.position[1], 10.0);
    }

    #[test]
    fn impossible_radius_is_rejected() {
        let mut machine = Machine::sim();
        machine.cm.gm.feed_rate = 1200.0;
        let mut words = [None; AXES];
        words[0] = Some(100.0);
        let err = machine
            .cm_arc_feed(&words, &[None, None, None], Some(10.0), None, false)
            .unwrap_err();
        assert_eq!(err, Status::ArcSpecificationError);
    }

    #[test]
    fn center_mode_full_circle() {
        let mut machine = Machine::sim();
        machine.cm.gm.feed_rate = 6000.0;
        // no endpoint: full circle about a center 5mm to the right
        let words = [None; AXES];
        machine
            .cm_arc_feed(&words, &[Some(5.0), None, None], None, None, false)
            .unwrap();
        let arc = machine.cm.arc.as_ref();
        // either fully spooled or still active; sweep was a full turn
        if let Some(arc) = arc {
            assert_approx_eq!(f64, arc.sweep.abs(), 2.0 * PI, epsilon = 1e-9);
        }
        assert_approx_eq!(f64, machine.cm.position[0], 0.0);
    }

    #[test]
    fn missing_offsets_are_rejected() {
        let mut machine = Machine::sim();
        machine.cm.gm.feed_rate = 1200.0;
        let mut words = [None; AXES];
        words[0] = Some(10.0);
        let err = machine
            .cm_arc_feed(&words, &[None, None, None], None, None, false)
            .unwrap_err();
        assert_eq!(err, Status::ArcSpecificationError);
    }
}
