//! Task timescales
//!
//! A task measures progress in its own units, related to its source (the
//! parent task, or the platform clock for root tasks) either by a scalar
//! or by a tempo curve. The conversions here are element-wise; walking the
//! hierarchy lives in the scheduler core.

use crate::curve::TempoCurve;

/// How a task's local units relate to its source's units.
pub(crate) enum Sync {
    /// `local = source · scaling`.
    Scaling(f64),
    /// Local position follows the curve evaluated at the source time.
    Curve(TempoCurve),
}

/// Runtime time state of one task.
pub(crate) struct Timescale {
    pub sync: Sync,
    /// Current location in the source's units.
    pub src_loc: f64,
    /// Current location in this task's units.
    pub self_loc: f64,
}

impl Timescale {
    pub fn identity() -> Self {
        Self { sync: Sync::Scaling(1.0), src_loc: 0.0, self_loc: 0.0 }
    }

    /// Advance by `elapsed` source units. Returns the local position update,
    /// which is what the task's children see as their elapsed source time.
    pub fn update_position(&mut self, elapsed: f64) -> f64 {
        match &self.sync {
            Sync::Scaling(scaling) => {
                let update = scaling * elapsed;
                self.self_loc += update;
                self.src_loc += elapsed;
                update
            }
            Sync::Curve(curve) => {
                let new_src_loc = self.src_loc + elapsed;
                let (new_self_loc, _) = curve.position_from_time(new_src_loc);
                // Differencing absolute positions loses significance far from
                // the origin; curve-native deltas would avoid that.
                let update = new_self_loc - self.self_loc;
                self.self_loc = new_self_loc;
                self.src_loc = new_src_loc;
                update
            }
        }
    }

    /// Convert a delay of local steps into the source's units.
    pub fn local_to_source(&self, steps: f64) -> f64 {
        match &self.sync {
            Sync::Scaling(scaling) => {
                debug_assert!(*scaling != 0.0);
                steps / scaling
            }
            Sync::Curve(curve) => {
                let (next_time, _) = curve.time_from_position(self.self_loc + steps);
                next_time - self.src_loc
            }
        }
    }
}
