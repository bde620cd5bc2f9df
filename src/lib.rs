//! Hierarchical timescale scheduler
//!
//! A cooperative temporal scheduler for interactive and real-time programs:
//! - Tasks form a tree; each carries its own timescale, related to its
//!   parent's by a scalar or a tempo curve, down to wall-clock at the root
//! - Fibers advance in lockstep with their task's local time and wait in
//!   steps of that timescale
//! - Tempo curves are piecewise constant / linear / Bézier, converted
//!   between time and position by closed forms or adaptive Cash–Karp
//!   integration
//! - Actions fire callbacks at precise wall instants; a look-ahead window
//!   lets fiber events run slightly early to absorb timer jitter
//! - Blocking work migrates to a background worker pool and back

pub mod bezier;
pub mod context;
pub mod curve;
pub mod engine;
pub mod handle;
pub mod ode;
pub mod scheduler;

mod background;
mod messages;
mod queue;
mod timescale;

#[cfg(test)]
mod sched_tests;

pub use background::BACKGROUND_THREADS;
pub use context::{Ctx, Remote};
pub use curve::{CurveAxes, CurveDescriptor, CurveElement, CurveError, Domain, ElementKind, TempoCurve};
pub use engine::{Config, Mode, Scheduler, LOOK_AHEAD_WINDOW};
pub use handle::{FiberHandle, Handle, TaskHandle, HANDLE_SLOTS};
pub use scheduler::{Signal, Steps, Wakeup, ACTION_INLINE_SIZE, FUSION_THRESHOLD};
