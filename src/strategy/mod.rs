// Breakout signal engine
pub mod breakout;

pub use breakout::{reference_levels, BreakoutEngine, BreakoutParams, ReferenceLevels, SignalEvent};

use crate::models::Side;

/// Renderer-facing capability for showing the active position's levels.
///
/// The engine depends on this abstractly; [`NoopOverlay`] satisfies tests
/// and headless runs without a chart attached.
pub trait OverlaySink: Send + Sync {
    fn set_levels(&self, entry: f64, stop: f64, target: f64, side: Side);
    fn clear(&self);
}

pub struct NoopOverlay;

impl OverlaySink for NoopOverlay {
    fn set_levels(&self, _entry: f64, _stop: f64, _target: f64, _side: Side) {}
    fn clear(&self) {}
}
