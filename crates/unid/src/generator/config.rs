use core::time::Duration;

use crate::Layout;

/// Construction-time settings for a Snowflake generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Bit partition of generated IDs.
    pub layout: Layout,
    /// How far the clock may move backward before generation fails with
    /// [`ClockRollback`](crate::Error::ClockRollback). Within the tolerance
    /// the blocking APIs wait for the clock to catch up instead.
    pub rollback_tolerance: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            layout: Layout::TWITTER,
            rollback_tolerance: Duration::from_millis(5),
        }
    }
}
