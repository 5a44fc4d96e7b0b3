use std::time::Duration;

/// Fault and timing knobs of the in-process fabric.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricConfig {
    /// Added to every send, get, and put.
    pub latency: Duration,
    /// Probability in `[0, 1]` that a send is silently lost. Get and put are
    /// never dropped.
    pub drop_rate: f64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            drop_rate: 0.0,
        }
    }
}
