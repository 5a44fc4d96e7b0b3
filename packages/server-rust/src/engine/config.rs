use std::time::Duration;

/// Engine-level configuration.
///
/// The node id is not part of it: an engine takes its identity from the
/// transport it is attached to.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte budget of the node-local buffer allocator.
    pub allocator_capacity_bytes: usize,
    /// Maximum number of live operations, origin and target combined.
    /// Launches beyond it fail; new inbound conversations are dropped.
    pub max_live_ops: usize,
    /// How long `shutdown` waits for live operations before abandoning them.
    pub shutdown_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allocator_capacity_bytes: 64 * 1024 * 1024,
            max_live_ops: 10_000,
            shutdown_drain_timeout: Duration::from_secs(5),
        }
    }
}
