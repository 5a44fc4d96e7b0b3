//! Protocols shipped with the engine.

pub mod ping;
pub mod rdma_ping;

pub use ping::PingOp;
pub use rdma_ping::RdmaPingOp;
