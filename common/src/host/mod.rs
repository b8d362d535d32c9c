// Host-level background work that runs beside the listeners

pub mod heartbeat;

pub use heartbeat::{HeartbeatRecord, HostHeartbeat};
