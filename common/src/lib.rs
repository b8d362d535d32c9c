// Blob trigger engine: detects blob writes in storage accounts and decides
// which registered functions to invoke

pub mod blob_path;
pub mod clock;
pub mod config;
pub mod errors;
pub mod host;
pub mod listener;
pub mod models;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod timer;
pub mod trigger;
