pub mod analog_cache;
pub mod config;
pub mod drivers;
pub mod error;
pub mod http;
pub mod latency;
pub mod lifecycle;
pub mod liveness;
pub mod publisher;
pub mod pulse;
pub mod sensors;
pub mod simulation;
pub mod sink;
pub mod task;
pub mod telemetry;
