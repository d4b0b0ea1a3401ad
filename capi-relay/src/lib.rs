pub mod api;
pub mod client_ip;
pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod event;
pub mod fbc;
pub mod limiters;
pub mod pipeline;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
