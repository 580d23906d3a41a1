pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod server;
