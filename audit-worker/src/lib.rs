pub mod config;
pub mod error;
pub mod kafka;
pub mod sinks;
pub mod worker;
