pub mod config;
pub mod dispatch;
pub mod engine;
pub mod log;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod session;
