pub mod client;
pub mod common;
pub mod logging;
pub mod server;
