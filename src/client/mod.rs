pub mod driver;

pub use driver::{compose, connect, disconnect, send, ConsoleSink};
