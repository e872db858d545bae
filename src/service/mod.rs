pub mod client;
pub mod protocol;
pub mod transport;

pub use client::ServerEndpoint;
pub use transport::{ChunkedChannel, MessageSink};
