//! Message bus transport
//!
//! The roles only see the `Transport` trait: publish, subscribe, send a
//! request and serve requests. `TcpTransport` is the network
//! implementation (one encoded message per line over TCP), `MemoryBus`
//! connects roles running in the same process and is what the tests use.

pub mod memory;
pub mod tcp;

pub use memory::MemoryBus;
pub use tcp::TcpTransport;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::message::Message;

/// Turns one request into its reply
pub type RequestHandler = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Sending side of a publication
pub trait Publish: Send + Sync {
    fn send(&self, msg: &Message) -> Result<()>;

    /// Address subscribers connect to
    fn address(&self) -> String;
}

/// Receiving side of a subscription
pub trait MessageSource: Send {
    /// Waits up to `timeout`; `Ok(None)` means nothing arrived.
    /// An error means the subscription is broken and must be recreated.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>>;
}

/// A running request server
pub trait Service: Send {
    fn address(&self) -> String;
    fn stop(&mut self);
}

pub trait Transport: Send + Sync {
    /// Starts publishing on `port` (0 picks a free one)
    fn publisher(&self, port: u16) -> Result<Arc<dyn Publish>>;

    /// Subscribes to `address`, keeping messages whose subject starts
    /// with one of `topics` (all messages when empty)
    fn subscribe(&self, address: &str, topics: &[String]) -> Result<Box<dyn MessageSource>>;

    /// Sends `msg` to the service at `address` and waits for the reply
    fn request(&self, address: &str, msg: &Message, timeout: Duration) -> Result<Message>;

    /// Serves requests on `port` (0 picks a free one)
    fn serve(&self, port: u16, handler: RequestHandler) -> Result<Box<dyn Service>>;
}

/// Prefix topic filtering as done by subscribers
pub fn topic_matches(topics: &[String], subject: &str) -> bool {
    topics.is_empty() || topics.iter().any(|t| subject.starts_with(t.as_str()))
}

/// Publisher that drops everything (used when a role has nothing to publish to)
pub struct NullPublisher;

impl Publish for NullPublisher {
    fn send(&self, _msg: &Message) -> Result<()> {
        Ok(())
    }

    fn address(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        let topics = vec!["/1b/avhrr".to_string(), "/heartbeat".to_string()];
        assert!(topic_matches(&topics, "/1b/avhrr/noaa19"));
        assert!(topic_matches(&topics, "/heartbeat/move_it_server"));
        assert!(!topic_matches(&topics, "/1b/viirs"));
        assert!(topic_matches(&[], "/anything"));
    }
}
