//! # client
//!
//! why: give callers get/put/delete against a coordinator without speaking the wire format
//! relations: talks to coordinator.rs's ClientHandler through wire.rs
//! what: KvClient, mapping of failure responses back to KvError kinds

use std::time::Duration;

use tpc_core::{KvError, Message, MessageType};

use crate::config::DEFAULT_TIMEOUT;
use crate::wire;

/// Talks to one coordinator; every call opens its own connection.
#[derive(Debug, Clone)]
pub struct KvClient {
    addr: String,
    timeout: Duration,
}

impl KvClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Upper bound on the whole exchange, 2PC rounds included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get(&self, key: &str) -> Result<String, KvError> {
        let reply = self.send(&Message::get_request(key))?;
        reply
            .value
            .ok_or_else(|| KvError::Protocol("successful get without a value".into()))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.send(&Message::put_request(key, value)).map(|_| ())
    }

    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        self.send(&Message::delete_request(key)).map(|_| ())
    }

    fn send(&self, request: &Message) -> Result<Message, KvError> {
        let reply = wire::call(&self.addr, request, self.timeout)?;
        if reply.msg_type != MessageType::Response {
            return Err(KvError::Protocol(format!(
                "expected resp, got {:?}",
                reply.msg_type
            )));
        }
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(remote_error(reply.message.unwrap_or_default()))
        }
    }
}

/// Rebuilds the error a failure response was made from.
fn remote_error(text: String) -> KvError {
    const VALIDATION: [&str; 4] = ["Empty key", "Over sized key", "Empty value", "Over sized value"];

    if VALIDATION.contains(&text.as_str()) {
        KvError::Validation(text)
    } else if text.starts_with("Does not exist") {
        KvError::NotFound(text)
    } else if let Some(reason) = text.strip_prefix("Aborted: ") {
        KvError::Aborted(reason.to_string())
    } else if let Some(reason) = text.strip_prefix("Unavailable: ") {
        KvError::Unavailable(reason.to_string())
    } else {
        KvError::Protocol(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_maps_back_to_error_kinds() {
        assert!(matches!(remote_error("Over sized key".into()), KvError::Validation(_)));
        assert!(matches!(remote_error("Does not exist".into()), KvError::NotFound(_)));
        assert!(matches!(
            remote_error("Aborted: a replica did not vote ready".into()),
            KvError::Aborted(_)
        ));
        assert!(matches!(remote_error("something odd".into()), KvError::Protocol(_)));
    }

    #[test]
    fn unreachable_coordinator_is_an_io_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = KvClient::new(addr).with_timeout(Duration::from_millis(300));
        assert!(matches!(client.get("k"), Err(KvError::Io(_))));
    }
}
