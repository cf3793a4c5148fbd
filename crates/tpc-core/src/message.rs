//! # message
//!
//! why: define the single message shape every component speaks
//! relations: produced and consumed by participant.rs, coordinator.rs and the tpc-node runtime
//! what: MessageType tags, Message struct, json wire codec, key/value size limits

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 256;
/// Largest accepted value, in bytes (128 KiB).
pub const MAX_VALUE_SIZE: usize = 128 * 1024;

/// Text carried by every successful response.
pub const SUCCESS: &str = "Success";

/// The fixed set of message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "getreq")]
    GetRequest,
    #[serde(rename = "putreq")]
    PutRequest,
    #[serde(rename = "delreq")]
    DeleteRequest,
    #[serde(rename = "resp")]
    Response,
    /// Phase-1 vote: the participant is prepared to commit.
    #[serde(rename = "ready")]
    Ready,
    /// Phase-1 negative vote, or the phase-2 abort decision.
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "commit")]
    Commit,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "register")]
    Register,
}

/// One protocol message.
///
/// Serialized as a single json object: `type` plus the capitalised members
/// below, each present only when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(rename = "Key", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
    #[serde(rename = "Message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "TPCOpId", skip_serializing_if = "Option::is_none")]
    pub tpc_op_id: Option<String>,
}

impl Message {
    /// A bare message of the given type with every optional field unset.
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            key: None,
            value: None,
            status: None,
            message: None,
            tpc_op_id: None,
        }
    }

    pub fn get_request(key: impl Into<String>) -> Self {
        Self::new(MessageType::GetRequest).with_key(key)
    }

    pub fn put_request(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(MessageType::PutRequest).with_key(key).with_value(value)
    }

    pub fn delete_request(key: impl Into<String>) -> Self {
        Self::new(MessageType::DeleteRequest).with_key(key)
    }

    /// Successful response, optionally echoing a key/value pair.
    pub fn success(key: Option<String>, value: Option<String>) -> Self {
        Self {
            key,
            value,
            status: Some(true),
            message: Some(SUCCESS.to_string()),
            ..Self::new(MessageType::Response)
        }
    }

    /// Failure response carrying the error text.
    pub fn failure(err: &KvError) -> Self {
        Self {
            status: Some(false),
            message: Some(err.to_string()),
            ..Self::new(MessageType::Response)
        }
    }

    pub fn ready(tpc_op_id: impl Into<String>) -> Self {
        Self::new(MessageType::Ready).with_tpc_op_id(tpc_op_id)
    }

    pub fn abort(tpc_op_id: impl Into<String>) -> Self {
        Self::new(MessageType::Abort).with_tpc_op_id(tpc_op_id)
    }

    pub fn commit(tpc_op_id: impl Into<String>) -> Self {
        Self::new(MessageType::Commit).with_tpc_op_id(tpc_op_id)
    }

    pub fn ack(tpc_op_id: impl Into<String>) -> Self {
        Self::new(MessageType::Ack).with_tpc_op_id(tpc_op_id)
    }

    /// Registration request; `info` is `"<id>@<host>:<port>"`.
    pub fn register(info: impl Into<String>) -> Self {
        Self::new(MessageType::Register).with_message(info)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_tpc_op_id(mut self, tpc_op_id: impl Into<String>) -> Self {
        self.tpc_op_id = Some(tpc_op_id.into());
        self
    }

    /// A put or delete request that belongs to a 2PC transaction.
    pub fn is_prepare(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::PutRequest | MessageType::DeleteRequest
        ) && self.tpc_op_id.is_some()
    }

    pub fn is_decision(&self) -> bool {
        matches!(self.msg_type, MessageType::Commit | MessageType::Abort)
    }

    /// Whether a response reports success.
    ///
    /// Responses without an explicit status fall back to the message text.
    pub fn is_success(&self) -> bool {
        match self.status {
            Some(status) => status,
            None => self.message.as_deref() == Some(SUCCESS),
        }
    }

    /// Key, or a validation error when absent.
    pub fn require_key(&self) -> Result<&str> {
        self.key
            .as_deref()
            .ok_or_else(|| KvError::Validation("Empty key".to_string()))
    }

    /// Value, or a validation error when absent.
    pub fn require_value(&self) -> Result<&str> {
        self.value
            .as_deref()
            .ok_or_else(|| KvError::Validation("Empty value".to_string()))
    }

    /// Checks the size limits that apply to this message's type.
    pub fn validate(&self) -> Result<()> {
        match self.msg_type {
            MessageType::GetRequest | MessageType::DeleteRequest => check_key(self.require_key()?),
            MessageType::PutRequest => {
                check_key(self.require_key()?)?;
                check_value(self.require_value()?)
            }
            _ => Ok(()),
        }
    }

    /// Serializes to the json wire form (no trailing newline).
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| KvError::Protocol(e.to_string()))
    }

    /// Parses the json wire form.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text.trim())
            .map_err(|e| KvError::Protocol(format!("Received unparseable message: {e}")))
    }
}

/// Rejects empty or oversized keys.
pub fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvError::Validation("Empty key".to_string()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(KvError::Validation("Over sized key".to_string()));
    }
    Ok(())
}

/// Rejects empty or oversized values.
pub fn check_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(KvError::Validation("Empty value".to_string()));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::Validation("Over sized value".to_string()));
    }
    Ok(())
}
