//! Physical messages flowing through the receive pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered header map carried on every message.
pub type Headers = BTreeMap<String, String>;

/// A message as received from the input queue.
///
/// The body may be replaced by stages (decompression, decryption, ...); the
/// bytes originally received are kept so retries and error-queue forwarding
/// always carry the payload as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    message_id: String,
    headers: Headers,
    body: Vec<u8>,
    original_body: Vec<u8>,
}

impl IncomingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            original_body: body.clone(),
            body,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Header value by key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body seen by later stages. The original bytes are retained.
    pub fn update_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn body_was_modified(&self) -> bool {
        self.body != self.original_body
    }

    /// Restore the body to the bytes originally received.
    pub fn revert_to_original_body_if_needed(&mut self) {
        if self.body_was_modified() {
            self.body = self.original_body.clone();
        }
    }
}

/// A message about to be dispatched.
///
/// Always built as a fresh copy; it never aliases the incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body,
        }
    }

    /// Copy the current headers and body of an incoming message.
    pub fn from_incoming(message: &IncomingMessage) -> Self {
        Self {
            message_id: message.message_id().to_string(),
            headers: message.headers().clone(),
            body: message.body().to_vec(),
        }
    }

    /// Turn a dispatched message back into what a receiver would see.
    pub fn into_incoming(self) -> IncomingMessage {
        IncomingMessage::new(self.message_id, self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_body_after_mutation() {
        let mut message = IncomingMessage::new("id", Headers::new(), b"original".to_vec());
        message.update_body(b"modified".to_vec());

        assert!(message.body_was_modified());
        message.revert_to_original_body_if_needed();

        assert_eq!(message.body(), b"original");
        assert!(!message.body_was_modified());
    }

    #[test]
    fn test_outgoing_copies_current_state() {
        let mut headers = Headers::new();
        headers.insert("key".to_string(), "value".to_string());
        let mut incoming = IncomingMessage::new("id", headers, b"body".to_vec());

        let outgoing = OutgoingMessage::from_incoming(&incoming);
        incoming.headers_mut().insert("later".to_string(), "x".to_string());

        assert_eq!(outgoing.message_id, "id");
        assert_eq!(outgoing.body, b"body");
        assert!(!outgoing.headers.contains_key("later"));
        assert_eq!(outgoing.headers.get("key").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_into_incoming_resets_original_body() {
        let outgoing = OutgoingMessage::new("id", Headers::new(), b"payload".to_vec());
        let incoming = outgoing.into_incoming();

        assert_eq!(incoming.body(), b"payload");
        assert!(!incoming.body_was_modified());
    }

    #[test]
    fn test_serialized_message_keeps_original_body() {
        let mut message = IncomingMessage::new("id", Headers::new(), b"original".to_vec());
        message.update_body(b"modified".to_vec());

        let json = serde_json::to_string(&message).unwrap();
        let mut restored: IncomingMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.body(), b"modified");
        restored.revert_to_original_body_if_needed();
        assert_eq!(restored.body(), b"original");
    }
}
