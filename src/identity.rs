//! SRT stream identity
//!
//! Builds the access-control stream id sent during the SRT handshake
//! (`#!::u=<user>,r=<resource>`).

use std::fmt;

/// Prefix marking a structured SRT access-control stream id.
const STREAM_ID_PREFIX: &str = "#!::";

/// Optional credentials identifying the caller to the SRT peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIdentity {
    user: Option<String>,
    resource: Option<String>,
}

impl StreamIdentity {
    pub fn new(user: Option<String>, resource: Option<String>) -> Self {
        Self { user, resource }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.resource.is_none()
    }

    /// Serialized token; empty when neither field is set.
    pub fn token(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut token = String::from(STREAM_ID_PREFIX);
        if let Some(user) = &self.user {
            token.push_str("u=");
            token.push_str(user);
        }
        if let Some(resource) = &self.resource {
            if self.user.is_some() {
                token.push(',');
            }
            token.push_str("r=");
            token.push_str(resource);
        }
        token
    }

    /// Token in the shape the transport expects: `None` means "send no stream id".
    pub fn stream_id(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.token())
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<anonymous>")
        } else {
            write!(f, "{}", self.token())
        }
    }
}
