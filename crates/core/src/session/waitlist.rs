//! Host-side admission waitlist

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A participant waiting for the host to admit them
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJoinRequest {
    /// Requesting participant
    pub client_id: String,
    /// Display name, when the server sent one
    pub client_name: Option<String>,
    /// When the request was received
    pub requested_at: DateTime<Utc>,
}

impl PendingJoinRequest {
    /// Create a request stamped with the current time
    pub fn new(client_id: impl Into<String>, client_name: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_name,
            requested_at: Utc::now(),
        }
    }

    /// Name to show for this participant
    pub fn display_name(&self) -> &str {
        self.client_name.as_deref().unwrap_or(&self.client_id)
    }
}

/// Ordered, duplicate-free collection of pending join requests
#[derive(Debug, Clone, Default)]
pub struct Waitlist {
    entries: Vec<PendingJoinRequest>,
}

impl Waitlist {
    /// Create an empty waitlist
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request unless its `client_id` is already waiting
    ///
    /// Returns false for duplicates.
    pub fn insert(&mut self, request: PendingJoinRequest) -> bool {
        if self.contains(&request.client_id) {
            return false;
        }
        self.entries.push(request);
        true
    }

    /// Remove a request by client id
    pub fn remove(&mut self, client_id: &str) -> Option<PendingJoinRequest> {
        let index = self.entries.iter().position(|r| r.client_id == client_id)?;
        Some(self.entries.remove(index))
    }

    /// Whether `client_id` is waiting
    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.iter().any(|r| r.client_id == client_id)
    }

    /// Requests in arrival order
    pub fn entries(&self) -> &[PendingJoinRequest] {
        &self.entries
    }

    /// Number of waiting participants
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every request
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
