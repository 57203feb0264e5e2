//! Which client owns which thread, learned from observed traffic.

use std::collections::HashMap;

use monitor_proto::Frame;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no owning client known for thread {thread_id} yet")]
pub struct OwnershipError {
    pub thread_id: String,
}

/// threadId -> owning clientId. Records are created and refreshed from the
/// `sourceClientId` of any inbound frame whose params carry a
/// `conversationId`; nothing ever deletes them. A process-wide last-known
/// owner doubles as a fallback for threads we have not yet seen traffic for.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    by_thread: HashMap<String, String>,
    last_known: Option<String>,
}

impl OwnershipRegistry {
    pub fn observe_frame(&mut self, frame: &Frame) {
        let Some(source) = frame.source_client_id() else {
            return;
        };
        let thread_id = frame
            .params()
            .and_then(|params| params.get("conversationId"))
            .and_then(Value::as_str);
        if let Some(thread_id) = thread_id {
            self.record(thread_id, source);
        }
    }

    pub fn record(&mut self, thread_id: &str, client_id: &str) {
        self.by_thread
            .insert(thread_id.to_string(), client_id.to_string());
        self.last_known = Some(client_id.to_string());
    }

    pub fn owner_of(&self, thread_id: &str) -> Option<&str> {
        self.by_thread.get(thread_id).map(String::as_str)
    }

    pub fn last_known(&self) -> Option<&str> {
        self.last_known.as_deref()
    }

    /// Resolve the client a directly-addressed request should target.
    ///
    /// Priority: the owner observed for this thread, then the caller's
    /// override, then the supplied global fallback. Misdirecting a targeted
    /// request is worse than failing, so with none of the three this errors.
    pub fn resolve_with_fallback(
        &self,
        thread_id: &str,
        override_id: Option<&str>,
        fallback: Option<&str>,
    ) -> Result<String, OwnershipError> {
        self.owner_of(thread_id)
            .or(override_id)
            .or(fallback)
            .map(str::to_string)
            .ok_or_else(|| OwnershipError {
                thread_id: thread_id.to_string(),
            })
    }

    /// Like [`resolve_with_fallback`](Self::resolve_with_fallback), with the
    /// registry's own last-known owner as the fallback.
    pub fn resolve(
        &self,
        thread_id: &str,
        override_id: Option<&str>,
    ) -> Result<String, OwnershipError> {
        self.resolve_with_fallback(thread_id, override_id, self.last_known())
    }
}
