use std::time::Duration;

use thiserror::Error;

/// Message fragments that mark a thread as evicted rather than gone. The
/// backend drops threads from its working set and needs an explicit resume
/// before they are addressable again.
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "not loaded",
    "no rollout",
    "not materialized yet",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The codex executable is not installed anywhere we look.
    #[error("codex executable not found")]
    ExecutableNotFound,
    /// The backend answered with a well-formed error: it is up, the call was
    /// rejected.
    #[error("codex backend error {code}: {message}")]
    Backend { code: i64, message: String },
    /// Process-level failure: spawn, write, exit, or malformed output.
    #[error("codex transport failure: {0}")]
    Transport(String),
    #[error("codex request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("codex response decode failed for {method}: {message}")]
    Decode { method: String, message: String },
    #[error("codex rpc client is closed")]
    Closed,
}

impl RpcError {
    /// Whether the failure means the backend process itself is unreachable,
    /// as opposed to the backend rejecting an individual call.
    pub fn is_backend_down(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound | Self::Transport(_) | Self::Timeout { .. } | Self::Closed
        )
    }

    /// Whether a resume-then-retry is worth attempting: the backend reported
    /// the thread missing or unloaded. Classification inspects the error code
    /// plus a case-insensitive scan of the message, since backends spell this
    /// condition several ways.
    pub fn is_thread_not_found(&self) -> bool {
        let Self::Backend { message, .. } = self else {
            return false;
        };
        let message = message.to_ascii_lowercase();
        NOT_FOUND_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}
