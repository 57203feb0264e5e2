//! The live-state reducer: folds an ordered list of snapshot/patch stream
//! events into per-thread conversation state.
//!
//! Events are consumed strictly in input order. Callers guarantee arrival
//! order per thread; nothing here re-sorts by any embedded sequence number.
//! The fold is pure, so replaying the same slice twice yields the same map,
//! which callers rely on when they rebuild state from a synthetic snapshot
//! plus the buffered events behind it.

use std::collections::BTreeMap;

use monitor_proto::{StreamChange, StreamEvent};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ReducedThread {
    pub conversation_state: Value,
    pub owner_client_id: Option<String>,
}

/// Pinpoints the event and the patch within it that broke a thread's fold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "live-state reduction failed for thread {thread_id} at event {event_index}, patch {patch_index}: {message}"
)]
pub struct ReductionError {
    pub thread_id: String,
    pub event_index: usize,
    pub patch_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReductionOutcome {
    pub threads: BTreeMap<String, ReducedThread>,
    pub failures: BTreeMap<String, ReductionError>,
}

/// Fold `events` into a per-thread state map.
///
/// A snapshot replaces the thread's tracked state wholesale. A patches event
/// requires a prior snapshot for the same thread within this call; without
/// one there is no base to patch and the thread's reduction fails. A failed
/// thread stays failed for the rest of the fold, and never disturbs any
/// other thread's result.
pub fn reduce_stream_events(events: &[StreamEvent]) -> ReductionOutcome {
    let mut outcome = ReductionOutcome::default();

    for (event_index, event) in events.iter().enumerate() {
        if outcome.failures.contains_key(&event.thread_id) {
            continue;
        }

        match &event.change {
            StreamChange::Snapshot { conversation_state } => {
                outcome.threads.insert(
                    event.thread_id.clone(),
                    ReducedThread {
                        conversation_state: conversation_state.clone(),
                        owner_client_id: event.source_client_id.clone(),
                    },
                );
            }
            StreamChange::Patches { patches } => {
                if !outcome.threads.contains_key(&event.thread_id) {
                    fail(
                        &mut outcome,
                        &event.thread_id,
                        event_index,
                        0,
                        "patch event arrived before any snapshot",
                    );
                    continue;
                }

                let mut failed_at: Option<(usize, String)> = None;
                if let Some(tracked) = outcome.threads.get_mut(&event.thread_id) {
                    for (patch_index, patch) in patches.iter().enumerate() {
                        if let Err(error) =
                            crate::patch::apply_patch(&mut tracked.conversation_state, patch)
                        {
                            failed_at = Some((patch_index, error.to_string()));
                            break;
                        }
                    }
                    if failed_at.is_none() {
                        if let Some(source) = &event.source_client_id {
                            tracked.owner_client_id = Some(source.clone());
                        }
                    }
                }

                if let Some((patch_index, message)) = failed_at {
                    fail(
                        &mut outcome,
                        &event.thread_id,
                        event_index,
                        patch_index,
                        &message,
                    );
                }
            }
        }
    }

    outcome
}

fn fail(
    outcome: &mut ReductionOutcome,
    thread_id: &str,
    event_index: usize,
    patch_index: usize,
    message: &str,
) {
    outcome.threads.remove(thread_id);
    outcome.failures.insert(
        thread_id.to_string(),
        ReductionError {
            thread_id: thread_id.to_string(),
            event_index,
            patch_index,
            message: message.to_string(),
        },
    );
}
