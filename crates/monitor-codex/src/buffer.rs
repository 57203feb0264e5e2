//! Per-thread buffers of raw stream broadcasts, with quarantine pruning.

use std::collections::{HashMap, VecDeque};

use monitor_proto::{BroadcastFrame, StreamEvent};

/// Buffer cap per thread; the oldest event is evicted first.
pub const EVENT_BUFFER_CAP: usize = 400;

#[derive(Debug, Default)]
pub struct ThreadEventBuffers {
    by_thread: HashMap<String, VecDeque<BroadcastFrame>>,
}

impl ThreadEventBuffers {
    pub fn push(&mut self, thread_id: &str, frame: BroadcastFrame) {
        let buffer = self.by_thread.entry(thread_id.to_string()).or_default();
        if buffer.len() >= EVENT_BUFFER_CAP {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    pub fn len(&self, thread_id: &str) -> usize {
        self.by_thread.get(thread_id).map_or(0, VecDeque::len)
    }

    /// Raw buffered frames in arrival order, for audit/replay surfaces.
    pub fn raw_events(&self, thread_id: &str) -> Vec<BroadcastFrame> {
        self.by_thread
            .get(thread_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-validate every buffered event for a thread, pruning the ones that
    /// fail so they are never re-attempted.
    ///
    /// Pruning is hygiene, not correctness: the valid subset always comes
    /// back usable. The first invalid event per batch is logged with its
    /// bounded issue summary; a batch line reports pruned vs total.
    pub fn materialize(&mut self, thread_id: &str) -> Vec<StreamEvent> {
        let Some(buffer) = self.by_thread.get_mut(thread_id) else {
            return Vec::new();
        };

        let total = buffer.len();
        let mut kept = VecDeque::with_capacity(total);
        let mut events = Vec::with_capacity(total);
        let mut pruned = 0usize;

        for frame in buffer.drain(..) {
            match StreamEvent::from_broadcast(&frame) {
                Ok(event) => {
                    events.push(event);
                    kept.push_back(frame);
                }
                Err(error) => {
                    if pruned == 0 {
                        tracing::warn!(
                            thread_id,
                            issues = %error.summary(),
                            "pruning invalid stream event"
                        );
                    }
                    pruned += 1;
                }
            }
        }

        *buffer = kept;
        if pruned > 0 {
            tracing::warn!(thread_id, pruned, total, "stream event batch pruned");
        }
        events
    }
}
