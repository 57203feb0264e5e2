//! Process-wide adapter status, published over a watch channel.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub app_ready: bool,
    pub ipc_connected: bool,
    pub ipc_initialized: bool,
    pub codex_available: bool,
    pub last_error: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            app_ready: false,
            ipc_connected: false,
            ipc_initialized: false,
            // Assume installed until discovery proves otherwise.
            codex_available: true,
            last_error: None,
        }
    }
}

/// Single owner of the runtime-state tuple. Transitions notify subscribers
/// only when the tuple actually changes value.
#[derive(Debug)]
pub struct RuntimeStateCell {
    tx: watch::Sender<RuntimeState>,
}

impl Default for RuntimeStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RuntimeState::default());
        Self { tx }
    }

    pub fn current(&self) -> RuntimeState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.tx.subscribe()
    }

    /// Apply a pure transition. No notification goes out when `next == old`.
    pub fn update(&self, transition: impl FnOnce(&mut RuntimeState)) {
        self.tx.send_if_modified(|state| {
            let old = state.clone();
            transition(state);
            *state != old
        });
    }
}
