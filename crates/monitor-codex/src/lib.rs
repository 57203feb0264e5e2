//! Codex backend adapter.
//!
//! Combines two transports into one thread-addressable surface: a JSON-RPC
//! subprocess for bulk reads and turn control, and the framed IPC channel for
//! live stream events and directly-addressed requests.

mod adapter;
mod buffer;
mod discovery;
mod error;
mod live_state;
mod ownership;
mod patch;
mod rpc;
mod runtime_state;
mod types;

pub use adapter::{
    AdapterConfig, AdapterError, CodexAdapter, DEFAULT_RECONNECT_DELAY, LiveState, LiveStateError,
    SendMessageOptions,
};
pub use buffer::{EVENT_BUFFER_CAP, ThreadEventBuffers};
pub use discovery::{is_codex_available, resolve_backend_command};
pub use error::RpcError;
pub use live_state::{ReducedThread, ReductionError, ReductionOutcome, reduce_stream_events};
pub use ownership::{OwnershipError, OwnershipRegistry};
pub use patch::{PatchError, apply_patch};
pub use rpc::{CodexBackendConfig, CodexRpc};
pub use runtime_state::{RuntimeState, RuntimeStateCell};
pub use types::*;
