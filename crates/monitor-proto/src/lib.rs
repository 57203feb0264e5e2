//! Protocol types shared by the IPC channel and the backend adapters.

mod event;
mod frame;
mod state;
mod validate;

pub use event::{
    PatchOp, PatchOpKind, PathSegment, STREAM_EVENT_METHOD, StreamChange, StreamEvent,
};
pub use frame::{
    BroadcastFrame, Frame, InitializeFrame, InitializeParams, InitializeResponseFrame,
    PROTOCOL_VERSION, RequestFrame, ResponseFrame,
};
pub use state::{ConversationState, PendingRequest, Turn, TurnStatus};
pub use validate::{FrameValidationError, ValidationIssue};
