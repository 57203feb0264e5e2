//! Framed duplex channel for the desktop agent IPC socket.

mod channel;
mod codec;

pub use channel::{ChannelConfig, ChannelError, DuplexChannel, RequestOptions};
pub use codec::{CodecError, MAX_FRAME_LEN, read_frame, write_frame};
