//! Live stream sessions.
//!
//! A [`StreamSession`] owns one upstream tuner stream and at most one
//! transcoding process for the lifetime of a single stream request. The
//! [`StreamManager`] keeps track of all running sessions.

pub mod command;
mod ended;
mod manager;
mod mode;
mod reader;
mod session;

pub use ended::{EndReason, EndedSignal};
pub use manager::StreamManager;
pub use mode::{ProcessOption, StreamKind, StreamMode};
pub use session::{LiveStreamInfo, SessionContext, SessionState, StreamSession};
