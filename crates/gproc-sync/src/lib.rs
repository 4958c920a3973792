//! Live synchronization core for the gproc operator console.
//!
//! One duplex connection to the backend carries every real-time event. This
//! crate owns the pieces that must stay consistent with that stream: the
//! connection state machine, the frame demultiplexer, the per-topic bounded
//! buffers, and the session/permission model that gates user actions. It
//! has no runtime of its own; transports and timers plug in through the
//! [`connection::Transport`] and [`connection::Scheduler`] seams.

pub mod backoff;
pub mod buffers;
pub mod connection;
pub mod demux;
pub mod guard;
pub mod routes;
pub mod session;
pub mod wire;

pub use backoff::{Backoff, BackoffPolicy};
pub use buffers::{BufferLimits, ChannelBuffer, ChannelBuffers, Retention};
pub use connection::{
    ConnectRequest, ConnectionManager, ConnectionState, Scheduler, TimerHandle, TimerToken,
    Transport, TransportHandle,
};
pub use demux::{DemuxStats, Demultiplexer, Dispatch};
pub use guard::{has_permission, satisfies, PermissionClaim, ADMIN_ROLE, WILDCARD_SCOPE};
pub use routes::{evaluate_route, RouteDecision, RouteRule, ROUTES};
pub use session::{BearerToken, Credentials, LoginResponse, Session, User};
pub use wire::{
    decode_frame, encode_frame, Frame, LogLine, Topic, WireError, DEFAULT_MAX_FRAME_BYTES,
};
