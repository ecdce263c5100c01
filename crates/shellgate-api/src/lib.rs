// shellgate-api: Wire protocol, WebSocket transport, and request correlator
// for the database shell backend.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod socket;

pub use channel::{ChannelConfig, PendingReply, ShellChannel};
pub use error::Error;
pub use protocol::{
    AuthenticateRequest, RequestState, ResponseState, ServerMessage, ShellRequest, ShellResponse,
    WebSessionData,
};
pub use socket::{ReconnectConfig, SocketHandle, SocketState};
