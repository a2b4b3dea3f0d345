//! JSON-RPC plumbing for app-server backends
//!
//! - `message`: line classification and outgoing shapes
//! - `channel`: id-correlated request/response over byte streams
//! - `transport`: how the byte streams are obtained

mod channel;
mod message;
mod transport;

pub use channel::{CloseReason, Incoming, RpcChannel};
pub use message::{
    Notification, ParseLineError, Response, RpcErrorObject, RpcMessage, ServerRequest,
};
pub use transport::{RpcTransport, StdioTransport, TransportIo};
