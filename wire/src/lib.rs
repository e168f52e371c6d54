//! # culvert-wire
//!
//! Wire-level building blocks shared by the controller and the agent:
//!
//! - [`frame`] — the tagged-union messages exchanged on a tunnel stream
//! - [`codec`] — length-prefixed framing over any async byte stream
//! - [`registry`] — per-transaction cancel handles and response routing
//!
//! The protocol is a single full-duplex stream per agent. Frames are
//! processed strictly in order per direction; everything transaction-scoped
//! carries the transaction id so many HTTP exchanges can interleave on one
//! stream.

pub mod codec;
pub mod frame;
pub mod registry;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use frame::{
    bad_gateway_frames, Annotation, Endpoint, Frame, Hello, HttpHeader, HttpTunnelResponse,
    OpenHttpTunnelRequest, TunnelControl,
};
pub use registry::TransactionRegistry;
