//! Shared-Bus Transport Library
//!
//! One TCP connection to an RS-485 gateway, shared by many independent
//! logical devices. The library provides:
//!
//! - **`frame`**: the wire record model and command builders
//! - **`codec`**: length-prefixed decoding with start-code resynchronization
//! - **`transport`**: the reference-counted connection with serialized writes
//!   and a frame-forwarding read loop
//! - **`dispatcher`**: pub/sub routing of decoded frames to device handlers
//!
//! Data flow:
//!
//! ```text
//! Command ──encode──► BusTransport::send ──wire──► gateway
//! gateway ──wire──► read loop ──FrameCodec──► Dispatcher ──► FrameHandler
//! ```
//!
//! The bus is half-duplex with no request pipelining: sends are mutually
//! exclusive, and reply correlation happens through the identify field
//! matched by the dispatcher.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod transport;

pub use codec::FrameCodec;
pub use dispatcher::{Dispatcher, FrameHandler, RoutingKey, RoutingMode, SubscriptionHandle};
pub use error::{BusLinkError, FrameError, Result};
pub use frame::{
    Command, CommandKind, CurtainAction, Frame, CURTAIN_IDENTIFY, DEFAULT_REGISTER_STATE,
    FC_CURTAIN, FC_READ_HOLDING, FC_WRITE_SINGLE, START_CODE, SWITCH_REGISTER,
};
pub use transport::{BusTransport, BusTransportConfig, TransportStats};
