//! An SAE J1939-21 transport protocol engine
//!
//! Turns a datagram-style interface ("send this 50 byte message with this PGN
//! to that address") into a stream of 8 byte CAN frames, and back again on
//! receive. Short messages travel as single frames; anything from 9 to 1785
//! bytes is fragmented and reassembled by the transport protocol, broadcast
//! (BAM) or connection mode (RTS/CTS) depending on the identifier.
//!
//! The engine is single-threaded and cooperative: all work happens inside
//! [Node::send] and the periodic [Engine::tick]. Ports are polled, never
//! waited on.
pub mod engine;
pub mod frame;
pub mod message;
pub mod node;
pub mod port;
pub mod tp;
pub mod vbus;

pub use engine::{Engine, NodeId};
pub use frame::CanFrame;
pub use message::CanMessage;
pub use node::{Node, NodeHandler, default_filter};
pub use port::{Port, PortError};
pub use tp::{AbortReason, SendError};
pub use vbus::{VirtualBus, VirtualPort};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
