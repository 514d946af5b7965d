//! The seam between the engine and a concrete CAN transport
use thiserror::Error;

use crate::frame::CanFrame;

/// Errors surfaced by a [Port] implementation
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every transmit mailbox is occupied
    #[error("transmit mailboxes full")]
    TxOverflow,
    /// The port is not attached to a bus
    #[error("port is offline")]
    Offline,
}

/// A CAN transport: frames in, frames out, and a clock
///
/// Every operation is non-blocking and returns immediately; the engine polls
/// the fill/free levels and never waits inside a call. Implementations range
/// from hardware mailboxes to the in-process [VirtualBus](crate::vbus::VirtualBus)
/// used for testing.
pub trait Port {
    /// Bring the port up; called once when a node takes ownership of it
    fn init(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    /// Tear the port down
    fn deinit(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    /// Monotonic milliseconds
    fn tick(&self) -> u64;

    /// Number of empty transmit mailbox slots
    fn tx_free_level(&self) -> u32;

    /// Number of received frames waiting to be read
    fn rx_fill_level(&self) -> u32;

    /// Hand one frame to the transport
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), PortError>;

    /// Take one received frame, if any
    fn receive(&mut self) -> Option<CanFrame>;
}
