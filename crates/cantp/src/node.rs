//! Per-node state: address, TX FIFO, transport session, and callbacks
use std::collections::VecDeque;

use crate::frame::{self, ADDRESS_GLOBAL, CanFrame};
use crate::message::CanMessage;
use crate::port::{Port, PortError};
use crate::tp::{self, AbortReason, SendError, TpEvent, TpSession};

/// The callback set a [Node] drives as traffic comes and goes
///
/// Every method has a default: [NodeHandler::filter] applies
/// [default_filter], everything else is a no-op. `()` implements the trait as
/// the all-default handler.
pub trait NodeHandler {
    /// The software filter; runs after [NodeHandler::reading] on every
    /// received frame and decides whether the node processes it
    fn filter(&mut self, self_address: u8, frame: &CanFrame) -> bool {
        default_filter(self_address, frame)
    }

    /// A complete application message arrived, either as a single frame or
    /// reassembled by the transport protocol
    fn decode(&mut self, msg: CanMessage) {
        let _ = msg;
    }

    /// A frame was handed to the port for transmission
    fn sending(&mut self, frame: &CanFrame) {
        let _ = frame;
    }

    /// A frame could not be queued or transmitted and has been dropped
    fn missing(&mut self, frame: &CanFrame) {
        let _ = frame;
    }

    /// A frame was read from the port, before filtering
    fn reading(&mut self, frame: &CanFrame) {
        let _ = frame;
    }

    /// A transport session timed out; the in-progress message is handed back
    fn timeout(&mut self, msg: CanMessage) {
        let _ = msg;
    }
}

impl NodeHandler for () {}

/// The default software filter: accept broadcast frames, and peer-directed
/// frames addressed to this node or to the global address
#[inline]
#[must_use]
pub fn default_filter(self_address: u8, frame: &CanFrame) -> bool {
    frame.dst() == self_address || frame.dst() == ADDRESS_GLOBAL
}

/// One network node: an address on a port, with its own TX FIFO and at most
/// one transport session in flight
///
/// A node does nothing on its own; [Node::task] (normally invoked through
/// [Engine::tick](crate::engine::Engine::tick)) performs one cooperative
/// pass: advance the transport session, drain the TX FIFO into the port, and
/// poll received frames.
pub struct Node {
    name: String,
    address: u8,
    port: Box<dyn Port>,
    handler: Box<dyn NodeHandler>,
    tx_fifo: VecDeque<CanFrame>,
    fifo_capacity: usize,
    session: TpSession,
}

impl Node {
    /// Create a node and bring its port up
    pub fn new(
        name: impl Into<String>,
        address: u8,
        fifo_capacity: usize,
        mut port: Box<dyn Port>,
        handler: Box<dyn NodeHandler>,
    ) -> Result<Self, PortError> {
        port.init()?;
        let name = name.into();
        tracing::debug!("[{name}] node up at address {address:#04X}");
        Ok(Self {
            name,
            address,
            port,
            handler,
            tx_fifo: VecDeque::with_capacity(fifo_capacity),
            fifo_capacity,
            session: TpSession::default(),
        })
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    /// Is a transport session in progress?
    ///
    /// A busy node refuses new work until the session completes, aborts, or
    /// times out.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.session.is_ready()
    }

    /// Queue a message for transmission
    ///
    /// The message's source address is coerced to this node's address.
    /// Messages of at most 8 bytes go out as a single frame through the TX
    /// FIFO; longer messages open a transport session, broadcast (BAM) for
    /// PDU2 identifiers and connection mode (RTS/CTS) for PDU1.
    pub fn send(&mut self, mut msg: CanMessage) -> Result<(), SendError> {
        if self.is_busy() {
            return Err(SendError::Busy);
        }
        if msg.len() > tp::TP_MAX_MSG_SIZE {
            return Err(SendError::TooLarge(msg.len()));
        }
        msg.set_src(self.address);
        if msg.len() <= 8 {
            if self.tx_fifo.len() >= self.fifo_capacity {
                return Err(SendError::QueueFull);
            }
            self.tx_fifo
                .push_back(CanFrame::from_slice(msg.canid, &msg.data));
            Ok(())
        } else {
            self.session.begin_transmit(msg)
        }
    }

    /// Convenience over [Node::send]
    pub fn send_bytes(&mut self, canid: u32, payload: &[u8]) -> Result<(), SendError> {
        self.send(CanMessage::new(canid, payload.to_vec()))
    }

    /// Locally abort the in-flight connection-mode transfer
    ///
    /// Returns whether there was an abortable session.
    pub fn abort(&mut self, reason: AbortReason) -> bool {
        self.session.abort(reason)
    }

    /// One cooperative pass over this node's work
    pub fn task(&mut self) {
        let now = self.port.tick();
        self.advance_session(now);
        self.drain_tx();
        self.poll_rx(now);
    }

    fn advance_session(&mut self, now: u64) {
        match self.session.poll(now) {
            TpEvent::Idle => {}
            TpEvent::Transmit(frame) => {
                if self.tx_fifo.len() >= self.fifo_capacity {
                    tracing::warn!("[{}] TX FIFO full, transport frame dropped", self.name);
                    self.handler.missing(&frame);
                } else {
                    self.tx_fifo.push_back(frame);
                }
            }
            TpEvent::Received(msg) => self.handler.decode(msg),
            TpEvent::Timeout(msg) => {
                tracing::warn!(
                    "[{}] transport session timed out (pgn {:#X})",
                    self.name,
                    msg.pgn()
                );
                self.handler.timeout(msg);
            }
        }
    }

    fn drain_tx(&mut self) {
        while self.port.tx_free_level() > 0 {
            let Some(frame) = self.tx_fifo.pop_front() else {
                break;
            };
            match self.port.transmit(&frame) {
                Ok(()) => self.handler.sending(&frame),
                Err(e) => {
                    tracing::warn!(
                        "[{}] port rejected frame {:#010X}: {e}",
                        self.name,
                        frame.canid
                    );
                    self.handler.missing(&frame);
                }
            }
        }
    }

    fn poll_rx(&mut self, now: u64) {
        while self.port.rx_fill_level() > 0 {
            let Some(frame) = self.port.receive() else {
                break;
            };
            self.handler.reading(&frame);
            if !self.handler.filter(self.address, &frame) {
                continue;
            }
            match frame::pgn(frame.canid) {
                tp::PGN_TP_CM | tp::PGN_TP_DT => self.session.handle_frame(&frame, now),
                _ => self.handler.decode(CanMessage::from(frame)),
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.port.deinit();
    }
}
