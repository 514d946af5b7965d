//! Owned, variable-length CAN messages
use std::io::Write;

use crate::frame::{self, CanFrame};

/// An application message of up to 1785 bytes
///
/// Messages of at most 8 bytes travel as a single [CanFrame]; anything longer
/// is fragmented and reassembled by the transport protocol. A [CanMessage] is
/// created by the application on the transmit side, and by the transport
/// receiver when a BAM or RTS announces an incoming message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CanMessage {
    pub canid: u32,
    pub data: Vec<u8>,
}

impl From<CanFrame> for CanMessage {
    fn from(frame: CanFrame) -> CanMessage {
        CanMessage {
            canid: frame.canid,
            data: frame.data().to_vec(),
        }
    }
}

impl CanMessage {
    pub fn new(canid: u32, data: Vec<u8>) -> Self {
        Self { canid, data }
    }

    /// A zero-filled message of the given length
    pub fn with_len(canid: u32, len: usize) -> Self {
        Self {
            canid,
            data: vec![0; len],
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn priority(&self) -> u8 {
        frame::priority(self.canid)
    }

    #[inline]
    #[must_use]
    pub fn pgn(&self) -> u32 {
        frame::pgn(self.canid)
    }

    #[inline]
    #[must_use]
    pub fn src(&self) -> u8 {
        frame::src(self.canid)
    }

    #[inline]
    #[must_use]
    pub fn dst(&self) -> u8 {
        frame::dst(self.canid)
    }

    #[inline]
    #[must_use]
    pub fn is_point_to_point(&self) -> bool {
        frame::is_point_to_point(self.canid)
    }

    pub fn set_src(&mut self, sa: u8) {
        self.canid = frame::set_src(self.canid, sa);
    }

    /// Render the message as one candump-style log line
    pub fn write<W: Write>(
        &self,
        writer: &mut W,
        timestamp: f64,
        interface: &str,
    ) -> std::io::Result<()> {
        writeln!(
            writer,
            "({timestamp:.6}) {interface} {}#{}",
            hex::encode_upper(self.canid.to_be_bytes()),
            hex::encode_upper(&self.data)
        )
    }
}
