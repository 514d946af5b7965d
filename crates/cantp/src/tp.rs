//! SAE J1939-21 Transport Protocol session state machine
//!
//! A CAN data frame carries at most 8 bytes, so J1939 layers larger messages
//! (9..=1785 bytes) over sequences of frames using two PGNs:
//!
//! 1. `0xEB00` - Data Transfer (TP.DT): one byte of sequence number plus 7
//!    bytes of payload per frame.
//! 2. `0xEC00` - Connection Management (TP.CM): the metadata and flow control
//!    frames, distinguished by the first byte of the message (the Control
//!    Byte):
//!
//!    1. `0x10` - Request To Send (TP.CM_RTS)
//!    2. `0x11` - Clear To Send (TP.CM_CTS)
//!    3. `0x13` - End of Message Acknowledgement (TP.CM_EndofMsgACK)
//!    4. `0x20` - Broadcast Announce Message (TP.CM_BAM)
//!    5. `0xFF` - Connection Abort (TP.Conn_Abort)
//!
//!    Other control byte values are reserved.
//!
//! There are two kinds of transport session:
//!
//! 1. Broadcast - a TP.CM_BAM announcement followed by a paced series of
//!    TP.DT frames to the global address, with no flow control and no
//!    acknowledgement.
//! 2. Connection mode - a TP.CM_RTS/TP.CM_CTS handshake between two nodes,
//!    TP.DT frames sent in bursts sized by each TP.CM_CTS window, and a final
//!    TP.CM_EndofMsgACK from the receiver.
//!
//! A [TpSession] plays both roles, one transfer at a time. It never talks to
//! a port itself: [TpSession::poll] advances the state machine against the
//! caller's clock and hands back at most one frame to transmit, a completed
//! message, or a timed-out one. Frame reception is pushed in through
//! [TpSession::handle_frame].
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::frame::{self, ADDRESS_GLOBAL, CanFrame};
use crate::message::CanMessage;

/// Transmits the payload data for the transport protocol
pub const PGN_TP_DT: u32 = 0x00EB00;
/// Supplies the metadata (size, packet count, PGN) for the transport protocol
pub const PGN_TP_CM: u32 = 0x00EC00;
/// Positive or negative acknowledgement of various network services
pub const PGN_ACKNOWLEDGEMENT: u32 = 0x00E800;
/// Requests another PGN, similarly to a CAN remote frame (which J1939 does
/// not use; a request is an ordinary data frame)
pub const PGN_REQUEST: u32 = 0x00EA00;
/// Identifies an ECU and detects address conflicts
pub const PGN_ADDRESS_CLAIMED: u32 = 0x00EE00;
/// Manufacturer-definable
pub const PGN_PROPRIETARY_A: u32 = 0x00EF00;
/// Manufacturer-definable, data page 1
pub const PGN_PROPRIETARY_A1: u32 = 0x01EF00;

/// TP.DT payload bytes per frame; the eighth byte is the sequence number
pub const DT_PAYLOAD: usize = 7;
/// Maximum transport message size: 255 packets of [DT_PAYLOAD] bytes
pub const TP_MAX_MSG_SIZE: usize = 255 * DT_PAYLOAD;

/// Priority of every TP.CM and TP.DT frame
const TP_PRIORITY: u8 = 7;
/// Most packets granted per TP.CM_CTS window
const CTS_RESPONSE_LIMIT: u8 = 4;
/// Minimum delay between successive broadcast TP.DT frames, in ms
const BAM_TX_INTERVAL: u64 = 50;

// Timeouts from SAE J1939-21 5.10.2.4, in ms
const TIMEOUT_TR: u64 = 200;
#[allow(unused)]
const TIMEOUT_TH: u64 = 500;
const TIMEOUT_T1: u64 = 750;
#[allow(unused)]
const TIMEOUT_T2: u64 = 1250;
const TIMEOUT_T3: u64 = 1250;
#[allow(unused)]
const TIMEOUT_T4: u64 = 1050;

// TP.CM control bytes
const CONTROL_RTS: u8 = 0x10;
const CONTROL_CTS: u8 = 0x11;
const CONTROL_ACK: u8 = 0x13;
const CONTROL_BAM: u8 = 0x20;
const CONTROL_ABORT: u8 = 0xFF;

/// Why a connection was aborted
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Reserved,
    ExistingTransportSession = 1,
    SystemResources = 2,
    Timeout = 3,
    CtsDuringDt = 4,
    MaxRetryLimit = 5,
    UnexpectedDt = 6,
    BadSequenceNumber = 7,
    DuplicateSequenceNumber = 8,
    MessageTooLarge = 9,
    UnknownReason = 250,
}

impl From<u8> for AbortReason {
    fn from(reason: u8) -> Self {
        match reason {
            0 | 10..=249 => AbortReason::Reserved,
            1 => AbortReason::ExistingTransportSession,
            2 => AbortReason::SystemResources,
            3 => AbortReason::Timeout,
            4 => AbortReason::CtsDuringDt,
            5 => AbortReason::MaxRetryLimit,
            6 => AbortReason::UnexpectedDt,
            7 => AbortReason::BadSequenceNumber,
            8 => AbortReason::DuplicateSequenceNumber,
            9 => AbortReason::MessageTooLarge,
            250..=255 => AbortReason::UnknownReason,
        }
    }
}

/// Why the engine refused to queue a message
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// A transport session is already in progress on this node
    #[error("transport session already in progress")]
    Busy,
    /// The message exceeds the 1785 byte transport protocol limit
    #[error("message of {0} bytes exceeds the transport protocol limit of {TP_MAX_MSG_SIZE} bytes")]
    TooLarge(usize),
    /// The TX FIFO has no room for another frame
    #[error("transmit queue full")]
    QueueFull,
}

#[repr(transparent)]
struct TpDt(CanFrame);

impl TpDt {
    #[inline]
    #[must_use]
    fn seq_id(&self) -> u8 {
        self.0.data()[0]
    }

    #[inline]
    #[must_use]
    fn data(&self) -> &[u8] {
        &self.0.data()[1..]
    }
}

#[repr(transparent)]
struct TpCmRts(CanFrame);

impl TpCmRts {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u16 {
        LittleEndian::read_u16(&self.0.data()[1..3])
    }

    #[inline]
    #[must_use]
    fn total_message_packets(&self) -> u8 {
        self.0.data()[3]
    }

    /// The PGN of the message being sent
    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmCts(CanFrame);

impl TpCmCts {
    /// Number of packets the receiver is allowing the sender to send in one burst
    #[inline]
    #[must_use]
    fn number_of_packets(&self) -> u8 {
        self.0.data()[1]
    }

    /// The next packet number the receiver is expecting
    #[inline]
    #[must_use]
    fn next_packet(&self) -> u8 {
        self.0.data()[2]
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmEndOfMsgAck(CanFrame);

impl TpCmEndOfMsgAck {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u16 {
        LittleEndian::read_u16(&self.0.data()[1..3])
    }

    #[inline]
    #[must_use]
    fn total_message_packets(&self) -> u8 {
        self.0.data()[3]
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmBam(CanFrame);

impl TpCmBam {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u16 {
        LittleEndian::read_u16(&self.0.data()[1..3])
    }

    #[inline]
    #[must_use]
    fn total_message_packets(&self) -> u8 {
        self.0.data()[3]
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmConnAbort(CanFrame);

impl TpCmConnAbort {
    #[inline]
    #[must_use]
    fn abort_reason(&self) -> AbortReason {
        AbortReason::from(self.0.data()[1])
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

fn encode_cm(src: u8, dst: u8, data: [u8; 8]) -> CanFrame {
    CanFrame::new(frame::assemble(TP_PRIORITY, PGN_TP_CM, dst, src), 8, data)
}

fn encode_rts(src: u8, dst: u8, size: u16, total_packets: u8, pgn: u32) -> CanFrame {
    let mut data = [0xFF; 8];
    data[0] = CONTROL_RTS;
    LittleEndian::write_u16(&mut data[1..3], size);
    data[3] = total_packets;
    LittleEndian::write_u24(&mut data[5..8], pgn & 0xFF_FFFF);
    encode_cm(src, dst, data)
}

fn encode_cts(src: u8, dst: u8, response_packets: u8, next_sequence: u8, pgn: u32) -> CanFrame {
    let mut data = [0xFF; 8];
    data[0] = CONTROL_CTS;
    data[1] = response_packets;
    data[2] = next_sequence;
    LittleEndian::write_u24(&mut data[5..8], pgn & 0xFF_FFFF);
    encode_cm(src, dst, data)
}

fn encode_ack(src: u8, dst: u8, size: u16, total_packets: u8, pgn: u32) -> CanFrame {
    let mut data = [0xFF; 8];
    data[0] = CONTROL_ACK;
    LittleEndian::write_u16(&mut data[1..3], size);
    data[3] = total_packets;
    LittleEndian::write_u24(&mut data[5..8], pgn & 0xFF_FFFF);
    encode_cm(src, dst, data)
}

fn encode_bam(src: u8, size: u16, total_packets: u8, pgn: u32) -> CanFrame {
    let mut data = [0xFF; 8];
    data[0] = CONTROL_BAM;
    LittleEndian::write_u16(&mut data[1..3], size);
    data[3] = total_packets;
    LittleEndian::write_u24(&mut data[5..8], pgn & 0xFF_FFFF);
    encode_cm(src, ADDRESS_GLOBAL, data)
}

fn encode_abort(src: u8, dst: u8, reason: AbortReason, pgn: u32) -> CanFrame {
    let mut data = [0xFF; 8];
    data[0] = CONTROL_ABORT;
    data[1] = reason as u8;
    LittleEndian::write_u24(&mut data[5..8], pgn & 0xFF_FFFF);
    encode_cm(src, dst, data)
}

/// Number of TP.DT packets needed for a message of `len` bytes
#[inline]
#[must_use]
fn total_packets(len: usize) -> u8 {
    ((len - 1) / DT_PAYLOAD + 1) as u8
}

/// Payload bytes carried by the final TP.DT packet of a `len` byte message
#[inline]
#[must_use]
fn last_section(len: usize) -> usize {
    match len % DT_PAYLOAD {
        0 => DT_PAYLOAD,
        section => section,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum TpState {
    /// Ready to transmit or receive a transport message
    #[default]
    Ready,
    CompleteTx,
    CompleteRx,
    AbortTx,
    BamTx,
    RtsTx,
    CtsTx,
    CtsRx,
    AckTx,
    AckRx,
    DtBamTx,
    DtBamRx,
    DtCmdtTx,
    DtCmdtRx,
}

/// What a [TpSession] wants its node to do after one advancement pass
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TpEvent {
    /// Nothing to do on this pass
    Idle,
    /// Enqueue this frame for transmission
    Transmit(CanFrame),
    /// A complete message was reassembled; deliver it to the application
    Received(CanMessage),
    /// The session timed out; the in-progress message is handed back so the
    /// application can be told what was lost
    Timeout(CanMessage),
}

#[derive(Clone, Copy)]
struct PendingAbort {
    reason: AbortReason,
    /// Was the session receiving when it was aborted? Decides which way
    /// around the abort frame's addresses go, since the buffered message
    /// always carries the original sender's identifier.
    from_receiver: bool,
}

/// One in-flight transport transfer
///
/// The session exists from the start of negotiation until completion, abort,
/// or timeout, at which point it resets itself to ready and drops its buffer.
/// At most one transfer is in flight per session.
#[derive(Default)]
pub(crate) struct TpSession {
    state: TpState,
    /// The message being fragmented or reassembled
    buffer: Option<CanMessage>,
    total_packets: u8,
    packets_count: u8,
    /// Packets remaining in the current CTS window
    response_packets: u8,
    abort: Option<PendingAbort>,
    /// Last activity: stamped at every successful emit and accepted reception
    tick: u64,
}

impl TpSession {
    #[inline]
    #[must_use]
    pub(crate) fn is_ready(&self) -> bool {
        self.state == TpState::Ready
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Tear the session down and hand back whatever message it was holding
    fn export(&mut self) -> Option<CanMessage> {
        let msg = self.buffer.take();
        self.reset();
        msg
    }

    /// Open a transmit session for a message longer than one frame
    ///
    /// PDU2 identifiers start a broadcast (BAM) transfer, PDU1 identifiers a
    /// connection-mode (RTS/CTS) transfer to the destination address.
    pub(crate) fn begin_transmit(&mut self, msg: CanMessage) -> Result<(), SendError> {
        if self.state != TpState::Ready {
            return Err(SendError::Busy);
        }
        if msg.len() > TP_MAX_MSG_SIZE {
            return Err(SendError::TooLarge(msg.len()));
        }
        debug_assert!(msg.len() > 8, "single-frame messages bypass the transport");

        self.total_packets = total_packets(msg.len());
        self.packets_count = 0;
        self.response_packets = 0;
        self.state = if msg.is_point_to_point() {
            TpState::RtsTx
        } else {
            TpState::BamTx
        };
        self.buffer = Some(msg);
        Ok(())
    }

    /// Locally abort the in-flight connection-mode transfer
    ///
    /// Only meaningful while a connection-mode session is still in flight;
    /// broadcast transfers have no connection to abort. Returns whether the
    /// abort was accepted. The abort frame goes out on the next [TpSession::poll].
    pub(crate) fn abort(&mut self, reason: AbortReason) -> bool {
        let from_receiver = match self.state {
            TpState::CtsTx | TpState::DtCmdtRx | TpState::AckTx => true,
            TpState::RtsTx | TpState::CtsRx | TpState::DtCmdtTx | TpState::AckRx => false,
            _ => return false,
        };
        self.abort = Some(PendingAbort {
            reason,
            from_receiver,
        });
        self.state = TpState::AbortTx;
        true
    }

    /// Advance the state machine by one cooperative pass
    ///
    /// `now` is the port's monotonic millisecond tick. Timeout checks come
    /// before emission, so a stalled session surfaces [TpEvent::Timeout] even
    /// when it would otherwise have a frame ready.
    pub(crate) fn poll(&mut self, now: u64) -> TpEvent {
        match self.state {
            TpState::Ready => TpEvent::Idle,
            TpState::CompleteTx => {
                // Fully sent (and for connection mode, acknowledged)
                self.reset();
                TpEvent::Idle
            }
            TpState::CompleteRx => match self.export() {
                Some(msg) => TpEvent::Received(msg),
                None => TpEvent::Idle,
            },
            TpState::AbortTx => self.abort_transmit(now),
            TpState::BamTx => self.bam_transmit(now),
            TpState::RtsTx => self.rts_transmit(now),
            TpState::CtsTx => self.timeout_or(now, TIMEOUT_TR, Self::cts_transmit),
            TpState::CtsRx => self.timeout_or(now, TIMEOUT_T3, |_, _| TpEvent::Idle),
            TpState::AckTx => self.timeout_or(now, TIMEOUT_TR, Self::ack_transmit),
            TpState::AckRx => self.timeout_or(now, TIMEOUT_T3, |_, _| TpEvent::Idle),
            TpState::DtBamTx => self.timeout_or(now, TIMEOUT_TR, Self::dt_bam_transmit),
            TpState::DtBamRx => self.timeout_or(now, TIMEOUT_T1, |_, _| TpEvent::Idle),
            TpState::DtCmdtTx => self.timeout_or(now, TIMEOUT_T3, Self::dt_cmdt_transmit),
            TpState::DtCmdtRx => self.timeout_or(now, TIMEOUT_T3, |_, _| TpEvent::Idle),
        }
    }

    fn timeout_or(
        &mut self,
        now: u64,
        bound: u64,
        then: impl FnOnce(&mut Self, u64) -> TpEvent,
    ) -> TpEvent {
        if now.saturating_sub(self.tick) >= bound {
            tracing::warn!(
                "transport session timed out in {:?} after {bound} ms",
                self.state
            );
            match self.export() {
                Some(msg) => TpEvent::Timeout(msg),
                None => TpEvent::Idle,
            }
        } else {
            then(self, now)
        }
    }

    fn bam_transmit(&mut self, now: u64) -> TpEvent {
        let Some(buffer) = self.buffer.as_ref() else {
            self.reset();
            return TpEvent::Idle;
        };
        tracing::debug!(
            "TP.CM_BAM from {:#X} packets: {}, bytes: {} pgn: {:#X}",
            buffer.src(),
            self.total_packets,
            buffer.len(),
            buffer.pgn()
        );
        let frame = encode_bam(
            buffer.src(),
            buffer.len() as u16,
            self.total_packets,
            buffer.pgn(),
        );
        self.state = TpState::DtBamTx;
        self.tick = now;
        TpEvent::Transmit(frame)
    }

    fn rts_transmit(&mut self, now: u64) -> TpEvent {
        let Some(buffer) = self.buffer.as_ref() else {
            self.reset();
            return TpEvent::Idle;
        };
        tracing::debug!(
            "TP.CM_RTS {:#X} -> {:#X} packets: {}, bytes: {} pgn: {:#X}",
            buffer.src(),
            buffer.dst(),
            self.total_packets,
            buffer.len(),
            buffer.pgn()
        );
        let frame = encode_rts(
            buffer.src(),
            buffer.dst(),
            buffer.len() as u16,
            self.total_packets,
            buffer.pgn(),
        );
        self.state = TpState::CtsRx;
        self.tick = now;
        TpEvent::Transmit(frame)
    }

    fn cts_transmit(&mut self, now: u64) -> TpEvent {
        let Some(buffer) = self.buffer.as_ref() else {
            self.reset();
            return TpEvent::Idle;
        };
        let remaining = self.total_packets - self.packets_count;
        let response_packets = remaining.min(CTS_RESPONSE_LIMIT);
        tracing::trace!(
            "TP.CM_CTS {:#X} -> {:#X} window: {} seq: {} pgn: {:#X}",
            buffer.dst(),
            buffer.src(),
            response_packets,
            self.packets_count + 1,
            buffer.pgn()
        );
        // The buffered message carries the original sender's identifier, so
        // the flow control frame goes out with the addresses swapped
        let frame = encode_cts(
            buffer.dst(),
            buffer.src(),
            response_packets,
            self.packets_count + 1,
            buffer.pgn(),
        );
        self.response_packets = response_packets;
        self.state = TpState::DtCmdtRx;
        self.tick = now;
        TpEvent::Transmit(frame)
    }

    fn ack_transmit(&mut self, now: u64) -> TpEvent {
        let Some(buffer) = self.buffer.as_ref() else {
            self.reset();
            return TpEvent::Idle;
        };
        tracing::debug!(
            "TP.CM_ACK {:#X} -> {:#X} packets: {}, bytes: {} pgn: {:#X}",
            buffer.dst(),
            buffer.src(),
            self.total_packets,
            buffer.len(),
            buffer.pgn()
        );
        let frame = encode_ack(
            buffer.dst(),
            buffer.src(),
            buffer.len() as u16,
            self.total_packets,
            buffer.pgn(),
        );
        self.state = TpState::CompleteRx;
        self.tick = now;
        TpEvent::Transmit(frame)
    }

    fn dt_bam_transmit(&mut self, now: u64) -> TpEvent {
        if now.saturating_sub(self.tick) < BAM_TX_INTERVAL {
            return TpEvent::Idle;
        }
        self.dt_transmit(now)
    }

    fn dt_cmdt_transmit(&mut self, now: u64) -> TpEvent {
        if self.response_packets == 0 {
            return TpEvent::Idle;
        }
        self.dt_transmit(now)
    }

    fn dt_transmit(&mut self, now: u64) -> TpEvent {
        let Some(buffer) = self.buffer.as_ref() else {
            self.reset();
            return TpEvent::Idle;
        };

        let next = self.packets_count + 1;
        let offset = usize::from(next - 1) * DT_PAYLOAD;
        let section = if next == self.total_packets {
            last_section(buffer.len())
        } else {
            DT_PAYLOAD
        };

        // The last packet's unused bytes are padded with 0xFF
        let mut data = [0xFF; 8];
        data[0] = next;
        data[1..=section].copy_from_slice(&buffer.data[offset..offset + section]);

        let dst = if self.state == TpState::DtBamTx {
            ADDRESS_GLOBAL
        } else {
            buffer.dst()
        };
        tracing::trace!(
            "TP.DT {:#X} -> {:#X} seq: {}/{}",
            buffer.src(),
            dst,
            next,
            self.total_packets
        );
        let frame = CanFrame::new(
            frame::assemble(TP_PRIORITY, PGN_TP_DT, dst, buffer.src()),
            8,
            data,
        );

        self.packets_count = next;
        if self.packets_count == self.total_packets {
            self.state = match self.state {
                TpState::DtBamTx => TpState::CompleteTx,
                _ => TpState::AckRx,
            };
        } else if self.state == TpState::DtCmdtTx {
            self.response_packets -= 1;
            if self.response_packets == 0 {
                // Window exhausted; wait for the next TP.CM_CTS
                self.state = TpState::CtsRx;
            }
        }
        self.tick = now;
        TpEvent::Transmit(frame)
    }

    fn abort_transmit(&mut self, _now: u64) -> TpEvent {
        let (Some(buffer), Some(pending)) = (self.buffer.as_ref(), self.abort) else {
            self.reset();
            return TpEvent::Idle;
        };
        let (src, dst) = if pending.from_receiver {
            (buffer.dst(), buffer.src())
        } else {
            (buffer.src(), buffer.dst())
        };
        tracing::warn!(
            "TP.Conn_Abort {src:#X} -> {dst:#X} reason {:?} pgn {:#X}",
            pending.reason,
            buffer.pgn()
        );
        let frame = encode_abort(src, dst, pending.reason, buffer.pgn());
        self.reset();
        TpEvent::Transmit(frame)
    }

    /// Feed one received TP.CM or TP.DT frame into the session
    pub(crate) fn handle_frame(&mut self, frm: &CanFrame, now: u64) {
        if frm.dlc != 8 {
            tracing::warn!(
                "transport frame {:#010X} with dlc {} dropped; TP frames are 8 bytes",
                frm.canid,
                frm.dlc
            );
            return;
        }
        match frame::pgn(frm.canid) {
            PGN_TP_CM => self.cm_receive(frm, now),
            PGN_TP_DT => self.dt_receive(frm, now),
            pgn => unreachable!(
                "the transport protocol only uses the TP.CM (0xEC00) and TP.DT (0xEB00) PGNs, got {pgn:#X}"
            ),
        }
    }

    fn cm_receive(&mut self, frm: &CanFrame, now: u64) {
        let control = frm.data()[0];
        match control {
            CONTROL_RTS => self.rts_receive(TpCmRts(*frm), now),
            CONTROL_CTS => self.cts_receive(TpCmCts(*frm), now),
            CONTROL_ACK => self.ack_receive(TpCmEndOfMsgAck(*frm)),
            CONTROL_BAM => self.bam_receive(TpCmBam(*frm), now),
            CONTROL_ABORT => self.abort_receive(TpCmConnAbort(*frm)),
            _ => tracing::warn!("TP.CM control byte {control:#X} is reserved"),
        }
    }

    /// Allocate the reassembly buffer for an announced message
    ///
    /// The rebuilt identifier uses the announcing frame's priority and
    /// source/destination pair around the announced PGN.
    fn open_buffer(&mut self, cm: &CanFrame, bytes: usize, packets: u8) -> bool {
        if !(9..=TP_MAX_MSG_SIZE).contains(&bytes) || packets != total_packets(bytes) {
            tracing::warn!(
                "announcement of {bytes} bytes in {packets} packets from {:#X} is malformed",
                cm.src()
            );
            return false;
        }
        let pgn = TpCmRts(*cm).message_pgn();
        let canid = frame::assemble(cm.priority(), pgn, cm.dst(), cm.src());
        self.buffer = Some(CanMessage::with_len(canid, bytes));
        self.total_packets = packets;
        self.packets_count = 0;
        true
    }

    fn rts_receive(&mut self, cm: TpCmRts, now: u64) {
        if self.state != TpState::Ready {
            tracing::warn!(
                "TP.CM_RTS {:#X} -> {:#X} while a session is in progress",
                cm.0.src(),
                cm.0.dst()
            );
            return;
        }
        tracing::debug!(
            "TP.CM_RTS {:#X} -> {:#X} packets: {}, bytes: {} pgn: {:#X}",
            cm.0.src(),
            cm.0.dst(),
            cm.total_message_packets(),
            cm.total_message_bytes(),
            cm.message_pgn()
        );
        if self.open_buffer(
            &cm.0,
            usize::from(cm.total_message_bytes()),
            cm.total_message_packets(),
        ) {
            self.state = TpState::CtsTx;
            self.tick = now;
        }
    }

    fn bam_receive(&mut self, cm: TpCmBam, now: u64) {
        if self.state != TpState::Ready {
            tracing::warn!(
                "TP.CM_BAM from {:#X} while a session is in progress",
                cm.0.src()
            );
            return;
        }
        tracing::debug!(
            "TP.CM_BAM from {:#X} packets: {}, bytes: {} pgn: {:#X}",
            cm.0.src(),
            cm.total_message_packets(),
            cm.total_message_bytes(),
            cm.message_pgn()
        );
        if self.open_buffer(
            &cm.0,
            usize::from(cm.total_message_bytes()),
            cm.total_message_packets(),
        ) {
            self.state = TpState::DtBamRx;
            self.tick = now;
        }
    }

    fn cts_receive(&mut self, cm: TpCmCts, now: u64) {
        let Some(buffer) = self.buffer.as_ref() else {
            tracing::warn!(
                "unexpected TP.CM_CTS from {:#X} before TP.CM_RTS was sent",
                cm.0.src()
            );
            return;
        };
        if self.state != TpState::CtsRx {
            tracing::warn!("TP.CM_CTS from {:#X} while not awaiting one", cm.0.src());
            return;
        }
        if buffer.pgn() != cm.message_pgn() {
            tracing::warn!(
                "TP.CM_CTS pgn {:#X} does not match the session pgn {:#X}",
                cm.message_pgn(),
                buffer.pgn()
            );
            return;
        }
        if self.packets_count + 1 != cm.next_packet() {
            tracing::warn!(
                "TP.CM_CTS requests sequence {} but {} is next",
                cm.next_packet(),
                self.packets_count + 1
            );
            return;
        }
        tracing::trace!(
            "TP.CM_CTS {:#X} <- {:#X} window: {} seq: {} pgn: {:#X}",
            cm.0.dst(),
            cm.0.src(),
            cm.number_of_packets(),
            cm.next_packet(),
            cm.message_pgn()
        );
        self.response_packets = cm.number_of_packets();
        self.state = TpState::DtCmdtTx;
        self.tick = now;
    }

    fn ack_receive(&mut self, cm: TpCmEndOfMsgAck) {
        let Some(buffer) = self.buffer.as_ref() else {
            tracing::warn!(
                "unexpected TP.CM_ACK from {:#X} before TP.CM_RTS was sent",
                cm.0.src()
            );
            return;
        };
        if self.state != TpState::AckRx
            || buffer.pgn() != cm.message_pgn()
            || buffer.len() != usize::from(cm.total_message_bytes())
            || self.total_packets != cm.total_message_packets()
        {
            tracing::warn!(
                "TP.CM_ACK from {:#X} does not match the session (pgn {:#X}, {} bytes)",
                cm.0.src(),
                cm.message_pgn(),
                cm.total_message_bytes()
            );
            return;
        }
        tracing::debug!(
            "TP.CM_ACK {:#X} <- {:#X} bytes: {} pgn: {:#X}",
            cm.0.dst(),
            cm.0.src(),
            cm.total_message_bytes(),
            cm.message_pgn()
        );
        self.state = TpState::CompleteTx;
    }

    fn abort_receive(&mut self, cm: TpCmConnAbort) {
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        if buffer.pgn() != cm.message_pgn() {
            return;
        }
        tracing::warn!(
            "TP.Conn_Abort {:#X} <- {:#X} reason {:?} pgn {:#X}",
            cm.0.dst(),
            cm.0.src(),
            cm.abort_reason(),
            cm.message_pgn()
        );
        self.reset();
    }

    fn dt_receive(&mut self, frm: &CanFrame, now: u64) {
        if self.state != TpState::DtBamRx && self.state != TpState::DtCmdtRx {
            tracing::warn!("unexpected TP.DT {:#X} -> {:#X}", frm.src(), frm.dst());
            return;
        }
        let dt = TpDt(*frm);
        if self.packets_count + 1 != dt.seq_id() {
            // Drop the frame rather than corrupt the buffer
            tracing::warn!(
                "TP.DT {:#X} -> {:#X} seq {} out of order, {} expected",
                frm.src(),
                frm.dst(),
                dt.seq_id(),
                self.packets_count + 1
            );
            return;
        }
        let Some(buffer) = self.buffer.as_mut() else {
            self.reset();
            return;
        };

        self.packets_count += 1;
        let section = if self.packets_count == self.total_packets {
            last_section(buffer.len())
        } else {
            DT_PAYLOAD
        };
        let offset = usize::from(self.packets_count - 1) * DT_PAYLOAD;
        buffer.data[offset..offset + section].copy_from_slice(&dt.data()[..section]);

        tracing::trace!(
            "TP.DT {:#X} -> {:#X} seq: {}/{} bytes: {}/{}",
            frm.src(),
            frm.dst(),
            self.packets_count,
            self.total_packets,
            offset + section,
            buffer.len()
        );

        if self.packets_count == self.total_packets {
            self.state = match self.state {
                TpState::DtBamRx => TpState::CompleteRx,
                _ => TpState::AckTx,
            };
        } else if self.state == TpState::DtCmdtRx {
            self.response_packets -= 1;
            if self.response_packets == 0 {
                // Window consumed; offer the sender the next one
                self.state = TpState::CtsTx;
            }
        }
        self.tick = now;
    }
}
