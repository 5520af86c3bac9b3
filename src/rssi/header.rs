//! RSSI header codec.
//!
//! The header lives in the first bytes of a frame's first buffer and is
//! edited in place. All multi-byte fields are big-endian.
//!
//! Wire format:
//! ```text
//! ┌──────────┬─────────┬─────┬─────┬─────────────┬───────────────┐
//! │ Flags (1)│ HLen (1)│ Seq │ Ack │ PayloadLen 2│ Ver/Unit (2)  │
//! ├──────────┴─────────┴─────┴─────┴─────────────┴───────────────┤
//! │ Checksum (4)                                                  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ SYN extension (16, only when SYN): window, retry and timeout  │
//! │ parameters, connection id                                     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum is a 32-bit one's-complement sum over the whole header
//! (with the checksum field read as zero), carries folded back in and the
//! result inverted. The payload is not covered.
//!
//! Beyond the wire fields, a header carries transient retransmission state:
//! the monotonic send timestamp and a retry counter. Neither is serialized.

use std::time::Instant;

use crate::stream::Frame;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of a SYN header (fixed header plus negotiation extension).
pub const SYN_SIZE: usize = 28;

/// Header flag bits.
pub mod flags {
    /// Synchronize: carries the negotiation extension
    pub const SYN: u8 = 0x80;
    /// Acknowledge field is valid
    pub const ACK: u8 = 0x40;
    /// Extended acknowledgment (reserved, never set)
    pub const EACK: u8 = 0x20;
    /// Reset the connection
    pub const RST: u8 = 0x10;
    /// Null keepalive
    pub const NUL: u8 = 0x08;
    /// Sender is busy (flow control)
    pub const BSY: u8 = 0x04;
    /// Checksum present
    pub const CHK: u8 = 0x02;
}

const OFF_FLAGS: usize = 0;
const OFF_HEADER_LEN: usize = 1;
const OFF_SEQUENCE: usize = 2;
const OFF_ACKNOWLEDGE: usize = 3;
const OFF_PAYLOAD_LEN: usize = 4;
const OFF_VERSION: usize = 6;
const OFF_TIMEOUT_UNIT: usize = 7;
const OFF_CHECKSUM: usize = 8;
const OFF_MAX_OUTSTANDING: usize = 12;
const OFF_MAX_RETRAN: usize = 13;
const OFF_MAX_CUM_ACK: usize = 14;
const OFF_MAX_SEGMENT: usize = 16;
const OFF_RETRAN_TOUT: usize = 18;
const OFF_CUM_ACK_TOUT: usize = 20;
const OFF_NULL_TOUT: usize = 22;
const OFF_CONN_ID: usize = 24;

/// An RSSI header mapped over a frame, plus transient retransmit state.
#[derive(Debug, Clone)]
pub struct Header {
    frame: Frame,
    sent_at: Instant,
    retries: u32,
}

impl Header {
    /// Map a header over the start of a frame's first buffer.
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            sent_at: Instant::now(),
            retries: 0,
        }
    }

    /// The underlying frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Consume the header, yielding the frame.
    pub fn into_frame(self) -> Frame {
        self.frame
    }

    fn bytes(&self) -> &[u8] {
        self.frame.first().map(|b| b.payload()).unwrap_or(&[])
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.frame
            .first_mut()
            .map(|b| b.payload_mut())
            .unwrap_or(&mut [])
    }

    fn get_u8(&self, off: usize) -> u8 {
        self.bytes()[off]
    }

    fn set_u8(&mut self, off: usize, value: u8) {
        self.bytes_mut()[off] = value;
    }

    fn get_u16(&self, off: usize) -> u16 {
        let b = self.bytes();
        u16::from_be_bytes([b[off], b[off + 1]])
    }

    fn set_u16(&mut self, off: usize, value: u16) {
        self.bytes_mut()[off..off + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
    }

    fn set_u32(&mut self, off: usize, value: u32) {
        self.bytes_mut()[off..off + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn get_flag(&self, flag: u8) -> bool {
        self.get_u8(OFF_FLAGS) & flag != 0
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        let cur = self.get_u8(OFF_FLAGS);
        self.set_u8(OFF_FLAGS, if value { cur | flag } else { cur & !flag });
    }

    /// Initialize an outbound header: zero the header region, write the
    /// header length and seed the SYN flag. When `set_size` the first
    /// buffer's payload is forced to exactly the header size, which is how
    /// headers-only frames (SYN, pure ack, NUL, RST) take shape.
    pub fn tx_init(&mut self, syn: bool, set_size: bool) {
        let size = if syn { SYN_SIZE } else { HEADER_SIZE };
        if set_size {
            if let Some(first) = self.frame.first_mut() {
                first.set_payload_len(size);
            }
        }
        let bytes = self.bytes_mut();
        for b in &mut bytes[..size] {
            *b = 0;
        }
        self.set_u8(OFF_HEADER_LEN, size as u8);
        if syn {
            self.set_flag(flags::SYN, true);
        }
    }

    /// SYN flag.
    pub fn syn(&self) -> bool {
        self.get_flag(flags::SYN)
    }

    /// ACK flag.
    pub fn ack(&self) -> bool {
        self.get_flag(flags::ACK)
    }

    /// Set the ACK flag.
    pub fn set_ack(&mut self, value: bool) {
        self.set_flag(flags::ACK, value);
    }

    /// EACK flag (reserved on the wire, never produced).
    pub fn eack(&self) -> bool {
        self.get_flag(flags::EACK)
    }

    /// RST flag.
    pub fn rst(&self) -> bool {
        self.get_flag(flags::RST)
    }

    /// Set the RST flag.
    pub fn set_rst(&mut self, value: bool) {
        self.set_flag(flags::RST, value);
    }

    /// NUL (keepalive) flag.
    pub fn nul(&self) -> bool {
        self.get_flag(flags::NUL)
    }

    /// Set the NUL flag.
    pub fn set_nul(&mut self, value: bool) {
        self.set_flag(flags::NUL, value);
    }

    /// BSY (flow control) flag.
    pub fn busy(&self) -> bool {
        self.get_flag(flags::BSY)
    }

    /// Set the BSY flag.
    pub fn set_busy(&mut self, value: bool) {
        self.set_flag(flags::BSY, value);
    }

    /// CHK flag.
    pub fn chk(&self) -> bool {
        self.get_flag(flags::CHK)
    }

    /// Set the CHK flag.
    pub fn set_chk(&mut self, value: bool) {
        self.set_flag(flags::CHK, value);
    }

    /// Declared header length in bytes.
    pub fn header_len(&self) -> u8 {
        self.get_u8(OFF_HEADER_LEN)
    }

    /// Sequence number.
    pub fn sequence(&self) -> u8 {
        self.get_u8(OFF_SEQUENCE)
    }

    /// Set the sequence number.
    pub fn set_sequence(&mut self, seq: u8) {
        self.set_u8(OFF_SEQUENCE, seq);
    }

    /// Cumulative acknowledge number.
    pub fn acknowledge(&self) -> u8 {
        self.get_u8(OFF_ACKNOWLEDGE)
    }

    /// Set the cumulative acknowledge number.
    pub fn set_acknowledge(&mut self, ack: u8) {
        self.set_u8(OFF_ACKNOWLEDGE, ack);
    }

    /// Declared payload length (bytes following the header).
    pub fn payload_len(&self) -> u16 {
        self.get_u16(OFF_PAYLOAD_LEN)
    }

    /// Protocol version (SYN only).
    pub fn version(&self) -> u8 {
        self.get_u8(OFF_VERSION)
    }

    /// Set the protocol version (SYN only).
    pub fn set_version(&mut self, version: u8) {
        self.set_u8(OFF_VERSION, version);
    }

    /// Timeout-unit exponent: wire times mean `t * 10^unit` microseconds.
    pub fn timeout_unit(&self) -> u8 {
        self.get_u8(OFF_TIMEOUT_UNIT)
    }

    /// Set the timeout-unit exponent (SYN only).
    pub fn set_timeout_unit(&mut self, unit: u8) {
        self.set_u8(OFF_TIMEOUT_UNIT, unit);
    }

    /// Maximum outstanding segments offered (SYN only).
    pub fn max_outstanding(&self) -> u8 {
        self.get_u8(OFF_MAX_OUTSTANDING)
    }

    /// Set the maximum outstanding segments (SYN only).
    pub fn set_max_outstanding(&mut self, max: u8) {
        self.set_u8(OFF_MAX_OUTSTANDING, max);
    }

    /// Maximum retransmissions before teardown (SYN only).
    pub fn max_retran(&self) -> u8 {
        self.get_u8(OFF_MAX_RETRAN)
    }

    /// Set the maximum retransmissions (SYN only).
    pub fn set_max_retran(&mut self, max: u8) {
        self.set_u8(OFF_MAX_RETRAN, max);
    }

    /// Maximum acks accumulated before one must be sent (SYN only).
    pub fn max_cum_ack(&self) -> u8 {
        self.get_u8(OFF_MAX_CUM_ACK)
    }

    /// Set the maximum cumulative ack (SYN only).
    pub fn set_max_cum_ack(&mut self, max: u8) {
        self.set_u8(OFF_MAX_CUM_ACK, max);
    }

    /// Maximum segment size in bytes (SYN only).
    pub fn max_segment_size(&self) -> u16 {
        self.get_u16(OFF_MAX_SEGMENT)
    }

    /// Set the maximum segment size (SYN only).
    pub fn set_max_segment_size(&mut self, size: u16) {
        self.set_u16(OFF_MAX_SEGMENT, size);
    }

    /// Retransmission timeout in negotiated units (SYN only).
    pub fn retran_tout(&self) -> u16 {
        self.get_u16(OFF_RETRAN_TOUT)
    }

    /// Set the retransmission timeout (SYN only).
    pub fn set_retran_tout(&mut self, tout: u16) {
        self.set_u16(OFF_RETRAN_TOUT, tout);
    }

    /// Cumulative ack timeout in negotiated units (SYN only).
    pub fn cum_ack_tout(&self) -> u16 {
        self.get_u16(OFF_CUM_ACK_TOUT)
    }

    /// Set the cumulative ack timeout (SYN only).
    pub fn set_cum_ack_tout(&mut self, tout: u16) {
        self.set_u16(OFF_CUM_ACK_TOUT, tout);
    }

    /// Null keepalive timeout in negotiated units (SYN only).
    pub fn null_tout(&self) -> u16 {
        self.get_u16(OFF_NULL_TOUT)
    }

    /// Set the null keepalive timeout (SYN only).
    pub fn set_null_tout(&mut self, tout: u16) {
        self.set_u16(OFF_NULL_TOUT, tout);
    }

    /// Connection identifier (SYN only).
    pub fn connection_id(&self) -> u32 {
        self.get_u32(OFF_CONN_ID)
    }

    /// Set the connection identifier (SYN only).
    pub fn set_connection_id(&mut self, id: u32) {
        self.set_u32(OFF_CONN_ID, id);
    }

    /// One's-complement sum over the header with the checksum field zeroed.
    fn compute_checksum(&self) -> u32 {
        let bytes = self.bytes();
        let hlen = (self.header_len() as usize).min(bytes.len());
        let mut sum: u64 = 0;
        for (idx, chunk) in bytes[..hlen].chunks(4).enumerate() {
            if idx * 4 == OFF_CHECKSUM {
                continue;
            }
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            sum += u64::from(u32::from_be_bytes(word));
        }
        while sum >> 32 != 0 {
            sum = (sum & 0xffff_ffff) + (sum >> 32);
        }
        !(sum as u32)
    }

    /// Rewrite the length fields and checksum ahead of transmission.
    pub fn update(&mut self) {
        let hlen = usize::from(self.header_len());
        let payload = self.frame.payload_len().saturating_sub(hlen);
        self.set_u16(OFF_PAYLOAD_LEN, payload as u16);
        let sum = self.compute_checksum();
        self.set_u32(OFF_CHECKSUM, sum);
    }

    /// Validate an ingress header: length sanity, payload agreement and
    /// checksum. A SYN must declare the extended header length.
    pub fn verify(&self) -> bool {
        let bytes = self.bytes();
        if bytes.len() < HEADER_SIZE {
            return false;
        }
        let hlen = usize::from(self.header_len());
        let expected = if self.syn() { SYN_SIZE } else { HEADER_SIZE };
        if hlen != expected || hlen > bytes.len() {
            return false;
        }
        if usize::from(self.payload_len()) != self.frame.payload_len() - hlen {
            return false;
        }
        self.get_u32(OFF_CHECKSUM) == self.compute_checksum()
    }

    /// When this header last went on the wire.
    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// Stamp the header as sent now. Also used to hold the retransmission
    /// timer while the peer reports busy.
    pub fn mark_sent(&mut self) {
        self.sent_at = Instant::now();
    }

    /// Times this header has been retransmitted.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Count one more retransmission.
    pub fn bump_retries(&mut self) {
        self.retries += 1;
    }
}
