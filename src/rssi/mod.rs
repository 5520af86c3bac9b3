//! Reliable SLAC Stream Interface protocol engine.
//!
//! This module implements the RSSI connection machinery:
//!
//! 1. **Header codec**: fixed-offset big-endian header with a one's
//!    complement checksum and a SYN-time negotiation extension
//!
//! 2. **Sliding window**: 256-slot retransmit ring bounded by the peer's
//!    advertised outstanding-segment limit
//!
//! 3. **State machine**: Closed → WaitSyn → SendSeqAck → Open → Error,
//!    driven by a dedicated thread on a condition-variable timer loop
//!
//! 4. **Queueing bridge**: condition queues carrying control headers to the
//!    state machine and data headers to the application
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  Application                      │
//! │        application_rx ▲▼ application_tx           │
//! ├──────────────────────────────────────────────────┤
//! │  Controller (state machine, window, keepalive)   │
//! │         transport_rx ▲▼ Transport::send_frame     │
//! ├──────────────────────────────────────────────────┤
//! │        Unreliable frame carrier (UDP, ...)        │
//! └──────────────────────────────────────────────────┘
//! ```

mod controller;
mod header;
mod metrics;
mod queue;
mod seq;
mod timer;
mod window;

pub use controller::{Controller, State};
pub use header::{flags, Header, HEADER_SIZE, SYN_SIZE};
pub use metrics::{LinkMetrics, MetricsSnapshot};
pub use queue::CondQueue;
pub use window::TxWindow;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version advertised in SYN headers.
pub const VERSION: u8 = 1;

/// Timeout-unit exponent: wire times are `t * 10^3` microseconds.
pub const TIMEOUT_UNIT: u8 = 3;

/// Interval between connection attempts, in negotiated units.
pub const TRY_PERIOD: u32 = 100;

/// Outstanding-segment window advertised to the peer.
pub const LOC_MAX_BUFFERS: u8 = 32;

/// Requested retransmission timeout, in negotiated units.
pub const REQ_RETRAN_TOUT: u16 = 10;

/// Requested cumulative ack timeout, in negotiated units.
pub const REQ_CUM_ACK_TOUT: u16 = 5;

/// Requested null keepalive timeout, in negotiated units.
pub const REQ_NULL_TOUT: u16 = 3000;

/// Requested retransmission budget before teardown.
pub const REQ_MAX_RETRAN: u8 = 15;

/// Requested maximum acks accumulated before one must be sent.
pub const REQ_MAX_CUM_ACK: u8 = 2;

/// Application-queue depth above which outgoing headers assert BSY.
pub const BUSY_THOLD: usize = 64;

/// Local connection identifier placed in SYN headers.
pub const LOC_CONN_ID: u32 = 0x1234_5678;

/// Tunable connection parameters.
///
/// The timeout fields are *requests*: they ride out in the SYN and are
/// replaced by whatever the peer's SYN-ACK dictates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interval between connection attempts, in negotiated units
    pub try_period: u32,
    /// Requested retransmission timeout, in negotiated units
    pub retran_tout: u16,
    /// Requested cumulative ack timeout, in negotiated units
    pub cum_ack_tout: u16,
    /// Requested null keepalive timeout, in negotiated units
    pub null_tout: u16,
    /// Requested retransmission budget before teardown
    pub max_retran: u8,
    /// Requested maximum acks accumulated before one must be sent
    pub max_cum_ack: u8,
    /// Outstanding-segment window advertised to the peer
    pub loc_max_buffers: u8,
    /// Application-queue depth above which BSY is asserted
    pub busy_thold: usize,
    /// Timeout-unit exponent (wire times are `t * 10^unit` microseconds)
    pub timeout_unit: u8,
    /// Local connection identifier
    pub conn_id: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            try_period: TRY_PERIOD,
            retran_tout: REQ_RETRAN_TOUT,
            cum_ack_tout: REQ_CUM_ACK_TOUT,
            null_tout: REQ_NULL_TOUT,
            max_retran: REQ_MAX_RETRAN,
            max_cum_ack: REQ_MAX_CUM_ACK,
            loc_max_buffers: LOC_MAX_BUFFERS,
            busy_thold: BUSY_THOLD,
            timeout_unit: TIMEOUT_UNIT,
            conn_id: LOC_CONN_ID,
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration.
    ///
    /// The advertised window must stay within half the 8-bit sequence space
    /// so ack comparisons remain unambiguous.
    pub fn validate(&self) -> Result<()> {
        if self.loc_max_buffers == 0 || self.loc_max_buffers > 128 {
            return Err(Error::config("loc_max_buffers must be in 1..=128"));
        }
        if self.timeout_unit > 6 {
            return Err(Error::config("timeout_unit must not exceed 6"));
        }
        if self.try_period == 0 {
            return Err(Error::config("try_period must be nonzero"));
        }
        if self.retran_tout == 0 || self.cum_ack_tout == 0 || self.null_tout == 0 {
            return Err(Error::config("timeouts must be nonzero"));
        }
        Ok(())
    }
}
