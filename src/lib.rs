//! # Reliable SLAC Stream Interface (RSSI)
//!
//! A connection-oriented, sequenced, retransmitting transport layered over
//! an unreliable datagram-style frame carrier, as spoken between a host
//! process and front-end electronics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application                           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Controller (handshake, window, acks, keepalive)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Header codec (flags, sequence, checksum, negotiation)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Frame carrier (UDP or any lossy datagram transport)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **In-order delivery**: gaps are never delivered forward; lost frames
//!    are recovered by peer retransmission
//! 2. **Bounded memory**: a 256-slot retransmit ring and a negotiated
//!    outstanding-segment window of at most 128
//! 3. **Liveness**: null keepalives and cumulative-ack cadence keep the
//!    connection observable on an idle link
//!
//! The controller owns a dedicated state-machine thread; the carrier's
//! receive thread and any number of application threads call in through
//! [`rssi::Controller`]'s entry points.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod rssi;
pub mod stream;

pub use error::{Error, Result};
pub use rssi::{Controller, ControllerConfig};
pub use stream::{Buffer, Frame, Transport};
