//! Stream frame containers and the transport seam.
//!
//! The controller talks to the outside world through two seams:
//!
//! 1. **Frames** ([`Frame`], [`Buffer`]): owned byte containers with
//!    head-room cursors, so protocol headers can be reserved and revealed
//!    in place without copying payload.
//!
//! 2. **Transport** ([`Transport`]): the unreliable datagram-style carrier
//!    underneath the controller. It allocates frames and puts them on the
//!    wire; delivery, ordering and duplication are all the controller's
//!    problem.

mod frame;

pub use frame::{Buffer, Frame};

/// The unreliable frame carrier underneath an RSSI controller.
///
/// Implementations are shared across the controller's threads: the
/// state-machine thread, application threads and the carrier's own receive
/// thread all call in concurrently.
pub trait Transport: Send + Sync {
    /// Allocate a frame with at least `size` bytes of buffer capacity.
    fn req_frame(&self, size: usize) -> Frame;

    /// Transmit a frame's payload bytes. Best effort; the carrier may drop,
    /// duplicate or reorder.
    fn send_frame(&self, frame: &Frame);
}
