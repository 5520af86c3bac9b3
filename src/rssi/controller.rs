//! RSSI connection controller.
//!
//! One controller drives one connection. Three threads meet here:
//!
//! 1. The carrier's receive thread delivers frames through
//!    [`Controller::transport_rx`], which classifies them into the state
//!    queue (control) or the application queue (data) and nudges the state
//!    machine.
//!
//! 2. Application threads push outbound frames through
//!    [`Controller::application_rx`] and pull inbound ones through
//!    [`Controller::application_tx`].
//!
//! 3. A dedicated state-machine thread owns the connection state and runs a
//!    condition-variable timer loop: SYN handshake, cumulative-ack cadence,
//!    null keepalive, retransmission and teardown.
//!
//! The tx mutex covers the retransmit window and every adjacent counter;
//! the word-sized sequence fields crossing threads are relaxed atomics, as
//! in the reference protocol.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::stream::{Frame, Transport};

use super::header::{self, Header};
use super::metrics::{LinkMetrics, MetricsSnapshot};
use super::queue::CondQueue;
use super::{seq, timer, ControllerConfig, VERSION};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No connection; retry SYN after the try period
    Closed = 0,
    /// SYN sent, waiting for the peer's SYN-ACK
    WaitSyn = 1,
    /// Parameters accepted, about to confirm with an ACK
    SendSeqAck = 2,
    /// Connection established
    Open = 3,
    /// Teardown pending
    Error = 4,
}

struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> State {
        match self.0.load(Ordering::SeqCst) {
            1 => State::WaitSyn,
            2 => State::SendSeqAck,
            3 => State::Open,
            4 => State::Error,
            _ => State::Closed,
        }
    }

    fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Transmit-side bookkeeping, all guarded by one mutex.
struct TxState {
    window: super::TxWindow,
    loc_sequence: u8,
    last_ack_tx: u8,
    tx_time: Instant,
}

/// State private to the state-machine thread: the cumulative-ack anchor and
/// the parameter set adopted from the peer's SYN-ACK.
struct StateCtx {
    prev_ack_rx: u8,
    st_time: Instant,
    retran_tout: u16,
    cum_ack_tout: u16,
    null_tout: u16,
    max_retran: u8,
    max_cum_ack: u8,
    rem_conn_id: u32,
    timeout_unit: u8,
}

impl StateCtx {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            prev_ack_rx: 0,
            st_time: Instant::now(),
            retran_tout: config.retran_tout,
            cum_ack_tout: config.cum_ack_tout,
            null_tout: config.null_tout,
            max_retran: config.max_retran,
            max_cum_ack: config.max_cum_ack,
            rem_conn_id: 0,
            timeout_unit: config.timeout_unit,
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    segment_size: u32,

    state: AtomicState,
    running: AtomicBool,

    // Word-sized fields read across threads without the tx lock; relaxed on
    // purpose, matching the reference protocol's unfenced reads.
    last_ack_rx: AtomicU8,
    last_seq_rx: AtomicU8,
    next_seq_rx: AtomicU8,
    peer_busy: AtomicBool,
    rem_max_buffers: AtomicU32,
    rem_max_segment: AtomicU32,

    tx: Mutex<TxState>,
    st_lock: Mutex<()>,
    st_cond: Condvar,

    st_queue: CondQueue<Header>,
    app_queue: CondQueue<Header>,

    metrics: LinkMetrics,
}

/// A reliable, sequenced, retransmitting connection over an unreliable
/// frame carrier.
///
/// Dropping the controller (or calling [`Controller::stop`]) interrupts the
/// state-machine thread, which emits a final RST and wakes any application
/// thread blocked in [`Controller::application_tx`].
pub struct Controller {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Start a controller with default parameters.
    pub fn new(segment_size: u32, transport: Arc<dyn Transport>) -> Self {
        Self::start(segment_size, ControllerConfig::default(), transport)
    }

    /// Start a controller with explicit parameters.
    pub fn with_config(
        segment_size: u32,
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(segment_size, config, transport))
    }

    fn start(segment_size: u32, config: ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            transport,
            config,
            segment_size,
            state: AtomicState::new(State::Closed),
            running: AtomicBool::new(true),
            last_ack_rx: AtomicU8::new(0),
            last_seq_rx: AtomicU8::new(0),
            next_seq_rx: AtomicU8::new(0),
            peer_busy: AtomicBool::new(false),
            rem_max_buffers: AtomicU32::new(0),
            rem_max_segment: AtomicU32::new(0),
            tx: Mutex::new(TxState {
                window: super::TxWindow::new(),
                loc_sequence: 0,
                last_ack_tx: 0,
                tx_time: Instant::now(),
            }),
            st_lock: Mutex::new(()),
            st_cond: Condvar::new(),
            st_queue: CondQueue::new(),
            app_queue: CondQueue::new(),
            metrics: LinkMetrics::new(),
        });

        let engine = Arc::clone(&shared);
        let handle = thread::spawn(move || run(engine));

        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// True once the handshake has completed and the connection is usable.
    pub fn is_open(&self) -> bool {
        self.shared.state.load() == State::Open
    }

    /// Current connection state.
    pub fn state(&self) -> State {
        self.shared.state.load()
    }

    /// Number of connection teardowns since creation.
    pub fn down_count(&self) -> u32 {
        self.shared.metrics.down_count()
    }

    /// Number of ingress frames discarded since creation.
    pub fn drop_count(&self) -> u32 {
        self.shared.metrics.drop_count()
    }

    /// Number of retransmissions since creation.
    pub fn retran_count(&self) -> u32 {
        self.shared.metrics.retran_count()
    }

    /// True while the application-bound queue is deep enough that outgoing
    /// headers assert BSY.
    pub fn busy(&self) -> bool {
        self.shared.app_queue.len() > self.shared.config.busy_thold
    }

    /// Point-in-time copy of the link counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Allocate a single-buffer frame for application payload.
    ///
    /// The returned frame has header head-room already reserved and a size
    /// clamped to the negotiated remote segment limit and the local segment
    /// size.
    pub fn req_frame(&self, size: usize) -> Result<Frame> {
        let shared = &self.shared;

        let mut n = size + header::HEADER_SIZE;
        let rem = shared.rem_max_segment.load(Ordering::Relaxed) as usize;
        if rem > 0 && n > rem {
            n = rem;
        }
        let seg = shared.segment_size as usize;
        if n > seg {
            n = seg;
        }

        let mut frame = shared.transport.req_frame(n);
        {
            let Some(first) = frame.first_mut() else {
                return Err(Error::EmptyFrame);
            };
            if first.available() < header::HEADER_SIZE {
                return Err(Error::Buffer {
                    expected: header::HEADER_SIZE,
                    actual: first.available(),
                });
            }
            first.set_head_room(first.head_room() + header::HEADER_SIZE);
        }

        // The controller never fragments: multi-buffer frames collapse to
        // their first buffer.
        if frame.buffer_count() > 1 {
            if let Some(first) = frame.split_off_first() {
                frame = Frame::from_buffer(first);
            }
        }

        Ok(frame)
    }

    /// Ingress entry point: called by the carrier's receive thread for every
    /// frame that arrives.
    pub fn transport_rx(&self, frame: Frame) {
        let shared = &self.shared;

        if frame.buffer_count() == 0 {
            shared.metrics.record_drop();
            return;
        }
        let head = Header::new(frame);
        if !head.verify() {
            shared.metrics.record_drop();
            tracing::debug!("dropping malformed ingress frame");
            return;
        }

        if head.ack() {
            shared
                .last_ack_rx
                .store(head.acknowledge(), Ordering::Relaxed);
        }
        shared.peer_busy.store(head.busy(), Ordering::Relaxed);

        let state = shared.state.load();

        // SYN and RST drive the state machine while connecting or open
        if matches!(state, State::Open | State::WaitSyn) && (head.syn() || head.rst()) {
            shared.st_queue.push(head.clone());
        }

        // A SYN synchronizes receive tracking; data and NUL are delivered
        // only in sequence. Out-of-order frames are dropped here and
        // recovered by peer retransmission.
        let deliver = head.syn()
            || (state == State::Open
                && (head.nul() || head.frame().payload_len() > header::HEADER_SIZE)
                && head.sequence() == shared.next_seq_rx.load(Ordering::Relaxed));
        if deliver {
            if head.syn() {
                shared
                    .next_seq_rx
                    .store(head.sequence().wrapping_add(1), Ordering::Relaxed);
            } else {
                shared.next_seq_rx.fetch_add(1, Ordering::Relaxed);
            }
            shared.app_queue.push(head);
        }

        shared.st_cond.notify_all();
    }

    /// Egress entry point: frame the payload, wait for a window slot and
    /// transmit.
    ///
    /// The first buffer must carry header head-room, normally reserved by
    /// [`Controller::req_frame`]. When the connection is not open the frame
    /// is silently dropped.
    pub fn application_rx(&self, frame: Frame) -> Result<()> {
        let shared = &self.shared;

        if frame.buffer_count() == 0 {
            return Err(Error::EmptyFrame);
        }
        let mut frame = frame;
        {
            let Some(first) = frame.first_mut() else {
                return Err(Error::EmptyFrame);
            };
            let head_room = first.head_room();
            if head_room < header::HEADER_SIZE {
                return Err(Error::Buffer {
                    expected: header::HEADER_SIZE,
                    actual: head_room,
                });
            }
            first.set_head_room(head_room - header::HEADER_SIZE);
        }

        let mut head = Header::new(frame);
        head.tx_init(false, false);
        head.set_ack(true);

        // Backpressure: spin until the peer's window has room. The check and
        // the insert happen under the same lock so the window never overruns.
        let mut pending = Some(head);
        loop {
            if shared.state.load() != State::Open {
                tracing::debug!("connection not open, dropping application frame");
                return Ok(());
            }
            {
                let mut tx = shared.tx.lock();
                if tx.window.len() < shared.rem_max_buffers.load(Ordering::Relaxed) {
                    if let Some(head) = pending.take() {
                        transport_tx(shared, &mut tx, head, true);
                    }
                    break;
                }
            }
            thread::sleep(Duration::from_micros(10));
        }

        shared.st_cond.notify_all();
        Ok(())
    }

    /// Blocking delivery: wait for the next in-order data frame from the
    /// peer.
    ///
    /// Returns the frame with its head-room restored so only application
    /// payload is visible. Returns `None` when the connection is torn down
    /// while waiting.
    pub fn application_tx(&self) -> Option<Frame> {
        let shared = &self.shared;
        loop {
            let head = shared.app_queue.pop()?;

            // Every delivered header, keepalives included, advances the ack
            // we owe the peer.
            shared
                .last_seq_rx
                .store(head.sequence(), Ordering::Relaxed);
            shared.st_cond.notify_all();

            if head.nul() || head.syn() {
                continue;
            }

            let mut frame = head.into_frame();
            if let Some(first) = frame.first_mut() {
                first.set_head_room(first.head_room() + header::HEADER_SIZE);
            }
            return Some(frame);
        }
    }

    /// Shut the controller down: interrupt the state-machine thread, emit a
    /// final RST and release any blocked application threads. Idempotent;
    /// also performed on drop.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.st_cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stamp, record and transmit one header under the tx lock. With
/// `seq_update` the header consumes the local sequence number and joins the
/// retransmit window; without it the frame is stamped with the current
/// sequence but does not occupy it (pure acks).
fn transport_tx(shared: &Shared, tx: &mut TxState, mut head: Header, seq_update: bool) {
    let sequence = tx.loc_sequence;
    head.set_sequence(sequence);

    let ack = shared.last_seq_rx.load(Ordering::Relaxed);
    head.set_acknowledge(ack);
    head.set_busy(shared.app_queue.len() > shared.config.busy_thold);
    head.update();
    head.mark_sent();

    tx.last_ack_tx = ack;
    tx.tx_time = Instant::now();

    shared.transport.send_frame(head.frame());

    if seq_update {
        tx.window.insert(sequence, head);
        tx.loc_sequence = sequence.wrapping_add(1);
    }
}

/// State-machine thread body: timed condition-variable loop dispatching on
/// the current state. Each handler returns the next wait interval.
fn run(shared: Arc<Shared>) {
    let mut ctx = StateCtx::new(&shared.config);
    let mut wait = Duration::ZERO;

    tracing::debug!("controller state thread started");

    loop {
        if !wait.is_zero() {
            let mut guard = shared.st_lock.lock();
            shared.st_cond.wait_for(&mut guard, wait);
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        wait = match shared.state.load() {
            State::Closed | State::WaitSyn => state_closed_wait(&shared, &mut ctx),
            State::SendSeqAck => state_send_seq_ack(&shared, &mut ctx),
            State::Open => state_open(&shared, &mut ctx),
            State::Error => state_error(&shared, &mut ctx),
        };
    }

    // Final reset on the way out
    state_error(&shared, &mut ctx);
}

/// Closed / WaitSyn: consume a SYN-ACK or RST if one is queued, otherwise
/// re-issue the SYN once the try period lapses.
fn state_closed_wait(shared: &Shared, ctx: &mut StateCtx) -> Duration {
    if let Some(head) = shared.st_queue.try_pop() {
        if head.rst() {
            tracing::debug!("reset received while connecting");
            shared.state.store(State::Closed);
        } else if head.syn() && head.ack() {
            shared
                .rem_max_buffers
                .store(u32::from(head.max_outstanding()), Ordering::Relaxed);
            shared
                .rem_max_segment
                .store(u32::from(head.max_segment_size()), Ordering::Relaxed);
            ctx.retran_tout = head.retran_tout();
            ctx.cum_ack_tout = head.cum_ack_tout();
            ctx.null_tout = head.null_tout();
            ctx.max_retran = head.max_retran();
            ctx.max_cum_ack = head.max_cum_ack();
            ctx.rem_conn_id = head.connection_id();

            // The SYN-ACK acknowledges our SYN; anchor one behind it so the
            // first ack pass releases the SYN's window slot.
            ctx.prev_ack_rx = head.acknowledge().wrapping_sub(1);

            ctx.st_time = Instant::now();
            shared.state.store(State::SendSeqAck);
            tracing::debug!(conn_id = ctx.rem_conn_id, "syn-ack accepted");
        }
    } else if timer::time_passed(ctx.st_time, shared.config.try_period, ctx.timeout_unit) {
        let frame = shared.transport.req_frame(header::SYN_SIZE);
        let mut head = Header::new(frame);
        head.tx_init(true, true);
        head.set_chk(true);
        head.set_version(VERSION);
        head.set_timeout_unit(ctx.timeout_unit);
        head.set_max_outstanding(shared.config.loc_max_buffers);
        head.set_max_segment_size(shared.segment_size.min(u32::from(u16::MAX)) as u16);
        head.set_retran_tout(ctx.retran_tout);
        head.set_cum_ack_tout(ctx.cum_ack_tout);
        head.set_null_tout(ctx.null_tout);
        head.set_max_retran(ctx.max_retran);
        head.set_max_cum_ack(ctx.max_cum_ack);
        head.set_connection_id(shared.config.conn_id);

        {
            let mut tx = shared.tx.lock();
            // Each attempt starts with a clean window; SYNs from earlier
            // unanswered attempts would otherwise pin slots until teardown
            tx.window.clear();
            transport_tx(shared, &mut tx, head, true);
        }

        ctx.st_time = Instant::now();
        shared.state.store(State::WaitSyn);
        tracing::debug!("syn sent");
    }

    timer::conv_time(shared.config.try_period, ctx.timeout_unit) / 4
}

/// SendSeqAck: confirm the handshake with a pure (non-consuming) ACK and
/// open the connection.
fn state_send_seq_ack(shared: &Shared, ctx: &mut StateCtx) -> Duration {
    let frame = shared.transport.req_frame(header::HEADER_SIZE);
    let mut ack = Header::new(frame);
    ack.tx_init(false, true);
    ack.set_ack(true);

    {
        let mut tx = shared.tx.lock();
        transport_tx(shared, &mut tx, ack, false);
    }

    shared.state.store(State::Open);
    tracing::debug!("connection open");

    timer::conv_time(u32::from(ctx.cum_ack_tout / 2), ctx.timeout_unit)
}

/// Open: advance the cumulative ack, retransmit expired entries, and emit an
/// ack or null-keepalive frame when the cadence calls for one.
///
/// The cross-thread fields are sampled once up front to bound the races in
/// one tick.
fn state_open(shared: &Shared, ctx: &mut StateCtx) -> Duration {
    let loc_ack_rx = shared.last_ack_rx.load(Ordering::Relaxed);
    let loc_seq_rx = shared.last_seq_rx.load(Ordering::Relaxed);

    // Control traffic while open means the peer lost the connection
    if shared.st_queue.try_pop().is_some() {
        tracing::warn!("unexpected syn/rst while open");
        ctx.st_time = Instant::now();
        shared.state.store(State::Error);
        return Duration::ZERO;
    }

    // Cumulative ack advance: release every slot the peer now covers
    if loc_ack_rx != ctx.prev_ack_rx {
        let mut tx = shared.tx.lock();
        tx.window.release_range(&mut ctx.prev_ack_rx, loc_ack_rx);
    }

    // Retransmission pass over the still-outstanding range
    {
        let mut tx = shared.tx.lock();
        let peer_busy = shared.peer_busy.load(Ordering::Relaxed);
        let TxState {
            window,
            loc_sequence,
            last_ack_tx,
            tx_time,
        } = &mut *tx;
        let loc_seq_tx = loc_sequence.wrapping_sub(1);

        for sequence in seq::range(loc_ack_rx, loc_seq_tx) {
            let Some(head) = window.get_mut(sequence) else {
                continue;
            };

            // A busy peer freezes the timer; held time never counts toward
            // the retry budget
            if peer_busy {
                head.mark_sent();
                continue;
            }
            if !timer::time_passed(head.sent_at(), u32::from(ctx.retran_tout), ctx.timeout_unit)
            {
                continue;
            }

            if head.retries() >= u32::from(ctx.max_retran) {
                tracing::warn!(sequence, "retransmission budget exhausted");
                ctx.st_time = Instant::now();
                shared.state.store(State::Error);
                return Duration::ZERO;
            }

            // Re-send from the slot: original sequence, refreshed ack
            let ack = shared.last_seq_rx.load(Ordering::Relaxed);
            head.set_acknowledge(ack);
            head.set_busy(shared.app_queue.len() > shared.config.busy_thold);
            head.update();
            head.mark_sent();
            head.bump_retries();

            *last_ack_tx = ack;
            *tx_time = Instant::now();

            shared.transport.send_frame(head.frame());
            shared.metrics.record_retransmit();
            tracing::debug!(sequence, "retransmit");
        }
    }

    // Ack cadence
    let (loc_time, ack_pend) = {
        let tx = shared.tx.lock();
        (tx.tx_time, seq::distance(tx.last_ack_tx, loc_seq_rx))
    };

    let do_null = timer::time_passed(loc_time, u32::from(ctx.null_tout / 3), ctx.timeout_unit);
    let do_ack = ack_pend >= ctx.max_cum_ack
        || ((ack_pend > 0 || shared.app_queue.len() > shared.config.busy_thold)
            && timer::time_passed(loc_time, u32::from(ctx.cum_ack_tout), ctx.timeout_unit));

    if do_null || do_ack {
        let frame = shared.transport.req_frame(header::HEADER_SIZE);
        let mut head = Header::new(frame);
        head.tx_init(false, true);
        head.set_ack(true);
        head.set_nul(do_null);

        // A null keepalive consumes a sequence number and must be
        // retransmittable; a pure ack does not
        let mut tx = shared.tx.lock();
        transport_tx(shared, &mut tx, head, do_null);
    }

    timer::conv_time(u32::from(ctx.cum_ack_tout / 2), ctx.timeout_unit)
}

/// Error: emit a RST, flush all transmit state, wake the application and
/// fall back to Closed for a fresh attempt.
fn state_error(shared: &Shared, ctx: &mut StateCtx) -> Duration {
    tracing::warn!("connection reset");

    let frame = shared.transport.req_frame(header::HEADER_SIZE);
    let mut rst = Header::new(frame);
    rst.tx_init(false, true);
    rst.set_rst(true);

    {
        let mut tx = shared.tx.lock();
        transport_tx(shared, &mut tx, rst, true);
        tx.window.clear();
    }

    shared.metrics.record_down();
    shared.state.store(State::Closed);

    shared.app_queue.reset();
    shared.st_queue.reset();

    ctx.st_time = Instant::now();
    timer::conv_time(shared.config.try_period, ctx.timeout_unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rssi::header::{HEADER_SIZE, SYN_SIZE};
    use crate::rssi::{LOC_MAX_BUFFERS, REQ_RETRAN_TOUT, TIMEOUT_UNIT};

    /// Carrier stub recording every transmitted frame.
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        fn sent_headers(&self) -> Vec<Header> {
            self.sent
                .lock()
                .iter()
                .map(|wire| Header::new(Frame::from_bytes(wire)))
                .collect()
        }

        fn data_frames(&self) -> Vec<Header> {
            self.sent_headers()
                .into_iter()
                .filter(|h| !h.syn() && !h.rst() && !h.nul() && h.payload_len() > 0)
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn req_frame(&self, size: usize) -> Frame {
            Frame::with_capacity(size)
        }

        fn send_frame(&self, frame: &Frame) {
            let wire: Vec<u8> = frame
                .buffers()
                .flat_map(|b| b.payload().to_vec())
                .collect();
            self.sent.lock().push(wire);
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Peer parameters carried in the crafted SYN-ACK.
    struct Peer {
        sequence: u8,
        window: u8,
        retran_tout: u16,
        cum_ack_tout: u16,
        null_tout: u16,
        max_retran: u8,
    }

    impl Default for Peer {
        fn default() -> Self {
            Self {
                sequence: 50,
                window: 8,
                retran_tout: 1000,
                cum_ack_tout: 4,
                null_tout: 60000,
                max_retran: 15,
            }
        }
    }

    fn build_syn_ack(syn_wire: &[u8], peer: &Peer) -> Vec<u8> {
        let syn = Header::new(Frame::from_bytes(syn_wire));
        assert!(syn.verify() && syn.syn());

        let mut head = Header::new(Frame::with_capacity(SYN_SIZE));
        head.tx_init(true, true);
        head.set_ack(true);
        head.set_chk(true);
        head.set_version(VERSION);
        head.set_timeout_unit(TIMEOUT_UNIT);
        head.set_sequence(peer.sequence);
        head.set_acknowledge(syn.sequence());
        head.set_max_outstanding(peer.window);
        head.set_max_segment_size(1400);
        head.set_retran_tout(peer.retran_tout);
        head.set_cum_ack_tout(peer.cum_ack_tout);
        head.set_null_tout(peer.null_tout);
        head.set_max_retran(peer.max_retran);
        head.set_max_cum_ack(2);
        head.set_connection_id(0x8765_4321);
        head.update();
        head.frame().first().unwrap().payload().to_vec()
    }

    fn build_data(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Frame::with_capacity(HEADER_SIZE + payload.len());
        let first = frame.first_mut().unwrap();
        first.set_head_room(HEADER_SIZE);
        first.append(payload).unwrap();
        first.set_head_room(0);

        let mut head = Header::new(frame);
        head.tx_init(false, false);
        head.set_sequence(sequence);
        head.update();
        head.frame().first().unwrap().payload().to_vec()
    }

    fn build_ack(acknowledge: u8, busy: bool) -> Vec<u8> {
        let mut head = Header::new(Frame::with_capacity(HEADER_SIZE));
        head.tx_init(false, true);
        head.set_ack(true);
        head.set_acknowledge(acknowledge);
        head.set_busy(busy);
        head.update();
        head.frame().first().unwrap().payload().to_vec()
    }

    /// Bring a controller up against the mock carrier: wait for its SYN,
    /// answer with the peer's SYN-ACK and wait for Open.
    fn open_controller(peer: &Peer) -> (Arc<MockTransport>, Controller, u8) {
        let transport = MockTransport::new();
        let config = ControllerConfig {
            try_period: 20,
            ..Default::default()
        };
        let ctrl =
            Controller::with_config(8192, config, transport.clone() as Arc<dyn Transport>)
                .unwrap();

        assert!(wait_until(Duration::from_secs(2), || transport.sent_count() >= 1));
        let syn_wire = transport.sent.lock()[0].clone();
        let syn_seq = Header::new(Frame::from_bytes(&syn_wire)).sequence();

        ctrl.transport_rx(Frame::from_bytes(&build_syn_ack(&syn_wire, peer)));
        assert!(wait_until(Duration::from_secs(2), || ctrl.is_open()));

        (transport, ctrl, syn_seq)
    }

    fn send_payload(ctrl: &Controller, payload: &[u8]) {
        let mut frame = ctrl.req_frame(payload.len()).unwrap();
        frame.first_mut().unwrap().append(payload).unwrap();
        ctrl.application_rx(frame).unwrap();
    }

    #[test]
    fn test_handshake() {
        let peer = Peer::default();
        let (transport, ctrl, _) = open_controller(&peer);

        let heads = transport.sent_headers();
        let syn = &heads[0];
        assert!(syn.syn());
        assert!(syn.chk());
        assert!(syn.verify());
        assert_eq!(syn.version(), VERSION);
        assert_eq!(syn.connection_id(), 0x1234_5678);
        assert_eq!(syn.max_outstanding(), LOC_MAX_BUFFERS);
        assert_eq!(syn.max_segment_size(), 8192);
        assert_eq!(syn.retran_tout(), REQ_RETRAN_TOUT);

        // The frame confirming the handshake is a pure ack
        let ack = &heads[1];
        assert!(ack.ack());
        assert!(!ack.syn() && !ack.rst() && !ack.nul());
        assert_eq!(ack.payload_len(), 0);

        assert_eq!(ctrl.down_count(), 0);
        assert_eq!(ctrl.drop_count(), 0);
        assert!(!ctrl.busy());

        ctrl.stop();
    }

    #[test]
    fn test_malformed_ingress_counts_drop() {
        let transport = MockTransport::new();
        let ctrl = Controller::new(8192, transport as Arc<dyn Transport>);

        ctrl.transport_rx(Frame::new());
        assert_eq!(ctrl.drop_count(), 1);

        ctrl.transport_rx(Frame::from_bytes(&[0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(ctrl.drop_count(), 2);

        let mut corrupt = build_data(0, b"payload");
        corrupt[8] ^= 0xff; // break the checksum
        ctrl.transport_rx(Frame::from_bytes(&corrupt));
        assert_eq!(ctrl.drop_count(), 3);

        ctrl.stop();
    }

    #[test]
    fn test_application_rx_rejects_bad_frames() {
        let transport = MockTransport::new();
        let ctrl = Controller::new(8192, transport as Arc<dyn Transport>);

        let err = ctrl.application_rx(Frame::new()).unwrap_err();
        assert!(matches!(err, Error::EmptyFrame));

        // No head-room reserved for the header
        let err = ctrl.application_rx(Frame::from_bytes(b"data")).unwrap_err();
        assert!(matches!(err, Error::Buffer { expected, actual: 0 } if expected == HEADER_SIZE));

        ctrl.stop();
    }

    #[test]
    fn test_req_frame_clamps_size() {
        let peer = Peer::default();
        let (_transport, ctrl, _) = open_controller(&peer);

        // Peer advertised 1400; a larger request is clamped to it
        let frame = ctrl.req_frame(4000).unwrap();
        assert_eq!(frame.buffer_count(), 1);
        let first = frame.first().unwrap();
        assert_eq!(first.capacity(), 1400);
        assert_eq!(first.head_room(), HEADER_SIZE);

        let frame = ctrl.req_frame(100).unwrap();
        assert_eq!(frame.first().unwrap().capacity(), 100 + HEADER_SIZE);

        ctrl.stop();
    }

    #[test]
    fn test_ordered_delivery_drops_gaps() {
        let peer = Peer::default();
        let (_transport, ctrl, _) = open_controller(&peer);
        let ctrl = Arc::new(ctrl);

        let received = Arc::new(Mutex::new(Vec::new()));
        let drain_ctrl = Arc::clone(&ctrl);
        let drain_sink = Arc::clone(&received);
        let drain = thread::spawn(move || {
            while let Some(frame) = drain_ctrl.application_tx() {
                let payload: Vec<u8> = frame
                    .buffers()
                    .flat_map(|b| b.payload().to_vec())
                    .collect();
                drain_sink.lock().push(payload);
            }
        });

        let base = peer.sequence.wrapping_add(1);
        ctrl.transport_rx(Frame::from_bytes(&build_data(base, b"first")));
        // Sequence base+2 arrives before base+1 and is discarded
        ctrl.transport_rx(Frame::from_bytes(&build_data(base.wrapping_add(2), b"third")));
        ctrl.transport_rx(Frame::from_bytes(&build_data(base.wrapping_add(1), b"second")));
        // Peer retransmits the discarded frame; exactly one delivery results
        ctrl.transport_rx(Frame::from_bytes(&build_data(base.wrapping_add(2), b"third")));

        assert!(wait_until(Duration::from_secs(2), || received.lock().len() == 3));
        thread::sleep(Duration::from_millis(20));
        let got = received.lock().clone();
        assert_eq!(got, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);

        ctrl.stop();
        drain.join().unwrap();
    }

    #[test]
    fn test_retransmit_then_give_up() {
        let peer = Peer {
            retran_tout: 5,
            max_retran: 2,
            ..Default::default()
        };
        let (transport, ctrl, syn_seq) = open_controller(&peer);

        send_payload(&ctrl, b"hello");

        // No ack ever arrives: the header is re-sent until the budget runs
        // out, then the connection resets
        assert!(wait_until(Duration::from_secs(5), || {
            transport.sent_headers().iter().any(|h| h.rst())
        }));
        assert!(wait_until(Duration::from_secs(1), || ctrl.down_count() == 1));
        assert_eq!(ctrl.retran_count(), 2);
        assert!(!ctrl.is_open());

        // Original send plus both retries, all with the same sequence
        let data = transport.data_frames();
        assert_eq!(data.len(), 3);
        let expect_seq = syn_seq.wrapping_add(1);
        assert!(data.iter().all(|h| h.sequence() == expect_seq));

        ctrl.stop();
    }

    #[test]
    fn test_window_backpressure_and_cumulative_ack() {
        let peer = Peer {
            window: 3,
            ..Default::default()
        };
        let (transport, ctrl, syn_seq) = open_controller(&peer);
        let ctrl = Arc::new(ctrl);

        send_payload(&ctrl, b"one");
        send_payload(&ctrl, b"two");
        send_payload(&ctrl, b"three");
        assert!(wait_until(Duration::from_secs(1), || {
            transport.data_frames().len() == 3
        }));

        // Window is full: the fourth send must stall
        let blocked_ctrl = Arc::clone(&ctrl);
        let blocked = thread::spawn(move || send_payload(&blocked_ctrl, b"four"));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.data_frames().len(), 3);

        // A cumulative ack covering all three releases the caller promptly
        let last_data_seq = syn_seq.wrapping_add(3);
        ctrl.transport_rx(Frame::from_bytes(&build_ack(last_data_seq, false)));
        assert!(wait_until(Duration::from_secs(1), || {
            transport.data_frames().len() == 4
        }));
        blocked.join().unwrap();

        assert_eq!(ctrl.retran_count(), 0);
        ctrl.stop();
    }

    #[test]
    fn test_peer_busy_holds_retransmission() {
        let peer = Peer {
            retran_tout: 10,
            ..Default::default()
        };
        let (transport, ctrl, syn_seq) = open_controller(&peer);

        send_payload(&ctrl, b"held");

        // Busy ack without window movement: the retransmit timer is frozen
        ctrl.transport_rx(Frame::from_bytes(&build_ack(syn_seq, true)));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(ctrl.retran_count(), 0);
        assert_eq!(transport.data_frames().len(), 1);
        assert!(ctrl.is_open());

        // Busy clears: the pending header goes out again
        ctrl.transport_rx(Frame::from_bytes(&build_ack(syn_seq, false)));
        assert!(wait_until(Duration::from_secs(2), || ctrl.retran_count() >= 1));

        ctrl.stop();
    }

    #[test]
    fn test_null_keepalive_consumes_sequence() {
        let peer = Peer {
            null_tout: 30,
            ..Default::default()
        };
        let (transport, ctrl, syn_seq) = open_controller(&peer);

        // Idle connection: a NUL must appear within null_tout / 3
        assert!(wait_until(Duration::from_secs(2), || {
            transport.sent_headers().iter().any(|h| h.nul())
        }));

        let heads = transport.sent_headers();
        let nul = heads.iter().find(|h| h.nul()).unwrap();
        assert!(nul.ack());
        assert_eq!(nul.payload_len(), 0);
        assert_eq!(nul.sequence(), syn_seq.wrapping_add(1));

        ctrl.stop();
    }

    #[test]
    fn test_unexpected_syn_while_open_resets() {
        let peer = Peer::default();
        let (transport, ctrl, _) = open_controller(&peer);

        // A fresh SYN in the open state forces teardown
        let mut head = Header::new(Frame::with_capacity(SYN_SIZE));
        head.tx_init(true, true);
        head.set_sequence(7);
        head.update();
        let wire = head.frame().first().unwrap().payload().to_vec();
        ctrl.transport_rx(Frame::from_bytes(&wire));

        assert!(wait_until(Duration::from_secs(2), || ctrl.down_count() == 1));
        assert!(transport.sent_headers().iter().any(|h| h.rst()));

        ctrl.stop();
    }

    #[test]
    fn test_stop_unblocks_application_tx() {
        let peer = Peer::default();
        let (_transport, ctrl, _) = open_controller(&peer);
        let ctrl = Arc::new(ctrl);

        let waiter_ctrl = Arc::clone(&ctrl);
        let waiter = thread::spawn(move || waiter_ctrl.application_tx());

        thread::sleep(Duration::from_millis(20));
        ctrl.stop();

        // Teardown resets the queues; the blocked pull returns promptly
        assert_eq!(waiter.join().unwrap().map(|f| f.payload_len()), None);
    }
}
