//! Session orchestration: feeder threads, the completion dispatcher, and
//! terminal outcomes.
//!
//! A session runs three threads for its lifetime: one feeder per port and a
//! single dispatcher multiplexing device readiness. The output feeder pulls
//! access units from the [`Framer`] (directly, or packed through the ring
//! when buffers are scarce) and submits them; the capture feeder submits
//! empty buffers for the device to fill; the dispatcher drains completions,
//! recycles buffers into the per-port free queues, copies capture payload to
//! the sink and detects termination. `stop_feeding` is the single
//! cooperative cancellation flag; a thread blocked past its timeout always
//! fails explicitly rather than hanging.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use vidrig::buffer::Port;
//! use vidrig::framer::StreamFormat;
//! use vidrig::session::{Session, SessionConfig};
//! # fn open_device() -> Arc<dyn vidrig::device::CodecDevice> { unimplemented!() }
//!
//! let config = SessionConfig {
//!     format: StreamFormat::AnnexB,
//!     target_completions: 300,
//!     ..SessionConfig::default()
//! };
//! let mut session = Session::new(open_device(), config);
//! session.attach_source(File::open("stream.h264").unwrap());
//! session.start_feeder(Port::Output);
//! session.start_feeder(Port::Capture);
//! session.start_dispatcher(Box::new(File::create("out.yuv").unwrap()));
//! let outcome = session.join_all();
//! assert!(outcome.is_success());
//! ```

use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferArena, Port, SharedArena};
use crate::device::{CodecDevice, DeviceEvent, Readiness};
use crate::error::{CodecError, Result};
use crate::framer::{read_up_to, Framer, StreamFormat};
use crate::queue::{PopError, PortQueue};
use crate::ring::{RingSlot, SharedRing};

/// Default bound for buffer waits and readiness waits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Granularity of the feeder's ring-space wait, so shutdown is noticed
/// promptly while blocked on backpressure.
const SPACE_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Buffer allocation for one port.
#[derive(Debug, Clone, Copy)]
pub struct BufferLayout {
    pub count: u32,
    pub size: usize,
}

/// How many bytes an arbitrary-read feeder pulls per buffer.
#[derive(Debug, Clone, Copy)]
pub enum ReadSize {
    Fixed(usize),
    /// Uniform in `[max / (buffer_count - 1), max]`, so at least one frame's
    /// worth lands in the available buffers.
    Random { max: usize },
}

/// Output-port fill policy.
#[derive(Debug, Clone, Copy)]
pub enum FeedMode {
    /// One access unit per submission, delimited by the [`Framer`].
    Framed,
    /// Arbitrary byte runs, no framing; the device parses the stream
    /// itself. Ring sessions only.
    Arbitrary(ReadSize),
}

/// Fixed parameters of one codec session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub format: StreamFormat,
    pub output_buffers: BufferLayout,
    pub capture_buffers: BufferLayout,
    /// Capture completions after which the session succeeds. `u32::MAX`
    /// runs to end of stream.
    pub target_completions: u32,
    pub timeout: Duration,
    pub feed: FeedMode,
    /// Pack output payloads through a ring of this capacity instead of one
    /// unit per buffer.
    pub ring_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::AnnexB,
            output_buffers: BufferLayout {
                count: 4,
                size: 512 * 1024,
            },
            capture_buffers: BufferLayout {
                count: 4,
                size: 2 * 1024 * 1024,
            },
            target_completions: u32::MAX,
            timeout: DEFAULT_TIMEOUT,
            feed: FeedMode::Framed,
            ring_capacity: None,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Target completion count or device end-of-stream reached.
    Success,
    /// Explicit shutdown request.
    Aborted,
    /// Fatal error; the first failure recorded wins.
    Failed(CodecError),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success)
    }
}

/// State shared by the feeders and the dispatcher.
struct Shared {
    stop_feeding: AtomicBool,
    /// Completion counts per port (output = bitstream consumed, capture =
    /// frames produced).
    completions: [AtomicU32; 2],
    outcome: Mutex<Option<SessionOutcome>>,
    queues: [Arc<PortQueue>; 2],
}

impl Shared {
    fn stopped(&self) -> bool {
        // Monotone within a session, so a relaxed read suffices.
        self.stop_feeding.load(Ordering::Relaxed)
    }

    fn request_stop(&self) {
        self.stop_feeding.store(true, Ordering::SeqCst);
        for queue in &self.queues {
            queue.close();
        }
    }

    /// Record a terminal outcome; the first write wins.
    fn latch(&self, outcome: SessionOutcome) {
        let mut slot = self.outcome.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn latched(&self) -> bool {
        self.outcome.lock().unwrap().is_some()
    }

    fn fail(&self, err: CodecError) {
        error!(error = %err, "session failure");
        self.latch(SessionOutcome::Failed(err));
        self.request_stop();
    }

    fn bump(&self, port: Port) -> u32 {
        self.completions[port.index()].fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Seekable byte source for the output feeder.
pub trait BitstreamSource: Read + Seek + Send {}
impl<T: Read + Seek + Send> BitstreamSource for T {}

enum FeedSource {
    Framed(Framer<Box<dyn BitstreamSource>>),
    Raw {
        reader: Box<dyn BitstreamSource>,
        min: usize,
        max: usize,
    },
}

enum FeedStatus {
    Continue,
    EndOfStream,
    Aborted,
}

/// One session against one device. Threads are started individually so the
/// scripted-sequence interpreter can order operations, then joined together.
pub struct Session {
    device: Arc<dyn CodecDevice>,
    config: SessionConfig,
    arena: SharedArena,
    ring: Option<Arc<SharedRing>>,
    shared: Arc<Shared>,
    source: Option<Box<dyn BitstreamSource>>,
    handles: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(device: Arc<dyn CodecDevice>, config: SessionConfig) -> Self {
        let arena = Arc::new(Mutex::new(BufferArena::new(
            (config.output_buffers.count, config.output_buffers.size),
            (config.capture_buffers.count, config.capture_buffers.size),
        )));
        let queues = [
            Arc::new(PortQueue::new(Port::Output)),
            Arc::new(PortQueue::new(Port::Capture)),
        ];
        for port in Port::ALL {
            let layout = match port {
                Port::Output => config.output_buffers,
                Port::Capture => config.capture_buffers,
            };
            for index in 0..layout.count {
                queues[port.index()].push(index);
            }
        }
        let ring = config.ring_capacity.map(|cap| {
            info!(capacity = cap, "ring-backed output port");
            Arc::new(SharedRing::new(cap))
        });
        Self {
            device,
            config,
            arena,
            ring,
            shared: Arc::new(Shared {
                stop_feeding: AtomicBool::new(false),
                completions: [AtomicU32::new(0), AtomicU32::new(0)],
                outcome: Mutex::new(None),
                queues,
            }),
            source: None,
            handles: Vec::new(),
        }
    }

    /// The buffer memory both this crate and the device see.
    pub fn arena(&self) -> SharedArena {
        Arc::clone(&self.arena)
    }

    /// The ring region backing ring sessions, shared with the device so it
    /// can read submitted `(offset, len)` ranges. `None` unless
    /// `ring_capacity` is configured.
    pub fn ring(&self) -> Option<Arc<SharedRing>> {
        self.ring.clone()
    }

    /// Completions drained so far on `port`.
    pub fn completion_count(&self, port: Port) -> u32 {
        self.shared.completions[port.index()].load(Ordering::Relaxed)
    }

    /// Attach the bitstream the output feeder will consume.
    pub fn attach_source<S: Read + Seek + Send + 'static>(&mut self, source: S) {
        self.source = Some(Box::new(source));
    }

    /// Spawn the feeder thread for `port`. The output feeder consumes the
    /// attached source; the capture feeder submits empty buffers.
    ///
    /// # Panics
    ///
    /// Starting the output feeder without a prior [`attach_source`] is a
    /// caller bug and panics.
    ///
    /// [`attach_source`]: Session::attach_source
    pub fn start_feeder(&mut self, port: Port) {
        let source = match port {
            Port::Capture => None,
            Port::Output => {
                let reader = self
                    .source
                    .take()
                    .expect("output feeder requires an attached bitstream source");
                Some(match self.config.feed {
                    FeedMode::Framed => FeedSource::Framed(Framer::new(reader, self.config.format)),
                    FeedMode::Arbitrary(size) => {
                        let count = self.config.output_buffers.count.max(2) as usize;
                        let (min, max) = match size {
                            ReadSize::Fixed(n) => (n, n),
                            ReadSize::Random { max } => ((max / (count - 1)).max(1), max),
                        };
                        FeedSource::Raw { reader, min, max }
                    }
                })
            }
        };
        let feeder = Feeder {
            port,
            device: Arc::clone(&self.device),
            arena: Arc::clone(&self.arena),
            queue: Arc::clone(&self.shared.queues[port.index()]),
            shared: Arc::clone(&self.shared),
            timeout: self.config.timeout,
            ring: self.ring.clone(),
            source,
            pending: Bytes::new(),
        };
        self.handles.push(thread::spawn(move || feeder.run()));
    }

    /// Spawn the completion dispatcher. Capture payload is copied to `sink`
    /// in completion order.
    pub fn start_dispatcher(&mut self, sink: Box<dyn Write + Send>) {
        let dispatcher = Dispatcher {
            device: Arc::clone(&self.device),
            arena: Arc::clone(&self.arena),
            shared: Arc::clone(&self.shared),
            ring: self.ring.clone(),
            timeout: self.config.timeout,
            target: self.config.target_completions,
            sink,
        };
        self.handles.push(thread::spawn(move || dispatcher.run()));
    }

    /// Cooperatively shut the session down; the outcome becomes `Aborted`
    /// unless a terminal outcome was already recorded.
    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.shared.latch(SessionOutcome::Aborted);
        self.shared.request_stop();
    }

    /// Wait for all session threads and return the terminal outcome.
    pub fn join_all(mut self) -> SessionOutcome {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("session thread panicked");
            }
        }
        match self.shared.outcome.lock().unwrap().take() {
            Some(outcome) => {
                info!(?outcome, "session finished");
                outcome
            }
            None => SessionOutcome::Failed(CodecError::DeviceError(anyhow::anyhow!(
                "session ended without a terminal outcome"
            ))),
        }
    }
}

/// Per-port feed loop: pop a free buffer, fill it, submit it.
struct Feeder {
    port: Port,
    device: Arc<dyn CodecDevice>,
    arena: SharedArena,
    queue: Arc<PortQueue>,
    shared: Arc<Shared>,
    timeout: Duration,
    ring: Option<Arc<SharedRing>>,
    source: Option<FeedSource>,
    /// Unwritten tail of the current payload when a ring write came up
    /// short.
    pending: Bytes,
}

impl Feeder {
    fn run(mut self) {
        debug!(port = %self.port, "feeder started");
        loop {
            if self.shared.stopped() {
                debug!(port = %self.port, "aborting the session");
                break;
            }
            let index = match self.queue.pop_or_wait(self.timeout) {
                Ok(index) => index,
                Err(PopError::Closed) => break,
                Err(PopError::TimedOut) => {
                    self.shared.fail(CodecError::QueueTimeout {
                        port: self.port,
                        timeout: self.timeout,
                    });
                    break;
                }
            };
            if self.shared.stopped() {
                self.queue.push(index);
                break;
            }
            match self.feed_one(index) {
                Ok(FeedStatus::Continue) => {}
                Ok(FeedStatus::EndOfStream) => {
                    info!(port = %self.port, "end of stream submitted");
                    break;
                }
                Ok(FeedStatus::Aborted) => break,
                Err(err) => {
                    self.shared.fail(err);
                    break;
                }
            }
        }
        debug!(port = %self.port, "feeder exiting");
    }

    fn feed_one(&mut self, index: u32) -> Result<FeedStatus> {
        match self.port {
            // Capture buffers go down empty for the device to fill.
            Port::Capture => {
                self.submit(index, 0, 0, false)?;
                Ok(FeedStatus::Continue)
            }
            Port::Output => self.feed_output(index),
        }
    }

    fn feed_output(&mut self, index: u32) -> Result<FeedStatus> {
        let payload = match self.next_payload()? {
            Some(payload) => payload,
            None => {
                self.submit(index, 0, 0, true)?;
                return Ok(FeedStatus::EndOfStream);
            }
        };

        match self.ring.clone() {
            None => {
                let mut arena = self.arena.lock().unwrap();
                let buf = arena.get_mut(Port::Output, index);
                if payload.len() > buf.capacity() {
                    return Err(CodecError::CorruptStream(
                        "access unit exceeds hardware buffer capacity",
                    ));
                }
                buf.data[..payload.len()].copy_from_slice(&payload);
                buf.bytes_used = payload.len();
                buf.data_offset = 0;
                drop(arena);
                self.submit(index, payload.len(), 0, false)?;
            }
            Some(ring) => {
                let slot = match self.ring_write(&ring, &payload)? {
                    Some(slot) => slot,
                    None => return Ok(FeedStatus::Aborted),
                };
                if slot.written < payload.len() {
                    // Carry the tail into the next submission.
                    self.pending = payload.slice(slot.written..);
                    trace!(
                        written = slot.written,
                        pending = self.pending.len(),
                        "partial ring write"
                    );
                }
                self.submit(index, slot.written, slot.offset, false)?;
            }
        }
        Ok(FeedStatus::Continue)
    }

    /// Next bytes to submit: a pending ring tail, the next access unit, or
    /// an arbitrary byte run, per feed mode. `None` is end of stream.
    fn next_payload(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        match self.source.as_mut() {
            Some(FeedSource::Framed(framer)) => framer.next_unit(),
            Some(FeedSource::Raw { reader, min, max }) => {
                let want = if min == max {
                    *min
                } else {
                    rand::rng().random_range(*min..=*max)
                };
                trace!(bytes = want, "arbitrary read");
                let mut buf = vec![0u8; want];
                let got = read_up_to(reader, &mut buf)?;
                if got == 0 {
                    return Ok(None);
                }
                buf.truncate(got);
                Ok(Some(buf.into()))
            }
            None => Ok(None),
        }
    }

    /// Write into the ring, blocking for reclaimed space when it is full.
    /// `Ok(None)` means the session stopped while waiting.
    fn ring_write(&self, ring: &SharedRing, payload: &[u8]) -> Result<Option<RingSlot>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match ring.write(payload) {
                Ok(slot) => return Ok(Some(slot)),
                Err(CodecError::RingFull) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(CodecError::SpaceTimeout(self.timeout));
                    }
                    debug!("ring full, waiting for released space");
                    ring.wait_for_space(remaining.min(SPACE_WAIT_SLICE));
                    if self.shared.stopped() {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn submit(&self, index: u32, bytes_used: usize, data_offset: usize, eos: bool) -> Result<()> {
        debug!(
            port = %self.port,
            index,
            bytes_used,
            data_offset,
            eos,
            "submitting buffer"
        );
        self.device
            .submit_buffer(self.port, index, bytes_used, data_offset, eos)
            .map_err(|source| CodecError::Submission {
                port: self.port,
                source,
            })
    }
}

/// Single-threaded state machine over device readiness.
struct Dispatcher {
    device: Arc<dyn CodecDevice>,
    arena: SharedArena,
    shared: Arc<Shared>,
    ring: Option<Arc<SharedRing>>,
    timeout: Duration,
    target: u32,
    sink: Box<dyn Write + Send>,
}

impl Dispatcher {
    fn run(mut self) {
        debug!("dispatcher started");
        loop {
            if self.shared.stopped() && self.shared.latched() {
                debug!("dispatcher exiting on latched outcome");
                break;
            }
            let readiness = match self.device.await_readiness(self.timeout) {
                Ok(readiness) => readiness,
                Err(err) => {
                    self.shared.fail(CodecError::DeviceError(err));
                    break;
                }
            };
            trace!(?readiness, "device readiness");
            match readiness {
                Readiness::Idle => {
                    self.shared.fail(CodecError::PollTimeout(self.timeout));
                    break;
                }
                Readiness::Output => self.drain_output(),
                Readiness::Capture => {
                    if self.drain_capture() {
                        break;
                    }
                }
                Readiness::Event => {
                    if self.handle_event() {
                        break;
                    }
                }
                Readiness::Error => {
                    if !self.device.events_subscribed() {
                        info!("error readiness with no subscriptions, device closed");
                        self.shared.request_stop();
                        break;
                    }
                    warn!("error readiness while subscribed");
                }
            }
        }
        debug!("dispatcher exiting");
    }

    fn drain_output(&mut self) {
        for completion in self.device.drain_completed(Port::Output) {
            let ebd = self.shared.bump(Port::Output);
            debug!(ebd, index = completion.index, "output completion");
            if let Some(ring) = &self.ring {
                // The only path by which ring space comes back.
                if let Err(err) = ring.advance_read(completion.bytes_used) {
                    error!(error = %err, "failed to reclaim ring space");
                }
            }
            self.shared.queues[Port::Output.index()].push(completion.index);
        }
    }

    /// Returns `true` once a terminal condition was reached.
    fn drain_capture(&mut self) -> bool {
        let mut done = false;
        for completion in self.device.drain_completed(Port::Capture) {
            let fbd = self.shared.bump(Port::Capture);
            debug!(
                fbd,
                index = completion.index,
                bytes_used = completion.bytes_used,
                "capture completion"
            );
            if completion.eos || fbd >= self.target {
                if completion.eos {
                    info!("end of stream on capture port");
                } else {
                    info!(fbd, "target completion count reached");
                }
                self.shared.latch(SessionOutcome::Success);
                self.shared.request_stop();
                done = true;
            }
            if completion.bytes_used > 0 {
                let arena = self.arena.lock().unwrap();
                let buf = arena.get(Port::Capture, completion.index);
                let len = completion.bytes_used.min(buf.capacity());
                if let Err(err) = self.sink.write_all(&buf.data[..len]) {
                    drop(arena);
                    self.shared.fail(err.into());
                    return true;
                }
            }
            self.shared.queues[Port::Capture.index()].push(completion.index);
        }
        done
    }

    /// Returns `true` when the event terminates the dispatcher.
    fn handle_event(&mut self) -> bool {
        match self.device.dequeue_event() {
            Some(DeviceEvent::CloseDone) => {
                // Normal device close: release blocked feeders without
                // latching a failure.
                info!("close done received");
                self.shared.request_stop();
                true
            }
            Some(DeviceEvent::SysError) => {
                self.shared.fail(CodecError::SysError);
                true
            }
            Some(DeviceEvent::SettingsChangedInsufficient) => {
                // Reconfiguration is the outer harness's job.
                info!("port settings changed, insufficient");
                false
            }
            Some(DeviceEvent::SettingsChangedSufficient) => {
                info!("port settings changed, sufficient");
                false
            }
            Some(DeviceEvent::FlushDone) => {
                info!("flush done received");
                false
            }
            Some(DeviceEvent::Unknown(kind)) => {
                warn!(kind, "unhandled device event");
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
