//! Interface to the external codec device.
//!
//! Everything the device-control collaborator does before and around a
//! session (capability query, format negotiation, buffer preparation,
//! stream on/off, controls, event subscription) happens outside this crate;
//! what remains is the per-buffer exchange surface the feeder and
//! dispatcher drive. A real implementation wraps the driver's
//! submit/poll/drain calls; tests script a mock.
//!
//! Device failures are opaque to this crate, so the fallible methods return
//! `anyhow::Result` and the session wraps them into its own taxonomy.

use std::time::Duration;

use anyhow::Result;

use crate::buffer::Port;

/// What the device signalled within one bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Output-port completions are waiting to be drained.
    Output,
    /// Capture-port completions are waiting to be drained.
    Capture,
    /// An out-of-band event is queued.
    Event,
    /// Nothing within the bound.
    Idle,
    /// Error readiness (POLLERR-like); normal termination when no event
    /// subscriptions are outstanding.
    Error,
}

/// A device-reported completion: a previously submitted buffer returned to
/// the caller.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Buffer slot within its port.
    pub index: u32,
    /// Valid payload bytes (capture) or bytes consumed (output).
    pub bytes_used: usize,
    /// Payload offset within the backing region.
    pub data_offset: usize,
    /// Device flagged end of stream on this buffer.
    pub eos: bool,
}

/// Out-of-band device events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Port settings changed; current buffers still suffice.
    SettingsChangedSufficient,
    /// Port settings changed; reconfiguration needed (outer harness
    /// concern).
    SettingsChangedInsufficient,
    /// A requested flush finished.
    FlushDone,
    /// The device closed the session.
    CloseDone,
    /// Fatal device-side failure.
    SysError,
    /// Anything else, carried by raw type.
    Unknown(u32),
}

/// Blocking per-buffer exchange surface of a codec device.
pub trait CodecDevice: Send + Sync {
    /// Hand a buffer to the device. `bytes_used` is the payload length,
    /// `data_offset` its offset within the backing region (ring sessions),
    /// `eos` marks the final submission of the stream.
    fn submit_buffer(
        &self,
        port: Port,
        index: u32,
        bytes_used: usize,
        data_offset: usize,
        eos: bool,
    ) -> Result<()>;

    /// Block until the device signals readiness or `timeout` elapses.
    fn await_readiness(&self, timeout: Duration) -> Result<Readiness>;

    /// Drain all currently completed buffers on `port`, in completion
    /// order.
    fn drain_completed(&self, port: Port) -> Vec<Completion>;

    /// Dequeue one pending out-of-band event, if any.
    fn dequeue_event(&self) -> Option<DeviceEvent>;

    /// Whether event subscriptions are outstanding. Error readiness with no
    /// subscriptions means the device has closed.
    fn events_subscribed(&self) -> bool;
}
