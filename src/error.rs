//! Error taxonomy for a codec session.
//!
//! Everything here is fatal for the session except [`CodecError::RingFull`],
//! which is backpressure: the feeder waits for the dispatcher to reclaim
//! ring space and retries.

use std::time::Duration;

use thiserror::Error;

use crate::buffer::Port;

/// Errors surfaced by the framing and buffer-exchange pipeline.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bitstream ended or desynchronized mid-unit.
    #[error("corrupt bitstream: {0}")]
    CorruptStream(&'static str),

    /// I/O failure while reading the input stream or writing the sink.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The device rejected a submitted buffer.
    #[error("submit failed on {port} port: {source}")]
    Submission {
        port: Port,
        #[source]
        source: anyhow::Error,
    },

    /// No free buffer became available within the bound.
    #[error("no free {port} buffer within {timeout:?}")]
    QueueTimeout { port: Port, timeout: Duration },

    /// The device reported no readiness within the bound.
    #[error("device reported no readiness within {0:?}")]
    PollTimeout(Duration),

    /// The readiness wait itself failed.
    #[error("device readiness wait failed: {0}")]
    DeviceError(anyhow::Error),

    /// The ring buffer has no free space. Recoverable: retry after the next
    /// `advance_read`.
    #[error("ring buffer full")]
    RingFull,

    /// No ring space was released within the bound.
    #[error("no ring space released within {0:?}")]
    SpaceTimeout(Duration),

    /// A read-offset advance claimed more bytes than are occupied.
    #[error("ring read of {requested} bytes exceeds {occupied} occupied")]
    RingUnderflow { requested: usize, occupied: usize },

    /// The device raised a fatal system error event.
    #[error("device system error event")]
    SysError,
}

pub type Result<T> = std::result::Result<T, CodecError>;
