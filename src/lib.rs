//! Exerciser for V4L2-style hardware video codecs.
//!
//! Drives one codec session end to end: access units are cut from an
//! elementary stream by the [`framer`], carried in fixed hardware buffers
//! (optionally packed through a byte [`ring`] when buffers are scarce) and
//! exchanged with the device by per-port feeder threads, while a single
//! dispatcher drains completions and decides how the session ends. The
//! device itself sits behind the [`device::CodecDevice`] trait, so the same
//! loops run against a real driver or a scripted mock.
//!
//! Call [`init_logging`] (or install your own `tracing` subscriber) and set
//! `RUST_LOG=vidrig=debug` for per-buffer traces.

pub mod buffer;
pub mod device;
pub mod error;
pub mod framer;
pub mod queue;
pub mod ring;
pub mod session;

pub use buffer::{BufferArena, HardwareBuffer, Port, SharedArena};
pub use device::{CodecDevice, Completion, DeviceEvent, Readiness};
pub use error::CodecError;
pub use framer::{Framer, StreamFormat};
pub use ring::{RingBuffer, SharedRing};
pub use session::{FeedMode, Session, SessionConfig, SessionOutcome};

/// Install a `tracing` subscriber honoring `RUST_LOG`, at info level for
/// this crate by default.
pub fn init_logging() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vidrig=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();
    Ok(())
}
