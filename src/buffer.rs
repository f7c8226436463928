//! Hardware buffer bookkeeping.
//!
//! Buffers are allocated once per port at session setup and live in a
//! [`BufferArena`]. Queues and the device refer to them by `(port, index)`
//! only, so a buffer is held by exactly one party at a time: the free queue,
//! the device (in flight), or the dispatcher (being drained). The arena is
//! shared with the device behind a mutex, standing in for the mapped memory
//! both sides of a real driver see.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Buffer memory shared between the session and the device, standing in for
/// the mapped region both sides of a real driver see.
pub type SharedArena = Arc<Mutex<BufferArena>>;

/// One of the two data directions of a codec session.
///
/// `Output` carries compressed (decode) or raw (encode) data *to* the
/// device; `Capture` receives what the device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Output,
    Capture,
}

impl Port {
    /// Both ports, output first.
    pub const ALL: [Port; 2] = [Port::Output, Port::Capture];

    /// Array index for per-port tables.
    pub fn index(self) -> usize {
        match self {
            Port::Output => 0,
            Port::Capture => 1,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Output => write!(f, "output"),
            Port::Capture => write!(f, "capture"),
        }
    }
}

/// One hardware buffer: a fixed-capacity byte region plus the submission
/// metadata the device echoes back on completion.
#[derive(Debug)]
pub struct HardwareBuffer {
    pub index: u32,
    pub port: Port,
    pub data: Vec<u8>,
    /// Valid payload length for the most recent submission or completion.
    pub bytes_used: usize,
    /// Payload offset within the backing region (ring sessions only).
    pub data_offset: usize,
}

impl HardwareBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// All buffers of a session, indexed by port and slot.
#[derive(Debug)]
pub struct BufferArena {
    planes: [Vec<HardwareBuffer>; 2],
}

impl BufferArena {
    /// Allocate `count` buffers of `size` bytes for each port.
    pub fn new(output: (u32, usize), capture: (u32, usize)) -> Self {
        let alloc = |port: Port, (count, size): (u32, usize)| {
            (0..count)
                .map(|index| HardwareBuffer {
                    index,
                    port,
                    data: vec![0u8; size],
                    bytes_used: 0,
                    data_offset: 0,
                })
                .collect()
        };
        Self {
            planes: [alloc(Port::Output, output), alloc(Port::Capture, capture)],
        }
    }

    pub fn buffer_count(&self, port: Port) -> u32 {
        self.planes[port.index()].len() as u32
    }

    pub fn get(&self, port: Port, index: u32) -> &HardwareBuffer {
        &self.planes[port.index()][index as usize]
    }

    pub fn get_mut(&mut self, port: Port, index: u32) -> &mut HardwareBuffer {
        &mut self.planes[port.index()][index as usize]
    }
}
