//! Elementary-stream framing.
//!
//! A [`Framer`] splits a raw bitstream into access units sized for hardware
//! consumption, one unit per call. The container format is fixed for the
//! lifetime of a session:
//!
//! - [`StreamFormat::AnnexB`] — H.264-style start-code delimited NAL units
//! - [`StreamFormat::Mpeg4`] — MPEG-4 VOP-marker delimited chunks
//! - [`StreamFormat::Ivf`] — IVF length-prefixed frames (VP8)
//! - [`StreamFormat::RawNv12`] — fixed-size uncompressed NV12 frames, for
//!   feeding an encoder
//!
//! # Example
//!
//! ```
//! use std::io::Cursor;
//! use vidrig::framer::{Framer, StreamFormat};
//!
//! let stream = Cursor::new(vec![0, 0, 1, 0x67, 0xAA]);
//! let mut framer = Framer::new(stream, StreamFormat::AnnexB);
//! let unit = framer.next_unit().unwrap().unwrap();
//! assert_eq!(&unit[..], &[0, 0, 1, 0x67, 0xAA]);
//! assert!(framer.next_unit().unwrap().is_none());
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{CodecError, Result};

/// Number of interior start-code matches folded into the first Annex-B unit
/// before it is considered closed. Keeps SPS/PPS and the first slice
/// together in one buffer and guards against payload bytes that mimic the
/// prefix early in the stream.
pub const START_CODE_LOOKAHEAD: u32 = 2;

/// MPEG-4 VOP start marker.
const MPEG4_VOP_MARKER: u32 = 0x0000_01B6;

/// Chunk size for the MPEG-4 rolling-window scan.
const MPEG4_CHUNK: usize = 256;

/// IVF container header length.
const IVF_HEADER_LEN: usize = 32;

/// Bitstream container format, selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// Start-code delimited (`00 00 01` / `00 00 00 01` prefixes).
    AnnexB,
    /// Marker-delimited (`00 00 01 B6` VOP start codes).
    Mpeg4,
    /// Length-prefixed IVF frames, optional `DKIF` container header.
    Ivf,
    /// Uncompressed NV12 frames of fixed size (encode sessions).
    RawNv12 { width: u32, height: u32 },
}

/// Produces one access unit per call from a seekable byte stream.
///
/// All scanning state is per-instance, so repeated sessions in one process
/// start from a clean slate.
pub struct Framer<R> {
    reader: R,
    format: StreamFormat,
    /// Interior start-code matches consumed so far (Annex-B lookahead).
    lookahead_matches: u32,
    /// Whether the first MPEG-4 unit has been emitted.
    first_unit_done: bool,
    /// Whether the IVF container header has been consumed (or found absent).
    container_header_done: bool,
}

impl<R: Read + Seek> Framer<R> {
    pub fn new(reader: R, format: StreamFormat) -> Self {
        Self {
            reader,
            format,
            lookahead_matches: 0,
            first_unit_done: false,
            container_header_done: false,
        }
    }

    /// Read the next access unit. `Ok(None)` is end of stream; a short read
    /// mid-unit that is not genuine end-of-input is
    /// [`CodecError::CorruptStream`].
    pub fn next_unit(&mut self) -> Result<Option<Bytes>> {
        match self.format {
            StreamFormat::AnnexB => self.next_annexb(),
            StreamFormat::Mpeg4 => self.next_mpeg4(),
            StreamFormat::Ivf => self.next_ivf(),
            StreamFormat::RawNv12 { width, height } => self.next_nv12(width, height),
        }
    }

    /// Start-code delimited scan. The unit keeps its leading start code; the
    /// source cursor is rewound so the next call begins exactly at the next
    /// unit's start code.
    fn next_annexb(&mut self) -> Result<Option<Bytes>> {
        let mut unit: Vec<u8> = Vec::with_capacity(256);
        let mut head = [0u8; 3];
        if read_up_to(&mut self.reader, &mut head)? < 3 {
            return Ok(None);
        }
        unit.extend_from_slice(&head);
        if !is_start_code(&unit, 2) {
            let mut b = [0u8; 1];
            if read_up_to(&mut self.reader, &mut b)? < 1 {
                return Ok(None);
            }
            unit.push(b[0]);
            if !is_start_code(&unit, 3) {
                return Err(CodecError::CorruptStream("no start code at unit head"));
            }
        }

        loop {
            let mut b = [0u8; 1];
            if read_one(&mut self.reader, &mut b)? == 0 {
                // End of input before another start code: final partial unit.
                trace!(len = unit.len(), "annexb: final unit at end of input");
                return Ok(Some(unit.into()));
            }
            unit.push(b[0]);
            let pos = unit.len();
            // Longer prefix checked first so `00 00 00 01` never matches as
            // a 3-byte code one byte late.
            let prefix = if pos >= 4 && is_start_code(&unit[pos - 4..], 3) {
                4
            } else if pos >= 3 && is_start_code(&unit[pos - 3..], 2) {
                3
            } else {
                0
            };
            if prefix == 0 {
                continue;
            }
            if self.lookahead_matches < START_CODE_LOOKAHEAD {
                self.lookahead_matches += 1;
                trace!(
                    matches = self.lookahead_matches,
                    "annexb: folding start code into first unit"
                );
                continue;
            }
            self.reader.seek(SeekFrom::Current(-(prefix as i64)))?;
            unit.truncate(pos - prefix);
            return Ok(Some(unit.into()));
        }
    }

    /// Marker-delimited scan with a rolling 32-bit window over fixed-size
    /// chunks. Units start with the 4-byte marker (synthesized for the very
    /// first unit when the source omits it) and exclude the trailing marker,
    /// which the next call re-reads after the cursor rewind.
    fn next_mpeg4(&mut self) -> Result<Option<Bytes>> {
        let mut unit: Vec<u8> = Vec::with_capacity(1024);
        let mut head = [0u8; 4];
        let n = read_up_to(&mut self.reader, &mut head)?;
        if n == 0 {
            return Ok(None);
        }
        let have_marker = n == 4 && u32::from_be_bytes(head) == MPEG4_VOP_MARKER;
        if !self.first_unit_done && !have_marker {
            debug!("mpeg4: synthesizing VOP marker at head of first unit");
            unit.extend_from_slice(&MPEG4_VOP_MARKER.to_be_bytes());
        }
        self.first_unit_done = true;
        unit.extend_from_slice(&head[..n]);
        if n < 4 {
            return Ok(Some(unit.into()));
        }

        let mut word = u32::from_be_bytes(head);
        let mut chunk = [0u8; MPEG4_CHUNK];
        loop {
            let n = read_one(&mut self.reader, &mut chunk)?;
            if n == 0 {
                trace!(len = unit.len(), "mpeg4: final unit at end of input");
                return Ok(Some(unit.into()));
            }
            for (i, &b) in chunk[..n].iter().enumerate() {
                word = (word << 8) | b as u32;
                unit.push(b);
                if word == MPEG4_VOP_MARKER {
                    // Rewind to the marker boundary; the marker heads the
                    // next unit.
                    let overshoot = (n - i - 1) as i64 + 4;
                    self.reader.seek(SeekFrom::Current(-overshoot))?;
                    unit.truncate(unit.len() - 4);
                    return Ok(Some(unit.into()));
                }
            }
        }
    }

    /// Length-prefixed IVF frames: 4-byte little-endian length, 8-byte
    /// timestamp (ignored), payload. A missing or zero length field is end
    /// of stream.
    fn next_ivf(&mut self) -> Result<Option<Bytes>> {
        if !self.container_header_done {
            self.container_header_done = true;
            let mut header = [0u8; IVF_HEADER_LEN];
            let n = read_up_to(&mut self.reader, &mut header)?;
            if n == 0 {
                return Ok(None);
            }
            if n == IVF_HEADER_LEN && &header[..4] == b"DKIF" {
                debug!("ivf: container header found");
            } else {
                debug!("ivf: no container header, parsing headerless");
                self.reader.seek(SeekFrom::Current(-(n as i64)))?;
            }
        }

        let mut len_field = [0u8; 4];
        let n = read_up_to(&mut self.reader, &mut len_field)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 {
            return Err(CodecError::CorruptStream("truncated IVF frame length"));
        }
        let len = u32::from_le_bytes(len_field) as usize;
        if len == 0 {
            debug!("ivf: zero-length frame, end of stream");
            return Ok(None);
        }

        let mut ts = [0u8; 8];
        if read_up_to(&mut self.reader, &mut ts)? < 8 {
            return Err(CodecError::CorruptStream("truncated IVF frame timestamp"));
        }
        trace!(timestamp = u64::from_le_bytes(ts), len, "ivf frame");

        let mut payload = vec![0u8; len];
        if read_up_to(&mut self.reader, &mut payload)? < len {
            return Err(CodecError::CorruptStream("truncated IVF frame payload"));
        }
        Ok(Some(payload.into()))
    }

    /// Fixed-size NV12 frames, stride aligned to 32. A short final frame is
    /// returned as read.
    fn next_nv12(&mut self, width: u32, height: u32) -> Result<Option<Bytes>> {
        let stride = (width as usize + 31) & !31;
        let size = height as usize * stride * 3 / 2;
        let mut frame = vec![0u8; size];
        let n = read_up_to(&mut self.reader, &mut frame)?;
        if n == 0 {
            return Ok(None);
        }
        frame.truncate(n);
        Ok(Some(frame.into()))
    }
}

/// `true` when `buf` starts with `zeros` zero bytes followed by `0x01`.
fn is_start_code(buf: &[u8], zeros: usize) -> bool {
    buf.len() > zeros && buf[..zeros].iter().all(|&b| b == 0) && buf[zeros] == 1
}

/// Read until `buf` is full or end of input; returns the bytes read.
pub(crate) fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A single `read` call, retried on interruption.
fn read_one<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn annexb_stream(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(&[0, 0, 1]);
            out.extend_from_slice(p);
        }
        out
    }

    fn collect_units(data: Vec<u8>, format: StreamFormat) -> Vec<Bytes> {
        let mut framer = Framer::new(Cursor::new(data), format);
        let mut units = Vec::new();
        while let Some(unit) = framer.next_unit().unwrap() {
            units.push(unit);
        }
        units
    }

    #[test]
    fn annexb_empty_input_is_eos() {
        let units = collect_units(Vec::new(), StreamFormat::AnnexB);
        assert!(units.is_empty());
    }

    #[test]
    fn annexb_missing_start_code_is_corrupt() {
        let mut framer = Framer::new(
            Cursor::new(vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB]),
            StreamFormat::AnnexB,
        );
        assert!(matches!(
            framer.next_unit(),
            Err(CodecError::CorruptStream(_))
        ));
    }

    #[test]
    fn annexb_lookahead_folds_first_units() {
        // SPS + PPS + IDR + two slices: the first unit spans the first three
        // start codes, the rest come out one per call.
        let data = annexb_stream(&[
            &[0x67, 0x42],
            &[0x68, 0xCE],
            &[0x65, 0x88],
            &[0x41, 0x9A],
            &[0x41, 0x9B],
        ]);
        let units = collect_units(data.clone(), StreamFormat::AnnexB);
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &data[..15]);
        assert_eq!(&units[1][..], &[0, 0, 1, 0x41, 0x9A]);
        assert_eq!(&units[2][..], &[0, 0, 1, 0x41, 0x9B]);

        // Concatenation reproduces the source byte-for-byte.
        let joined: Vec<u8> = units.iter().flat_map(|u| u.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn annexb_four_byte_codes() {
        let mut data = Vec::new();
        for p in [&[0x67u8, 1][..], &[0x68, 2], &[0x65, 3], &[0x41, 4]] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(p);
        }
        let units = collect_units(data.clone(), StreamFormat::AnnexB);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[1][..], &[0, 0, 0, 1, 0x41, 4]);
        let joined: Vec<u8> = units.iter().flat_map(|u| u.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn annexb_ten_unit_stream_yields_eight() {
        let payloads: Vec<Vec<u8>> = (0u8..10).map(|i| vec![0x41, i, i + 1]).collect();
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        let data = annexb_stream(&refs);
        let units = collect_units(data.clone(), StreamFormat::AnnexB);
        assert_eq!(units.len(), 10 - START_CODE_LOOKAHEAD as usize);
        let joined: Vec<u8> = units.iter().flat_map(|u| u.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn annexb_lookahead_is_per_instance() {
        let data = annexb_stream(&[&[1], &[2], &[3], &[4]]);
        // A fresh framer folds again; state does not leak between instances.
        for _ in 0..2 {
            let units = collect_units(data.clone(), StreamFormat::AnnexB);
            assert_eq!(units.len(), 2);
        }
    }

    #[test]
    fn mpeg4_synthesizes_head_marker() {
        let mut data = b"VOLHDR".to_vec();
        data.extend_from_slice(&[0, 0, 1, 0xB6]);
        data.extend_from_slice(b"vop-one");
        data.extend_from_slice(&[0, 0, 1, 0xB6]);
        data.extend_from_slice(b"vop-two");
        let units = collect_units(data, StreamFormat::Mpeg4);
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], b"\x00\x00\x01\xB6VOLHDR");
        assert_eq!(&units[1][..], b"\x00\x00\x01\xB6vop-one");
        assert_eq!(&units[2][..], b"\x00\x00\x01\xB6vop-two");
    }

    #[test]
    fn mpeg4_keeps_source_head_marker() {
        let mut data = vec![0, 0, 1, 0xB6];
        data.extend_from_slice(b"only-vop");
        let units = collect_units(data.clone(), StreamFormat::Mpeg4);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &data[..]);
    }

    #[test]
    fn mpeg4_unit_excludes_trailing_marker() {
        // Payload crossing the 256-byte chunk boundary still rewinds to the
        // exact marker boundary.
        let mut data = vec![0, 0, 1, 0xB6];
        data.extend_from_slice(&vec![0xAA; 300]);
        data.extend_from_slice(&[0, 0, 1, 0xB6]);
        data.extend_from_slice(&[0xBB; 10]);
        let units = collect_units(data, StreamFormat::Mpeg4);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].len(), 4 + 300);
        assert_eq!(&units[1][4..], &[0xBB; 10][..]);
    }

    #[test]
    fn mpeg4_empty_input_is_eos() {
        assert!(collect_units(Vec::new(), StreamFormat::Mpeg4).is_empty());
    }

    fn ivf_frame(payload: &[u8], ts: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&ts.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn ivf_with_container_header() {
        let mut data = b"DKIF".to_vec();
        data.resize(IVF_HEADER_LEN, 0);
        data.extend_from_slice(&ivf_frame(b"frame-a", 0));
        data.extend_from_slice(&ivf_frame(b"frame-b", 33));
        let units = collect_units(data, StreamFormat::Ivf);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], b"frame-a");
        assert_eq!(&units[1][..], b"frame-b");
    }

    #[test]
    fn ivf_headerless_rewinds() {
        let mut data = ivf_frame(b"frame-a", 1);
        data.extend_from_slice(&ivf_frame(b"frame-b", 2));
        let units = collect_units(data, StreamFormat::Ivf);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], b"frame-a");
    }

    #[test]
    fn ivf_zero_length_field_is_eos() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0xFF; 16]);
        let units = collect_units(data, StreamFormat::Ivf);
        assert!(units.is_empty());
    }

    #[test]
    fn ivf_truncated_payload_is_corrupt() {
        let mut data = (100u32).to_le_bytes().to_vec();
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3]); // 3 of 100 payload bytes
        let mut framer = Framer::new(Cursor::new(data), StreamFormat::Ivf);
        assert!(matches!(
            framer.next_unit(),
            Err(CodecError::CorruptStream(_))
        ));
    }

    #[test]
    fn nv12_frame_sizing() {
        // width 33 -> stride 64; frame = 8 * 64 * 3/2 = 768 bytes.
        let format = StreamFormat::RawNv12 {
            width: 33,
            height: 8,
        };
        let data = vec![0x11u8; 768 + 100];
        let units = collect_units(data, format);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].len(), 768);
        assert_eq!(units[1].len(), 100);
    }
}
