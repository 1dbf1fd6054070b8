//! Streaming zstd sessions with explicit begin/write/end phases.
//!
//! A session lives exactly as long as one segment stream. `write` flushes the
//! encoder after every call so that staged bytes always end on a complete
//! zstd block; a crash that loses the unterminated stream tail still leaves
//! every flushed record decodable.

use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::error::{Error, Result};

const SCRATCH_LEN: usize = 16 * 1024;

pub(crate) struct CompressSession {
    enc: Encoder<'static>,
    scratch: Vec<u8>,
}

impl CompressSession {
    pub fn begin(level: i32) -> Result<Self> {
        let enc = Encoder::new(level).map_err(Error::Compression)?;
        Ok(Self {
            enc,
            scratch: vec![0u8; SCRATCH_LEN],
        })
    }

    /// Compresses `input` and appends all produced bytes to `out`, flushing
    /// the encoder so nothing is held back in internal buffers.
    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut in_buf = InBuffer::around(input);
        while in_buf.pos < input.len() {
            let produced = {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                self.enc
                    .run(&mut in_buf, &mut out_buf)
                    .map_err(Error::Compression)?;
                out_buf.pos()
            };
            out.extend_from_slice(&self.scratch[..produced]);
        }
        loop {
            let (produced, remaining) = {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self.enc.flush(&mut out_buf).map_err(Error::Compression)?;
                (out_buf.pos(), remaining)
            };
            out.extend_from_slice(&self.scratch[..produced]);
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// Terminates the stream, appending the frame epilogue to `out`. The
    /// session is consumed; a new segment starts a new session.
    pub fn end(mut self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            let (produced, remaining) = {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self
                    .enc
                    .finish(&mut out_buf, true)
                    .map_err(Error::Compression)?;
                (out_buf.pos(), remaining)
            };
            out.extend_from_slice(&self.scratch[..produced]);
            if remaining == 0 {
                return Ok(());
            }
        }
    }
}

/// Streaming inverse of [`CompressSession`], used by the parse path.
pub(crate) struct DecompressSession {
    dec: Decoder<'static>,
    scratch: Vec<u8>,
    frame_done: bool,
}

impl DecompressSession {
    pub fn begin() -> Result<Self> {
        let dec = Decoder::new().map_err(Error::Compression)?;
        Ok(Self {
            dec,
            scratch: vec![0u8; SCRATCH_LEN],
            frame_done: false,
        })
    }

    /// True once the stream's terminating block has been decoded. Input past
    /// that point belongs to whatever follows the stream in the file.
    pub fn frame_done(&self) -> bool {
        self.frame_done
    }

    /// Decompresses from `input`, appending plaintext to `out`. Returns the
    /// number of input bytes consumed, which is less than `input.len()` only
    /// when the frame ended inside `input`.
    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        if self.frame_done {
            return Ok(0);
        }
        let mut in_buf = InBuffer::around(input);
        loop {
            let (produced, hint) = {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                let hint = self
                    .dec
                    .run(&mut in_buf, &mut out_buf)
                    .map_err(Error::Compression)?;
                (out_buf.pos(), hint)
            };
            out.extend_from_slice(&self.scratch[..produced]);

            if hint == 0 {
                self.frame_done = true;
                break;
            }
            // No further progress is possible once the input is consumed and
            // the decoder stopped filling our scratch buffer.
            if in_buf.pos == input.len() && produced < self.scratch.len() {
                break;
            }
        }
        Ok(in_buf.pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decompress_all(bytes: &[u8]) -> (Vec<u8>, usize, bool) {
        let mut session = DecompressSession::begin().unwrap();
        let mut out = Vec::new();
        let consumed = session.write(bytes, &mut out).unwrap();
        (out, consumed, session.frame_done())
    }

    #[test]
    fn session_round_trips_multiple_writes() {
        let mut session = CompressSession::begin(10).unwrap();
        let mut compressed = Vec::new();
        session.write(b"the quick brown fox ", &mut compressed).unwrap();
        session.write(b"jumps over the lazy dog", &mut compressed).unwrap();
        session.end(&mut compressed).unwrap();

        let (out, consumed, done) = decompress_all(&compressed);
        assert_eq!(out, b"the quick brown fox jumps over the lazy dog");
        assert_eq!(consumed, compressed.len());
        assert!(done);
    }

    #[test]
    fn unterminated_stream_still_decodes_flushed_writes() {
        let mut session = CompressSession::begin(10).unwrap();
        let mut compressed = Vec::new();
        for i in 0..100 {
            session
                .write(format!("record number {i}\n").as_bytes(), &mut compressed)
                .unwrap();
        }
        // Simulated crash: the session is dropped without end().
        drop(session);

        let (out, consumed, done) = decompress_all(&compressed);
        assert_eq!(consumed, compressed.len());
        assert!(!done);
        assert_eq!(out.split(|b| *b == b'\n').count() - 1, 100);
    }

    #[test]
    fn decoder_stops_at_frame_boundary() {
        let mut session = CompressSession::begin(3).unwrap();
        let mut compressed = Vec::new();
        session.write(b"payload", &mut compressed).unwrap();
        session.end(&mut compressed).unwrap();
        let stream_len = compressed.len();
        compressed.extend_from_slice(b"NEXT UNIT");

        let (out, consumed, done) = decompress_all(&compressed);
        assert_eq!(out, b"payload");
        assert_eq!(consumed, stream_len);
        assert!(done);
    }

    #[test]
    fn large_input_spans_scratch_buffers() {
        let input: Vec<u8> = (0..200_000u32).map(|v| (v % 251) as u8).collect();
        let mut session = CompressSession::begin(1).unwrap();
        let mut compressed = Vec::new();
        session.write(&input, &mut compressed).unwrap();
        session.end(&mut compressed).unwrap();

        let (out, _, done) = decompress_all(&compressed);
        assert_eq!(out, input);
        assert!(done);
    }
}
