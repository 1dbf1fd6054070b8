//! Variable-length integer and byte-string framing for record frames.
//!
//! One record is framed as `varint(len) || payload`, where the payload is a
//! fixed-order field concatenation:
//!
//! ```text
//! level(u8) | secs(zigzag varint) | nsecs(varint) | line(varint, max=absent)
//!   | thread_id(varint, max=absent) | lstr(tag) | lstr(file) | lstr(func)
//!   | lstr(content)
//! ```
//!
//! `lstr(x)` is `varint(byte_len) || bytes`; a zero length stands for an
//! absent string. Varints are unsigned LEB128, signed values zigzag first.

use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::record::{Level, Location, Record};

const LINE_ABSENT: u32 = u32::MAX;
const THREAD_ABSENT: u64 = u64::MAX;

pub(crate) fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub(crate) fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(crate) fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn put_lstr(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            put_uvarint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        None => put_uvarint(out, 0),
    }
}

/// Appends the full frame (length prefix included) for `record` to `out`.
/// `scratch` is reused across calls to avoid a per-record allocation.
pub(crate) fn encode_record(record: &Record, scratch: &mut Vec<u8>, out: &mut Vec<u8>) {
    scratch.clear();
    scratch.push(record.level as u8);
    put_uvarint(scratch, zigzag(record.datetime.secs));
    put_uvarint(scratch, record.datetime.nsecs as u64);
    put_uvarint(
        scratch,
        record.location.line.unwrap_or(LINE_ABSENT) as u64,
    );
    put_uvarint(scratch, record.thread_id.unwrap_or(THREAD_ABSENT));
    put_lstr(scratch, record.tag.as_deref());
    put_lstr(scratch, record.location.file.as_deref());
    put_lstr(scratch, record.location.function.as_deref());
    put_lstr(scratch, Some(record.content.as_str()));

    put_uvarint(out, scratch.len() as u64);
    out.extend_from_slice(scratch);
}

/// Forward-only reader over a byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn uvarint(&mut self) -> Result<u64> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| Error::Codec("varint ends mid-value".to_string()))?;
            self.pos += 1;

            if shift == 63 && byte > 1 {
                return Err(Error::Codec("varint overflows u64".to_string()));
            }
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Codec(format!(
                "need {n} bytes but only {} remain",
                self.remaining()
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn lstr(&mut self) -> Result<Option<String>> {
        let len = self.uvarint()?;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Decodes one frame payload. Rejects payloads that are not consumed exactly.
pub(crate) fn decode_record(payload: &[u8]) -> Result<Record> {
    let mut c = Cursor::new(payload);

    let level = c.take(1)?[0];
    let level = Level::from_u8(level)
        .ok_or_else(|| Error::Codec(format!("unknown level value {level}")))?;

    let secs = unzigzag(c.uvarint()?);
    let nsecs = u32::try_from(c.uvarint()?)
        .map_err(|_| Error::Codec("nsecs overflows u32".to_string()))?;
    let line = u32::try_from(c.uvarint()?)
        .map_err(|_| Error::Codec("line overflows u32".to_string()))?;
    let thread = c.uvarint()?;

    let tag = c.lstr()?;
    let file = c.lstr()?;
    let function = c.lstr()?;
    let content = c.lstr()?.unwrap_or_default();

    if c.remaining() != 0 {
        return Err(Error::Codec(format!(
            "frame declares more than it holds: {} trailing bytes",
            c.remaining()
        )));
    }

    Ok(Record {
        level,
        datetime: Timestamp::new(secs, nsecs),
        tag,
        location: Location {
            file,
            function,
            line: (line != LINE_ABSENT).then_some(line),
        },
        thread_id: (thread != THREAD_ABSENT).then_some(thread),
        content,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn uvarint_round_trip(v: u64) -> u64 {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, v);
        let mut c = Cursor::new(&buf);
        let got = c.uvarint().unwrap();
        assert_eq!(c.remaining(), 0);
        got
    }

    #[test]
    fn uvarint_boundaries() {
        let mut cases = vec![0u64, 1];
        for k in 1..10 {
            let edge = 1u64 << (7 * k);
            cases.push(edge - 1);
            if k < 10 {
                cases.push(edge);
            }
        }
        cases.push(u64::MAX);

        for v in cases {
            assert_eq!(uvarint_round_trip(v), v);
        }
    }

    #[quickcheck]
    fn uvarint_round_trips(v: u64) -> bool {
        uvarint_round_trip(v) == v
    }

    #[quickcheck]
    fn zigzag_round_trips(v: i64) -> bool {
        unzigzag(zigzag(v)) == v
    }

    #[test]
    fn zigzag_small_magnitudes_stay_small() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
    }

    #[test]
    fn uvarint_rejects_truncation_and_overflow() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, u64::MAX);
        assert!(Cursor::new(&buf[..buf.len() - 1]).uvarint().is_err());

        // Eleven continuation bytes can never fit in 64 bits.
        let over = [0xffu8; 10];
        assert!(Cursor::new(&over).uvarint().is_err());
    }

    fn frame_payload(record: &Record) -> Vec<u8> {
        let (mut scratch, mut out) = (Vec::new(), Vec::new());
        encode_record(record, &mut scratch, &mut out);
        let mut c = Cursor::new(&out);
        let len = c.uvarint().unwrap() as usize;
        let payload = c.take(len).unwrap().to_vec();
        assert_eq!(c.remaining(), 0);
        payload
    }

    #[test]
    fn record_round_trips_every_field() {
        let record = Record {
            level: Level::Warn,
            datetime: Timestamp::new(1_700_000_123, 456_789_000),
            tag: Some("net".to_string()),
            location: Location {
                file: Some("conn.rs".to_string()),
                function: Some("dial".to_string()),
                line: Some(42),
            },
            thread_id: Some(12345),
            content: "connection reset".to_string(),
        };
        assert_eq!(decode_record(&frame_payload(&record)).unwrap(), record);
    }

    #[test]
    fn absent_fields_round_trip_to_none() {
        let record = Record {
            level: Level::Info,
            datetime: Timestamp::new(-7, 0),
            tag: None,
            location: Location::default(),
            thread_id: None,
            content: String::new(),
        };
        let got = decode_record(&frame_payload(&record)).unwrap();
        assert_eq!(got, record);
        assert_eq!(got.location.line, None);
        assert_eq!(got.thread_id, None);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let record = Record::new(Level::Debug, "x");
        let mut payload = frame_payload(&record);
        payload.push(0);
        match decode_record(&payload) {
            Err(Error::Codec(_)) => (),
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = frame_payload(&Record::new(Level::Debug, "truncate me"));
        assert!(decode_record(&payload[..payload.len() - 4]).is_err());
    }
}
