//! Read path: time-ranged extraction and parse-to-text.
//!
//! Extraction is a byte-level concatenation of segment files, so its output
//! is itself a valid log archive. Parsing walks an archive unit by unit
//! (each unit: segment header + one compressed, optionally encrypted
//! stream), inverting the write pipeline. Reads are best-effort: a corrupt
//! or crash-truncated stream ends its unit, and the parser resynchronizes
//! on the next plausible unit header rather than abandoning the archive.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::cipher::{self, DecryptStream, BLOCK_LEN};
use crate::codec;
use crate::compress::DecompressSession;
use crate::error::{Error, Result};
use crate::logger::Domain;
use crate::record::Record;
use crate::segment::{list_segments, SegmentHeader, SEGMENT_MAGIC};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Concatenates the segments whose bucket window intersects the inclusive
/// range `[start_secs, end_secs]` into `dest`, in bucket order.
///
/// No re-compression or re-encryption happens; `dest` can be parsed with
/// the same secret key as the source directory. Segments whose header does
/// not validate are skipped with a warning. A failure to create or write
/// `dest` is returned and may leave a partial file behind.
pub fn extract(domain: &Domain, start_secs: i64, end_secs: i64, dest: &Path) -> Result<()> {
    let entries = list_segments(&domain.directory, &domain.identifier)?;
    let mut out = File::create(dest)?;

    for entry in entries {
        if entry.bucket_start > end_secs || entry.bucket_end <= start_secs {
            continue;
        }
        let mut file = match File::open(&entry.path) {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(path = %entry.path.display(), %error, "skipping unreadable segment");
                continue;
            }
        };
        let mut head = [0u8; 41];
        let mut filled = 0;
        while filled < head.len() {
            match file.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(error) => {
                    filled = 0;
                    tracing::warn!(path = %entry.path.display(), %error, "skipping unreadable segment");
                    break;
                }
            }
        }
        if let Err(error) = SegmentHeader::decode(&head[..filled]) {
            tracing::warn!(path = %entry.path.display(), %error, "skipping invalid segment");
            continue;
        }
        out.write_all(&head[..filled])?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

/// Renders parsed records into bytes appended to the output file.
pub trait Formatter {
    fn format(&mut self, record: &Record) -> Vec<u8>;

    /// Error channel: invoked when part of the archive cannot be read. The
    /// returned bytes, if any, are appended in place of the lost records.
    fn unreadable(&mut self, _error: &Error) -> Option<Vec<u8>> {
        None
    }
}

/// Renders one line per record:
/// `YYYY-MM-DD HH:MM:SS.mmm <LEVEL> [tag] (file:line function) [thread_id] content`.
/// Missing optional fields collapse their brackets.
#[derive(Debug, Default)]
pub struct DefaultFormatter;

impl Formatter for DefaultFormatter {
    fn format(&mut self, record: &Record) -> Vec<u8> {
        let dt = OffsetDateTime::from_unix_timestamp(record.datetime.secs)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let stamp = dt
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .expect("formatting into a string cannot fail");

        let mut line = format!(
            "{stamp}.{:03} <{}>",
            record.datetime.nsecs / 1_000_000,
            record.level.name()
        );
        if let Some(tag) = &record.tag {
            line.push_str(&format!(" [{tag}]"));
        }
        let location = &record.location;
        if location.file.is_some() || location.function.is_some() || location.line.is_some() {
            let mut part = String::new();
            if let Some(file) = &location.file {
                part.push_str(file);
            }
            if let Some(line_no) = location.line {
                part.push_str(&format!(":{line_no}"));
            }
            if let Some(function) = &location.function {
                if !part.is_empty() {
                    part.push(' ');
                }
                part.push_str(function);
            }
            line.push_str(&format!(" ({part})"));
        }
        if let Some(thread_id) = record.thread_id {
            line.push_str(&format!(" [{thread_id}]"));
        }
        line.push(' ');
        line.push_str(&record.content);
        line.push('\n');
        line.into_bytes()
    }
}

/// Parses the archive at `src` (a segment file, or an [`extract`] output)
/// and writes each record's textual projection to `dest`.
///
/// `secret_key` is the base64 secp256r1 secret matching the public key the
/// archive was written under; required when any unit is encrypted. Key
/// problems abort with an error; corruption within a unit is absorbed
/// best-effort as described on the module.
pub fn parse_to_file(
    src: &Path,
    dest: &Path,
    secret_key: Option<&str>,
    formatter: &mut dyn Formatter,
) -> Result<()> {
    let secret = match secret_key {
        Some(secret_key) => Some(cipher::parse_secret_key(secret_key)?),
        None => None,
    };
    let bytes = fs::read(src)?;
    let mut out = BufWriter::new(File::create(dest)?);

    let mut pos = 0;
    let mut records = 0;
    let mut decrypt_failure = None;
    while pos < bytes.len() {
        // A missing secret key and output IO failures abort; unit
        // corruption only advances to the next recognizable header.
        match parse_unit(&bytes[pos..], secret.as_ref(), formatter, &mut out, &mut records)? {
            UnitOutcome::Clean(consumed) => pos += consumed,
            UnitOutcome::Corrupt(error) => {
                if matches!(error, Error::Decrypt(_)) && decrypt_failure.is_none() {
                    decrypt_failure = Some(error);
                }
                match find_next_header(&bytes, pos + 1) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
        }
    }
    out.flush()?;
    // When decryption failed and not one record came out, the caller's key
    // is wrong; report that rather than an empty success.
    match decrypt_failure {
        Some(error) if records == 0 => Err(error),
        _ => Ok(()),
    }
}

enum UnitOutcome {
    /// The unit decoded; skip this many input bytes to reach the next one.
    Clean(usize),
    /// The unit is damaged and its extent unknowable; resynchronize.
    Corrupt(Error),
}

/// The decoded body of one unit, plus how far it reached into the input and
/// whether it ended in corruption worth resynchronizing over.
struct UnitBody {
    plain: Vec<u8>,
    consumed: usize,
    error: Option<Error>,
}

fn parse_unit(
    buf: &[u8],
    secret: Option<&p256::SecretKey>,
    formatter: &mut dyn Formatter,
    out: &mut impl Write,
    records: &mut usize,
) -> Result<UnitOutcome> {
    let (header, header_len) = match SegmentHeader::decode(buf) {
        Ok(decoded) => decoded,
        Err(error) => {
            tracing::warn!(%error, "unreadable unit header");
            if let Some(note) = formatter.unreadable(&error) {
                out.write_all(&note)?;
            }
            return Ok(UnitOutcome::Corrupt(error));
        }
    };
    let body = &buf[header_len..];
    let unit = match &header.eph_public {
        Some(eph_public) => read_encrypted_body(eph_public, secret, body)?,
        None => read_plain_body(body),
    };

    *records += emit_records(&unit.plain, formatter, out)?;
    match unit.error {
        None => Ok(UnitOutcome::Clean(header_len + unit.consumed)),
        Some(error) => {
            tracing::warn!(%error, "archive unit ends in corruption");
            if let Some(note) = formatter.unreadable(&error) {
                out.write_all(&note)?;
            }
            Ok(UnitOutcome::Corrupt(error))
        }
    }
}

fn read_plain_body(body: &[u8]) -> UnitBody {
    let mut session = match DecompressSession::begin() {
        Ok(session) => session,
        Err(error) => {
            return UnitBody {
                plain: Vec::new(),
                consumed: 0,
                error: Some(error),
            }
        }
    };
    let mut plain = Vec::new();
    match session.write(body, &mut plain) {
        // An unterminated final stream (crash before shutdown) is decoded
        // as far as its complete blocks go; that is not corruption.
        Ok(consumed) => UnitBody {
            plain,
            consumed,
            error: None,
        },
        Err(error) => UnitBody {
            plain,
            consumed: body.len(),
            error: Some(error),
        },
    }
}

fn read_encrypted_body(
    eph_public: &[u8],
    secret: Option<&p256::SecretKey>,
    body: &[u8],
) -> Result<UnitBody> {
    let secret = secret.ok_or_else(|| {
        Error::InvalidKey("a secret key is required to parse an encrypted log".to_string())
    })?;
    // A header whose ephemeral key is not on the curve is unit corruption,
    // not a caller mistake.
    let mut stream = match DecryptStream::begin(secret, eph_public) {
        Ok(stream) => stream,
        Err(error) => {
            return Ok(UnitBody {
                plain: Vec::new(),
                consumed: 0,
                error: Some(error),
            })
        }
    };
    let mut session = DecompressSession::begin()?;

    let mut plain = Vec::new();
    let mut block = Vec::with_capacity(BLOCK_LEN);
    let mut consumed = 0;
    let mut first = true;

    loop {
        if body.len() - consumed < BLOCK_LEN {
            // Ran off the end mid-stream; salvage what decoded.
            return Ok(UnitBody {
                plain,
                consumed: body.len(),
                error: Some(Error::Decrypt(
                    "encrypted stream is truncated".to_string(),
                )),
            });
        }
        block.clear();
        stream.decrypt_block(&body[consumed..consumed + BLOCK_LEN], &mut block);
        consumed += BLOCK_LEN;

        if first {
            first = false;
            // The plaintext of a well-formed stream opens with a zstd
            // frame; anything else means the key does not match.
            if !block.starts_with(&ZSTD_MAGIC) {
                return Ok(UnitBody {
                    plain,
                    consumed,
                    error: Some(Error::Decrypt(
                        "wrong secret key, or the segment is corrupt".to_string(),
                    )),
                });
            }
        }

        let used = match session.write(&block, &mut plain) {
            Ok(used) => used,
            Err(error) => {
                return Ok(UnitBody {
                    plain,
                    consumed,
                    error: Some(error),
                })
            }
        };
        if !session.frame_done() {
            continue;
        }

        // The stream ended inside this block; all decrypted bytes past it
        // are the PKCS#7 pad, possibly a whole further block.
        let mut padding = block[used..].to_vec();
        if padding.is_empty() {
            if body.len() - consumed < BLOCK_LEN {
                return Ok(UnitBody {
                    plain,
                    consumed: body.len(),
                    error: Some(Error::Decrypt("padding block is missing".to_string())),
                });
            }
            stream.decrypt_block(&body[consumed..consumed + BLOCK_LEN], &mut padding);
            consumed += BLOCK_LEN;
        }
        let error = cipher::check_padding(&padding).err();
        return Ok(UnitBody {
            plain,
            consumed,
            error,
        });
    }
}

/// Decodes frames from a unit's plaintext and appends their projections,
/// returning how many records came out. A malformed frame stops this unit;
/// the rest of the archive goes on.
fn emit_records(
    plain: &[u8],
    formatter: &mut dyn Formatter,
    out: &mut impl Write,
) -> Result<usize> {
    let mut cursor = codec::Cursor::new(plain);
    let mut records = 0;
    while cursor.remaining() > 0 {
        let decoded = cursor
            .uvarint()
            .and_then(|len| cursor.take(len as usize))
            .and_then(codec::decode_record);
        match decoded {
            Ok(record) => {
                out.write_all(&formatter.format(&record))?;
                records += 1;
            }
            Err(error) => {
                tracing::warn!(%error, "malformed record frame; dropping the rest of the unit");
                if let Some(note) = formatter.unreadable(&error) {
                    out.write_all(&note)?;
                }
                break;
            }
        }
    }
    Ok(records)
}

/// Scans for the next byte offset that decodes as a unit header.
fn find_next_header(bytes: &[u8], from: usize) -> Option<usize> {
    let last = bytes.len().checked_sub(8)?;
    (from..=last).find(|&at| {
        bytes[at..at + 4] == SEGMENT_MAGIC && SegmentHeader::decode(&bytes[at..]).is_ok()
    })
}
