//! Chunk Log Codec
//!
//! Encoding and decoding for the three on-disk/on-wire formats of a chunk:
//! the binary record log, the newline-delimited index, and the exported chunk blob.
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────────┬──────┬──────┬──────┬───────┬────────┬────────┬────────┬────────┬───────────┐
//! │ Finished │ Rate │ Time │ Type │ Width │ Height │ SPS Len│ PPS Len│ NAL Len│ AddSeqNum │
//! │ (1 byte) │ f64  │ f64  │ f64  │ f64   │ f64    │ f64    │ f64    │ f64    │ f64       │
//! └──────────┴──────┴──────┴──────┴───────┴────────┴────────┴────────┴────────┴───────────┘
//! ┌─────┬─────┬─────┐
//! │ SPS │ PPS │ NAL │
//! └─────┴─────┴─────┘
//! ```
//!
//! All floats are little-endian. `Time` is milliseconds since the epoch. The
//! finished byte is 0 for every record; a finalized log ends with one extra 0
//! byte that is not followed by a header.
//!
//! ## Index Layout
//!
//! One JSON object per line (see [`IndexEntry`]), followed by the literal line
//! `"finished"` once the chunk has been finalized.
//!
//! ## Chunk Blob Layout
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────┐
//! │ Index Len (u32BE)│ JSON index array │ Raw log bytes   │
//! └──────────────────┴──────────────────┴─────────────────┘
//! ```

use crate::error::{Error, Result};
use crate::record::{micros_to_ms, ms_to_micros, FrameType, IndexEntry, NalRecord};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Finished marker plus nine `f64` header fields
pub const RECORD_HEADER_LEN: usize = 1 + 9 * 8;

/// Trailing line of a finalized index file
pub const FINISHED_LINE: &str = "\"finished\"";

/// Encode one record in the chunk log layout.
pub fn encode_record(record: &NalRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(record.encoded_len() as usize);

    buf.put_u8(0);
    buf.put_f64_le(record.rate as f64);
    buf.put_f64_le(micros_to_ms(record.time));
    buf.put_f64_le(record.frame_type.code() as f64);
    buf.put_f64_le(record.width as f64);
    buf.put_f64_le(record.height as f64);
    buf.put_f64_le(record.sps.len() as f64);
    buf.put_f64_le(record.pps.len() as f64);
    buf.put_f64_le(record.nal.len() as f64);
    buf.put_f64_le(record.add_seq_num as f64);

    buf.put_slice(&record.sps);
    buf.put_slice(&record.pps);
    buf.put_slice(&record.nal);

    buf.freeze()
}

struct Header {
    rate: u64,
    time: i64,
    frame_type: FrameType,
    width: u32,
    height: u32,
    sps_len: usize,
    pps_len: usize,
    nal_len: usize,
    add_seq_num: u64,
}

impl Header {
    fn record_len(&self, pos: u64) -> Result<u64> {
        [self.sps_len, self.pps_len, self.nal_len]
            .iter()
            .try_fold(RECORD_HEADER_LEN as u64, |total, &len| total.checked_add(len as u64))
            .ok_or_else(|| Error::InvalidRecord(format!("record length overflows at byte {}", pos)))
    }
}

fn whole(value: f64, field: &str, pos: u64) -> Result<u64> {
    if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
        return Err(Error::InvalidRecord(format!(
            "{} is not a whole number ({}) at byte {}",
            field, value, pos
        )));
    }
    Ok(value as u64)
}

/// Payload lengths are written from in-memory buffers and never exceed `u32::MAX`.
fn length(value: f64, field: &str, pos: u64) -> Result<usize> {
    let len = whole(value, field, pos)?;
    if len > u32::MAX as u64 {
        return Err(Error::InvalidRecord(format!(
            "{} of {} bytes at byte {}",
            field, value, pos
        )));
    }
    Ok(len as usize)
}

/// Parse a record header. `buf` starts at the record; `pos` is only used in errors.
fn read_header(buf: &[u8], pos: u64) -> Result<Header> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::TruncatedRecord {
            pos,
            needed: RECORD_HEADER_LEN as u64,
            available: buf.len() as u64,
        });
    }

    let mut cursor = buf;
    let marker = cursor.get_u8();
    if marker != 0 {
        return Err(Error::InvalidRecordHeader { pos, marker });
    }

    let rate = cursor.get_f64_le();
    if rate == 0.0 {
        return Err(Error::InvalidRecord(format!("rate was 0 at byte {}", pos)));
    }
    let rate = whole(rate, "rate", pos)?;
    let time = ms_to_micros(cursor.get_f64_le());
    let type_code = whole(cursor.get_f64_le(), "type", pos)?;
    let frame_type = FrameType::try_from(type_code as u8).map_err(Error::InvalidRecord)?;
    let width = whole(cursor.get_f64_le(), "width", pos)? as u32;
    let height = whole(cursor.get_f64_le(), "height", pos)? as u32;
    let sps_len = length(cursor.get_f64_le(), "sps length", pos)?;
    let pps_len = length(cursor.get_f64_le(), "pps length", pos)?;
    let nal_len = length(cursor.get_f64_le(), "nal length", pos)?;
    let add_seq_num = whole(cursor.get_f64_le(), "addSeqNum", pos)?;

    Ok(Header {
        rate,
        time,
        frame_type,
        width,
        height,
        sps_len,
        pps_len,
        nal_len,
        add_seq_num,
    })
}

/// Decode one record from the start of `buf`.
///
/// `buf` may extend past the record (trailing bytes are ignored). `pos` is the
/// absolute offset of the record in its log and only appears in errors.
///
/// # Errors
/// - `InvalidRecordHeader` if the finished marker is not 0
/// - `InvalidRecord` if a header field is out of range
/// - `TruncatedRecord` if the declared lengths exceed `buf`
pub fn decode_record(buf: &[u8], pos: u64) -> Result<NalRecord> {
    let header = read_header(buf, pos)?;
    let len = header.record_len(pos)?;
    if (buf.len() as u64) < len {
        return Err(Error::TruncatedRecord {
            pos,
            needed: len,
            available: buf.len() as u64,
        });
    }

    let mut offset = RECORD_HEADER_LEN;
    let mut take = |n: usize| {
        let slice = Bytes::copy_from_slice(&buf[offset..offset + n]);
        offset += n;
        slice
    };
    let sps = take(header.sps_len);
    let pps = take(header.pps_len);
    let nal = take(header.nal_len);

    Ok(NalRecord {
        rate: header.rate,
        time: header.time,
        frame_type: header.frame_type,
        width: header.width,
        height: header.height,
        sps,
        pps,
        nal,
        add_seq_num: header.add_seq_num,
    })
}

/// Result of scanning a whole chunk log
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// One entry per complete record, in log order
    pub entries: Vec<IndexEntry>,

    /// Log ends with the finished sentinel
    pub finished: bool,

    /// Bytes covered by complete records (plus the sentinel, if finished)
    pub valid_len: u64,

    /// A partial record followed the last complete one
    pub truncated_tail: bool,
}

/// Rebuild the index of a chunk log by walking its records.
///
/// A single trailing 0 byte marks a finalized log. A partial record at the end
/// (a write cut short by a crash) is reported through `truncated_tail` and
/// excluded from `valid_len`; any other malformed record is an error.
pub fn scan_records(buf: &[u8]) -> Result<ScanOutcome> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = &buf[pos..];
        if remaining.is_empty() {
            return Ok(ScanOutcome {
                entries,
                finished: false,
                valid_len: pos as u64,
                truncated_tail: false,
            });
        }
        if remaining.len() == 1 && remaining[0] == 0 {
            return Ok(ScanOutcome {
                entries,
                finished: true,
                valid_len: buf.len() as u64,
                truncated_tail: false,
            });
        }

        let header = match read_header(remaining, pos as u64) {
            Ok(header) => header,
            Err(Error::TruncatedRecord { .. }) => {
                return Ok(ScanOutcome {
                    entries,
                    finished: false,
                    valid_len: pos as u64,
                    truncated_tail: true,
                })
            }
            Err(e) => return Err(e),
        };

        let len = header.record_len(pos as u64)?;
        if (remaining.len() as u64) < len {
            return Ok(ScanOutcome {
                entries,
                finished: false,
                valid_len: pos as u64,
                truncated_tail: true,
            });
        }

        entries.push(IndexEntry {
            pos: pos as u64,
            len,
            rate: header.rate,
            time: header.time,
            frame_type: header.frame_type,
            width: header.width,
            height: header.height,
            add_seq_num: header.add_seq_num,
        });
        pos += len as usize;
    }
}

/// One index line, newline included
pub fn index_line(entry: &IndexEntry) -> Result<String> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    Ok(line)
}

/// Parsed `.index` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIndex {
    pub entries: Vec<IndexEntry>,
    pub finished: bool,
}

/// Parse the text of an `.index` file.
///
/// A `"finished"` line anywhere but last is corruption.
pub fn parse_index(text: &str) -> Result<ParsedIndex> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut entries = Vec::with_capacity(lines.len());
    let mut finished = false;

    for (i, line) in lines.iter().enumerate() {
        if line.trim() == FINISHED_LINE {
            if i != lines.len() - 1 {
                return Err(Error::InvalidIndex(format!(
                    "finished marker on line {} of {}",
                    i + 1,
                    lines.len()
                )));
            }
            finished = true;
            continue;
        }
        entries.push(serde_json::from_str::<IndexEntry>(line)?);
    }

    Ok(ParsedIndex { entries, finished })
}

/// Render a complete `.index` file
pub fn render_index(entries: &[IndexEntry], finished: bool) -> Result<String> {
    let mut text = String::with_capacity(entries.len() * 128);
    for entry in entries {
        text.push_str(&index_line(entry)?);
    }
    if finished {
        text.push_str(FINISHED_LINE);
        text.push('\n');
    }
    Ok(text)
}

/// Serialize a chunk for export to another tier.
pub fn encode_chunk_blob(entries: &[IndexEntry], log: &[u8]) -> Result<Bytes> {
    let index = serde_json::to_vec(entries)?;
    let mut buf = BytesMut::with_capacity(4 + index.len() + log.len());
    buf.put_u32(index.len() as u32);
    buf.put_slice(&index);
    buf.put_slice(log);
    Ok(buf.freeze())
}

/// Split an exported chunk blob back into its index and raw log bytes.
pub fn decode_chunk_blob(blob: &Bytes) -> Result<(Vec<IndexEntry>, Bytes)> {
    if blob.len() < 4 {
        return Err(Error::InvalidIndex(format!(
            "chunk blob is only {} bytes",
            blob.len()
        )));
    }
    let index_len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    if blob.len() < 4 + index_len {
        return Err(Error::InvalidIndex(format!(
            "chunk blob declares a {} byte index but has {} bytes",
            index_len,
            blob.len() - 4
        )));
    }
    let entries: Vec<IndexEntry> = serde_json::from_slice(&blob[4..4 + index_len])?;
    let log = blob.slice(4 + index_len..);
    Ok((entries, log))
}
