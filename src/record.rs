//! The per-rank binary record stream decoder (spec.md §4.1).
//!
//! Each record is a fixed-width header followed by space-separated
//! argument byte-strings, framed by a newline. Records may be stored
//! compressed: a back-reference to an earlier record in the same
//! rank's stream plus a bitmask of argument positions to overwrite.

use std::convert::TryInto;

use bitvec::prelude::*;

use crate::error::TraceError;

/// Header byte offsets, per spec.md §4.1's record layout table.
const OFF_STATUS: usize = 0;
const OFF_TSTART: usize = 1;
const OFF_TEND: usize = 5;
const OFF_RESULT: usize = 9;
const OFF_FUNC: usize = 13;
const OFF_ARGS: usize = 14;

/// A newline inside this many bytes of the record start is assumed to
/// be part of an argument, not the frame terminator (spec.md §4.1,
/// §6).
const MIN_FRAME_LEN: usize = 10;

/// A fully decoded trace record: absolute timestamps in ticks, a
/// resolved function id, and raw argument byte-strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub func_id: u8,
    pub tstart: i64,
    pub tend: i64,
    pub result: i32,
    pub args: Vec<Vec<u8>>,
}

impl Record {
    pub fn arg_str(&self, idx: usize) -> Option<std::borrow::Cow<'_, str>> {
        self.args.get(idx).map(|a| String::from_utf8_lossy(a))
    }
}

/// Splits `content` into frames on the first newline found at or past
/// `MIN_FRAME_LEN` bytes into the current frame.
struct FrameIter<'a> {
    content: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.content.len() {
            return None;
        }
        let search_from = self.pos + MIN_FRAME_LEN;
        if search_from > self.content.len() {
            return None;
        }
        let rel = self.content[search_from..].iter().position(|&b| b == b'\n')?;
        let end = search_from + rel;
        let frame = &self.content[self.pos..end];
        self.pos = end + 1;
        Some(frame)
    }
}

fn frames(content: &[u8]) -> FrameIter<'_> {
    FrameIter { content, pos: 0 }
}

/// A record as it appears on the wire, before delta decode or
/// decompression.
struct RawRecord<'a> {
    status: i8,
    delta_tstart: i32,
    delta_tend: i32,
    result: i32,
    func_or_ref: u8,
    args: Vec<&'a [u8]>,
}

fn parse_raw(frame: &[u8]) -> Option<RawRecord<'_>> {
    if frame.len() < OFF_ARGS {
        return None;
    }
    let status = frame[OFF_STATUS] as i8;
    let delta_tstart = i32::from_le_bytes(frame[OFF_TSTART..OFF_TSTART + 4].try_into().ok()?);
    let delta_tend = i32::from_le_bytes(frame[OFF_TEND..OFF_TEND + 4].try_into().ok()?);
    let result = i32::from_le_bytes(frame[OFF_RESULT..OFF_RESULT + 4].try_into().ok()?);
    let func_or_ref = frame[OFF_FUNC];
    let args = if frame.len() > OFF_ARGS {
        frame[OFF_ARGS..].split(|&b| b == b' ').collect()
    } else {
        Vec::new()
    };

    Some(RawRecord {
        status,
        delta_tstart,
        delta_tend,
        result,
        func_or_ref,
        args,
    })
}

/// Decodes every record in one rank's `<r>.itf` byte stream, aborting
/// the whole rank on the first malformed record.
pub fn decode_rank(rank: u32, content: &[u8]) -> Result<Vec<Record>, TraceError> {
    decode_rank_prefix(rank, content).map_err(|(_, err)| err)
}

/// Like [`decode_rank`], but on a malformed record returns the prefix
/// decoded so far instead of discarding it, for callers that would
/// rather analyze a truncated rank than skip it entirely.
pub fn decode_lenient(rank: u32, content: &[u8]) -> (Vec<Record>, Option<TraceError>) {
    match decode_rank_prefix(rank, content) {
        Ok(records) => (records, None),
        Err((partial, err)) => (partial, Some(err)),
    }
}

fn decode_rank_prefix(rank: u32, content: &[u8]) -> Result<Vec<Record>, (Vec<Record>, TraceError)> {
    let mut decoded: Vec<Record> = Vec::new();
    let mut prev_tstart: i64 = 0;
    let mut prev_tend: i64 = 0;

    for (index, frame) in frames(content).enumerate() {
        let raw = match parse_raw(frame) {
            Some(r) => r,
            None => {
                let err = TraceError::MalformedRecord {
                    rank,
                    index,
                    reason: "frame shorter than record header".to_string(),
                };
                return Err((decoded, err));
            }
        };

        let tstart = prev_tstart + raw.delta_tstart as i64;
        let tend = prev_tend + raw.delta_tend as i64;
        prev_tstart = tstart;
        prev_tend = tend;

        let record = if raw.status == 0 {
            Record {
                func_id: raw.func_or_ref,
                tstart,
                tend,
                result: raw.result,
                args: raw.args.into_iter().map(|a| a.to_vec()).collect(),
            }
        } else {
            match decompress(rank, index, &raw, &decoded) {
                Ok(mut record) => {
                    record.tstart = tstart;
                    record.tend = tend;
                    record.result = raw.result;
                    record
                }
                Err(err) => return Err((decoded, err)),
            }
        };

        decoded.push(record);
    }

    Ok(decoded)
}

fn decompress(
    rank: u32,
    index: usize,
    raw: &RawRecord<'_>,
    prior: &[Record],
) -> Result<Record, TraceError> {
    let distance = raw.func_or_ref as usize;
    if distance + 1 > index {
        return Err(TraceError::MalformedRecord {
            rank,
            index,
            reason: format!("back-reference distance {distance} exceeds current index {index}"),
        });
    }
    let reference = &prior[index - distance - 1];

    let bitmask = (raw.status as u8) & 0b0111_1111;
    let bits = bitmask.view_bits::<Lsb0>();
    let set_count = bits[..7].count_ones();

    if set_count < raw.args.len() {
        return Err(TraceError::MalformedRecord {
            rank,
            index,
            reason: format!(
                "bitmask has {set_count} set bit(s) but {} stored arg(s)",
                raw.args.len()
            ),
        });
    }

    let mut args = reference.args.clone();
    let mut stored = raw.args.iter();
    for (pos, bit) in bits[..7].iter().enumerate() {
        if !*bit {
            continue;
        }
        if pos >= args.len() {
            // Reference doesn't have this many args; nothing to overwrite.
            continue;
        }
        if let Some(value) = stored.next() {
            args[pos] = value.to_vec();
        }
    }

    Ok(Record {
        func_id: reference.func_id,
        tstart: 0,
        tend: 0,
        result: 0,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uncompressed_record(delta_tstart: i32, delta_tend: i32, result: i32, func_id: u8, args: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0u8); // status = 0 (uncompressed)
        out.extend_from_slice(&delta_tstart.to_le_bytes());
        out.extend_from_slice(&delta_tend.to_le_bytes());
        out.extend_from_slice(&result.to_le_bytes());
        out.push(func_id);
        out.extend_from_slice(&args.join(&b' '));
        out.push(b'\n');
        out
    }

    #[test]
    fn decodes_uncompressed_records_with_delta_timestamps() {
        let mut stream = Vec::new();
        stream.extend(uncompressed_record(100, 110, 3, 5, &[b"fileA", b"0"]));
        stream.extend(uncompressed_record(50, 40, -1, 6, &[b"fileA", b"10", b"10"]));

        let records = decode_rank(0, &stream).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tstart, 100);
        assert_eq!(records[0].tend, 110);
        assert_eq!(records[1].tstart, 150);
        assert_eq!(records[1].tend, 150);
        assert_eq!(records[1].args[1], b"10");
    }

    #[test]
    fn newline_inside_argument_does_not_split_frame() {
        // An argument byte-string containing an embedded newline must
        // survive because the frame search starts MIN_FRAME_LEN bytes
        // into the record.
        let mut stream = Vec::new();
        stream.push(0u8);
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.push(1u8);
        stream.extend_from_slice(b"a\nb");
        stream.push(b'\n');

        let records = decode_rank(0, &stream).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].args[0], b"a\nb");
    }

    #[test]
    fn decompresses_record_against_reference() {
        let mut stream = Vec::new();
        stream.extend(uncompressed_record(0, 0, 0, 9, &[b"fileA", b"0", b"16"]));

        // Compressed record: status bit7 set (marker) + bitmask 0b0000010
        // (overwrite position 1 only), back-reference distance 0 (the
        // record directly before this one).
        let status: i8 = (0b1000_0000u8 | 0b0000_0010u8) as i8;
        stream.push(status as u8);
        stream.extend_from_slice(&5i32.to_le_bytes());
        stream.extend_from_slice(&5i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.push(0); // distance = 0 -> previous record
        stream.extend_from_slice(b"32");
        stream.push(b'\n');

        let records = decode_rank(0, &stream).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].func_id, 9);
        assert_eq!(records[1].args[0], b"fileA");
        assert_eq!(records[1].args[1], b"32");
        assert_eq!(records[1].args[2], b"16");
        assert_eq!(records[1].tstart, 5);
    }

    #[test]
    fn rejects_back_reference_past_start_of_stream() {
        let mut stream = Vec::new();
        let status: i8 = 0b1000_0001u8 as i8;
        stream.push(status as u8);
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.push(5); // distance 5, but this is record index 0
        stream.push(b'\n');

        let err = decode_rank(0, &stream).unwrap_err();
        assert!(matches!(err, TraceError::MalformedRecord { .. }));
    }

    #[test]
    fn lenient_decode_returns_prefix_and_error() {
        let mut stream = Vec::new();
        stream.extend(uncompressed_record(0, 0, 0, 1, &[b"fileA"]));
        let status: i8 = 0b1000_0001u8 as i8;
        stream.push(status as u8);
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.push(9); // distance 9, far past the single decoded record
        stream.push(b'\n');

        let (partial, err) = decode_lenient(0, &stream);
        assert_eq!(partial.len(), 1);
        assert!(err.is_some());
    }
}
