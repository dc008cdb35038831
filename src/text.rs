//! Legacy text trace reader (Cargo feature `text-trace`, spec.md §4.1
//! ambient addition), grounded on
//! `examples/original_source/tools/reader.py::read_traces`. Parses the
//! older whitespace-delimited `timestamp func(args) duration` format
//! into the same [`Record`] shape produced by the binary decoder, so
//! downstream components are agnostic to which reader produced their
//! input.

use crate::error::TraceError;
use crate::meta::FunctionTable;
use crate::record::Record;

/// Builds the function table by first-appearance order across every
/// line, since text traces carry function names directly rather than
/// a numeric id resolved against `recorder.mt`.
pub fn scan_function_names(content: &str) -> FunctionTable {
    let mut names: Vec<String> = Vec::new();
    for line in content.lines() {
        if let Some(func) = line.split_whitespace().nth(1) {
            let func = func.split('(').next().unwrap_or(func);
            if !names.iter().any(|n| n == func) {
                names.push(func.to_string());
            }
        }
    }
    FunctionTable::from_names(names)
}

/// Parses one rank's text trace content against a function table that
/// already contains every function name this rank uses (see
/// [`scan_function_names`], typically run across all ranks first so
/// func ids are stable trace-wide).
pub fn decode_rank_text(rank: u32, content: &str, functions: &FunctionTable) -> Result<Vec<Record>, TraceError> {
    let mut records = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_line(line).ok_or_else(|| TraceError::MalformedRecord {
            rank,
            index,
            reason: "text trace line did not match `timestamp func(args) duration`".to_string(),
        })?;

        let func_id = functions
            .names_iter()
            .position(|n| n == record.func)
            .ok_or_else(|| TraceError::MalformedRecord {
                rank,
                index,
                reason: format!("function {:?} absent from scanned function table", record.func),
            })? as u8;

        let tstart = (record.timestamp * 1e6) as i64;
        let tend = ((record.timestamp + record.duration) * 1e6) as i64;

        records.push(Record {
            func_id,
            tstart,
            tend,
            result: 0,
            args: record.args.into_iter().map(|a| a.into_bytes()).collect(),
        });
    }

    Ok(records)
}

struct TextRecord {
    timestamp: f64,
    duration: f64,
    func: String,
    args: Vec<String>,
}

/// `<timestamp> <func>(<arg1>,<arg2>,…) <duration>`, tolerating spaces
/// inside the parenthesized argument list (it is rejoined before being
/// split on commas, mirroring the original's `"".join(fields[2:-1])`).
fn parse_line(line: &str) -> Option<TextRecord> {
    let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
    if fields.len() < 3 {
        return None;
    }

    let timestamp: f64 = fields[0].parse().ok()?;
    let duration: f64 = fields[fields.len() - 1].parse().ok()?;

    let middle = fields[1..fields.len() - 1].join("");
    let open = middle.find('(')?;
    let close = middle.rfind(')')?;
    if close <= open {
        return None;
    }
    let func = middle[..open].to_string();
    let args_text = &middle[open + 1..close];
    let args = if args_text.is_empty() {
        Vec::new()
    } else {
        args_text.split(',').map(|a| a.to_string()).collect()
    };

    Some(TextRecord { timestamp, duration, func, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_function_names_in_first_appearance_order() {
        let content = "0.0 open(f) 0.1\n0.2 write(f,0,10) 0.05\n0.3 open(g) 0.02\n";
        let functions = scan_function_names(content);
        assert_eq!(functions.get(0), Some("open"));
        assert_eq!(functions.get(1), Some("write"));
        assert_eq!(functions.len(), 2);
    }

    #[test]
    fn decodes_text_records_with_args() {
        let content = "0.0 open(f) 0.1\n0.2 write(f,0,10) 0.05\n";
        let functions = scan_function_names(content);
        let records = decode_rank_text(0, content, &functions).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].args[0], b"f");
        assert_eq!(records[1].args[2], b"10");
    }

    #[test]
    fn rejects_line_without_parens() {
        let content = "0.0 not-a-call 0.1\n";
        let functions = scan_function_names(content);
        assert!(decode_rank_text(0, content, &functions).is_err());
    }
}
