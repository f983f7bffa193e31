/// Multi-key command splitting and response coalescing
///
/// A multi-key command is dispatched as N ordinary pipeline requests that
/// share one client-visible sequence number. The aggregator collects the
/// sub-replies and produces exactly one coalesced reply when the last one
/// arrives. A single failing sub-request fails the whole command; the first
/// failure in sub-request order wins.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::PorteroError;
use crate::resp::{Command, RespData};

/// Per-session storage for SCAN cursors
///
/// Keyed by `scan:cursor:<client cursor>`; the value maps each primary's
/// fan-out index to the cursor that primary should resume from.
pub type ScanCursorMap = Arc<Mutex<HashMap<String, HashMap<usize, String>>>>;

pub fn scan_cursor_key(cursor: &str) -> String {
    format!("scan:cursor:{}", cursor)
}

/// Key count of a splittable multi-key command (`MGET`/`MSET`/`DEL`)
pub fn multi_key_count(cmd: &Command) -> Option<usize> {
    match cmd.name() {
        "MGET" | "DEL" => Some(cmd.args.len().saturating_sub(1)),
        "MSET" => Some(cmd.args.len().saturating_sub(1) / 2),
        _ => None,
    }
}

/// The i-th single-key sub-command of a split `MGET`/`MSET`/`DEL`
pub fn sub_command(cmd: &Command, index: usize) -> Option<Command> {
    match cmd.name() {
        "MGET" => Some(Command::from_slice(&["GET", cmd.arg(1 + index)])),
        "MSET" => Some(Command::from_slice(&[
            "SET",
            cmd.arg(1 + 2 * index),
            cmd.arg(2 + 2 * index),
        ])),
        "DEL" => Some(Command::from_slice(&["DEL", cmd.arg(1 + index)])),
        _ => None,
    }
}

/// The per-primary sub-command of a fan-out command
///
/// `SCAN` substitutes each primary's saved cursor; everything else is sent
/// unchanged to every primary.
pub fn read_all_sub_command(
    cmd: &Command,
    sub_seq: usize,
    cursors: &HashMap<usize, String>,
) -> Command {
    if cmd.name() != "SCAN" {
        return cmd.clone();
    }
    let mut sub = cmd.clone();
    if sub.args.len() < 2 {
        sub.args.push(String::new());
    }
    sub.args[1] = cursors
        .get(&sub_seq)
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    sub
}

/// Aggregator for one in-flight multi-key command
#[derive(Debug)]
pub struct MultiCmd {
    cmd: Command,
    pending: usize,
    sub_results: Vec<Option<Result<Bytes, PorteroError>>>,
}

impl MultiCmd {
    pub fn new(cmd: Command, num_sub: usize) -> Self {
        Self {
            cmd,
            pending: num_sub,
            sub_results: (0..num_sub).map(|_| None).collect(),
        }
    }

    /// Record one sub-reply; returns true when all have arrived
    pub fn on_sub_finished(&mut self, sub_seq: usize, result: Result<Bytes, PorteroError>) -> bool {
        if let Some(slot) = self.sub_results.get_mut(sub_seq) {
            *slot = Some(result);
        }
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    /// Take the collected sub-replies out for coalescing
    pub fn take(&mut self) -> (Command, Vec<Option<Result<Bytes, PorteroError>>>) {
        (self.cmd.clone(), std::mem::take(&mut self.sub_results))
    }
}

/// Build the single client-visible reply from the collected sub-replies
pub async fn coalesce(
    cmd: &Command,
    results: Vec<Option<Result<Bytes, PorteroError>>>,
    scan_cursors: &ScanCursorMap,
) -> Bytes {
    let mut parsed = Vec::with_capacity(results.len());
    for result in results {
        let raw = match result {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => return RespData::error(e.resp_message()).to_bytes(),
            None => return RespData::error("ERR missing sub response").to_bytes(),
        };
        let data = match RespData::parse(&raw).await {
            Ok(data) => data,
            Err(e) => return RespData::error(e.resp_message()).to_bytes(),
        };
        if data.is_error() {
            return data.to_bytes();
        }
        parsed.push(data);
    }

    match cmd.name() {
        "MGET" => RespData::Array(Some(parsed)).to_bytes(),
        "MSET" => RespData::ok().to_bytes(),
        "DEL" => {
            let sum = parsed
                .iter()
                .map(|data| match data {
                    RespData::Integer(n) => *n,
                    _ => 0,
                })
                .sum();
            RespData::Integer(sum).to_bytes()
        }
        "SCAN" => coalesce_scan(&parsed, scan_cursors),
        "SLOWLOG" => coalesce_slowlog(cmd, parsed),
        // KEYS and any other fan-out whose sub-replies are arrays
        _ => coalesce_arrays(parsed),
    }
}

fn coalesce_arrays(parsed: Vec<RespData>) -> Bytes {
    if parsed.iter().all(|d| matches!(d, RespData::Array(_))) {
        let mut merged = Vec::new();
        for data in parsed {
            if let RespData::Array(Some(elements)) = data {
                merged.extend(elements);
            }
        }
        RespData::Array(Some(merged)).to_bytes()
    } else {
        // not an array shape we know how to merge; the first primary's
        // reply stands for the lot
        match parsed.into_iter().next() {
            Some(first) => first.to_bytes(),
            None => RespData::error("ERR empty fan-out response").to_bytes(),
        }
    }
}

/// `[next_cursor, keys...]` where `next_cursor` comes from the first
/// primary and the keys are concatenated across all of them
///
/// Each primary's own next cursor is saved so the client's following
/// `SCAN <next_cursor>` resumes every primary from its own position. A
/// cursor of `0` means that primary is exhausted.
fn coalesce_scan(parsed: &[RespData], scan_cursors: &ScanCursorMap) -> Bytes {
    let mut next_cursor: Option<String> = None;
    let mut keys = Vec::new();
    let mut cursors = HashMap::new();

    for (sub_seq, data) in parsed.iter().enumerate() {
        let RespData::Array(Some(fields)) = data else {
            return RespData::error("ERR malformed SCAN response").to_bytes();
        };
        let Some(cursor) = fields.first().and_then(RespData::bulk_str) else {
            return RespData::error("ERR malformed SCAN response").to_bytes();
        };
        if next_cursor.is_none() {
            next_cursor = Some(cursor.to_string());
        }
        cursors.insert(sub_seq, cursor.to_string());
        if let Some(RespData::Array(Some(elements))) = fields.get(1) {
            keys.extend(elements.iter().cloned());
        }
    }

    let next_cursor = next_cursor.unwrap_or_else(|| "0".to_string());
    scan_cursors
        .lock()
        .unwrap()
        .insert(scan_cursor_key(&next_cursor), cursors);

    RespData::Array(Some(vec![
        RespData::BulkString(Some(Bytes::from(next_cursor.into_bytes()))),
        RespData::Array(Some(keys)),
    ]))
    .to_bytes()
}

fn coalesce_slowlog(cmd: &Command, parsed: Vec<RespData>) -> Bytes {
    match cmd.arg(1).to_ascii_uppercase().as_str() {
        "GET" => {
            let mut merged = Vec::new();
            for data in parsed {
                if let RespData::Array(Some(elements)) = data {
                    merged.extend(elements);
                }
            }
            // entries are truncated after concatenation, so they are not
            // necessarily the globally newest <count>
            let count = cmd.int_arg(2);
            if count > 0 && merged.len() > count as usize {
                merged.truncate(count as usize);
            }
            RespData::Array(Some(merged)).to_bytes()
        }
        "LEN" => {
            let sum = parsed
                .iter()
                .map(|data| match data {
                    RespData::Integer(n) => *n,
                    _ => 0,
                })
                .sum();
            RespData::Integer(sum).to_bytes()
        }
        "RESET" => RespData::ok().to_bytes(),
        _ => match parsed.into_iter().next() {
            Some(first) => first.to_bytes(),
            None => RespData::error("ERR empty fan-out response").to_bytes(),
        },
    }
}
