/// MOVED/ASK redirection parsing
///
/// Redirections arrive as RESP errors (`-MOVED 3999 127.0.0.1:6381\r\n`).
/// The raw reply bytes are scanned without building a RESP tree, using
/// Aho-Corasick for the keyword and `btoi` for the slot number.
use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;

const BYTE_SPACE: u8 = b' ';
const PATTERNS: &[&str] = &["ASK", "MOVED"];

/// `ASKING` pre-encoded; sent before the retried command on ASK
pub const ASKING_CMD_BYTES: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

lazy_static! {
    static ref FINDER: AhoCorasick =
        AhoCorasick::new(PATTERNS).expect("static redirect patterns must compile");
}

/// A parsed redirection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub slot: u16,
    pub target: String,
    /// ASK targets require an `ASKING` command first
    pub is_ask: bool,
}

/// Scan a raw RESP reply for a `-MOVED` or `-ASK` redirection
pub fn parse_redirect_raw(response: &[u8]) -> Option<Redirection> {
    if response.first() != Some(&b'-') {
        return None;
    }
    parse_redirect_bytes(&response[1..])
}

fn parse_redirect_bytes(data: &[u8]) -> Option<Redirection> {
    let mat = FINDER.find(data)?;
    let end = mat.end();
    if end >= data.len() || data[end] != BYTE_SPACE {
        return None;
    }

    let rest = &data[end + 1..];
    let pos = rest.iter().position(|&b| b == BYTE_SPACE)?;
    let slot = btoi::btoi::<u16>(&rest[..pos]).ok()?;

    let target = String::from_utf8_lossy(&rest[pos + 1..]);
    let target = target.trim_end_matches('\n').trim_end_matches('\r').to_string();
    if target.is_empty() {
        return None;
    }

    Some(Redirection {
        slot,
        target,
        is_ask: mat.pattern().as_u32() == 0,
    })
}
