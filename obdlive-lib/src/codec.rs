//! Pure response-text cleanup and payload extraction for ELM327 replies.

use crate::pid::Pid;

/// Adapter replies that carry no measurement. "NO DATA" is the normal case
/// for a parameter the vehicle does not report; the rest are ELM327 bus
/// error strings. All of them yield a null value, never an error.
const NO_DATA_MARKERS: [&str; 5] = [
    "NO DATA",
    "CAN ERROR",
    "BUS ERROR",
    "UNABLE TO CONNECT",
    "STOPPED",
];

/// Strip prompt, line endings, spaces and the transient "SEARCHING..."
/// banner, and uppercase what remains.
pub fn clean(raw: &str) -> String {
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '>' | ' ' | '\t'))
        .collect();
    compact.to_uppercase().replace("SEARCHING...", "")
}

/// Whether the reply is a no-data or bus-error marker rather than hex data.
pub fn is_no_data(raw: &str) -> bool {
    let upper = raw.to_uppercase();
    upper.contains('?') || NO_DATA_MARKERS.iter().any(|m| upper.contains(m))
}

/// Extract the payload bytes following the "41" + code prefix.
///
/// Returns an empty list when the prefix is absent or the reply is a
/// no-data marker; the caller treats that as "no value", not a failure.
pub fn payload_bytes(raw: &str, pid: Pid) -> Vec<u8> {
    if is_no_data(raw) {
        return Vec::new();
    }
    let cleaned = clean(raw);
    let prefix = pid.response_prefix();
    let Some(pos) = cleaned.find(&prefix) else {
        return Vec::new();
    };
    let digits: String = cleaned[pos + prefix.len()..]
        .chars()
        .take_while(char::is_ascii_hexdigit)
        .collect();
    // Parse pairwise; a trailing odd digit is dropped.
    let usable = digits.len() - digits.len() % 2;
    hex::decode(&digits[..usable]).unwrap_or_default()
}

/// Decode one reply into a physical value, or `None` for no-data,
/// malformed, or short responses.
pub fn decode(raw: &str, pid: Pid) -> Option<f64> {
    let def = pid.definition();
    let bytes = payload_bytes(raw, pid);
    if bytes.len() < def.expected_bytes {
        return None;
    }
    Some((def.decode)(&bytes[..def.expected_bytes]))
}
