//! Splits a contract blob into deployment code, runtime code and the trailing data that
//! follows the runtime (data sections and the compiler's CBOR metadata).
//!
//! The patcher only rewrites the first two; the trailer is copied through byte for byte.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// `CODECOPY PUSH1 0x00 RETURN` followed by `STOP` or `INVALID`, the tail of every solc
/// constructor.
const DEPLOYMENT_MARKERS: [[u8; 5]; 2] = [
    [0x39, 0x60, 0x00, 0xf3, 0x00],
    [0x39, 0x60, 0x00, 0xf3, 0xfe],
];

/// Legacy swarm metadata prefix `a1 65 "bzzr0" 58 20`.
const BZZR0_MARKER: &[u8] = &[0xa1, 0x65, 0x62, 0x7a, 0x7a, 0x72, 0x30, 0x58, 0x20];

const LIBRARY_ADDRESS: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

/// The three parts of a contract blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeSections {
    /// Constructor code, up to and including its final `RETURN` marker.
    pub deployment: Option<Vec<u8>>,
    /// Runtime code, up to and including the `INVALID` that separates it from data.
    pub runtime: Vec<u8>,
    /// Everything after the runtime, kept unchanged.
    pub trailer: Vec<u8>,
}

/// Replaces unlinked library placeholders (`__$…$__`) with a fixed dummy address so that the
/// hex decodes.
pub fn replace_library_placeholders(hex: &str) -> Cow<'_, str> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    match PLACEHOLDER.get_or_init(|| Regex::new(r"__\$.+?\$__").ok()) {
        Some(re) => re.replace_all(hex, LIBRARY_ADDRESS),
        None => Cow::Borrowed(hex),
    }
}

/// Returns the length of the deployment code, i.e. the offset just past the first
/// constructor return marker.
pub fn deployment_end(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(5)
        .position(|window| DEPLOYMENT_MARKERS.iter().any(|marker| window == marker))
        .map(|pos| pos + 5)
}

/// Returns `true` if the blob starts with constructor code.
pub fn contains_deployment_code(bytes: &[u8]) -> bool {
    deployment_end(bytes).is_some()
}

/// Locates the compiler metadata at the end of `bytes`.
///
/// The canonical CBOR encoding ends with its own big-endian length; the legacy `bzzr0`
/// encoding is recognised by its prefix within the last 64 bytes.
pub fn metadata_offset(bytes: &[u8]) -> Option<usize> {
    let len = bytes.len();
    if len < 2 {
        return None;
    }

    let len_raw = u16::from_be_bytes([bytes[len - 2], bytes[len - 1]]) as usize;
    if len_raw > 0 && len_raw + 2 <= len {
        let off = len - len_raw - 2;
        if matches!(bytes[off], 0xa1..=0xa3) && matches!(bytes.get(off + 1), Some(0x64 | 0x65)) {
            tracing::debug!("Metadata detected (cbor): offset={}, len={}", off, len_raw + 2);
            return Some(off);
        }
    }

    let tail_start = len.saturating_sub(64 + BZZR0_MARKER.len());
    let off = bytes[tail_start..]
        .windows(BZZR0_MARKER.len())
        .rposition(|window| window == BZZR0_MARKER)
        .map(|pos| tail_start + pos);
    if let Some(off) = off {
        tracing::debug!("Metadata detected (bzzr0): offset={}", off);
    }
    off
}

/// Returns the length of the runtime code inside `bytes`.
///
/// The runtime ends at the first `INVALID` byte that is neither preceded by `JUMPI` nor
/// followed by `JUMPDEST`; such an `INVALID` separates solc's code from its data. Push data is
/// skipped so immediates are never mistaken for opcodes.
pub fn runtime_end(bytes: &[u8]) -> usize {
    let mut i = 0;
    let mut previous = 0u8;
    while i < bytes.len() {
        let opcode = bytes[i];
        if opcode == 0xfe && previous != 0x57 && bytes.get(i + 1).is_some_and(|&next| next != 0x5b)
        {
            return i + 1;
        }
        if (0x60..=0x7f).contains(&opcode) {
            i += (opcode - 0x5f) as usize;
        }
        previous = opcode;
        i += 1;
    }
    bytes.len()
}

/// Splits a contract blob into deployment, runtime and trailer.
pub fn split_sections(bytes: &[u8]) -> BytecodeSections {
    let (deployment, rest) = match deployment_end(bytes) {
        Some(end) if end < bytes.len() => (Some(bytes[..end].to_vec()), &bytes[end..]),
        _ => (None, bytes),
    };

    let code_len = metadata_offset(rest).unwrap_or(rest.len());
    let runtime_len = runtime_end(&rest[..code_len]).min(rest.len());

    tracing::debug!(
        "Sections: deployment={} runtime={} trailer={}",
        deployment.as_ref().map_or(0, Vec::len),
        runtime_len,
        rest.len() - runtime_len
    );

    BytecodeSections {
        deployment,
        runtime: rest[..runtime_len].to_vec(),
        trailer: rest[runtime_len..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_placeholders_are_replaced() {
        let hex = "73__$0123456789abcdef0123456789abcdef01$__3b";
        assert_eq!(
            replace_library_placeholders(hex),
            format!("73{LIBRARY_ADDRESS}3b")
        );
    }

    #[test]
    fn split_constructor_runtime_and_metadata() {
        // PUSH1 0x05 DUP1 PUSH1 0x0c PUSH1 0x00 CODECOPY PUSH1 0x00 RETURN STOP
        let mut blob = hex::decode("600580600c6000396000f300").unwrap();
        let runtime = hex::decode("6001600055fe").unwrap();
        let metadata = hex::decode("a264697066735822aabb000a").unwrap();
        blob.extend_from_slice(&runtime);
        blob.extend_from_slice(&[0xde, 0xad]);
        blob.extend_from_slice(&metadata);

        let sections = split_sections(&blob);
        assert_eq!(sections.deployment.as_deref().map(<[u8]>::len), Some(12));
        assert_eq!(sections.runtime, runtime);
        assert_eq!(sections.trailer[..2], [0xde, 0xad]);
        assert!(sections.trailer.ends_with(&metadata));
    }

    #[test]
    fn guarded_invalid_does_not_end_runtime() {
        // PUSH1 0x05 JUMPI INVALID JUMPDEST STOP INVALID 00
        let code = hex::decode("600557fe5b00fe00").unwrap();
        assert_eq!(runtime_end(&code), 7);
    }

    #[test]
    fn runtime_only_input_has_no_deployment() {
        let code = hex::decode("6001600101").unwrap();
        let sections = split_sections(&code);
        assert!(sections.deployment.is_none());
        assert_eq!(sections.runtime, code);
        assert!(sections.trailer.is_empty());
    }
}
