//! gRPC message framing: the 5-byte `{compressed: u8, length: u32 BE}`
//! prefix that precedes every message on the wire for the binary families
//! (`grpc`, `grpc-web`, `grpc-web-text` after base64 decoding).
//!
//! The façade buffers whole request bodies rather than streaming frame-by-
//! frame off the HTTP/2 connection (see `combined.rs`), so framing here is
//! just byte-slice bookkeeping, not an async decoder.

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(0); // uncompressed
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a buffered body into its constituent message payloads. Stops (and
/// drops any trailing partial frame) rather than erroring, since a short
/// final frame indicates a truncated request the caller will reject anyway
/// when decoding its messages.
pub fn decode_frames(body: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + 5 <= body.len() {
        let len = u32::from_be_bytes([body[offset + 1], body[offset + 2], body[offset + 3], body[offset + 4]]) as usize;
        let start = offset + 5;
        let end = start + len;
        if end > body.len() {
            break;
        }
        frames.push(body[start..end].to_vec());
        offset = end;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let framed = encode_frame(b"hello");
        let frames = decode_frames(&framed);
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn decodes_multiple_concatenated_frames() {
        let mut body = encode_frame(b"a");
        body.extend(encode_frame(b"bb"));
        let frames = decode_frames(&body);
        assert_eq!(frames, vec![b"a".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn drops_a_truncated_trailing_frame() {
        let mut body = encode_frame(b"a");
        body.push(0);
        body.extend_from_slice(&10u32.to_be_bytes());
        body.extend_from_slice(b"short");
        let frames = decode_frames(&body);
        assert_eq!(frames, vec![b"a".to_vec()]);
    }
}
