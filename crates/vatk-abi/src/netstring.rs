//! Netstring framing: `<decimal length>:<payload>,`.

use crate::{AbiError, MAX_FRAME_LEN};

/// Frame `payload` as a netstring.
pub fn encode_netstring(payload: &[u8]) -> Vec<u8> {
    let prefix = format!("{}:", payload.len());
    let mut out = Vec::with_capacity(prefix.len() + payload.len() + 1);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Incremental decoder: feed it whatever bytes arrived, pull out complete frames.
/// Frames split across reads are reassembled.
#[derive(Debug)]
pub struct NetstringDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl Default for NetstringDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetstringDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, AbiError> {
        let Some(colon) = self.buf.iter().position(|b| *b == b':') else {
            // a length prefix longer than any allowed length is garbage
            if self.buf.len() > 20 {
                return Err(AbiError::Netstring("length prefix too long".into()));
            }
            if let Some(bad) = self.buf.iter().find(|b| !b.is_ascii_digit()) {
                return Err(AbiError::Netstring(format!(
                    "unexpected byte {bad:#04x} in length prefix"
                )));
            }
            return Ok(None);
        };
        let digits = &self.buf[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(AbiError::Netstring("invalid length prefix".into()));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AbiError::Netstring("invalid length prefix".into()))?;
        if len > self.max_len {
            return Err(AbiError::FrameTooLarge {
                len,
                limit: self.max_len,
            });
        }
        let start = colon + 1;
        let end = start + len;
        if self.buf.len() < end + 1 {
            return Ok(None);
        }
        if self.buf[end] != b',' {
            return Err(AbiError::Netstring("missing trailing comma".into()));
        }
        let frame = self.buf[start..end].to_vec();
        self.buf.drain(..=end);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_prefix() {
        assert_eq!(encode_netstring(b"hello"), b"5:hello,");
        assert_eq!(encode_netstring(b""), b"0:,");
    }

    #[test]
    fn reassembles_partial_reads() {
        let mut wire = encode_netstring(b"[\"deliver\"]");
        wire.extend(encode_netstring(b"second"));
        let mut decoder = NetstringDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.push(chunk);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![b"[\"deliver\"]".to_vec(), b"second".to_vec()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn rejects_bad_framing() {
        let mut decoder = NetstringDecoder::new();
        decoder.push(b"3:abc;");
        assert!(decoder.next_frame().is_err());

        let mut decoder = NetstringDecoder::new();
        decoder.push(b"x3:abc,");
        assert!(decoder.next_frame().is_err());

        let mut decoder = NetstringDecoder::with_max_len(2);
        decoder.push(b"3:");
        assert!(matches!(
            decoder.next_frame(),
            Err(AbiError::FrameTooLarge { len: 3, limit: 2 })
        ));
    }
}
