//! Line codec for the engine-side byte stream.
//!
//! Frames are CRLF-terminated ASCII lines. A bare LF is accepted on input so that
//! hand-typed input and LF-only firmware builds decode the same way. Works over
//! any AsyncRead/AsyncWrite, and on plain `BytesMut` buffers.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::TERMINATOR;

/// Longest line accepted before the decoder gives up on the stream.
///
/// RAMSES frames top out well under this; anything longer is line noise.
pub const MAX_LINE_LENGTH: usize = 512;

/// Splits a byte stream into frames and terminates outgoing frames with CRLF.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Bytes already scanned for a newline.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn overlong() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line exceeds {MAX_LINE_LENGTH} bytes"),
    )
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                let pending = src.strip_suffix(b"\r").map_or(src.len(), <[u8]>::len);
                if pending > MAX_LINE_LENGTH {
                    return Err(overlong());
                }
                return Ok(None);
            };

            let line_end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(line_end + 1);
            let line = &line[..line_end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > MAX_LINE_LENGTH {
                return Err(overlong());
            }

            if line.is_empty() {
                continue;
            }

            let frame = std::str::from_utf8(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            tracing::trace!(frame_len = frame.len(), "Decoded frame");
            return Ok(Some(frame.to_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // Unterminated trailing line, e.g. the last line of piped input.
        self.next_index = 0;
        let rest = src.split();
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
        if rest.is_empty() {
            return Ok(None);
        }
        let frame =
            std::str::from_utf8(rest).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(frame.to_owned()))
    }
}

impl<T: AsRef<str>> Encoder<T> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.as_ref().trim_end_matches(['\r', '\n']);
        dst.reserve(frame.len() + TERMINATOR.len());
        dst.put_slice(frame.as_bytes());
        dst.put_slice(TERMINATOR.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_crlf_and_lf_lines() {
        let frames = decode_all(b"RQ --- 18:123456 01:000000 --:------ 0005 002 0000\r\n!V\n");
        assert_eq!(
            frames,
            vec![
                "RQ --- 18:123456 01:000000 --:------ 0005 002 0000".to_string(),
                "!V".to_string()
            ]
        );
    }

    #[test]
    fn skips_empty_lines() {
        assert_eq!(decode_all(b"\r\n\r\n# evofw3 0.7.1\r\n"), vec!["# evofw3 0.7.1"]);
    }

    #[test]
    fn waits_for_terminator_across_chunks() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b" I --- 01:145038 --:------ "[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"01:145038 1F09 003 FF04B5\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some(" I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_flushes_unterminated_line() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"!V"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("!V"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_overlong_line() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[b'0'; MAX_LINE_LENGTH + 1][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_overlong_terminated_line_and_recovers() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[b'0'; 2000][..]);
        buf.extend_from_slice(b"\r\n!V\r\n");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("!V"));
    }

    #[test]
    fn accepts_line_at_limit() {
        let line = "0".repeat(MAX_LINE_LENGTH);
        assert_eq!(decode_all(format!("{line}\r\n").as_bytes()), vec![line]);
    }

    #[test]
    fn rejects_non_utf8_line() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xff\xfe\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encoder_terminates_exactly_once() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("!V", &mut buf).unwrap();
        codec.encode("RP --- 01:000000 18:123456 --:------ 0005 002 0000\r\n", &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            b"!V\r\nRP --- 01:000000 18:123456 --:------ 0005 002 0000\r\n"
        );
    }
}
