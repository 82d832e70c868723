//! Length-prefixed message framing.
//!
//! Each on-wire message is a 4-byte big-endian unsigned length N followed by
//! exactly N bytes of UTF-8 payload. A zero-length message is valid and
//! carries an empty payload.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::{Buf, BytesMut};
use std::io::{self, Write};
use std::thread;

pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Eq, PartialEq)]
pub enum FrameError {
    /// Payload bytes are not valid UTF-8. Protocol violation, the connection
    /// must be dropped.
    Encoding,
}

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame
        .write_u32::<BigEndian>(payload.len() as u32)
        .expect("writing to a vec cannot fail");
    frame.extend_from_slice(payload.as_bytes());
    frame
}

/// Write one frame to the stream, retrying short and would-block sends until
/// every byte has left the socket or the socket errors.
pub fn write_frame<W: Write>(stream: &mut W, payload: &str) -> io::Result<()> {
    let frame = encode_frame(payload);
    let mut written = 0;

    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Reassembles length-prefixed frames out of arbitrarily chunked reads.
///
/// Bytes are appended as they arrive off the socket; partial headers and
/// partial payloads are retained across readiness events until the rest of
/// the frame shows up.
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    #[inline]
    pub fn new() -> FrameDecoder {
        FrameDecoder { buf: BytesMut::new() }
    }

    /// Append freshly read bytes to the accumulator.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    #[inline]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Detach the next complete message. `Ok(None)` means the accumulator
    /// holds only a partial header or payload.
    pub fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let advertised = BigEndian::read_u32(&self.buf[..HEADER_SIZE]) as usize;

        if self.buf.len() < HEADER_SIZE + advertised {
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(advertised);

        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| FrameError::Encoding)
    }
}

impl Default for FrameDecoder {
    fn default() -> FrameDecoder {
        FrameDecoder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Accepts at most `chunk` bytes per write and reports `WouldBlock` on
    /// every other call, like a socket with a nearly full kernel buffer.
    struct ChokedWriter {
        data: Vec<u8>,
        chunk: usize,
        choked: bool,
    }

    impl ChokedWriter {
        fn new(chunk: usize) -> ChokedWriter {
            ChokedWriter { data: Vec::new(), chunk, choked: false }
        }
    }

    impl Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.choked = !self.choked;
            if self.choked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(self.chunk, buf.len());
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_roundtrip_single_frame() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(&encode_frame("你好, world"));

        assert_eq!(decode_all(&mut decoder), vec!["你好, world".to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_zero_length_frame() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(&encode_frame(""));

        assert_eq!(decode_all(&mut decoder), vec![String::new()]);
    }

    #[test]
    fn test_multiple_frames_in_one_extend() {
        let mut bytes = encode_frame("first");
        bytes.extend_from_slice(&encode_frame(""));
        bytes.extend_from_slice(&encode_frame("third"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(decode_all(&mut decoder), vec!["first", "", "third"]);
    }

    #[test]
    fn test_partial_header_retained() {
        let frame = encode_frame("late");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..2]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&frame[2..]);
        assert_eq!(decoder.next_frame().unwrap(), Some("late".to_string()));
    }

    #[test]
    fn test_partial_payload_retained() {
        let frame = encode_frame("split payload");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..HEADER_SIZE + 3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.pending(), HEADER_SIZE + 3);

        decoder.extend(&frame[HEADER_SIZE + 3..]);
        assert_eq!(decoder.next_frame().unwrap(), Some("split payload".to_string()));
    }

    #[test]
    fn test_chunked_stream_matches_contiguous_decode() {
        let messages = ["alpha", "", "броски", "a much longer message body"];
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&encode_frame(message));
        }

        for chunk_size in [1, 2, 3, 5, 7, stream.len()] {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.extend(chunk);
                decoded.extend(decode_all(&mut decoder));
            }
            assert_eq!(decoded, messages, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_invalid_utf8_is_fatal() {
        let bytes = vec![0, 0, 0, 2, 0xff, 0xfe];
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(decoder.next_frame(), Err(FrameError::Encoding));
    }

    #[test]
    fn test_write_frame_retries_until_complete() {
        let mut writer = ChokedWriter::new(3);

        write_frame(&mut writer, "stubborn").unwrap();

        assert_eq!(writer.data, encode_frame("stubborn"));
    }

    #[test]
    fn test_write_frame_surfaces_hard_errors() {
        struct BrokenWriter;
        impl Write for BrokenWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let err = write_frame(&mut BrokenWriter, "doomed").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_write_frame_zero_write_is_an_error() {
        struct ZeroWriter;
        impl Write for ZeroWriter {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let err = write_frame(&mut ZeroWriter, "x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
