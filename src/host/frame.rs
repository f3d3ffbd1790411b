//! Wire framing: length + crc32c, 8-byte little-endian header.
//!
//! Each frame is `[len: u32le][crc32c(body): u32le][body]`. The length
//! covers the body only. Frames preserve message boundaries over the
//! stream socket; the body is an encoded message container.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

/// Encode one frame around `payload`.
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "length exceeds u32",
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc32c(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame body. `Ok(None)` is a clean end-of-stream at a
    /// frame boundary; EOF mid-frame is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "length cannot be zero",
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                ))
            } else {
                FrameError::Io(err)
            }
        })?;

        let got = crc32c(&body);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn roundtrip_through_reader() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf, 1024);
            writer.write_frame(b"first").unwrap();
            writer.write_frame(b"second").unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(reader.read_next().unwrap().unwrap(), b"first");
        assert_eq!(reader.read_next().unwrap().unwrap(), b"second");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut frame = encode_frame(b"payload", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn oversize_frames_are_rejected_both_ways() {
        assert!(matches!(
            encode_frame(&[0u8; 10], 5),
            Err(FrameError::TooLarge { .. })
        ));

        let frame = encode_frame(&[0u8; 10], 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame), 5);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let frame = encode_frame(b"xyz", 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(&frame[..4]), 1024);
        assert!(matches!(reader.read_next(), Err(FrameError::Io(_))));
    }
}
