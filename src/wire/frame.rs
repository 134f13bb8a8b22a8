//! Wire framing: magic-header handshake, length-prefixed frames, receipts.

use std::io::{Read, Write};

use thiserror::Error;

/// 4-byte magic prefix exchanged both ways before any frame.
pub const MAGIC: [u8; 4] = *b"RMG1";

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic header: expected {MAGIC:?} got {got:?}")]
    BadMagic { got: [u8; 4] },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("unknown receipt byte: {got}")]
    UnknownReceipt { got: u8 },
}

/// Single-byte response codes, transmitted raw on a dedicated receipt read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receipt {
    Ok,
    DuplicateId,
    AuthFailed,
    VersionCheckFailed,
    Reconnect,
}

impl Receipt {
    pub fn as_byte(self) -> u8 {
        match self {
            Receipt::Ok => 1,
            Receipt::DuplicateId => 2,
            Receipt::AuthFailed => 3,
            Receipt::VersionCheckFailed => 4,
            Receipt::Reconnect => 5,
        }
    }

    pub fn from_byte(raw: u8) -> Result<Self, FrameError> {
        match raw {
            1 => Ok(Receipt::Ok),
            2 => Ok(Receipt::DuplicateId),
            3 => Ok(Receipt::AuthFailed),
            4 => Ok(Receipt::VersionCheckFailed),
            5 => Ok(Receipt::Reconnect),
            got => Err(FrameError::UnknownReceipt { got }),
        }
    }
}

pub fn write_magic<W: Write>(writer: &mut W) -> Result<(), FrameError> {
    writer.write_all(&MAGIC)?;
    writer.flush()?;
    Ok(())
}

pub fn read_magic<R: Read>(reader: &mut R) -> Result<(), FrameError> {
    let mut got = [0u8; 4];
    reader.read_exact(&mut got)?;
    if got != MAGIC {
        return Err(FrameError::BadMagic { got });
    }
    Ok(())
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

    /// Reads one frame body; `Ok(None)` on clean EOF before any header byte.
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

        let length = u32::from_be_bytes(header) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            read_body += n;
        }

        Ok(Some(body))
    }
}

/// Frames one payload for a guarded single write: the caller owns the
/// socket write so the timeout wheel can cover header and body together.
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let payload = b"topology";
        let frame = encode_frame(payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let decoded = reader.read_next().unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn reader_rejects_oversize_frame() {
        let payload = vec![0u8; 64];
        let frame = encode_frame(&payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 16);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn reader_reports_clean_eof_as_none() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 1024);
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0]), 1024);
        assert!(reader.read_next().is_err());
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let mut cursor = Cursor::new(b"XXXX".to_vec());
        let err = read_magic(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic { .. }));
    }

    #[test]
    fn receipt_bytes_round_trip() {
        for receipt in [
            Receipt::Ok,
            Receipt::DuplicateId,
            Receipt::AuthFailed,
            Receipt::VersionCheckFailed,
            Receipt::Reconnect,
        ] {
            assert_eq!(Receipt::from_byte(receipt.as_byte()).unwrap(), receipt);
        }
        assert!(Receipt::from_byte(0).is_err());
        assert!(Receipt::from_byte(200).is_err());
    }
}
