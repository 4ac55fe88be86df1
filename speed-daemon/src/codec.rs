//! Wire framing for the Speed Daemon protocol: type-prefixed,
//! length-delimited, no checksums, everything big-endian.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod msg_type {
    pub const ERROR: u8 = 0x10;
    pub const PLATE: u8 = 0x20;
    pub const TICKET: u8 = 0x21;
    pub const WANT_HEARTBEAT: u8 = 0x40;
    pub const HEARTBEAT: u8 = 0x41;
    pub const I_AM_CAMERA: u8 = 0x80;
    pub const I_AM_DISPATCHER: u8 = 0x81;
}

/// A frame received from a client.
///
/// `plate` is kept as opaque bytes rather than `String`: the wire format
/// is a u8-length-prefixed byte string with no character-set guarantee,
/// and nothing downstream is allowed to reject or reinterpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Plate { plate: Vec<u8>, timestamp: u32 },
    WantHeartbeat { interval: u32 },
    IAmCamera { road: u16, mile: u16, limit: u16 },
    IAmDispatcher { roads: Vec<u16> },
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Error {
        msg: String,
    },
    Ticket {
        plate: Vec<u8>,
        road: u16,
        mile1: u16,
        timestamp1: u32,
        mile2: u16,
        timestamp2: u32,
        speed_x100: u16,
    },
    Heartbeat,
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("unknown message type: {0:#04x}")]
    MalformedType(u8),

    #[error("frame truncated")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads the length-prefixed opaque byte-string format shared by several
/// frames: a one-byte length followed by exactly that many bytes. No
/// character-set validation is performed; the bytes are returned as-is.
async fn read_bytes<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    let len = reader.read_u8().await?;
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(map_truncated)?;
    Ok(buf)
}

async fn read_u16_vec<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
) -> Result<Vec<u16>, DecodeError> {
    let count = reader.read_u8().await?;
    let mut roads = Vec::with_capacity(count as usize);
    for _ in 0..count {
        roads.push(reader.read_u16().await.map_err(map_truncated)?);
    }
    Ok(roads)
}

fn map_truncated(err: std::io::Error) -> DecodeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated
    } else {
        DecodeError::Io(err)
    }
}

impl Frame {
    /// Decodes the next frame off `reader`.
    ///
    /// Returns `Ok(None)` on a clean EOF at a type boundary (the normal
    /// way a connection ends); every other EOF, even one byte into a
    /// frame, is reported as `DecodeError::Truncated`.
    pub async fn decode<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Option<Self>, DecodeError> {
        let ty = match reader.read_u8().await {
            Ok(ty) => ty,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let frame = match ty {
            msg_type::PLATE => Frame::Plate {
                plate: read_bytes(reader).await?,
                timestamp: reader.read_u32().await.map_err(map_truncated)?,
            },
            msg_type::WANT_HEARTBEAT => Frame::WantHeartbeat {
                interval: reader.read_u32().await.map_err(map_truncated)?,
            },
            msg_type::I_AM_CAMERA => Frame::IAmCamera {
                road: reader.read_u16().await.map_err(map_truncated)?,
                mile: reader.read_u16().await.map_err(map_truncated)?,
                limit: reader.read_u16().await.map_err(map_truncated)?,
            },
            msg_type::I_AM_DISPATCHER => Frame::IAmDispatcher {
                roads: read_u16_vec(reader).await?,
            },
            other => return Err(DecodeError::MalformedType(other)),
        };

        Ok(Some(frame))
    }
}

#[async_trait]
pub trait Encode {
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), EncodeError>;
}

#[async_trait]
impl Encode for Message {
    /// Serializes into a single in-memory buffer and issues exactly one
    /// `write_all`, so a frame is never split across non-atomic writes.
    async fn encode<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        let mut buf = Vec::new();
        match self {
            Message::Error { msg } => {
                buf.push(msg_type::ERROR);
                push_bytes(&mut buf, msg.as_bytes());
            }
            Message::Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed_x100,
            } => {
                buf.push(msg_type::TICKET);
                push_bytes(&mut buf, plate);
                buf.extend_from_slice(&road.to_be_bytes());
                buf.extend_from_slice(&mile1.to_be_bytes());
                buf.extend_from_slice(&timestamp1.to_be_bytes());
                buf.extend_from_slice(&mile2.to_be_bytes());
                buf.extend_from_slice(&timestamp2.to_be_bytes());
                buf.extend_from_slice(&speed_x100.to_be_bytes());
            }
            Message::Heartbeat => buf.push(msg_type::HEARTBEAT),
        }
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn push_bytes(buf: &mut Vec<u8>, s: &[u8]) {
    // Plates and error strings are capped at 255 bytes by the u8 length
    // prefix; callers never construct longer ones.
    buf.push(s.len() as u8);
    buf.extend_from_slice(s);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decodes_plate() {
        let raw: &[u8] = b"\x20\x04\x55\x4E\x31\x58\x00\x00\x03\xE8";
        let mut cursor = raw;
        let frame = Frame::decode(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Plate {
                plate: b"UN1X".to_vec(),
                timestamp: 1000,
            }
        );
    }

    #[tokio::test]
    async fn decodes_plate_with_non_utf8_bytes() {
        // Plates are opaque bytes; a length prefix of 3 followed by
        // non-UTF-8 bytes must decode successfully, not error.
        let raw: &[u8] = b"\x20\x03\x01\xff\x02\x00\x00\x00\x00";
        let mut cursor = raw;
        let frame = Frame::decode(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Plate {
                plate: vec![0x01, 0xff, 0x02],
                timestamp: 0,
            }
        );
    }

    #[tokio::test]
    async fn decodes_want_heartbeat() {
        let raw: &[u8] = b"\x40\x00\x00\x00\x0a";
        let mut cursor = raw;
        let frame = Frame::decode(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, Frame::WantHeartbeat { interval: 10 });
    }

    #[tokio::test]
    async fn decodes_i_am_camera() {
        let raw: &[u8] = b"\x80\x00\x42\x00\x64\x00\x3c";
        let mut cursor = raw;
        let frame = Frame::decode(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::IAmCamera {
                road: 66,
                mile: 100,
                limit: 60,
            }
        );
    }

    #[tokio::test]
    async fn decodes_i_am_dispatcher() {
        let raw: &[u8] = b"\x81\x03\x00\x42\x01\x70\x13\x88";
        let mut cursor = raw;
        let frame = Frame::decode(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::IAmDispatcher {
                roads: vec![66, 368, 5000],
            }
        );
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_not_an_error() {
        let raw: &[u8] = b"";
        let mut cursor = raw;
        assert!(Frame::decode(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_mid_frame_is_reported() {
        // S6: 0x81 0x02 0x00 0x42 then EOF - IAmDispatcher claims 2 roads
        // but only one u16 follows.
        let raw: &[u8] = b"\x81\x02\x00\x42";
        let mut cursor = raw;
        let err = Frame::decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }

    #[tokio::test]
    async fn unknown_type_is_malformed() {
        let raw: &[u8] = b"\x99";
        let mut cursor = raw;
        let err = Frame::decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, DecodeError::MalformedType(0x99)));
    }

    #[tokio::test]
    async fn encodes_ticket() {
        let msg = Message::Ticket {
            plate: b"UN1X".to_vec(),
            road: 66,
            mile1: 100,
            timestamp1: 123456,
            mile2: 110,
            timestamp2: 123816,
            speed_x100: 10000,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            b"\x21\x04\x55\x4e\x31\x58\x00\x42\x00\x64\x00\x01\xe2\x40\x00\x6e\x00\x01\xe3\xa8\x27\x10"
        );
    }

    #[tokio::test]
    async fn encodes_heartbeat() {
        let mut buf = Vec::new();
        Message::Heartbeat.encode(&mut buf).await.unwrap();
        assert_eq!(buf, b"\x41");
    }

    #[tokio::test]
    async fn encodes_error() {
        let mut buf = Vec::new();
        Message::Error { msg: "bad".into() }.encode(&mut buf).await.unwrap();
        assert_eq!(buf, b"\x10\x03bad");
    }
}
