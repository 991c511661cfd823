//! Wire format for the TCP transport.
//!
//! Every message is one frame: a 4-byte big-endian length prefix followed by
//! a UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The first frame from the connector is a [`HandshakeRequest`], answered by
//! one [`HandshakeReply`]. After an accepting reply both sides exchange
//! [`Invoke`](crate::Invoke) envelopes until either closes the socket.

use crate::config::{CloseStatus, ProtocolConfig};
use crate::error::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// First frame of every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest<H> {
    pub header: H,
}

/// The acceptor's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeReply {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            status: None,
            reason: None,
        }
    }

    pub fn rejected(status: u16, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            status: Some(status),
            reason: Some(reason.into()),
        }
    }

    /// `Err(Rejected)` unless the connection was accepted.
    pub fn into_result(self) -> Result<()> {
        if self.accepted {
            return Ok(());
        }
        Err(TetherError::Rejected {
            status: self.status.unwrap_or(CloseStatus::DEFAULT_REJECT),
            reason: self.reason.unwrap_or_default(),
        })
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(TetherError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(TetherError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{Invoke, InvokeFunction};
    use serde_json::json;

    #[test]
    fn test_reply_wire_shape() {
        let accepted = serde_json::to_value(HandshakeReply::accepted()).unwrap();
        assert_eq!(accepted, json!({"accepted": true}));

        let rejected =
            serde_json::to_value(HandshakeReply::rejected(1008, "bad password")).unwrap();
        assert_eq!(
            rejected,
            json!({"accepted": false, "status": 1008, "reason": "bad password"})
        );
    }

    #[test]
    fn test_rejected_reply_into_error() {
        let err = HandshakeReply::rejected(4001, "full")
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            TetherError::Rejected { status: 4001, ref reason } if reason == "full"
        ));
        assert!(HandshakeReply::accepted().into_result().is_ok());
    }

    #[tokio::test]
    async fn test_message_over_frames() {
        let mut buf = Vec::new();
        let invoke = Invoke::from(InvokeFunction::new(3, "nested.double", vec![json!(21)]));
        write_message(&mut buf, &invoke).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back: Invoke = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read_back, invoke);
        assert!(read_message::<_, Invoke>(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(TetherError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_json_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"not valid json").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_message::<_, Invoke>(&mut cursor).await;
        assert!(matches!(result, Err(TetherError::Json { .. })));
    }
}
