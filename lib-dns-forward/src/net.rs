//! TCP framing for DNS: a big-endian u16 length prefix in front of
//! every message (RFC 1035 section 4.2.2).

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one length-prefixed DNS message from a stream.
///
/// The prefix is redundant (the header says how many fields follow)
/// but it means the entire message can be read before parsing begins.
pub async fn read_tcp_bytes<R: AsyncRead + Unpin>(stream: &mut R) -> Result<BytesMut, TcpError> {
    match stream.read_u16().await {
        Ok(size) => {
            let expected = size as usize;
            let mut bytes = BytesMut::with_capacity(expected);
            while bytes.len() < expected {
                match stream.read_buf(&mut bytes).await {
                    Ok(0) if bytes.len() < expected => {
                        return Err(TcpError::TooShort {
                            id: id_from_prefix(&bytes),
                            expected,
                            actual: bytes.len(),
                        });
                    }
                    Err(err) => {
                        return Err(TcpError::IO {
                            id: id_from_prefix(&bytes),
                            error: err,
                        });
                    }
                    _ => (),
                }
            }
            Ok(bytes)
        }
        Err(err) => Err(TcpError::IO {
            id: None,
            error: err,
        }),
    }
}

/// Write one length-prefixed DNS message to a stream.
pub async fn send_tcp_bytes<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
) -> Result<(), io::Error> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "message too long for a TCP frame",
        )
    })?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;

    Ok(())
}

/// The id of a partially-read message, if enough of it arrived.
fn id_from_prefix(bytes: &BytesMut) -> Option<u16> {
    if bytes.len() >= 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    /// The stream ended before the promised number of octets arrived.
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    IO {
        id: Option<u16>,
        error: io::Error,
    },
}

impl TcpError {
    pub fn id(&self) -> Option<u16> {
        match self {
            TcpError::TooShort { id, .. } | TcpError::IO { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_through_a_buffer() {
        let message = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01];

        let mut written = Vec::new();
        send_tcp_bytes(&mut written, &message).await.unwrap();
        assert_eq!(vec![0x00, 0x06], written[..2].to_vec());

        let read = read_tcp_bytes(&mut written.as_slice()).await.unwrap();
        assert_eq!(message, read.to_vec());
    }

    #[tokio::test]
    async fn short_read_carries_the_id() {
        // promises 10 octets, delivers 4
        let partial = vec![0x00, 0x0A, 0x12, 0x34, 0x01, 0x00];

        match read_tcp_bytes(&mut partial.as_slice()).await {
            Err(TcpError::TooShort {
                id,
                expected,
                actual,
            }) => {
                assert_eq!(Some(0x1234), id);
                assert_eq!(10, expected);
                assert_eq!(4, actual);
            }
            other => panic!("expected TooShort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_message_is_refused() {
        let huge = vec![0u8; 70_000];
        let mut sink = Vec::new();

        assert!(send_tcp_bytes(&mut sink, &huge).await.is_err());
        assert!(sink.is_empty());
    }
}
