//! Length-prefixed framing.
//!
//! The blocking variants serve the daemon thread inside instrumented
//! processes, which must not pull in an async runtime. The async variants are
//! for the controller and `loomctl`.

use std::io::{ErrorKind, Read, Write};

use crate::{IpcError, MAX_FRAME_LEN};

fn encode_len(len: usize) -> Result<[u8; 4], IpcError> {
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    Ok((len as u32).to_be_bytes())
}

fn decode_len(buf: [u8; 4]) -> Result<usize, IpcError> {
    let len = u32::from_be_bytes(buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    Ok(len)
}

fn into_text(buf: Vec<u8>) -> Result<String, IpcError> {
    String::from_utf8(buf).map_err(|_| IpcError::InvalidUtf8)
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, message: &str) -> Result<(), IpcError> {
    let len = encode_len(message.len())?;
    writer.write_all(&len)?;
    writer.write_all(message.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A connection closed mid-frame is an `UnexpectedEof` error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<String>, IpcError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = decode_len(len_buf)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    into_text(payload).map(Some)
}

#[cfg(feature = "tokio")]
mod async_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Write one frame on an async stream.
    pub async fn write_frame_async<W>(writer: &mut W, message: &str) -> Result<(), IpcError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = encode_len(message.len())?;
        writer.write_all(&len).await?;
        writer.write_all(message.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from an async stream. Same EOF rules as [`read_frame`].
    pub async fn read_frame_async<R>(reader: &mut R) -> Result<Option<String>, IpcError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = decode_len(len_buf)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        into_text(payload).map(Some)
    }
}

#[cfg(feature = "tokio")]
pub use async_io::{read_frame_async, write_frame_async};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prefix_is_big_endian_payload_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "OK").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 2, b'O', b'K']);
    }

    #[test]
    fn test_read_sequence_then_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "ls").unwrap();
        write_frame(&mut buf, "").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().as_deref(), Some("ls"));
        assert_eq!(read_frame(&mut cursor).unwrap().as_deref(), Some(""));
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let big = "x".repeat(MAX_FRAME_LEN + 1);
        let mut buf = Vec::new();
        assert!(matches!(
            write_frame(&mut buf, &big),
            Err(IpcError::FrameTooLarge(_))
        ));
        assert!(buf.is_empty());

        let mut cursor = Cursor::new(((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(IpcError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 5, b'a', b'b']);
        assert!(matches!(read_frame(&mut cursor), Err(IpcError::Io(_))));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 2, 0xff, 0xfe]);
        assert!(matches!(read_frame(&mut cursor), Err(IpcError::InvalidUtf8)));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_async_matches_sync_encoding() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, "del 4").await.unwrap();

        let mut sync_buf = Vec::new();
        write_frame(&mut sync_buf, "del 4").unwrap();
        assert_eq!(buf, sync_buf);

        let mut reader = &buf[..];
        assert_eq!(
            read_frame_async(&mut reader).await.unwrap().as_deref(),
            Some("del 4")
        );
        assert!(read_frame_async(&mut reader).await.unwrap().is_none());
    }
}
