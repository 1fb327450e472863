//! Peer-to-peer line protocol
//!
//! Every frame is UTF-8 text terminated by `\n`. The first frame on a
//! connection carries the dialing peer's username; every later frame is one
//! chat line. Frames are bounded by the configured maximum length.

use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Reading half of a peer connection
pub type FrameReader<R> = FramedRead<R, LinesCodec>;

/// Writing half of a peer connection
pub type FrameWriter<W> = FramedWrite<W, LinesCodec>;

/// Wrap a reader in the line codec
pub fn frame_reader<R: AsyncRead>(reader: R, max_frame_bytes: usize) -> FrameReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes))
}

/// Wrap a writer in the line codec
pub fn frame_writer<W: AsyncWrite>(writer: W, max_frame_bytes: usize) -> FrameWriter<W> {
    FramedWrite::new(writer, LinesCodec::new_with_max_length(max_frame_bytes))
}

/// Check that `username` can be sent as an identity frame
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(Error::Protocol("empty username".to_string()));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(Error::Protocol(format!("username {:?} contains whitespace", username)));
    }
    Ok(())
}

/// Check that `text` is a non-empty line that fits in a single chat frame
pub fn validate_chat_text(text: &str, max_frame_bytes: usize) -> Result<()> {
    if text.is_empty() {
        return Err(Error::Protocol("chat text is empty".to_string()));
    }
    if text.contains(['\n', '\r']) {
        return Err(Error::Protocol("chat text must be a single line".to_string()));
    }
    if text.len() > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "chat text is {} bytes, limit is {}",
            text.len(),
            max_frame_bytes
        )));
    }
    Ok(())
}

/// Read the identity frame
///
/// Returns `Ok(None)` if the peer closed the connection before sending one.
pub async fn read_identity<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Option<String>> {
    let Some(frame) = read_frame(reader).await? else {
        return Ok(None);
    };

    let username = frame.trim().to_string();
    validate_username(&username)?;
    Ok(Some(username))
}

/// Read the next frame; `Ok(None)` on orderly close
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Option<String>> {
    match reader.next().await {
        Some(Ok(line)) => Ok(Some(line)),
        Some(Err(e)) => Err(codec_error(e)),
        None => Ok(None),
    }
}

/// Send the identity frame
pub async fn write_identity<W: AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, username: &str) -> Result<()> {
    validate_username(username)?;
    writer.send(username).await.map_err(codec_error)
}

/// Send one chat line and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, text: &str) -> Result<()> {
    writer.send(text).await.map_err(codec_error)
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => Error::Protocol("frame exceeds maximum length".to_string()),
        LinesCodecError::Io(io) => Error::Io(io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("al ice").is_err());
    }

    #[test]
    fn test_validate_chat_text() {
        assert!(validate_chat_text("hello there", 1024).is_ok());
        assert!(validate_chat_text("two\nlines", 1024).is_err());
        assert!(validate_chat_text("carriage\rreturn", 1024).is_err());
        assert!(validate_chat_text("toolong", 3).is_err());
        assert!(validate_chat_text("", 1024).is_err());
    }

    #[tokio::test]
    async fn test_frames_split_on_newline_not_on_read() {
        // Two frames delivered in one read, a third split across reads
        let (client, server) = tokio::io::duplex(64);
        let mut writer = frame_writer(client, 1024);
        let mut reader = frame_reader(server, 1024);

        write_identity(&mut writer, "bob").await.expect("Failed to write identity");
        write_frame(&mut writer, "hi").await.expect("Failed to write frame");
        write_frame(&mut writer, "there").await.expect("Failed to write frame");
        drop(writer);

        assert_eq!(read_identity(&mut reader).await.expect("read failed"), Some("bob".to_string()));
        assert_eq!(read_frame(&mut reader).await.expect("read failed"), Some("hi".to_string()));
        assert_eq!(read_frame(&mut reader).await.expect("read failed"), Some("there".to_string()));
        assert_eq!(read_frame(&mut reader).await.expect("read failed"), None);
    }

    #[tokio::test]
    async fn test_crlf_tolerated() {
        let data: &[u8] = b"carol\r\nhello\r\n";
        let mut reader = frame_reader(data, 1024);

        assert_eq!(read_identity(&mut reader).await.expect("read failed"), Some("carol".to_string()));
        assert_eq!(read_frame(&mut reader).await.expect("read failed"), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let data: &[u8] = b"abcdefghijklmnop\n";
        let mut reader = frame_reader(data, 4);

        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_closed_before_identity() {
        let data: &[u8] = b"";
        let mut reader = frame_reader(data, 1024);
        assert_eq!(read_identity(&mut reader).await.expect("read failed"), None);
    }
}
