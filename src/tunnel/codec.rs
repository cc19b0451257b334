//! Record codec
//!
//! Every frame travels in one record:
//! ```text
//! +--------------------------+------------------------------+
//! | length (2) [+ tag (16)]  | frame plaintext [+ tag (16)] |
//! +--------------------------+------------------------------+
//! ```
//! The length header is sealed with its own key and counts the sealed body.
//! Header and body consume consecutive nonces of the same [`Cipher`].

use super::{Frame, TunnelError, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, MAX_PADDING};
use crate::crypto::Cipher;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame plaintext a record may carry
const MAX_PLAINTEXT: usize = FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD + MAX_PADDING;

/// Seal `frame` and append the complete record to `out`
pub fn encode_record(
    cipher: &mut Cipher,
    frame: &Frame,
    out: &mut Vec<u8>,
) -> Result<(), TunnelError> {
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(TunnelError::FrameTooLarge(
            frame.payload.len(),
            MAX_FRAME_PAYLOAD,
        ));
    }
    let size = frame.encoded_size();
    if size > MAX_PLAINTEXT {
        return Err(TunnelError::FrameTooLarge(size, MAX_PLAINTEXT));
    }

    let mut body = frame.encode().to_vec();
    let sealed_len = body.len() + cipher.suite().overhead();

    let header = cipher.seal_length(sealed_len as u16)?;
    cipher.seal_in_place(&mut body)?;

    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(())
}

/// Seal and write one frame
pub async fn write_frame<W>(
    writer: &mut W,
    cipher: &mut Cipher,
    frame: &Frame,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut record = Vec::with_capacity(cipher.header_len() + frame.encoded_size() + 16);
    encode_record(cipher, frame, &mut record)?;
    writer.write_all(&record).await?;
    Ok(())
}

/// Read, authenticate and decode one frame
///
/// A clean EOF before the first header byte surfaces as
/// `io::ErrorKind::UnexpectedEof`, same as a truncated record.
pub async fn read_frame<R>(reader: &mut R, cipher: &mut Cipher) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; cipher.header_len()];
    reader.read_exact(&mut header).await?;
    let len = cipher.open_length(&mut header)? as usize;

    let max = MAX_PLAINTEXT + cipher.suite().overhead();
    if len > max {
        return Err(TunnelError::FrameTooLarge(len, max));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let plain = cipher.open_in_place(&mut body)?;

    Frame::decode(Bytes::copy_from_slice(plain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherSuite, KEY_LEN};
    use crate::tunnel::FrameType;

    fn pair(suite: CipherSuite) -> (Cipher, Cipher) {
        let key = [1u8; KEY_LEN];
        let length_key = [2u8; KEY_LEN];
        (
            Cipher::new(suite, &key, &length_key).unwrap(),
            Cipher::new(suite, &key, &length_key).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_record_roundtrip_all_suites() {
        for suite in CipherSuite::ALL {
            let (mut tx, mut rx) = pair(suite);
            let (mut a, mut b) = tokio::io::duplex(1 << 20);

            write_frame(&mut a, &mut tx, &Frame::new_stream(1)).await.unwrap();
            let payload = Bytes::from(vec![0xab; MAX_FRAME_PAYLOAD]);
            write_frame(&mut a, &mut tx, &Frame::data(1, 1, payload.clone()))
                .await
                .unwrap();
            write_frame(&mut a, &mut tx, &Frame::keepalive(200)).await.unwrap();

            let first = read_frame(&mut b, &mut rx).await.unwrap();
            assert_eq!(first.frame_type, FrameType::New);

            let second = read_frame(&mut b, &mut rx).await.unwrap();
            assert_eq!(second.seq, 1);
            assert_eq!(second.payload, payload);

            let third = read_frame(&mut b, &mut rx).await.unwrap();
            assert_eq!(third.frame_type, FrameType::Keepalive);
        }
    }

    #[tokio::test]
    async fn test_tampered_record_fails_authentication() {
        let (mut tx, mut rx) = pair(CipherSuite::ChaCha20Poly1305);
        let mut record = Vec::new();
        encode_record(&mut tx, &Frame::data(3, 0, Bytes::from_static(b"secret")), &mut record)
            .unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;

        let mut reader = &record[..];
        assert!(matches!(
            read_frame(&mut reader, &mut rx).await,
            Err(TunnelError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_truncated_record_is_io_error() {
        let (mut tx, mut rx) = pair(CipherSuite::Aes256Gcm);
        let mut record = Vec::new();
        encode_record(&mut tx, &Frame::close(5, 2), &mut record).unwrap();
        record.truncate(record.len() - 4);

        let mut reader = &record[..];
        assert!(matches!(
            read_frame(&mut reader, &mut rx).await,
            Err(TunnelError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut cipher = Cipher::plain();
        let frame = Frame::data(1, 0, Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]));
        let mut out = Vec::new();
        assert!(matches!(
            encode_record(&mut cipher, &frame, &mut out),
            Err(TunnelError::FrameTooLarge(..))
        ));
    }
}
