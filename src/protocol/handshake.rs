//! Unframed key-exchange preamble.
//!
//! Each side writes its 8-byte big-endian public value exactly once before
//! any framed traffic. The gateway writes first; the client public value
//! must be the very first bytes it reads.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::kex::{HandshakeError, KeyPair, SharedSecret, PUBLIC_KEY_LEN};

/// Whether a connection has finished key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingPeer,
    Established,
}

/// Gateway side: send our public value, then wait for the peer's.
pub async fn server_handshake<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<SharedSecret, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pair = KeyPair::generate();
    stream.write_all(&pair.public_bytes()).await?;
    stream.flush().await?;

    let peer = read_public(stream, timeout).await?;
    pair.agree(peer)
}

/// Client side of the preamble; used by tooling and tests.
pub async fn client_handshake<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<SharedSecret, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pair = KeyPair::generate();
    let peer = read_public(stream, timeout).await?;
    stream.write_all(&pair.public_bytes()).await?;
    stream.flush().await?;
    pair.agree(peer)
}

async fn read_public<S>(stream: &mut S, timeout: Duration) -> Result<u64, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; PUBLIC_KEY_LEN];
    tokio::time::timeout(timeout, stream.read_exact(&mut raw))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cipher::StreamCipher;
    use crate::protocol::frame::{encode_frame, Frame, FrameDecoder, FrameEncoder};
    use bytes::BytesMut;

    const WAIT: Duration = Duration::from_secs(2);

    async fn agreed_pair() -> (SharedSecret, SharedSecret) {
        let (mut gateway, mut client) = tokio::io::duplex(64);
        let server = tokio::spawn(async move { server_handshake(&mut gateway, WAIT).await });
        let client_secret = client_handshake(&mut client, WAIT).await.unwrap();
        let server_secret = server.await.unwrap().unwrap();
        (server_secret, client_secret)
    }

    #[tokio::test]
    async fn preamble_agrees_on_secret() {
        let (server, client) = agreed_pair().await;
        assert_eq!(server, client);
    }

    #[tokio::test]
    async fn in_order_frames_decode() {
        let (server, client) = agreed_pair().await;
        let mut encoder = FrameEncoder::new();
        encoder.set_cipher(StreamCipher::from_secret(&client));
        let mut decoder = FrameDecoder::new(1024);
        decoder.set_cipher(StreamCipher::from_secret(&server));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoder.encode("login", b"alice").unwrap());
        buf.extend_from_slice(&encoder.encode("chat.say", b"hi").unwrap());

        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::new("login", &b"alice"[..]))
        );
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::new("chat.say", &b"hi"[..]))
        );
    }

    #[tokio::test]
    async fn skipped_frame_corrupts_the_stream() {
        let (server, client) = agreed_pair().await;
        let mut encoder = FrameEncoder::new();
        encoder.set_cipher(StreamCipher::from_secret(&client));

        let lost = encoder.encode("login", b"alice").unwrap();
        let second = encoder.encode("chat.say", b"hi").unwrap();
        let third = encoder.encode("chat.say", b"anyone there").unwrap();

        // Started at the wrong keystream offset, the bytes stay garbage.
        let mut misaligned = second.to_vec();
        StreamCipher::from_secret(&server).apply(&mut misaligned);
        assert_ne!(&misaligned[..], &encode_frame("chat.say", b"hi").unwrap()[..]);

        let expected = [
            Frame::new("chat.say", &b"hi"[..]),
            Frame::new("chat.say", &b"anyone there"[..]),
        ];

        let mut decoder = FrameDecoder::new(1024);
        decoder.set_cipher(StreamCipher::from_secret(&server));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&second);
        buf.extend_from_slice(&third);
        for _ in 0..expected.len() {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => assert!(!expected.contains(&frame), "decoded {frame:?}"),
                Ok(None) | Err(_) => break,
            }
        }

        // The same bytes decode once the lost frame is fed first.
        let mut decoder = FrameDecoder::new(1024);
        decoder.set_cipher(StreamCipher::from_secret(&server));
        let mut buf = BytesMut::new();
        for chunk in [&lost, &second, &third] {
            buf.extend_from_slice(chunk);
        }
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().name, "login");
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(expected[0].clone()));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(expected[1].clone()));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (mut gateway, _client) = tokio::io::duplex(64);
        let err = server_handshake(&mut gateway, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test]
    async fn zero_public_value_fails() {
        let (mut gateway, mut client) = tokio::io::duplex(64);
        let server = tokio::spawn(async move { server_handshake(&mut gateway, WAIT).await });
        let mut theirs = [0u8; PUBLIC_KEY_LEN];
        client.read_exact(&mut theirs).await.unwrap();
        client.write_all(&[0u8; PUBLIC_KEY_LEN]).await.unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidPublicKey(0)));
    }
}
