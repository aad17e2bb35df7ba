// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for moving migration messages and bulk bytes over websockets.
//!
//! Control-channel messages are protobuf-encoded, one message per binary
//! websocket frame; the frame itself carries the length prefix. The bulk
//! (filesystem and checkpoint) channels are exposed to the storage layer
//! as plain byte streams via [`transfer_conn`]: every write becomes one
//! binary frame, reads concatenate incoming frames, and shutdown never
//! emits a close frame so that a concurrent writer elsewhere cannot race
//! a close against in-flight data. The peer observes the end of a bulk
//! channel as a raw socket close.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use prost::Message as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;

use cask::storage::FsConn;

/// Migration protocol framing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encountered an I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error occurred in the underlying websocket transport
    #[error("websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),

    /// Failed to decode a received protobuf payload
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The peer closed the channel while a message was expected
    #[error("peer closed the control channel")]
    PeerClosed,

    /// Control messages are always binary frames
    #[error("unexpected {0} frame on control channel")]
    UnexpectedFrame(&'static str),
}

/// Encodes one protobuf message into a binary websocket frame.
pub(crate) fn encode<M: prost::Message>(m: &M) -> tungstenite::Message {
    tungstenite::Message::Binary(m.encode_to_vec())
}

/// Sends one message on a control-channel sink half.
pub(crate) async fn send_message<T, M>(
    sink: &mut SplitSink<WebSocketStream<T>, tungstenite::Message>,
    m: &M,
) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: prost::Message,
{
    sink.send(encode(m)).await?;
    Ok(())
}

/// Receives the next message from a control-channel stream half,
/// skipping keep-alive frames.
pub(crate) async fn recv_message<T, M>(
    stream: &mut SplitStream<WebSocketStream<T>>,
) -> Result<M, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: prost::Message + Default,
{
    loop {
        match stream.next().await {
            Some(Ok(tungstenite::Message::Binary(buf))) => {
                return Ok(M::decode(&buf[..])?);
            }
            Some(Ok(tungstenite::Message::Ping(_)))
            | Some(Ok(tungstenite::Message::Pong(_))) => continue,
            Some(Ok(tungstenite::Message::Text(_))) => {
                return Err(ProtocolError::UnexpectedFrame("text"));
            }
            Some(Ok(tungstenite::Message::Frame(_))) => {
                return Err(ProtocolError::UnexpectedFrame("raw"));
            }
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                return Err(ProtocolError::PeerClosed);
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Adapts a bulk websocket into the byte-stream pair the storage drivers
/// consume.
pub(crate) fn transfer_conn<T>(ws: WebSocketStream<T>) -> FsConn
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = ws.split();
    FsConn::new(
        Box::new(WsReader { stream, buf: Bytes::new() }),
        Box::new(WsWriter { sink }),
    )
}

struct WsReader<T> {
    stream: SplitStream<WebSocketStream<T>>,
    buf: Bytes,
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.buf.is_empty() {
                let n = out.remaining().min(me.buf.len());
                out.put_slice(&me.buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut me.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(tungstenite::Message::Binary(b)))) => {
                    me.buf = Bytes::from(b);
                }
                // A close frame or a dropped socket both read as EOF.
                Poll::Ready(Some(Ok(tungstenite::Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => continue,
                // Bulk channels end with a raw socket close, never a
                // close frame; don't surface that as an error.
                Poll::Ready(Some(Err(tungstenite::Error::Protocol(
                    tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
                ))))
                | Poll::Ready(Some(Err(tungstenite::Error::ConnectionClosed)))
                | Poll::Ready(Some(Err(tungstenite::Error::AlreadyClosed))) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct WsWriter<T> {
    sink: SplitSink<WebSocketStream<T>, tungstenite::Message>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsWriter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut me.sink)
                    .start_send(tungstenite::Message::Binary(buf.to_vec()))
                    .map_err(to_io)?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(to_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        Pin::new(&mut me.sink).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Flush only. Bulk channels are released by dropping the socket,
        // never by a close frame.
        let me = self.get_mut();
        Pin::new(&mut me.sink).poll_flush(cx).map_err(to_io)
    }
}

fn to_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod encoding_tests {
    use crate::migration::{
        Config, IdMapType, MigrationControl, MigrationFsType, MigrationHeader, Snapshot,
    };
    use prost::Message as _;

    #[test]
    fn control_success_bytes() {
        let m = MigrationControl { success: true, message: None };
        assert_eq!(m.encode_to_vec(), vec![0x08, 0x01]);
    }

    #[test]
    fn control_failure_bytes() {
        let m = MigrationControl { success: false, message: Some("all bad".to_string()) };
        let mut expected = vec![0x08, 0x00, 0x12, 0x07];
        expected.extend_from_slice(b"all bad");
        assert_eq!(m.encode_to_vec(), expected);
    }

    #[test]
    fn header_bytes() {
        let m = MigrationHeader {
            fs: MigrationFsType::Zfs as i32,
            criu: None,
            idmap: vec![IdMapType {
                isuid: true,
                isgid: false,
                hostid: 100000,
                nsid: 0,
                maprange: 65536,
            }],
            snapshot_names: vec!["snap0".to_string()],
            snapshots: vec![],
        };
        let expected = vec![
            0x08, 0x02, // fs = ZFS
            0x1a, 0x0e, // idmap entry, 14 bytes
            0x08, 0x01, // isuid = true
            0x10, 0x00, // isgid = false
            0x18, 0xa0, 0x8d, 0x06, // hostid = 100000
            0x20, 0x00, // nsid = 0
            0x28, 0x80, 0x80, 0x04, // maprange = 65536
            0x22, 0x05, b's', b'n', b'a', b'p', b'0', // snapshot name
        ];
        assert_eq!(m.encode_to_vec(), expected);
    }

    #[test]
    fn header_criu_presence() {
        let live = MigrationHeader {
            fs: MigrationFsType::Rsync as i32,
            criu: Some(0), // CRIU_RSYNC
            ..Default::default()
        };
        // An explicit zero-valued optional enum still goes on the wire;
        // its presence is what signals a live migration.
        assert_eq!(live.encode_to_vec(), vec![0x08, 0x00, 0x10, 0x00]);

        let stopped =
            MigrationHeader { fs: MigrationFsType::Rsync as i32, ..Default::default() };
        assert_eq!(stopped.encode_to_vec(), vec![0x08, 0x00]);
    }

    #[test]
    fn snapshot_round_trip() {
        let snap = Snapshot {
            name: "snap0".to_string(),
            local_config: vec![Config {
                key: "limits.memory".to_string(),
                value: "256MB".to_string(),
            }],
            profiles: vec!["default".to_string()],
            ephemeral: false,
            local_devices: vec![],
            architecture: 2,
            stateful: false,
        };
        let decoded = Snapshot::decode(&snap.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded, snap);
    }

}

#[cfg(test)]
mod transfer_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn bytes_cross_frame_boundaries() {
        let (client, server) = ws_pair().await;
        let mut tx = transfer_conn(client);
        let mut rx = transfer_conn(server);

        tx.tx.write_all(b"hello ").await.unwrap();
        tx.tx.write_all(b"world").await.unwrap();
        tx.tx.flush().await.unwrap();

        let mut buf = [0u8; 11];
        rx.rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn drop_reads_as_eof() {
        let (client, server) = ws_pair().await;
        let tx = transfer_conn(client);
        let mut rx = transfer_conn(server);
        drop(tx);

        let mut buf = Vec::new();
        rx.rx.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
