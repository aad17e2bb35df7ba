// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container migration between daemons.
//!
//! A migration runs over up to three websockets: `control` carries the
//! protobuf handshake and the final verdict, `fs` carries the storage
//! driver's stream, and `criu` (live migrations only) carries the
//! checkpoint image. Each channel is guarded by a per-operation secret;
//! the sink dials all of them, the source accepts them one upgrade at a
//! time and starts once the expected set is attached.

pub mod codec;
pub mod destination;
pub mod source;

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{tungstenite, WebSocketStream};

use cask::checkpoint::CheckpointError;
use cask::container::{ContainerError, LocalDevice, SnapshotRecord};
use cask::idmap::{IdmapEntry, IdmapError, IdmapSet};
use cask::storage::StorageError;

use crate::migration::{Config, Device, IdMapType, MigrationControl, Snapshot};

pub use destination::{MigrationSink, MigrationSinkArgs};
pub use source::MigrationSource;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MigrateRole {
    Source,
    Sink,
}

impl std::fmt::Display for MigrateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrateRole::Source => write!(f, "source"),
            MigrateRole::Sink => write!(f, "sink"),
        }
    }
}

/// Errors which may occur during the course of a migration.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// An error from establishing one of the migration websockets
    #[error("HTTP error: {0}")]
    Http(String),

    /// The connect request carried no secret at all
    #[error("missing secret")]
    MissingSecret,

    /// The sink was constructed without one of the mandatory secrets
    #[error("missing {0} migration secret")]
    MissingChannelSecret(&'static str),

    /// The secret did not match any expected channel, or was already used
    #[error("permission denied")]
    Permission,

    /// A migration operation is consumable at most once
    #[error("migration operation was already consumed")]
    Consumed,

    /// Live migration needs the checkpoint tool on both ends
    #[error("unable to perform live migration: checkpoint tool not installed on the {0} server")]
    CheckpointToolMissing(MigrateRole),

    /// Encountered an error encoding or decoding control messages
    #[error("codec error: {0}")]
    Codec(#[from] codec::ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Idmap(#[from] IdmapError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The other end of the migration ran into an error
    #[error("{0} migration peer reported: {1}")]
    Remote(MigrateRole, String),

    /// The control channel went away before the final verdict
    #[error("error reading migration control socket")]
    ControlClosed,

    /// The peer agreed to a live migration but sent no checkpoint type
    #[error("got no checkpoint type for live migration")]
    MissingCriuType,

    /// Only the rsync checkpoint transfer is understood
    #[error("checkpoint formats other than rsync are not understood")]
    UnsupportedCriuType,
}

impl From<tungstenite::Error> for MigrateError {
    fn from(e: tungstenite::Error) -> MigrateError {
        MigrateError::Codec(e.into())
    }
}

/// Generates one channel secret: 32 bytes of CSPRNG output, hex-encoded.
pub(crate) fn random_secret() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Constant-time string comparison for secret matching.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Mangles an operation URL into the websocket URL for one of its
/// channels.
pub(crate) fn websocket_url(op_url: &str, secret: &str) -> String {
    if let Some(rest) = op_url.strip_prefix("https://") {
        format!("wss://{rest}/websocket?secret={secret}")
    } else if let Some(rest) = op_url.strip_prefix("http://") {
        format!("ws://{rest}/websocket?secret={secret}")
    } else {
        format!("wss://{op_url}/websocket?secret={secret}")
    }
}

/// Dials an action-script websocket and reports the restore verdict.
///
/// Run from inside the checkpoint tool's action script (via the
/// `migratedumpsuccess` subcommand): the dial itself tells the source
/// daemon the dump is complete, and the socket then hangs until the sink
/// has restored. Returns `true` only when the far end closes with a
/// normal close frame, i.e. the restore succeeded and the container
/// should be left dead on this side.
pub async fn migrate_dump_success(op_url: &str, secret: &str) -> Result<bool, MigrateError> {
    let url = websocket_url(op_url, secret);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| MigrateError::Http(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return Ok(matches!(frame, Some(f) if f.code == CloseCode::Normal));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(false),
        }
    }
}

/// The control websocket, split so that the single logical reader never
/// blocks the writers. All writes serialize on the sink lock: the
/// protocol sender, the failure reporter and the disconnect close frame
/// may otherwise race on one socket.
pub(crate) struct ControlChannel<T> {
    sink: tokio::sync::Mutex<Option<SplitSink<WebSocketStream<T>, tungstenite::Message>>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocketStream<T>>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ControlChannel<T> {
    pub fn new(ws: WebSocketStream<T>) -> ControlChannel<T> {
        let (sink, stream) = ws.split();
        ControlChannel {
            sink: tokio::sync::Mutex::new(Some(sink)),
            stream: tokio::sync::Mutex::new(stream),
        }
    }

    pub async fn send<M: prost::Message>(&self, m: &M) -> Result<(), codec::ProtocolError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(s) => codec::send_message(s, m).await,
            None => Err(codec::ProtocolError::PeerClosed),
        }
    }

    pub async fn recv<M: prost::Message + Default>(&self) -> Result<M, codec::ProtocolError> {
        let mut stream = self.stream.lock().await;
        codec::recv_message(&mut stream).await
    }

    /// Reports the migration verdict to the peer. A failure verdict also
    /// announces our intent to disconnect, so the session is closed
    /// behind it. Best effort; the channel may already be gone.
    pub async fn send_control(&self, err: Option<&MigrateError>) {
        let msg = MigrationControl {
            success: err.is_none(),
            message: err.map(|e| e.to_string()),
        };
        let _ = self.send(&msg).await;
        if err.is_some() {
            self.disconnect().await;
        }
    }

    /// Sends a normal close frame and drops the write half. The fs and
    /// criu channels are never closed this way; their owners drop the
    /// raw sockets instead (see `codec`).
    pub async fn disconnect(&self) {
        let mut sink = self.sink.lock().await;
        if let Some(mut s) = sink.take() {
            let _ = s
                .send(tungstenite::Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
        }
    }
}

/// The full set of channels for one migration, handed to an engine once
/// every expected websocket is attached.
pub(crate) struct ChannelSet<T> {
    pub control: Arc<ControlChannel<T>>,
    pub fs: WebSocketStream<T>,
    pub criu: Option<WebSocketStream<T>>,
}

pub(crate) fn idmap_to_wire(e: &IdmapEntry) -> IdMapType {
    IdMapType {
        isuid: e.isuid,
        isgid: e.isgid,
        hostid: e.hostid as i32,
        nsid: e.nsid as i32,
        maprange: e.maprange as i32,
    }
}

pub(crate) fn idmap_from_wire(entries: &[IdMapType]) -> Result<IdmapSet, IdmapError> {
    let mut set = IdmapSet::new();
    for e in entries {
        set.append(IdmapEntry {
            isuid: e.isuid,
            isgid: e.isgid,
            hostid: e.hostid as i64,
            nsid: e.nsid as i64,
            maprange: e.maprange as i64,
        })?;
    }
    Ok(set)
}

fn config_to_wire(pairs: &[(String, String)]) -> Vec<Config> {
    pairs
        .iter()
        .map(|(key, value)| Config { key: key.clone(), value: value.clone() })
        .collect()
}

fn config_from_wire(pairs: &[Config]) -> Vec<(String, String)> {
    pairs.iter().map(|c| (c.key.clone(), c.value.clone())).collect()
}

pub(crate) fn snapshot_to_wire(r: &SnapshotRecord) -> Snapshot {
    Snapshot {
        name: r.name.clone(),
        local_config: config_to_wire(&r.local_config),
        profiles: r.profiles.clone(),
        ephemeral: r.ephemeral,
        local_devices: r
            .local_devices
            .iter()
            .map(|d| Device { name: d.name.clone(), config: config_to_wire(&d.config) })
            .collect(),
        architecture: r.architecture,
        stateful: r.stateful,
    }
}

pub(crate) fn snapshot_from_wire(s: &Snapshot) -> SnapshotRecord {
    SnapshotRecord {
        name: s.name.clone(),
        local_config: config_from_wire(&s.local_config),
        profiles: s.profiles.clone(),
        ephemeral: s.ephemeral,
        local_devices: s
            .local_devices
            .iter()
            .map(|d| LocalDevice { name: d.name.clone(), config: config_from_wire(&d.config) })
            .collect(),
        architecture: s.architecture,
        stateful: s.stateful,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn secrets_are_hex_and_unique() {
        let a = random_secret();
        let b = random_secret();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn snapshot_wire_round_trip() {
        let record = SnapshotRecord {
            name: "snap0".to_string(),
            local_config: vec![("limits.memory".to_string(), "256MB".to_string())],
            profiles: vec!["default".to_string()],
            ephemeral: true,
            local_devices: vec![LocalDevice {
                name: "root".to_string(),
                config: vec![("path".to_string(), "/".to_string())],
            }],
            architecture: 2,
            stateful: false,
        };
        assert_eq!(snapshot_from_wire(&snapshot_to_wire(&record)), record);
    }

    #[test]
    fn idmap_wire_enforces_invariants() {
        let entry = |nsid| IdMapType {
            isuid: true,
            isgid: false,
            hostid: 100000,
            nsid,
            maprange: 65536,
        };
        let set = idmap_from_wire(&[entry(0)]).unwrap();
        assert_eq!(set.entries().len(), 1);
        // Overlapping namespace ranges of the same kind are refused.
        assert!(idmap_from_wire(&[entry(0), entry(1000)]).is_err());
    }

    #[test]
    fn websocket_url_shapes() {
        assert_eq!(
            websocket_url("https://host:8443/1.0/operations/abc", "s3"),
            "wss://host:8443/1.0/operations/abc/websocket?secret=s3"
        );
        assert_eq!(
            websocket_url("http://host:8443/1.0/operations/abc", "s3"),
            "ws://host:8443/1.0/operations/abc/websocket?secret=s3"
        );
    }

    async fn control_pair() -> (
        ControlChannel<tokio::io::DuplexStream>,
        ControlChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (ControlChannel::new(client), ControlChannel::new(server))
    }

    #[tokio::test]
    async fn concurrent_writers_serialize() {
        let (tx, rx) = control_pair().await;
        let tx = Arc::new(tx);

        // Two logical writers racing on the control channel must come out
        // as well-formed sequential messages.
        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let tx = Arc::clone(&tx);
            tasks.push(tokio::spawn(async move {
                let msg = MigrationControl {
                    success: true,
                    message: Some(format!("writer {i}")),
                };
                tx.send(&msg).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let msg: MigrationControl = rx.recv().await.unwrap();
            assert!(msg.success);
            seen.push(msg.message.unwrap());
        }
        for t in tasks {
            t.await.unwrap();
        }
        seen.sort();
        for i in 0..8 {
            assert_eq!(seen[i], format!("writer {i}"));
        }
    }

    #[tokio::test]
    async fn control_failure_disconnects() {
        let (tx, rx) = control_pair().await;
        tx.send_control(Some(&MigrateError::ControlClosed)).await;

        let msg: MigrationControl = rx.recv().await.unwrap();
        assert!(!msg.success);
        assert_eq!(msg.message.unwrap(), "error reading migration control socket");

        // The sender disconnected behind the failure; the next read sees
        // the close.
        assert!(matches!(
            rx.recv::<MigrationControl>().await,
            Err(codec::ProtocolError::PeerClosed)
        ));
    }
}
