// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The universal rsync storage driver.
//!
//! Both halves spawn `rsync --server` locally and splice its stdio onto
//! the transfer channel, so the two rsync processes speak their own
//! protocol end to end across the websocket. Multiple transfers run
//! back-to-back on one channel; each session is delimited by the rsync
//! protocol itself and the bridge ends when the local process exits.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use slog::{debug, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::container::Container;
use crate::storage::{
    FsConn, FsType, SinkArgs, SinkDriver, SourceDriver, StorageDriver, StorageError,
};

/// Flag soup rsync expects in server mode: archive semantics plus the
/// protected-args/extended-attribute negotiation string.
const RSYNC_SERVER_FLAGS: &str = "-vlogDtpre.iLsfx";

pub struct RsyncDriver;

impl StorageDriver for RsyncDriver {
    fn fs_type(&self) -> FsType {
        FsType::Rsync
    }

    fn preserves_inodes(&self) -> bool {
        false
    }

    fn migration_source(
        &self,
        container: Arc<dyn Container>,
        log: &Logger,
    ) -> Result<Box<dyn SourceDriver>, StorageError> {
        let snapshots = container.snapshots()?;
        Ok(Box::new(RsyncSource { container, snapshots, log: log.clone() }))
    }

    fn migration_sink(&self, log: &Logger) -> Box<dyn SinkDriver> {
        Box::new(RsyncSink { log: log.clone() })
    }
}

struct RsyncSource {
    container: Arc<dyn Container>,
    snapshots: Vec<Arc<dyn Container>>,
    log: Logger,
}

#[async_trait]
impl SourceDriver for RsyncSource {
    fn snapshots(&self) -> Vec<Arc<dyn Container>> {
        self.snapshots.clone()
    }

    async fn send_while_running(&mut self, conn: &mut FsConn) -> Result<(), StorageError> {
        for snap in &self.snapshots {
            rsync_send(&snap.rootfs_path(), conn, &self.log).await?;
        }
        rsync_send(&self.container.rootfs_path(), conn, &self.log).await
    }

    async fn send_after_checkpoint(&mut self, conn: &mut FsConn) -> Result<(), StorageError> {
        // A plain re-send; rsync only moves what changed since the first
        // pass, and the container is frozen by now.
        rsync_send(&self.container.rootfs_path(), conn, &self.log).await
    }

    async fn cleanup(&mut self) {
        // Nothing pinned; rsync reads the live tree in place.
    }
}

struct RsyncSink {
    log: Logger,
}

#[async_trait]
impl SinkDriver for RsyncSink {
    async fn receive(&mut self, args: SinkArgs<'_>) -> Result<(), StorageError> {
        for record in &args.snapshots {
            let dst = args.container.snapshots_path().join(&record.name);
            std::fs::create_dir_all(&dst)?;
            rsync_recv(&dst, args.conn, &self.log).await?;
        }

        let rootfs = args.container.rootfs_path();
        std::fs::create_dir_all(&rootfs)?;
        rsync_recv(&rootfs, args.conn, &self.log).await?;

        if args.live {
            // Matching session for the sender's post-checkpoint delta.
            rsync_recv(&rootfs, args.conn, &self.log).await?;
        }

        Ok(())
    }
}

/// Streams `path` into the channel as one rsync session.
pub async fn rsync_send(path: &Path, conn: &mut FsConn, log: &Logger) -> Result<(), StorageError> {
    debug!(log, "rsync send"; "path" => %path.display());
    let child = Command::new("rsync")
        .arg("--server")
        .arg("--sender")
        .arg(RSYNC_SERVER_FLAGS)
        .arg("--numeric-ids")
        .arg("--devices")
        .arg(".")
        .arg(with_slash(path))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    run_session(child, conn).await
}

/// Receives one rsync session from the channel into `path`.
pub async fn rsync_recv(path: &Path, conn: &mut FsConn, log: &Logger) -> Result<(), StorageError> {
    debug!(log, "rsync receive"; "path" => %path.display());
    let child = Command::new("rsync")
        .arg("--server")
        .arg(RSYNC_SERVER_FLAGS)
        .arg("--numeric-ids")
        .arg("--devices")
        .arg(".")
        .arg(with_slash(path))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    run_session(child, conn).await
}

/// Splices the child's stdio onto the channel until the child exits.
///
/// The outbound copy finishes when the child closes its stdout, which
/// happens only at process exit; by then both rsyncs have exchanged their
/// protocol goodbyes, so stopping the inbound copy at that point cannot
/// strand session bytes.
async fn run_session(mut child: Child, conn: &mut FsConn) -> Result<(), StorageError> {
    let mut stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| StorageError::Io(std::io::Error::other("rsync stdout not captured")))?;

    let forward = async {
        tokio::io::copy(&mut stdout, &mut conn.tx).await?;
        conn.tx.flush().await?;
        Ok::<(), std::io::Error>(())
    };
    tokio::pin!(forward);

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            res = &mut forward => {
                res?;
                break;
            }
            res = conn.rx.read(&mut buf), if stdin.is_some() => {
                match res? {
                    0 => {
                        // Remote hung up; let the child see EOF.
                        stdin = None;
                    }
                    n => {
                        if let Some(sin) = stdin.as_mut() {
                            if sin.write_all(&buf[..n]).await.is_err() {
                                stdin = None;
                            }
                        }
                    }
                }
            }
        }
    }
    drop(stdin);

    let status = child.wait().await?;
    if !status.success() {
        return Err(StorageError::ToolFailed { tool: "rsync", status });
    }
    Ok(())
}

fn with_slash(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::binary_on_path;
    use crate::storage::FsConn;

    #[test]
    fn with_slash_appends_once() {
        assert_eq!(with_slash(Path::new("/a/b")), "/a/b/");
        assert_eq!(with_slash(Path::new("/a/b/")), "/a/b/");
    }

    #[tokio::test]
    async fn round_trip_over_duplex() {
        if !binary_on_path("rsync") {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let log = Logger::root(slog::Discard, slog::o!());
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("etc")).unwrap();
        std::fs::write(src.path().join("etc/hostname"), b"alpha\n").unwrap();
        std::fs::write(src.path().join("init"), b"#!/bin/sh\n").unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut send_conn = FsConn::from_stream(a);
        let mut recv_conn = FsConn::from_stream(b);

        let src_path = src.path().to_path_buf();
        let dst_path = dst.path().to_path_buf();
        let send_log = log.clone();
        let sender =
            tokio::spawn(
                async move { rsync_send(&src_path, &mut send_conn, &send_log).await },
            );
        rsync_recv(&dst_path, &mut recv_conn, &log).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(std::fs::read(dst.path().join("etc/hostname")).unwrap(), b"alpha\n");
        assert_eq!(std::fs::read(dst.path().join("init")).unwrap(), b"#!/bin/sh\n");
    }

    #[tokio::test]
    async fn sequential_sessions_share_channel() {
        if !binary_on_path("rsync") {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let log = Logger::root(slog::Discard, slog::o!());
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(one.path().join("a"), b"1").unwrap();
        std::fs::write(two.path().join("b"), b"2").unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut send_conn = FsConn::from_stream(a);
        let mut recv_conn = FsConn::from_stream(b);

        let p1 = one.path().to_path_buf();
        let p2 = two.path().to_path_buf();
        let send_log = log.clone();
        let sender = tokio::spawn(async move {
            rsync_send(&p1, &mut send_conn, &send_log).await?;
            rsync_send(&p2, &mut send_conn, &send_log).await
        });

        let d1 = out.path().join("one");
        let d2 = out.path().join("two");
        std::fs::create_dir_all(&d1).unwrap();
        std::fs::create_dir_all(&d2).unwrap();
        rsync_recv(&d1, &mut recv_conn, &log).await.unwrap();
        rsync_recv(&d2, &mut recv_conn, &log).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(std::fs::read(d1.join("a")).unwrap(), b"1");
        assert_eq!(std::fs::read(d2.join("b")).unwrap(), b"2");
    }
}
