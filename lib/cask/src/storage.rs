// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage driver capability the migration core consumes.
//!
//! A backend that can interoperate bit-for-bit with its peer streams its
//! native format over the filesystem channel; any mismatch makes both
//! sides fall back to [`rsync::RsyncDriver`], which every installation
//! ships. Drivers never see websockets, only the byte-stream halves in
//! [`FsConn`].

pub mod rsync;

use std::sync::Arc;

use async_trait::async_trait;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use slog::Logger;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::container::{Container, ContainerError, SnapshotRecord};
use crate::idmap::IdmapSet;

/// Filesystem transfer formats, by wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FsType {
    Rsync = 0,
    Btrfs = 1,
    Zfs = 2,
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsType::Rsync => write!(f, "rsync"),
            FsType::Btrfs => write!(f, "btrfs"),
            FsType::Zfs => write!(f, "zfs"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} exited with {status}")]
    ToolFailed { tool: &'static str, status: std::process::ExitStatus },

    #[error("storage driver does not support {0}")]
    Unsupported(String),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// The two byte-stream halves of a bulk transfer channel. The daemon
/// builds these from a websocket; tests build them from in-memory pipes.
pub struct FsConn {
    pub rx: Box<dyn AsyncRead + Send + Unpin>,
    pub tx: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FsConn {
    pub fn new(
        rx: Box<dyn AsyncRead + Send + Unpin>,
        tx: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> FsConn {
        FsConn { rx, tx }
    }

    /// Splits a duplex byte stream into a transfer connection.
    pub fn from_stream<S>(stream: S) -> FsConn
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rx, tx) = tokio::io::split(stream);
        FsConn { rx: Box::new(rx), tx: Box::new(tx) }
    }
}

/// A storage backend, instantiated per migration.
pub trait StorageDriver: Send + Sync {
    /// The transfer format this backend speaks natively.
    fn fs_type(&self) -> FsType;

    /// Whether the backend's transfer preserves inode numbers. Exposed
    /// for the checkpoint tool's benefit; live migration on a backend
    /// that answers false has known correctness issues.
    fn preserves_inodes(&self) -> bool;

    /// Builds the sending side for one container.
    fn migration_source(
        &self,
        container: Arc<dyn Container>,
        log: &Logger,
    ) -> Result<Box<dyn SourceDriver>, StorageError>;

    /// Builds the receiving side.
    fn migration_sink(&self, log: &Logger) -> Box<dyn SinkDriver>;
}

/// The sending half of a storage migration.
#[async_trait]
pub trait SourceDriver: Send {
    /// Snapshot containers to be carried along, oldest first.
    fn snapshots(&self) -> Vec<Arc<dyn Container>>;

    /// Streams snapshots and the container filesystem. For a running
    /// container the tree may still be changing underneath; the deltas
    /// are picked up by [`SourceDriver::send_after_checkpoint`].
    async fn send_while_running(&mut self, conn: &mut FsConn) -> Result<(), StorageError>;

    /// Streams whatever changed since `send_while_running`, after the
    /// checkpoint tool froze the container.
    async fn send_after_checkpoint(&mut self, conn: &mut FsConn) -> Result<(), StorageError>;

    /// Releases anything the transfer pinned. Called exactly once,
    /// success or failure.
    async fn cleanup(&mut self);
}

pub struct SinkArgs<'a> {
    pub live: bool,
    pub container: Arc<dyn Container>,
    /// Descriptors for the snapshots the source will stream, in order.
    pub snapshots: Vec<SnapshotRecord>,
    pub conn: &'a mut FsConn,
    /// The sender's id map; some backends need it to interpret the
    /// stream. Ownership shifting itself happens after the receive.
    pub src_idmap: IdmapSet,
}

/// The receiving half of a storage migration.
#[async_trait]
pub trait SinkDriver: Send {
    async fn receive(&mut self, args: SinkArgs<'_>) -> Result<(), StorageError>;
}
