// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The container capability consumed by the migration core.
//!
//! The daemon's container implementation (database-backed, runtime-bound)
//! lives outside this crate; the migration engines only need the view
//! below. Snapshots are containers too, named `parent/snap`.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;

use crate::checkpoint::{CheckpointArgs, RuntimeVersion};
use crate::idmap::IdmapSet;
use crate::storage::StorageDriver;

/// Separator between a container name and a snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container operation failed: {0}")]
    Other(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One local device attached to a container: a name plus ordered
/// key/value configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalDevice {
    pub name: String,
    pub config: Vec<(String, String)>,
}

/// The self-describing payload exchanged for a container or snapshot
/// during the migration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotRecord {
    /// Snapshot name with the parent container prefix stripped.
    pub name: String,
    pub local_config: Vec<(String, String)>,
    pub profiles: Vec<String>,
    pub ephemeral: bool,
    pub local_devices: Vec<LocalDevice>,
    pub architecture: i32,
    pub stateful: bool,
}

/// The view of a container the migration core operates on.
pub trait Container: Send + Sync {
    /// Full name; for snapshots this includes the `parent/` prefix.
    fn name(&self) -> String;

    fn is_running(&self) -> bool;
    fn is_ephemeral(&self) -> bool;
    fn is_stateful(&self) -> bool;
    fn architecture(&self) -> i32;

    fn local_config(&self) -> Vec<(String, String)>;
    fn profiles(&self) -> Vec<String>;
    fn local_devices(&self) -> Vec<LocalDevice>;

    /// The container's snapshots, oldest first. Snapshots of a snapshot
    /// do not exist; for snapshot containers this is empty.
    fn snapshots(&self) -> Result<Vec<Arc<dyn Container>>, ContainerError>;

    /// The id map the container's files are owned through, if any.
    fn idmap(&self) -> Result<Option<IdmapSet>, ContainerError>;

    fn rootfs_path(&self) -> PathBuf;
    fn snapshots_path(&self) -> PathBuf;

    /// The storage backend hosting this container.
    fn storage(&self) -> Arc<dyn StorageDriver>;

    /// Mount the container's storage. Required before a stopped
    /// container's filesystem can be read.
    fn storage_start(&self) -> Result<(), ContainerError>;
    fn storage_stop(&self) -> Result<(), ContainerError>;

    /// Remove the container and everything under it.
    fn delete(&self) -> Result<(), ContainerError>;

    /// Re-run the container's file templates for the given trigger.
    fn apply_templates(&self, trigger: &str) -> Result<(), ContainerError>;

    /// Builds the checkpoint-tool invocation for this container. The
    /// caller owns spawning and supervision.
    fn checkpoint_command(&self, args: &CheckpointArgs) -> Command;

    /// Version of the container runtime's checkpoint integration.
    fn runtime_version(&self) -> RuntimeVersion;
}

/// Splits `parent/snap` into the parent name and the snapshot part.
pub fn split_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// Builds the handshake descriptor for a container or snapshot. The
/// descriptor name never carries the parent prefix.
pub fn snapshot_record(c: &dyn Container) -> SnapshotRecord {
    let name = c.name();
    let (_, snap) = split_snapshot_name(&name);
    let short = snap.unwrap_or(&name).to_string();

    SnapshotRecord {
        name: short,
        local_config: c.local_config(),
        profiles: c.profiles(),
        ephemeral: c.is_ephemeral(),
        local_devices: c.local_devices(),
        architecture: c.architecture(),
        stateful: c.is_stateful(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_names() {
        assert_eq!(split_snapshot_name("alpha/snap0"), ("alpha", Some("snap0")));
        assert_eq!(split_snapshot_name("alpha"), ("alpha", None));
        // Only the first delimiter splits.
        assert_eq!(split_snapshot_name("a/b/c"), ("a", Some("b/c")));
    }
}
