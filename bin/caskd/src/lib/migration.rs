// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-channel message types.
//!
//! These mirror `proto/migration.proto` (proto2) field for field; the
//! tags, wire types and enum values are the compatibility contract with
//! peer daemons and must never be renumbered. `required` fields always
//! go on the wire, including at their default values, so the encoding
//! stays byte-identical to what a proto2 peer produces.

/// Filesystem transfer formats a storage backend can negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MigrationFsType {
    Rsync = 0,
    Btrfs = 1,
    Zfs = 2,
}

/// Checkpoint image transports. Only `CriuRsync` is implemented; the
/// other values are reserved by the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CriuType {
    CriuRsync = 0,
    Phaul = 1,
    None = 2,
}

/// One uid/gid translation range of the sender's id map.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdMapType {
    #[prost(bool, required, tag = "1")]
    pub isuid: bool,
    #[prost(bool, required, tag = "2")]
    pub isgid: bool,
    #[prost(int32, required, tag = "3")]
    pub hostid: i32,
    #[prost(int32, required, tag = "4")]
    pub nsid: i32,
    #[prost(int32, required, tag = "5")]
    pub maprange: i32,
}

/// A single configuration key/value pair.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Config {
    #[prost(string, required, tag = "1")]
    pub key: String,
    #[prost(string, required, tag = "2")]
    pub value: String,
}

/// A local device attached to the container.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub config: Vec<Config>,
}

/// The self-describing payload for a container or snapshot carried in
/// the handshake. The name excludes the parent container prefix.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Snapshot {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub local_config: Vec<Config>,
    #[prost(string, repeated, tag = "3")]
    pub profiles: Vec<String>,
    #[prost(bool, required, tag = "4")]
    pub ephemeral: bool,
    #[prost(message, repeated, tag = "5")]
    pub local_devices: Vec<Device>,
    #[prost(int32, required, tag = "6")]
    pub architecture: i32,
    #[prost(bool, required, tag = "7")]
    pub stateful: bool,
}

/// The opening handshake, sent once in each direction. The presence of
/// `criu` is what marks a live migration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrationHeader {
    #[prost(enumeration = "MigrationFsType", required, tag = "1")]
    pub fs: i32,
    #[prost(enumeration = "CriuType", optional, tag = "2")]
    pub criu: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub idmap: Vec<IdMapType>,
    #[prost(string, repeated, tag = "4")]
    pub snapshot_names: Vec<String>,
    #[prost(message, repeated, tag = "5")]
    pub snapshots: Vec<Snapshot>,
}

/// The migration verdict. Sending `success == false` also announces the
/// sender's intent to disconnect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MigrationControl {
    #[prost(bool, required, tag = "1")]
    pub success: bool,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}
