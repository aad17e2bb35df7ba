// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core library for the cask container manager.
//!
//! This crate holds the transport-agnostic pieces of the migration core:
//! the container capability consumed by the engines, UID/GID map
//! translation, the storage driver interface (with the universal rsync
//! driver), and the checkpoint-tool launcher. The daemon crate layers the
//! wire protocol and websocket handling on top.

pub mod checkpoint;
pub mod container;
pub mod idmap;
pub mod storage;
