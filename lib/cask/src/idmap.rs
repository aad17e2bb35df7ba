// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UID/GID map translation across user namespaces.
//!
//! A container's files are owned by host ids allocated through the
//! container's id map. When a filesystem moves between hosts the two
//! daemons generally allocate from different host ranges, so the receiver
//! has to re-own every path: host id -> namespace id through the source
//! map, namespace id -> host id through the destination map. The walk is
//! offline; it runs only after the filesystem transfer has completed.

use std::fs;
use std::path::Path;

use nix::sys::stat::{lstat, SFlag};
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdmapError {
    /// Two entries of the same kind claim overlapping namespace ranges.
    #[error("id map entries overlap in namespace ids ({0} and {1})")]
    Overlap(String, String),

    /// A host id resolved through the source map has no allocation in the
    /// destination map.
    #[error("no destination mapping for {kind} {nsid}")]
    Unmapped { kind: IdKind, nsid: i64 },

    #[error("failed to walk {path}: {err}")]
    Walk { path: String, err: std::io::Error },

    #[error("failed to chown {path}: {err}")]
    Chown { path: String, err: nix::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Uid,
    Gid,
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdKind::Uid => write!(f, "uid"),
            IdKind::Gid => write!(f, "gid"),
        }
    }
}

/// One contiguous translation range. An entry may cover uids, gids, or
/// both (the kernel writes such maps as two lines; the wire format carries
/// the flags instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdmapEntry {
    pub isuid: bool,
    pub isgid: bool,
    pub hostid: i64,
    pub nsid: i64,
    pub maprange: i64,
}

impl IdmapEntry {
    fn covers_kind(&self, kind: IdKind) -> bool {
        match kind {
            IdKind::Uid => self.isuid,
            IdKind::Gid => self.isgid,
        }
    }

    fn contains_ns(&self, id: i64) -> bool {
        id >= self.nsid && id < self.nsid + self.maprange
    }

    fn contains_host(&self, id: i64) -> bool {
        id >= self.hostid && id < self.hostid + self.maprange
    }

    /// Namespace-range intersection, considered per kind.
    fn intersects(&self, other: &IdmapEntry) -> bool {
        let same_kind = (self.isuid && other.isuid) || (self.isgid && other.isgid);
        same_kind
            && self.nsid < other.nsid + other.maprange
            && other.nsid < self.nsid + self.maprange
    }

    fn describe(&self) -> String {
        format!(
            "{}{} {}:{}+{}",
            if self.isuid { "u" } else { "" },
            if self.isgid { "g" } else { "" },
            self.nsid,
            self.hostid,
            self.maprange
        )
    }
}

/// An ordered set of translation ranges with non-overlapping namespace
/// ids per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdmapSet {
    entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new() -> IdmapSet {
        IdmapSet::default()
    }

    /// Appends an entry, enforcing the no-overlap invariant.
    pub fn append(&mut self, entry: IdmapEntry) -> Result<(), IdmapError> {
        if let Some(clash) = self.entries.iter().find(|e| e.intersects(&entry)) {
            return Err(IdmapError::Overlap(clash.describe(), entry.describe()));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a host id back to its namespace id.
    pub fn host_to_ns(&self, kind: IdKind, id: i64) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.covers_kind(kind) && e.contains_host(id))
            .map(|e| id - e.hostid + e.nsid)
    }

    /// Resolves a namespace id to the host id this map allocates for it.
    pub fn ns_to_host(&self, kind: IdKind, id: i64) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.covers_kind(kind) && e.contains_ns(id))
            .map(|e| id - e.nsid + e.hostid)
    }

    /// Translates a host id allocated through this map into the
    /// equivalent host id under `dst`.
    ///
    /// Ids outside this map pass through unchanged. An id covered here
    /// but absent from `dst` is an error: continuing would leave the tree
    /// half-owned by a foreign map.
    pub fn translate(&self, dst: &IdmapSet, kind: IdKind, id: i64) -> Result<i64, IdmapError> {
        let nsid = match self.host_to_ns(kind, id) {
            Some(nsid) => nsid,
            None => return Ok(id),
        };
        dst.ns_to_host(kind, nsid)
            .ok_or(IdmapError::Unmapped { kind, nsid })
    }

    /// Re-owns every path under `root` from this (source) map to `dst`.
    ///
    /// Blocking; run it off the reactor. Symlinks are re-owned but never
    /// followed.
    pub fn shift_rootfs(&self, dst: &IdmapSet, root: &Path) -> Result<(), IdmapError> {
        if self.is_empty() {
            return Ok(());
        }
        self.shift_path(dst, root)
    }

    fn shift_path(&self, dst: &IdmapSet, path: &Path) -> Result<(), IdmapError> {
        let display = || path.to_string_lossy().into_owned();
        let st = lstat(path).map_err(|err| IdmapError::Chown { path: display(), err })?;

        let uid = self.translate(dst, IdKind::Uid, st.st_uid as i64)?;
        let gid = self.translate(dst, IdKind::Gid, st.st_gid as i64)?;
        if uid != st.st_uid as i64 || gid != st.st_gid as i64 {
            fchownat(
                None,
                path,
                Some(Uid::from_raw(uid as u32)),
                Some(Gid::from_raw(gid as u32)),
                FchownatFlags::NoFollowSymlink,
            )
            .map_err(|err| IdmapError::Chown { path: display(), err })?;
        }

        // Descend into real directories only; a symlinked directory is
        // handled as the link itself.
        let ftype = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        if ftype == SFlag::S_IFDIR {
            let dir = fs::read_dir(path).map_err(|err| IdmapError::Walk { path: display(), err })?;
            for entry in dir {
                let entry = entry.map_err(|err| IdmapError::Walk { path: display(), err })?;
                self.shift_path(dst, &entry.path())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(isuid: bool, isgid: bool, hostid: i64, nsid: i64, maprange: i64) -> IdmapEntry {
        IdmapEntry { isuid, isgid, hostid, nsid, maprange }
    }

    fn set(entries: Vec<IdmapEntry>) -> IdmapSet {
        let mut s = IdmapSet::new();
        for e in entries {
            s.append(e).unwrap();
        }
        s
    }

    #[test]
    fn append_rejects_ns_overlap() {
        let mut s = IdmapSet::new();
        s.append(entry(true, false, 100000, 0, 65536)).unwrap();
        assert!(s.append(entry(true, false, 300000, 1000, 10)).is_err());
    }

    #[test]
    fn append_allows_overlap_across_kinds() {
        let mut s = IdmapSet::new();
        s.append(entry(true, false, 100000, 0, 65536)).unwrap();
        s.append(entry(false, true, 100000, 0, 65536)).unwrap();
    }

    #[test]
    fn host_ns_resolution() {
        let s = set(vec![entry(true, true, 100000, 0, 65536)]);
        assert_eq!(s.host_to_ns(IdKind::Uid, 100005), Some(5));
        assert_eq!(s.ns_to_host(IdKind::Uid, 5), Some(100005));
        assert_eq!(s.host_to_ns(IdKind::Uid, 99999), None);
        assert_eq!(s.host_to_ns(IdKind::Uid, 165536), None);
    }

    #[test]
    fn translate_between_maps() {
        let src = set(vec![entry(true, true, 100000, 0, 65536)]);
        let dst = set(vec![entry(true, true, 500000, 0, 65536)]);
        assert_eq!(src.translate(&dst, IdKind::Uid, 100123).unwrap(), 500123);
        // Outside the source map: untouched.
        assert_eq!(src.translate(&dst, IdKind::Uid, 42).unwrap(), 42);
    }

    #[test]
    fn translate_requires_destination_coverage() {
        let src = set(vec![entry(true, true, 100000, 0, 65536)]);
        let dst = set(vec![entry(true, true, 500000, 0, 1000)]);
        assert!(src.translate(&dst, IdKind::Uid, 102000).is_err());
    }

    #[test]
    fn translate_round_trip() {
        let src = set(vec![
            entry(true, false, 100000, 0, 65536),
            entry(false, true, 200000, 0, 65536),
        ]);
        let dst = set(vec![
            entry(true, false, 700000, 0, 65536),
            entry(false, true, 800000, 0, 65536),
        ]);
        for id in [100000, 100001, 123456, 165535] {
            let shifted = src.translate(&dst, IdKind::Uid, id).unwrap();
            let back = dst.translate(&src, IdKind::Uid, shifted).unwrap();
            assert_eq!(back, id);
        }
        let shifted = src.translate(&dst, IdKind::Gid, 200007).unwrap();
        assert_eq!(shifted, 800007);
        assert_eq!(dst.translate(&src, IdKind::Gid, shifted).unwrap(), 200007);
    }

    #[test]
    fn shift_walks_identity_map() {
        // An identical source and destination map never changes ownership,
        // so the walk itself can be exercised without privileges.
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file"), b"x").unwrap();
        std::os::unix::fs::symlink("file", dir.path().join("sub/link")).unwrap();

        let me = nix::unistd::getuid().as_raw() as i64;
        let s = set(vec![entry(true, true, me, 0, 1)]);
        s.shift_rootfs(&s.clone(), dir.path()).unwrap();
    }
}
