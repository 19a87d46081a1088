// SPDX-License-Identifier: Apache-2.0

//! Events emitted by the file watcher and the file metadata they carry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::identity::FileId;

/// Kind of change detected between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Write,
    Truncate,
    Rename,
    Delete,
    /// A newly discovered compressed file, read once to EOF.
    Archived,
    /// The file did not change since the previous scan.
    NotChanged,
    /// No more events will follow.
    Done,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Write => "write",
            Operation::Truncate => "truncate",
            Operation::Rename => "rename",
            Operation::Delete => "delete",
            Operation::Archived => "archive",
            Operation::NotChanged => "not_changed",
            Operation::Done => "done",
        };
        f.write_str(s)
    }
}

/// Subset of the file metadata the watcher compares between scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub mod_time: SystemTime,
    pub file_id: FileId,
    pub is_symlink: bool,
}

impl FileInfo {
    pub fn new(size: u64, mod_time: SystemTime, file_id: FileId) -> Self {
        Self {
            size,
            mod_time,
            file_id,
            is_symlink: false,
        }
    }
}

/// Everything the scanner learned about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub filename: PathBuf,
    pub info: FileInfo,
    /// Hex encoded sha256 of the fingerprint window, when fingerprinting is enabled.
    pub fingerprint: Option<String>,
    pub gzip: bool,
    bytes_ingested: Option<u64>,
}

impl FileDescriptor {
    pub fn new(filename: impl Into<PathBuf>, info: FileInfo) -> Self {
        Self {
            filename: filename.into(),
            info,
            fingerprint: None,
            gzip: false,
            bytes_ingested: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Key used to pair vanished and new paths during rename detection.
    pub fn file_id(&self) -> String {
        match &self.fingerprint {
            Some(fp) => fp.clone(),
            None => self.info.file_id.to_string(),
        }
    }

    /// Record how many bytes a closed harvester consumed from this file.
    pub fn set_bytes_ingested(&mut self, n: u64) {
        self.bytes_ingested = Some(n);
    }

    pub fn size_or_bytes_ingested(&self) -> u64 {
        self.bytes_ingested.unwrap_or(self.info.size)
    }
}

/// Whether two descriptors point at the same underlying file.
///
/// Fingerprints win when both sides have one, otherwise device and inode decide.
pub fn same_file(a: &FileDescriptor, b: &FileDescriptor) -> bool {
    match (&a.fingerprint, &b.fingerprint) {
        (Some(fa), Some(fb)) => fa == fb,
        _ => a.info.file_id == b.info.file_id,
    }
}

/// A single filesystem change as seen by the watcher.
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub op: Operation,
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
    pub descriptor: FileDescriptor,
    /// Store key of the source this event belongs to.
    pub src_id: String,
}

impl FsEvent {
    pub fn create(path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        let op = if descriptor.gzip {
            Operation::Archived
        } else {
            Operation::Create
        };
        Self {
            op,
            old_path: None,
            new_path: Some(path.to_path_buf()),
            descriptor,
            src_id,
        }
    }

    pub fn write(path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self::in_place(Operation::Write, path, descriptor, src_id)
    }

    pub fn truncate(path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self::in_place(Operation::Truncate, path, descriptor, src_id)
    }

    pub fn not_changed(path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self::in_place(Operation::NotChanged, path, descriptor, src_id)
    }

    pub fn rename(old: &Path, new: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self {
            op: Operation::Rename,
            old_path: Some(old.to_path_buf()),
            new_path: Some(new.to_path_buf()),
            descriptor,
            src_id,
        }
    }

    pub fn delete(path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self {
            op: Operation::Delete,
            old_path: Some(path.to_path_buf()),
            new_path: None,
            descriptor,
            src_id,
        }
    }

    /// Event built from a path and descriptor only, used to derive source identities
    /// outside of a scan.
    pub fn from_descriptor(path: &Path, descriptor: FileDescriptor) -> Self {
        Self {
            op: Operation::Create,
            old_path: None,
            new_path: Some(path.to_path_buf()),
            descriptor,
            src_id: String::new(),
        }
    }

    pub fn done() -> Self {
        Self {
            op: Operation::Done,
            old_path: None,
            new_path: None,
            descriptor: FileDescriptor::new(
                PathBuf::new(),
                FileInfo::new(0, SystemTime::UNIX_EPOCH, FileId::new(0, 0)),
            ),
            src_id: String::new(),
        }
    }

    fn in_place(op: Operation, path: &Path, descriptor: FileDescriptor, src_id: String) -> Self {
        Self {
            op,
            old_path: Some(path.to_path_buf()),
            new_path: Some(path.to_path_buf()),
            descriptor,
            src_id,
        }
    }
}

/// Reported by the harvester coordinator when a harvester exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvesterStatus {
    /// Store key of the source.
    pub id: String,
    /// Bytes ingested when the harvester closed.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(ino: u64, fingerprint: Option<&str>) -> FileDescriptor {
        let mut fd = FileDescriptor::new(
            "/var/log/app.log",
            FileInfo::new(10, SystemTime::UNIX_EPOCH, FileId::new(1, ino)),
        );
        fd.fingerprint = fingerprint.map(str::to_string);
        fd
    }

    #[test]
    fn test_same_file_prefers_fingerprints() {
        assert!(same_file(&descriptor(1, None), &descriptor(1, None)));
        assert!(!same_file(&descriptor(1, None), &descriptor(2, None)));
        assert!(same_file(&descriptor(1, Some("aa")), &descriptor(2, Some("aa"))));
        assert!(!same_file(&descriptor(1, Some("aa")), &descriptor(1, Some("bb"))));
    }

    #[test]
    fn test_bytes_ingested_overrides_size() {
        let mut fd = descriptor(1, None);
        assert_eq!(10, fd.size_or_bytes_ingested());
        fd.set_bytes_ingested(4);
        assert_eq!(4, fd.size_or_bytes_ingested());
    }

    #[test]
    fn test_operation_vocabulary() {
        let ops = [
            Operation::Create,
            Operation::Write,
            Operation::Delete,
            Operation::Rename,
            Operation::Truncate,
            Operation::Archived,
            Operation::Done,
        ];
        let names: Vec<String> = ops.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            vec!["create", "write", "delete", "rename", "truncate", "archive", "done"],
            names
        );
    }
}
