// SPDX-License-Identifier: Apache-2.0

//! Source identity strategies.
//!
//! A [`FileIdentifier`] turns the metadata carried by a watcher event into a
//! stable [`FileSource`]. The identity string is the suffix of the store key
//! under which the source's cursor lives, so two events that resolve to the
//! same identity share one cursor.
//!
//! Strategies:
//! - `native`: device and inode, survives renames.
//! - `path`: absolute path, a rename starts a new source.
//! - `fingerprint`: hash of a byte window of the content, survives renames.
//! - `inode_marker`: inode plus the content of a marker file, survives renames.
//!
//! Any strategy can be wrapped with a suffix to namespace identities.

mod file_id;
mod fingerprint;
mod inode_marker;

pub use file_id::FileId;
pub use fingerprint::{FingerprintIdentifier, SHA256_BLOCK_SIZE, compute_fingerprint};
pub use inode_marker::InodeMarkerIdentifier;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::IdentityConfig;
use crate::error::{Error, Result};
use crate::watcher::{FileDescriptor, FsEvent, Operation};

pub const NATIVE: &str = "native";
pub const PATH: &str = "path";
pub const FINGERPRINT: &str = "fingerprint";
pub const INODE_MARKER: &str = "inode_marker";

/// Separator between the identifier name and the identity value.
pub const IDENTITY_SEP: &str = "::";

/// Optional behaviour an identifier may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The identity of a file is kept when the file is renamed.
    TrackRename,
}

/// A logical file as seen by the prospector, the store and the harvesters.
#[derive(Debug, Clone)]
pub struct FileSource {
    /// `<identifier>::<identity>[-<suffix>]`
    name: String,
    pub new_path: Option<PathBuf>,
    pub old_path: Option<PathBuf>,
    pub truncated: bool,
    pub archived: bool,
    pub identifier_name: &'static str,
    pub descriptor: FileDescriptor,
}

impl FileSource {
    fn from_event(identifier_name: &'static str, identity: &str, event: &FsEvent) -> Self {
        Self {
            name: format!("{}{}{}", identifier_name, IDENTITY_SEP, identity),
            new_path: event.new_path.clone(),
            old_path: event.old_path.clone(),
            truncated: event.op == Operation::Truncate,
            archived: event.op == Operation::Archived || event.descriptor.gzip,
            identifier_name,
            descriptor: event.descriptor.clone(),
        }
    }

    /// The identity string, used as the suffix of the store key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the harvester should open.
    pub fn path(&self) -> Option<&PathBuf> {
        self.new_path.as_ref().or(self.old_path.as_ref())
    }
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Strategy that derives a [`FileSource`] from a watcher event.
pub trait FileIdentifier: Send + Sync {
    fn get_source(&self, event: &FsEvent) -> FileSource;

    fn name(&self) -> &'static str;

    fn supports(&self, capability: Capability) -> bool;
}

/// Identity based on device and inode.
#[derive(Debug, Default)]
pub struct NativeIdentifier;

impl FileIdentifier for NativeIdentifier {
    fn get_source(&self, event: &FsEvent) -> FileSource {
        let identity = event.descriptor.info.file_id.to_string();
        FileSource::from_event(NATIVE, &identity, event)
    }

    fn name(&self) -> &'static str {
        NATIVE
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::TrackRename)
    }
}

/// Identity based on the absolute path of the file.
#[derive(Debug, Default)]
pub struct PathIdentifier;

impl FileIdentifier for PathIdentifier {
    fn get_source(&self, event: &FsEvent) -> FileSource {
        let path = if event.op == Operation::Delete {
            event.old_path.as_ref()
        } else {
            event.new_path.as_ref()
        };
        let identity = path.map(|p| p.display().to_string()).unwrap_or_default();
        FileSource::from_event(PATH, &identity, event)
    }

    fn name(&self) -> &'static str {
        PATH
    }

    fn supports(&self, _capability: Capability) -> bool {
        false
    }
}

/// Appends `-<suffix>` to the identity of the wrapped identifier.
pub struct WithSuffix {
    inner: Arc<dyn FileIdentifier>,
    suffix: String,
}

impl WithSuffix {
    pub fn new(inner: Arc<dyn FileIdentifier>, suffix: impl Into<String>) -> Self {
        Self {
            inner,
            suffix: suffix.into(),
        }
    }
}

impl FileIdentifier for WithSuffix {
    fn get_source(&self, event: &FsEvent) -> FileSource {
        let mut src = self.inner.get_source(event);
        src.name = format!("{}-{}", src.name, self.suffix);
        src
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn supports(&self, capability: Capability) -> bool {
        self.inner.supports(capability)
    }
}

/// Builds the store key prefix `<input-type>::<input-id or .global>::` for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentifier {
    prefix: String,
}

impl SourceIdentifier {
    pub fn new(input_type: &str, input_id: Option<&str>) -> Self {
        let id = match input_id {
            Some(id) if !id.is_empty() => id,
            _ => ".global",
        };
        Self {
            prefix: format!("{}{}{}{}", input_type, IDENTITY_SEP, id, IDENTITY_SEP),
        }
    }

    /// Full store key of `src`.
    pub fn id(&self, src: &FileSource) -> String {
        format!("{}{}", self.prefix, src.name())
    }

    /// Whether a store key belongs to this input.
    pub fn matches_input(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

type IdentifierFactory = fn(&IdentityConfig) -> Result<Arc<dyn FileIdentifier>>;

/// Maps identifier names to constructors.
///
/// Built once at start-up and handed to every input.
#[derive(Clone)]
pub struct IdentifierRegistry {
    factories: HashMap<&'static str, IdentifierFactory>,
}

impl IdentifierRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(NATIVE, |_| Ok(Arc::new(NativeIdentifier)));
        registry.register(PATH, |_| Ok(Arc::new(PathIdentifier)));
        registry.register(FINGERPRINT, |_| Ok(Arc::new(FingerprintIdentifier)));
        registry.register(INODE_MARKER, |cfg| {
            let path = cfg.inode_marker_path.clone().ok_or_else(|| {
                Error::Config("file_identity inode_marker requires inode_marker_path".to_string())
            })?;
            Ok(Arc::new(InodeMarkerIdentifier::new(path)?))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: IdentifierFactory) {
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the identifier described by `cfg`, applying the suffix decorator if set.
    pub fn build(&self, cfg: &IdentityConfig) -> Result<Arc<dyn FileIdentifier>> {
        let factory = self
            .factories
            .get(cfg.kind.as_str())
            .ok_or_else(|| Error::UnknownIdentifier(cfg.kind.clone()))?;
        let identifier = factory(cfg)?;

        match cfg.suffix.as_deref() {
            Some(suffix) if !suffix.is_empty() => Ok(Arc::new(WithSuffix::new(identifier, suffix))),
            _ => Ok(identifier),
        }
    }

    /// Build an identifier by name with default settings. Used by registry
    /// migrations that need to recompute keys of a previous identity.
    pub fn build_by_name(&self, name: &str) -> Option<Arc<dyn FileIdentifier>> {
        let cfg = IdentityConfig {
            kind: name.to_string(),
            ..IdentityConfig::default()
        };
        self.build(&cfg).ok()
    }
}

impl Default for IdentifierRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
