// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use flate2::read::MultiGzDecoder;
use regex::Regex;
use tracing::{debug, warn};

use super::event::{FileDescriptor, FileInfo};
use crate::config::{Compression, ScannerConfig};
use crate::error::{Error, Result};
use crate::identity::{FileId, compute_fingerprint};

/// Depth to which a `**` glob segment is expanded
pub const RECURSIVE_GLOB_DEPTH: usize = 8;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Resolved scanner settings
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub exclude: Vec<Regex>,
    pub include: Vec<Regex>,
    pub symlinks: bool,
    pub recursive_glob: bool,
    /// `(offset, length)` of the fingerprint window
    pub fingerprint: Option<(u64, u64)>,
    pub compression: Compression,
}

impl ScannerSettings {
    pub fn from_config(cfg: &ScannerConfig, compression: Compression) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(Error::from))
                .collect()
        };

        Ok(Self {
            exclude: compile(&cfg.exclude_files)?,
            include: compile(&cfg.include_files)?,
            symlinks: cfg.symlinks,
            recursive_glob: cfg.recursive_glob,
            fingerprint: cfg
                .fingerprint
                .enabled
                .then_some((cfg.fingerprint.offset, cfg.fingerprint.length)),
            compression,
        })
    }
}

/// Produces a snapshot of the files matching a set of glob patterns
#[derive(Debug, Clone)]
pub struct Scanner {
    patterns: Vec<String>,
    settings: ScannerSettings,
}

impl Scanner {
    pub fn new(paths: &[String], settings: ScannerSettings) -> Result<Self> {
        let mut patterns = Vec::new();
        for path in paths {
            let absolute = make_absolute(path)?;
            let expanded = if settings.recursive_glob {
                expand_recursive_glob(&absolute)?
            } else {
                vec![absolute]
            };
            for pattern in expanded {
                glob::Pattern::new(&pattern)
                    .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
                if !patterns.contains(&pattern) {
                    patterns.push(pattern);
                }
            }
        }

        Ok(Self { patterns, settings })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Snapshot of all matching files keyed by path.
    ///
    /// Directories, excluded paths, files below the fingerprint window and
    /// duplicate file identities are left out.
    pub fn scan(&self) -> BTreeMap<PathBuf, FileDescriptor> {
        let mut found: BTreeMap<PathBuf, FileDescriptor> = BTreeMap::new();
        let mut seen_names = HashSet::new();
        let mut too_small = 0usize;

        for pattern in &self.patterns {
            let matches = match glob::glob(pattern) {
                Ok(m) => m,
                Err(e) => {
                    warn!(pattern, error = %e, "Invalid glob pattern");
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(error = %e, "Glob match is not readable");
                        continue;
                    }
                };
                if !seen_names.insert(path.clone()) {
                    continue;
                }

                match self.describe(&path) {
                    Ok(Some(fd)) => {
                        found.insert(path, fd);
                    }
                    Ok(None) => {}
                    Err(ScanSkip::TooSmall) => too_small += 1,
                    Err(ScanSkip::Io(e)) => {
                        warn!(path = ?path, error = %e, "Failed to read file metadata");
                    }
                }
            }
        }

        if too_small > 0 {
            if let Some((offset, length)) = self.settings.fingerprint {
                warn!(
                    count = too_small,
                    min_size = offset + length,
                    "Files are too small to be fingerprinted and are ignored until they grow"
                );
            }
        }

        dedupe_by_file_id(found)
    }

    /// Describe one file the way a scan would.
    pub fn describe_file(&self, path: &Path) -> Result<FileDescriptor> {
        match self.describe(path) {
            Ok(Some(fd)) => Ok(fd),
            Ok(None) => Err(Error::ResourceNotFound(path.display().to_string())),
            Err(ScanSkip::TooSmall) => {
                let (offset, length) = self.settings.fingerprint.unwrap_or_default();
                let size = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
                Err(Error::FileTooSmall {
                    path: path.to_path_buf(),
                    size,
                    min_size: offset + length,
                })
            }
            Err(ScanSkip::Io(e)) => Err(e.into()),
        }
    }

    fn describe(&self, path: &Path) -> std::result::Result<Option<FileDescriptor>, ScanSkip> {
        if self.is_excluded(path) {
            debug!(path = ?path, "Skipping excluded file");
            return Ok(None);
        }

        let lstat = fs::symlink_metadata(path)?;
        if lstat.is_dir() {
            return Ok(None);
        }

        let is_symlink = lstat.file_type().is_symlink();
        let (meta, original) = if is_symlink {
            if !self.settings.symlinks {
                debug!(path = ?path, "Skipping symlink, symlinks are disabled");
                return Ok(None);
            }
            let meta = fs::metadata(path)?;
            if meta.is_dir() {
                return Ok(None);
            }
            let original = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            if self.is_excluded(&original) {
                debug!(path = ?path, target = ?original, "Skipping symlink to excluded file");
                return Ok(None);
            }
            (meta, original)
        } else {
            (lstat, path.to_path_buf())
        };

        let mut info = FileInfo::new(meta.len(), mod_time(&meta), FileId::for_path(&original, &meta)?);
        info.is_symlink = is_symlink;

        let mut fd = FileDescriptor::new(path, info);
        fd.gzip = match self.settings.compression {
            Compression::None => false,
            Compression::Gzip => true,
            Compression::Auto => is_gzip(&original)?,
        };

        if let Some((offset, length)) = self.settings.fingerprint {
            if !fd.gzip && fd.info.size < offset + length {
                return Err(ScanSkip::TooSmall);
            }
            let file = File::open(&original)?;
            let result = if fd.gzip {
                compute_fingerprint(MultiGzDecoder::new(BufReader::new(file)), offset, length)
            } else {
                compute_fingerprint(BufReader::new(file), offset, length)
            };
            match result {
                Ok(fp) => fd.fingerprint = Some(fp),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(ScanSkip::TooSmall);
                }
                Err(e) => return Err(ScanSkip::Io(e)),
            }
        }

        Ok(Some(fd))
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        if self.settings.exclude.iter().any(|r| r.is_match(&name)) {
            return true;
        }
        !self.settings.include.is_empty() && !self.settings.include.iter().any(|r| r.is_match(&name))
    }
}

enum ScanSkip {
    TooSmall,
    Io(io::Error),
}

impl From<io::Error> for ScanSkip {
    fn from(e: io::Error) -> Self {
        ScanSkip::Io(e)
    }
}

fn mod_time(meta: &Metadata) -> SystemTime {
    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Drop descriptors sharing a file identity, preferring the real file over a symlink.
fn dedupe_by_file_id(
    found: BTreeMap<PathBuf, FileDescriptor>,
) -> BTreeMap<PathBuf, FileDescriptor> {
    let mut by_id: HashMap<String, PathBuf> = HashMap::new();
    let mut result = BTreeMap::new();

    for (path, fd) in found {
        let id = fd.file_id();
        match by_id.get(&id) {
            None => {
                by_id.insert(id, path.clone());
                result.insert(path, fd);
            }
            Some(kept) => {
                let kept_is_symlink = result
                    .get(kept)
                    .is_some_and(|k: &FileDescriptor| k.info.is_symlink);
                if kept_is_symlink && !fd.info.is_symlink {
                    warn!(path = ?kept, duplicate_of = ?path, "Dropping duplicate file");
                    result.remove(kept);
                    by_id.insert(id, path.clone());
                    result.insert(path, fd);
                } else {
                    warn!(path = ?path, duplicate_of = ?kept, "Dropping duplicate file");
                }
            }
        }
    }

    result
}

fn make_absolute(pattern: &str) -> Result<String> {
    let path = Path::new(pattern);
    if path.is_absolute() {
        return Ok(pattern.to_string());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path).to_string_lossy().into_owned())
}

/// Expand a `**` segment into patterns descending up to [`RECURSIVE_GLOB_DEPTH`] levels.
fn expand_recursive_glob(pattern: &str) -> Result<Vec<String>> {
    let path = Path::new(pattern);
    let mut prefix = PathBuf::new();
    let mut rest: Option<PathBuf> = None;

    for component in path.components() {
        if let Some(rest) = rest.as_mut() {
            rest.push(component);
            continue;
        }
        match component {
            Component::Normal(part) if part == "**" => rest = Some(PathBuf::new()),
            Component::Normal(part) if part.to_string_lossy().contains("**") => {
                return Err(Error::InvalidGlob(format!(
                    "{}: recursive glob must be a path segment of its own",
                    pattern
                )));
            }
            _ => prefix.push(component),
        }
    }

    let Some(rest) = rest else {
        return Ok(vec![pattern.to_string()]);
    };
    if rest.to_string_lossy().contains("**") {
        return Err(Error::InvalidGlob(format!(
            "{}: at most one recursive glob is supported",
            pattern
        )));
    }

    let mut expanded = Vec::with_capacity(RECURSIVE_GLOB_DEPTH + 1);
    let mut dir = prefix;
    for _ in 0..=RECURSIVE_GLOB_DEPTH {
        let candidate = if rest.as_os_str().is_empty() {
            dir.join("*")
        } else {
            dir.join(&rest)
        };
        expanded.push(candidate.to_string_lossy().into_owned());
        dir.push("*");
    }
    Ok(expanded)
}
