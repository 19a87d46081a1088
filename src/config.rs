// SPDX-License-Identifier: Apache-2.0

//! Configuration for the harvesting engine.
//!
//! All durations are expressed as integer milliseconds (`*_ms` fields) so the
//! same structs load from JSON files and `LOGHARVEST_` environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::{FINGERPRINT, SHA256_BLOCK_SIZE};
use crate::watcher::WatchMode;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        for input in &self.inputs {
            input
                .validate()
                .map_err(|e| format!("input {}: {}", input.display_id(), e))?;
        }
        self.registry.validate()
    }
}

/// Reject configurations in which two inputs share an ID.
pub fn ensure_unique_ids(inputs: &[InputConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for id in inputs.iter().filter_map(|i| i.id.as_deref()) {
        if !id.is_empty() && !seen.insert(id) {
            return Err(Error::DuplicateInputId(id.to_string()));
        }
    }
    Ok(())
}

/// Location and housekeeping of the persistent registry
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry file holding the cursor states
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// How often the cleaner scans for expired entries
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Upper bound for flushing scheduled updates on shutdown
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("registry path must not be empty".to_string());
        }
        if self.cleanup_interval_ms == 0 {
            return Err("registry cleanup_interval_ms must be positive".to_string());
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Identity strategy of an input
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// One of `native`, `path`, `fingerprint`, `inode_marker`
    #[serde(default = "default_identity_kind")]
    pub kind: String,

    /// Appended to every identity as `-<suffix>`
    #[serde(default)]
    pub suffix: Option<String>,

    /// Marker file read by the `inode_marker` identity
    #[serde(default)]
    pub inode_marker_path: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            kind: default_identity_kind(),
            suffix: None,
            inode_marker_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub offset: u64,

    #[serde(default = "default_fingerprint_length")]
    pub length: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offset: 0,
            length: default_fingerprint_length(),
        }
    }
}

/// File discovery settings
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Regular expressions matched against file paths to skip
    #[serde(default)]
    pub exclude_files: Vec<String>,

    /// When non-empty only paths matching one of these are kept
    #[serde(default)]
    pub include_files: Vec<String>,

    /// Follow symbolic links
    #[serde(default)]
    pub symlinks: bool,

    /// Expand `**` in glob patterns
    #[serde(default = "default_true")]
    pub recursive_glob: bool,

    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    /// Interval between two scans
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Report a truncate when a file is touched without changing its size
    #[serde(default)]
    pub resend_on_touch: bool,

    #[serde(default)]
    pub watch_mode: WatchMode,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            exclude_files: Vec::new(),
            include_files: Vec::new(),
            symlinks: false,
            recursive_glob: true,
            fingerprint: FingerprintConfig::default(),
            check_interval_ms: default_check_interval_ms(),
            resend_on_touch: false,
            watch_mode: WatchMode::default(),
        }
    }
}

impl ScannerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Ordering applied to rotated companions of a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKind {
    /// `app.log.1` is newer than `app.log.2`
    #[default]
    Numeric,
    /// Suffix is a timestamp in `date_format`
    Date,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SortConfig {
    #[serde(default)]
    pub kind: SortKind,

    /// chrono format string, required when `kind` is `date`
    #[serde(default)]
    pub date_format: Option<String>,
}

/// Copy-truncate rotation awareness
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// Matches the suffix a rotated file carries, e.g. `\.\d+$`
    pub suffix_regex: String,

    #[serde(default)]
    pub sort: SortConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreInactive {
    SinceFirstStart,
    SinceLastStart,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateChangeCloseConfig {
    /// Close a harvester that read nothing for this long
    #[serde(default = "default_close_inactive_ms")]
    pub inactive_ms: u64,

    #[serde(default = "default_true")]
    pub removed: bool,

    #[serde(default)]
    pub renamed: bool,
}

impl Default for StateChangeCloseConfig {
    fn default() -> Self {
        Self {
            inactive_ms: default_close_inactive_ms(),
            removed: true,
            renamed: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReaderCloseConfig {
    #[serde(default)]
    pub on_eof: bool,

    /// Close after this long regardless of activity, 0 disables
    #[serde(default)]
    pub after_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloseConfig {
    #[serde(default)]
    pub on_state_change: StateChangeCloseConfig,

    #[serde(default)]
    pub reader: ReaderCloseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_init_ms")]
    pub init_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_ms: default_backoff_init_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    /// Detect gzip by its magic bytes
    Auto,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TakeOverConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Inputs whose registry entries are adopted, empty means ID-less inputs
    #[serde(default)]
    pub from_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

/// One log input: a set of paths sharing identity and cursor settings
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Unique input ID, part of every registry key of this input
    #[serde(default)]
    pub id: Option<String>,

    /// Glob patterns of files to harvest
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub file_identity: IdentityConfig,

    /// Enables copy-truncate rotation handling
    #[serde(default)]
    pub rotation: Option<RotationConfig>,

    /// Skip files not modified for this long, 0 disables
    #[serde(default)]
    pub ignore_older_ms: u64,

    #[serde(default)]
    pub ignore_inactive: Option<IgnoreInactive>,

    /// Registry entries not updated for this long are removed, unset keeps them forever
    #[serde(default)]
    pub clean_inactive_ms: Option<u64>,

    /// Remove registry entries of files that disappeared
    #[serde(default = "default_true")]
    pub clean_removed: bool,

    #[serde(default)]
    pub close: CloseConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Maximum number of concurrently running harvesters, 0 means unlimited
    #[serde(default)]
    pub harvester_limit: usize,

    /// Lines longer than this are truncated
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub take_over: TakeOverConfig,

    #[serde(default)]
    pub delete: DeleteConfig,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            id: None,
            paths: Vec::new(),
            scanner: ScannerConfig::default(),
            file_identity: IdentityConfig::default(),
            rotation: None,
            ignore_older_ms: 0,
            ignore_inactive: None,
            clean_inactive_ms: None,
            clean_removed: true,
            close: CloseConfig::default(),
            backoff: BackoffConfig::default(),
            harvester_limit: 0,
            max_bytes: default_max_bytes(),
            compression: Compression::default(),
            take_over: TakeOverConfig::default(),
            delete: DeleteConfig::default(),
        }
    }
}

impl InputConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.paths.is_empty() {
            return Err("at least one path must be specified".to_string());
        }

        let fp = &self.scanner.fingerprint;
        if fp.enabled && fp.length < SHA256_BLOCK_SIZE {
            return Err(format!(
                "fingerprint length must be at least {} bytes, got {}",
                SHA256_BLOCK_SIZE, fp.length
            ));
        }
        if self.file_identity.kind == FINGERPRINT && !fp.enabled {
            return Err(
                "file_identity fingerprint requires scanner.fingerprint.enabled".to_string(),
            );
        }

        if self.scanner.check_interval_ms == 0 {
            return Err("scanner check_interval_ms must be positive".to_string());
        }

        if let Some(clean_inactive) = self.clean_inactive_ms {
            if clean_inactive <= self.ignore_older_ms + self.scanner.check_interval_ms {
                return Err(
                    "clean_inactive must be greater than ignore_older + check_interval"
                        .to_string(),
                );
            }
        }

        if self.backoff.init_ms == 0 || self.backoff.init_ms > self.backoff.max_ms {
            return Err("backoff init_ms must be positive and not exceed max_ms".to_string());
        }

        if self.max_bytes == 0 {
            return Err("max_bytes must be positive".to_string());
        }

        if let Some(rotation) = &self.rotation {
            Regex::new(&rotation.suffix_regex)
                .map_err(|e| format!("invalid rotation suffix_regex: {}", e))?;
            if rotation.sort.kind == SortKind::Date && rotation.sort.date_format.is_none() {
                return Err("rotation sort kind date requires date_format".to_string());
            }
        }

        for pattern in self
            .scanner
            .exclude_files
            .iter()
            .chain(self.scanner.include_files.iter())
        {
            Regex::new(pattern).map_err(|e| format!("invalid file filter {}: {}", pattern, e))?;
        }

        Ok(())
    }

    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or(".global")
    }

    pub fn ignore_older(&self) -> Option<Duration> {
        (self.ignore_older_ms > 0).then(|| Duration::from_millis(self.ignore_older_ms))
    }

    /// TTL applied to the registry entries of this input. `None` never expires.
    pub fn clean_inactive(&self) -> Option<Duration> {
        self.clean_inactive_ms.map(Duration::from_millis)
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/registry.json")
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_flush_timeout_ms() -> u64 {
    2000
}

fn default_identity_kind() -> String {
    FINGERPRINT.to_string()
}

fn default_fingerprint_length() -> u64 {
    1024
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_close_inactive_ms() -> u64 {
    5 * 60 * 1000
}

fn default_backoff_init_ms() -> u64 {
    2000
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: Option<&str>) -> InputConfig {
        InputConfig {
            id: id.map(str::to_string),
            paths: vec!["/var/log/*.log".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: InputConfig = serde_json::from_str(r#"{"paths": ["/tmp/*.log"]}"#).unwrap();
        assert_eq!(FINGERPRINT, cfg.file_identity.kind);
        assert!(cfg.scanner.fingerprint.enabled);
        assert_eq!(1024, cfg.scanner.fingerprint.length);
        assert!(cfg.scanner.recursive_glob);
        assert!(cfg.clean_removed);
        assert!(cfg.close.on_state_change.removed);
        assert_eq!(None, cfg.clean_inactive());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_nested_fields_from_json() {
        let cfg: InputConfig = serde_json::from_str(
            r#"{
                "id": "app",
                "paths": ["/var/log/app.log*"],
                "file_identity": {"kind": "native", "suffix": "k8s"},
                "rotation": {"suffix_regex": "\\.\\d+$", "sort": {"kind": "numeric"}},
                "ignore_inactive": "since_first_start",
                "scanner": {"watch_mode": "poll", "check_interval_ms": 100},
                "compression": "auto"
            }"#,
        )
        .unwrap();
        assert_eq!("native", cfg.file_identity.kind);
        assert_eq!(Some("k8s".to_string()), cfg.file_identity.suffix);
        assert_eq!(Some(IgnoreInactive::SinceFirstStart), cfg.ignore_inactive);
        assert_eq!(WatchMode::Poll, cfg.scanner.watch_mode);
        assert_eq!(Compression::Auto, cfg.compression);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_short_fingerprint_is_rejected() {
        let mut cfg = input(Some("a"));
        cfg.scanner.fingerprint.length = 32;
        assert!(cfg.validate().unwrap_err().contains("at least 64"));
    }

    #[test]
    fn test_clean_inactive_must_exceed_ignore_older() {
        let mut cfg = input(Some("a"));
        cfg.ignore_older_ms = 60_000;
        cfg.clean_inactive_ms = Some(65_000);
        assert!(cfg.validate().is_err());

        cfg.clean_inactive_ms = Some(120_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_rotation_regex_is_rejected() {
        let mut cfg = input(Some("a"));
        cfg.rotation = Some(RotationConfig {
            suffix_regex: "(".to_string(),
            sort: SortConfig::default(),
        });
        assert!(cfg.validate().unwrap_err().contains("suffix_regex"));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let inputs = vec![input(Some("a")), input(Some("b")), input(Some("a"))];
        let err = ensure_unique_ids(&inputs).unwrap_err();
        assert!(matches!(err, Error::DuplicateInputId(id) if id == "a"));

        assert!(ensure_unique_ids(&[input(Some("a")), input(None), input(None)]).is_ok());
    }

    #[test]
    fn test_config_validation_names_the_input() {
        let cfg = Config {
            registry: RegistryConfig::default(),
            inputs: vec![InputConfig {
                id: Some("broken".to_string()),
                ..Default::default()
            }],
        };
        assert!(cfg.validate().unwrap_err().starts_with("input broken"));
    }
}
