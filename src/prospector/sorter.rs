// SPDX-License-Identifier: Apache-2.0

//! Ordering of rotated companions of a file.

use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveDateTime};

use super::copytruncate::RotatedFile;
use crate::config::{SortConfig, SortKind};
use crate::error::{Error, Result};

/// Orders rotated files from the oldest to the newest.
pub trait RotatedFileSorter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Position of a rotated file given the suffix the rotation appended.
    /// Smaller keys are older. `None` when the suffix cannot be interpreted.
    fn key(&self, suffix: &str) -> Option<i64>;

    fn sort(&self, files: &mut [RotatedFile]) {
        // Suffixes that cannot be interpreted go last
        files.sort_by(|a, b| match (a.sort_key, b.sort_key) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.path.cmp(&b.path),
        });
    }
}

/// `app.log.1` is newer than `app.log.2`.
#[derive(Debug, Default)]
pub struct NumericSorter;

impl RotatedFileSorter for NumericSorter {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn key(&self, suffix: &str) -> Option<i64> {
        let digits: String = suffix
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse::<i64>().ok().map(|n| -n)
    }
}

/// Suffix carries the rotation time, e.g. `app.log-20240131`.
#[derive(Debug)]
pub struct DateSorter {
    format: String,
}

impl DateSorter {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }

    fn parse(&self, s: &str) -> Option<i64> {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, &self.format) {
            return Some(ts.and_utc().timestamp());
        }
        NaiveDate::parse_from_str(s, &self.format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|ts| ts.and_utc().timestamp())
    }
}

impl RotatedFileSorter for DateSorter {
    fn name(&self) -> &'static str {
        "date"
    }

    fn key(&self, suffix: &str) -> Option<i64> {
        let trimmed = suffix.trim_start_matches(['.', '-', '_']);
        self.parse(trimmed)
            .or_else(|| self.parse(trimmed.strip_suffix(".gz")?))
    }
}

pub fn build_sorter(cfg: &SortConfig) -> Result<Box<dyn RotatedFileSorter>> {
    match cfg.kind {
        SortKind::Numeric => Ok(Box::new(NumericSorter)),
        SortKind::Date => {
            let format = cfg.date_format.clone().ok_or_else(|| {
                Error::Config("rotation sort kind date requires date_format".to_string())
            })?;
            Ok(Box::new(DateSorter::new(format)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{FileId, FileIdentifier, PathIdentifier};
    use crate::watcher::{FileDescriptor, FileInfo, FsEvent};
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;

    fn rotated(sorter: &dyn RotatedFileSorter, path: &str, suffix: &str) -> RotatedFile {
        let fd = FileDescriptor::new(path, FileInfo::new(1, SystemTime::now(), FileId::new(1, 1)));
        let src = PathIdentifier.get_source(&FsEvent::create(Path::new(path), fd, String::new()));
        RotatedFile {
            path: PathBuf::from(path),
            src,
            sort_key: sorter.key(suffix),
        }
    }

    fn paths(files: &[RotatedFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.to_str().unwrap()).collect()
    }

    #[test]
    fn test_numeric_oldest_first() {
        let sorter = NumericSorter;
        let mut files = vec![
            rotated(&sorter, "app.log.1", ".1"),
            rotated(&sorter, "app.log.10.gz", ".10.gz"),
            rotated(&sorter, "app.log.2", ".2"),
            rotated(&sorter, "app.log.x", ".x"),
        ];
        sorter.sort(&mut files);
        assert_eq!(vec!["app.log.10.gz", "app.log.2", "app.log.1", "app.log.x"], paths(&files));
    }

    #[test]
    fn test_date_oldest_first() {
        let sorter = DateSorter::new("%Y%m%d");
        let mut files = vec![
            rotated(&sorter, "app.log-20240301", "-20240301"),
            rotated(&sorter, "app.log-20231231.gz", "-20231231.gz"),
            rotated(&sorter, "app.log-20240115", "-20240115"),
        ];
        sorter.sort(&mut files);
        assert_eq!(
            vec!["app.log-20231231.gz", "app.log-20240115", "app.log-20240301"],
            paths(&files)
        );
    }

    #[test]
    fn test_date_with_time() {
        let sorter = DateSorter::new("%Y-%m-%d-%H%M");
        assert!(sorter.key(".2024-01-31-2300").unwrap() > sorter.key(".2024-01-31-0900").unwrap());
        assert_eq!(None, sorter.key(".yesterday"));
    }

    #[test]
    fn test_build_requires_date_format() {
        let cfg = SortConfig {
            kind: SortKind::Date,
            date_format: None,
        };
        assert!(build_sorter(&cfg).is_err());
        assert_eq!("numeric", build_sorter(&SortConfig::default()).unwrap().name());
    }
}
