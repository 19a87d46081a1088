// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::{Error, Result};

/// One line read from a file
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    /// Content without the line ending, cut to `max_bytes`
    pub content: String,
    /// Raw bytes consumed from the file, line ending included
    pub bytes: u64,
    /// The line was longer than `max_bytes`
    pub truncated: bool,
}

/// Lines read in one call, and whether the end of the file was reached
#[derive(Debug, Default)]
pub struct Batch {
    pub lines: Vec<Line>,
    pub eof: bool,
}

enum Source {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
}

/// Reads complete lines from a plain or gzip compressed file.
///
/// Bytes of an unfinished last line are buffered and not counted in the
/// offset until the line ending arrives.
pub struct LineReader {
    path: PathBuf,
    source: Source,
    /// Handle used to check the size of plain files
    stat: Option<File>,
    offset: u64,
    max_bytes: usize,
    partial: Vec<u8>,
    finished: bool,
}

impl LineReader {
    /// Open `path` positioned at `offset`. Returns the reader and whether the
    /// offset was past the end of the file, in which case reading starts
    /// from the beginning.
    pub fn open(path: impl AsRef<Path>, offset: u64, gzip: bool, max_bytes: usize) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        if gzip {
            Self::open_gzip(path, offset, max_bytes)
        } else {
            Self::open_plain(path, offset, max_bytes)
        }
    }

    fn open_plain(path: PathBuf, offset: u64, max_bytes: usize) -> Result<(Self, bool)> {
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        let truncated = offset > size;
        let offset = if truncated { 0 } else { offset };
        file.seek(SeekFrom::Start(offset))?;
        let stat = file.try_clone()?;

        Ok((
            Self {
                path,
                source: Source::Plain(BufReader::new(file)),
                stat: Some(stat),
                offset,
                max_bytes,
                partial: Vec::new(),
                finished: false,
            },
            truncated,
        ))
    }

    fn open_gzip(path: PathBuf, offset: u64, max_bytes: usize) -> Result<(Self, bool)> {
        let mut reader = BufReader::new(MultiGzDecoder::new(File::open(&path)?));
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        let truncated = skipped < offset;
        if truncated {
            reader = BufReader::new(MultiGzDecoder::new(File::open(&path)?));
        }

        Ok((
            Self {
                path,
                source: Source::Gzip(reader),
                stat: None,
                offset: if truncated { 0 } else { offset },
                max_bytes,
                partial: Vec::new(),
                finished: false,
            },
            truncated,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last complete line returned
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `limit` lines.
    ///
    /// At the end of a plain file the size is compared with the offset; a
    /// file that shrank is reported as [`Error::FileTruncated`].
    pub fn read_batch(&mut self, limit: usize) -> Result<Batch> {
        let mut batch = Batch::default();
        if self.finished {
            batch.eof = true;
            return Ok(batch);
        }

        while batch.lines.len() < limit {
            match &mut self.source {
                Source::Plain(r) => r.read_until(b'\n', &mut self.partial)?,
                Source::Gzip(r) => r.read_until(b'\n', &mut self.partial)?,
            };

            if self.partial.last() == Some(&b'\n') {
                batch.lines.push(self.take_line());
                continue;
            }
            // No line ending means the end of the data was reached
            self.at_eof(&mut batch)?;
            break;
        }
        Ok(batch)
    }

    fn at_eof(&mut self, batch: &mut Batch) -> Result<()> {
        batch.eof = true;
        match &self.stat {
            Some(file) => {
                let size = file.metadata()?.len();
                let consumed = self.offset + self.partial.len() as u64;
                if size < consumed {
                    return Err(Error::FileTruncated {
                        path: self.path.clone(),
                        size,
                        offset: self.offset,
                    });
                }
            }
            None => {
                // A compressed file is complete, its last line may lack a newline
                if !self.partial.is_empty() {
                    batch.lines.push(self.take_line());
                }
                self.finished = true;
            }
        }
        Ok(())
    }

    fn take_line(&mut self) -> Line {
        let raw = std::mem::take(&mut self.partial);
        let bytes = raw.len() as u64;
        self.offset += bytes;

        let mut end = raw.len();
        if raw[..end].ends_with(b"\n") {
            end -= 1;
        }
        if raw[..end].ends_with(b"\r") {
            end -= 1;
        }

        let truncated = end > self.max_bytes;
        let content = String::from_utf8_lossy(&raw[..end]);
        let content = if truncated {
            cut_at_char_boundary(&content, self.max_bytes).to_string()
        } else {
            content.into_owned()
        };

        Line {
            content,
            bytes,
            truncated,
        }
    }
}

fn cut_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
