// SPDX-License-Identifier: Apache-2.0

use sha2::{Digest, Sha256};
use std::io::{self, Read};

use super::{Capability, FINGERPRINT, FileIdentifier, FileSource};
use crate::watcher::FsEvent;

/// A fingerprint window shorter than one sha256 block hashes poorly.
pub const SHA256_BLOCK_SIZE: u64 = 64;

/// Hash `length` bytes of `reader` starting at `offset`, hex encoded.
///
/// The reader is consumed sequentially so compressed streams work too. Fails
/// with `UnexpectedEof` when the content ends before the window does.
pub fn compute_fingerprint<R: Read>(mut reader: R, offset: u64, length: u64) -> io::Result<String> {
    if offset > 0 {
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        if skipped < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("content ends at {} before fingerprint offset {}", skipped, offset),
            ));
        }
    }

    let mut hasher = Sha256::new();
    let mut window = reader.take(length);
    let mut buf = [0u8; 8192];
    let mut written = 0u64;
    loop {
        let n = window.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        written += n as u64;
    }

    if written != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read only {} of {} fingerprint bytes", written, length),
        ));
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Identity based on the content fingerprint computed by the scanner.
#[derive(Debug, Default)]
pub struct FingerprintIdentifier;

impl FileIdentifier for FingerprintIdentifier {
    fn get_source(&self, event: &FsEvent) -> FileSource {
        let identity = event.descriptor.fingerprint.clone().unwrap_or_default();
        FileSource::from_event(FINGERPRINT, &identity, event)
    }

    fn name(&self) -> &'static str {
        FINGERPRINT
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::TrackRename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fingerprint_of_window() {
        let data = vec![b'a'; 128];
        let full = compute_fingerprint(Cursor::new(&data), 0, 64).unwrap();
        let shifted = compute_fingerprint(Cursor::new(&data), 64, 64).unwrap();

        // Same bytes in both windows
        assert_eq!(full, shifted);
        assert_eq!(64, full.len());
        assert_eq!(
            hex::encode(Sha256::digest(&data[..64])),
            full,
        );
    }

    #[test]
    fn test_fingerprint_differs_with_content() {
        let mut a = vec![b'a'; 100];
        let b = a.clone();
        a[10] = b'z';

        let fa = compute_fingerprint(Cursor::new(&a), 0, 64).unwrap();
        let fb = compute_fingerprint(Cursor::new(&b), 0, 64).unwrap();
        assert_ne!(fa, fb);
    }

    #[test]
    fn test_fingerprint_requires_full_window() {
        let data = vec![b'a'; 80];
        let err = compute_fingerprint(Cursor::new(&data), 20, 64).unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());

        let err = compute_fingerprint(Cursor::new(&data), 100, 64).unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }
}
