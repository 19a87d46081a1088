// SPDX-License-Identifier: Apache-2.0

//! Log file harvesting engine.
//!
//! Files matching a set of glob patterns are discovered by periodic scans,
//! identified across renames and rotations, and read line by line. The read
//! offset of every file is persisted in a registry once the output has
//! acknowledged the lines, so a restart resumes exactly where the last
//! acknowledged line ended.

pub mod bounded_channel;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod harvester;
pub mod identity;
pub mod init;
pub mod input;
pub mod persistence;
pub mod prospector;
pub mod store;
pub mod update_writer;
pub mod watcher;
