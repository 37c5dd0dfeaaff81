//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Asimap.
//
// Asimap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Asimap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Asimap. If not, see <http://www.gnu.org/licenses/>.

//! Access to one on-disk MH folder.
//!
//! An MH folder is a directory whose children with positive decimal integer
//! names are messages and whose `.mh_sequences` file groups message keys
//! into named sets, one `name: <int-set>` line per sequence. This module
//! only does mechanical store access; flag semantics and UID bookkeeping
//! live in `account::mailbox`.
//!
//! Everything here must tolerate third-party MH tools mutating the folder
//! at any moment. Writes to `.mh_sequences` therefore always go through a
//! temp file renamed into place, and reads treat malformed content as a
//! recoverable condition, not a panic.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::account::model::MsgKey;
use crate::support::error::{Error, Inconsistency};
use crate::support::file_ops;

pub type Sequences = BTreeMap<String, BTreeSet<MsgKey>>;

pub const SEQUENCES_FILE: &str = ".mh_sequences";

/// Handle on one MH folder directory.
#[derive(Clone, Debug)]
pub struct MhFolder {
    path: PathBuf,
    use_locking: bool,
}

/// A point-in-time fingerprint of the observable folder state, used by the
/// resync engine to decide whether a full rescan is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FolderFingerprint {
    /// mtime of the directory itself, seconds since the epoch.
    pub dir_mtime: i64,
    /// mtime of `.mh_sequences`, seconds since the epoch; 0 if absent.
    pub seq_mtime: i64,
    /// Size of `.mh_sequences` in bytes; 0 if absent.
    pub seq_size: u64,
}

impl MhFolder {
    pub fn new(path: PathBuf, use_locking: bool) -> Self {
        MhFolder { path, use_locking }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn create(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.path)?;
        let seq = self.path.join(SEQUENCES_FILE);
        if !seq.exists() {
            file_ops::spit(&self.path, &seq, false, 0o600, b"")?;
        }
        Ok(())
    }

    pub fn message_path(&self, key: MsgKey) -> PathBuf {
        self.path.join(key.0.to_string())
    }

    /// Return the sorted list of message keys currently in the folder.
    pub fn list_keys(&self) -> Result<Vec<MsgKey>, Error> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Strictly decimal, no leading '+' or '0' padding games; this is
            // what MH itself generates.
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(n) = name.parse::<u32>() {
                if n >= 1 {
                    keys.push(MsgKey(n));
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// Read the full content of the message with the given key.
    pub fn read_message(&self, key: MsgKey) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        fs::File::open(self.message_path(key))
            .map_err(|e| {
                if std::io::ErrorKind::NotFound == e.kind() {
                    Error::ExpungedMessage
                } else {
                    Error::Io(e)
                }
            })?
            .read_to_end(&mut data)?;
        Ok(data)
    }

    /// Return size and mtime of the message file.
    pub fn stat_message(&self, key: MsgKey) -> Result<(u64, i64), Error> {
        let md = fs::metadata(self.message_path(key)).map_err(|e| {
            if std::io::ErrorKind::NotFound == e.kind() {
                Error::ExpungedMessage
            } else {
                Error::Io(e)
            }
        })?;
        Ok((md.len(), unix_mtime(&md)))
    }

    /// Write `data` as a new message, returning the key it was assigned.
    ///
    /// The key is one greater than the current maximum. Another process may
    /// race us for the name, so the non-clobbering write is retried with
    /// successive keys a few times before giving up.
    pub fn add_message(&self, data: &[u8]) -> Result<MsgKey, Error> {
        let start = self
            .list_keys()?
            .last()
            .map(|k| k.0 + 1)
            .unwrap_or(1);

        for key in start..start + 32 {
            let key = MsgKey(key);
            match file_ops::spit(
                &self.path,
                self.message_path(key),
                false,
                0o600,
                data,
            ) {
                Ok(()) => return Ok(key),
                Err(e)
                    if std::io::ErrorKind::AlreadyExists == e.kind() =>
                {
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Inconsistency(Inconsistency::TryAgain))
    }

    /// Remove the message with the given key.
    pub fn remove_message(&self, key: MsgKey) -> Result<(), Error> {
        fs::remove_file(self.message_path(key)).map_err(|e| {
            if std::io::ErrorKind::NotFound == e.kind() {
                Error::ExpungedMessage
            } else {
                Error::Io(e)
            }
        })
    }

    /// Read and parse `.mh_sequences`.
    ///
    /// A missing file is an empty sequence set. A line that cannot be
    /// parsed raises the `TryAgain` inconsistency: the usual cause is
    /// catching a third-party rewrite mid-flight, and rereading after the
    /// rename lands gets a consistent view.
    pub fn read_sequences(&self) -> Result<Sequences, Error> {
        let path = self.path.join(SEQUENCES_FILE);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                return Ok(Sequences::new())
            },
            Err(e) => return Err(e.into()),
        };

        let _lock = self.lock_shared(&file)?;

        let mut sequences = Sequences::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (name, spec) = line
                .split_once(':')
                .ok_or(Error::Inconsistency(Inconsistency::TryAgain))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Inconsistency(Inconsistency::TryAgain));
            }

            let set = sequences.entry(name.to_owned()).or_default();
            for part in spec.split_whitespace() {
                match parse_element(part) {
                    Some((start, end)) => {
                        for k in start..=end {
                            set.insert(MsgKey(k));
                        }
                    },
                    None => {
                        return Err(Error::Inconsistency(
                            Inconsistency::TryAgain,
                        ))
                    },
                }
            }
        }

        // Empty sequences are not written back, so drop them now to keep
        // equality comparisons meaningful.
        sequences.retain(|_, set| !set.is_empty());
        Ok(sequences)
    }

    /// Serialize and atomically rewrite `.mh_sequences`.
    pub fn write_sequences(&self, sequences: &Sequences) -> Result<(), Error> {
        let mut out = Vec::new();
        for (name, set) in sequences {
            if set.is_empty() {
                continue;
            }

            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            let mut run_start: Option<(u32, u32)> = None;
            for &MsgKey(k) in set {
                run_start = match run_start {
                    Some((start, end)) if k == end + 1 => Some((start, k)),
                    Some(run) => {
                        push_element(&mut out, run);
                        Some((k, k))
                    },
                    None => Some((k, k)),
                };
            }
            if let Some(run) = run_start {
                push_element(&mut out, run);
            }
            out.push(b'\n');
        }

        let path = self.path.join(SEQUENCES_FILE);
        if self.use_locking {
            // Hold the advisory lock on the *old* file across the rename so
            // lock-respecting readers don't observe the swap mid-write.
            if let Ok(file) = fs::File::open(&path) {
                let _lock = self.lock_exclusive(&file)?;
                return file_ops::spit(&self.path, &path, true, 0o600, &out)
                    .map_err(Error::Io);
            }
        }

        file_ops::spit(&self.path, &path, true, 0o600, &out)?;
        Ok(())
    }

    /// Capture the folder fingerprint used for change detection.
    pub fn fingerprint(&self) -> Result<FolderFingerprint, Error> {
        let dir_md = fs::metadata(&self.path).map_err(|e| {
            if std::io::ErrorKind::NotFound == e.kind() {
                Error::NxMailbox
            } else {
                Error::Io(e)
            }
        })?;

        let (seq_mtime, seq_size) =
            match fs::metadata(self.path.join(SEQUENCES_FILE)) {
                Ok(md) => (unix_mtime(&md), md.len()),
                Err(e) if std::io::ErrorKind::NotFound == e.kind() => (0, 0),
                Err(e) => return Err(e.into()),
            };

        Ok(FolderFingerprint {
            dir_mtime: unix_mtime(&dir_md),
            seq_mtime,
            seq_size,
        })
    }

    fn lock_shared(&self, file: &fs::File) -> Result<Option<FlockGuard>, Error> {
        self.lock(file, nix::fcntl::FlockArg::LockShared)
    }

    fn lock_exclusive(
        &self,
        file: &fs::File,
    ) -> Result<Option<FlockGuard>, Error> {
        self.lock(file, nix::fcntl::FlockArg::LockExclusive)
    }

    fn lock(
        &self,
        file: &fs::File,
        arg: nix::fcntl::FlockArg,
    ) -> Result<Option<FlockGuard>, Error> {
        if !self.use_locking {
            return Ok(None);
        }

        #[allow(deprecated)]
        nix::fcntl::flock(file.as_raw_fd(), arg)?;
        Ok(Some(FlockGuard {
            fd: file.as_raw_fd(),
        }))
    }
}

struct FlockGuard {
    fd: std::os::unix::io::RawFd,
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        #[allow(deprecated)]
        let _ = nix::fcntl::flock(self.fd, nix::fcntl::FlockArg::Unlock);
    }
}

fn parse_element(part: &str) -> Option<(u32, u32)> {
    if let Some((a, b)) = part.split_once('-') {
        let a = a.parse::<u32>().ok()?;
        let b = b.parse::<u32>().ok()?;
        (a >= 1 && b >= a).then_some((a, b))
    } else {
        let k = part.parse::<u32>().ok()?;
        (k >= 1).then_some((k, k))
    }
}

fn push_element(out: &mut Vec<u8>, (start, end): (u32, u32)) {
    out.push(b' ');
    if start == end {
        out.extend_from_slice(start.to_string().as_bytes());
    } else {
        out.extend_from_slice(format!("{}-{}", start, end).as_bytes());
    }
}

fn unix_mtime(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, MhFolder) {
        let dir = tempfile::TempDir::new().unwrap();
        let folder = MhFolder::new(dir.path().join("INBOX"), false);
        folder.create().unwrap();
        (dir, folder)
    }

    fn keyset(keys: &[u32]) -> BTreeSet<MsgKey> {
        keys.iter().copied().map(MsgKey).collect()
    }

    #[test]
    fn add_list_read_remove() {
        let (_dir, folder) = fixture();
        assert_eq!(Vec::<MsgKey>::new(), folder.list_keys().unwrap());

        let k1 = folder.add_message(b"From: a\r\n\r\nbody 1\r\n").unwrap();
        let k2 = folder.add_message(b"From: b\r\n\r\nbody 2\r\n").unwrap();
        assert_eq!(MsgKey(1), k1);
        assert_eq!(MsgKey(2), k2);
        assert_eq!(vec![k1, k2], folder.list_keys().unwrap());

        assert_eq!(
            b"From: b\r\n\r\nbody 2\r\n".to_vec(),
            folder.read_message(k2).unwrap()
        );

        folder.remove_message(k1).unwrap();
        assert_eq!(vec![k2], folder.list_keys().unwrap());
        assert_matches!(
            Err(Error::ExpungedMessage),
            folder.read_message(k1)
        );
    }

    #[test]
    fn non_message_files_are_ignored() {
        let (_dir, folder) = fixture();
        folder.add_message(b"x").unwrap();
        fs::write(folder.path().join("notes.txt"), b"x").unwrap();
        fs::write(folder.path().join("0"), b"x").unwrap();
        fs::create_dir(folder.path().join("17")).unwrap();
        // A subdirectory named like a key must not be taken for a message.
        let keys = folder.list_keys().unwrap();
        assert_eq!(vec![MsgKey(1)], keys);
    }

    #[test]
    fn sequences_round_trip() {
        let (_dir, folder) = fixture();

        let mut seq = Sequences::new();
        seq.insert("unseen".to_owned(), keyset(&[1, 2, 3, 7]));
        seq.insert("replied".to_owned(), keyset(&[2]));
        folder.write_sequences(&seq).unwrap();

        let raw =
            fs::read_to_string(folder.path().join(SEQUENCES_FILE)).unwrap();
        assert_eq!("replied: 2\nunseen: 1-3 7\n", raw);

        assert_eq!(seq, folder.read_sequences().unwrap());
    }

    #[test]
    fn missing_sequences_file_is_empty() {
        let (_dir, folder) = fixture();
        fs::remove_file(folder.path().join(SEQUENCES_FILE)).unwrap();
        assert_eq!(Sequences::new(), folder.read_sequences().unwrap());
    }

    #[test]
    fn truncated_sequences_file_is_empty_not_error() {
        let (_dir, folder) = fixture();
        fs::write(folder.path().join(SEQUENCES_FILE), b"").unwrap();
        assert_eq!(Sequences::new(), folder.read_sequences().unwrap());
    }

    #[test]
    fn garbage_sequences_line_raises_try_again() {
        let (_dir, folder) = fixture();
        fs::write(
            folder.path().join(SEQUENCES_FILE),
            b"unseen: 1 2\ngarbage without colon\n",
        )
        .unwrap();
        assert_matches!(
            Err(Error::Inconsistency(Inconsistency::TryAgain)),
            folder.read_sequences()
        );

        fs::write(folder.path().join(SEQUENCES_FILE), b"unseen: 1 x\n")
            .unwrap();
        assert_matches!(
            Err(Error::Inconsistency(Inconsistency::TryAgain)),
            folder.read_sequences()
        );
    }

    #[test]
    fn foreign_sequence_format_accepted() {
        let (_dir, folder) = fixture();
        // nmh writes ranges with '-'; some tools pad with extra spaces.
        fs::write(
            folder.path().join(SEQUENCES_FILE),
            b"unseen:  4-6\ncur: 5\n",
        )
        .unwrap();

        let seq = folder.read_sequences().unwrap();
        assert_eq!(keyset(&[4, 5, 6]), seq["unseen"]);
        assert_eq!(keyset(&[5]), seq["cur"]);
    }

    #[test]
    fn key_assignment_skips_existing() {
        let (_dir, folder) = fixture();
        fs::write(folder.path().join("9"), b"existing").unwrap();
        let key = folder.add_message(b"new").unwrap();
        assert_eq!(MsgKey(10), key);
    }
}
