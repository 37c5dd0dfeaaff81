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

//! The post-authentication IMAP frame trace.
//!
//! When enabled, every frame sent or received after authentication is
//! appended to a rotating log file as one JSON record per line. The replayer
//! tooling consumes these records to re-drive the client half of a session
//! against a live server.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::prelude::*;
use log::warn;
use serde::{Deserialize, Serialize};

const MAX_TRACE_SIZE: u64 = 20 * 1024 * 1024;
const TRACE_BACKUPS: u32 = 5;

/// One traced IMAP frame.
///
/// `dir` is `"S"` for server-to-client data and `"C"` for client-to-server
/// data. `data_b64` is the raw frame, base64-encoded so that literals with
/// arbitrary octets survive the JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub ts: f64,
    pub session: u64,
    pub dir: Direction,
    pub data_b64: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "S")]
    ServerToClient,
    #[serde(rename = "C")]
    ClientToServer,
}

/// Writer for one user's trace log, rotating by size.
pub struct TraceWriter {
    path: PathBuf,
    file: Option<fs::File>,
    written: u64,
}

impl TraceWriter {
    /// Open (creating if needed) the trace log for `user` under `trace_dir`.
    pub fn new(trace_dir: &std::path::Path, user: &str) -> Self {
        let path = trace_dir.join(format!("{}-asimapd.trace", user));
        let (file, written) = match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(f) => {
                let len = f.metadata().map(|md| md.len()).unwrap_or(0);
                (Some(f), len)
            },
            Err(e) => {
                warn!("Unable to open trace log '{}': {}", path.display(), e);
                (None, 0)
            },
        };

        Self {
            path,
            file,
            written,
        }
    }

    /// Append one frame to the trace.
    ///
    /// Trace failures are logged and otherwise ignored; tracing never makes
    /// a session fail.
    pub fn frame(&mut self, session: u64, dir: Direction, data: &[u8]) {
        let record = TraceRecord {
            ts: Utc::now().timestamp_millis() as f64 / 1000.0,
            session,
            dir,
            data_b64: base64::encode(data),
        };

        let Some(ref mut file) = self.file else {
            return;
        };

        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Unable to encode trace record: {}", e);
                return;
            },
        };
        line.push(b'\n');

        if let Err(e) = file.write_all(&line) {
            warn!("Unable to write trace record: {}", e);
            self.file = None;
            return;
        }

        self.written += line.len() as u64;
        if self.written >= MAX_TRACE_SIZE {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        self.file = None;
        self.written = 0;

        for n in (1..TRACE_BACKUPS).rev() {
            let _ = fs::rename(
                format!("{}.{}", self.path.display(), n),
                format!("{}.{}", self.path.display(), n + 1),
            );
        }
        let _ = fs::rename(
            &self.path,
            format!("{}.1", self.path.display()),
        );

        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(f) => self.file = Some(f),
            Err(e) => warn!(
                "Unable to reopen trace log '{}': {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn records_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut writer = TraceWriter::new(dir.path(), "fred");
        writer.frame(7, Direction::ClientToServer, b"a NOOP\r\n");
        writer.frame(7, Direction::ServerToClient, b"a OK NOOP done\r\n");

        let file =
            fs::File::open(dir.path().join("fred-asimapd.trace")).unwrap();
        let lines = std::io::BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(2, lines.len());

        let rec: TraceRecord = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(7, rec.session);
        assert_eq!(Direction::ClientToServer, rec.dir);
        assert_eq!(
            b"a NOOP\r\n".to_vec(),
            base64::decode(&rec.data_b64).unwrap()
        );

        let rec: TraceRecord = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(Direction::ServerToClient, rec.dir);
    }
}
