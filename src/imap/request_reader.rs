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

//! Buffered reading of the IMAP command stream.
//!
//! Command lines are length-prefix-aware: `{n}` and `{n+}` literals embed
//! raw octets mid-command, so the framing is not line-oriented and is
//! implemented as an explicit state machine driven by the session loop. The
//! reader itself only knows how to deliver lines, exact byte counts, and
//! discards; the session decides when a continuation line must be sent.

use std::io;

use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r"\{([0-9]+)(\+?)\}$").unwrap();
}

/// Information about a literal declaration found at the end of a command
/// line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteralInfo {
    pub length: u32,
    /// Whether this is a non-synchronising `{n+}` literal.
    pub literal_plus: bool,
}

pub struct RequestReader<R> {
    io: BufReader<R>,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(io: R) -> Self {
        RequestReader {
            io: BufReader::new(io),
        }
    }

    /// Read the next line, appending it to `cmdline` with the line ending
    /// removed. Both DOS and bare-LF endings are accepted.
    ///
    /// Returns the number of bytes appended, or `None` if `max` was reached
    /// without finding a line feed (in which case the partial line remains
    /// in `cmdline` and the protocol needs resynchronisation).
    ///
    /// EOF before a complete line is an `UnexpectedEof` error.
    pub async fn read_line(
        &mut self,
        cmdline: &mut Vec<u8>,
        max: usize,
    ) -> io::Result<Option<usize>> {
        let room = max.saturating_sub(cmdline.len()).max(1);
        let mut nread = (&mut self.io)
            .take(room as u64)
            .read_until(b'\n', cmdline)
            .await?;

        if 0 == nread {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached before reading full line",
            ));
        }

        if !cmdline.ends_with(b"\n") {
            return Ok(None);
        }

        cmdline.pop();
        nread -= 1;
        if cmdline.ends_with(b"\r") {
            cmdline.pop();
            nread -= 1;
        }

        Ok(Some(nread))
    }

    /// Append exactly `len` octets of literal data to `buf`.
    pub async fn read_literal(
        &mut self,
        buf: &mut Vec<u8>,
        len: u32,
    ) -> io::Result<()> {
        let nread = (&mut self.io)
            .take(len.into())
            .read_to_end(buf)
            .await?;
        if nread != len as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reading literal",
            ));
        }
        Ok(())
    }

    /// Discard exactly `len` octets of literal data.
    pub async fn discard_literal(&mut self, len: u32) -> io::Result<()> {
        let copied = tokio::io::copy(
            &mut (&mut self.io).take(len.into()),
            &mut tokio::io::sink(),
        )
        .await?;
        if copied != u64::from(len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF discarding literal",
            ));
        }
        Ok(())
    }
}

/// Check whether the current command line ends with a literal declaration.
///
/// Only the last `nread` bytes are inspected so that only material from the
/// most recent read operation is considered.
///
/// Returns the text before the literal and the literal's parameters.
pub fn check_literal(
    cmdline: &[u8],
    nread: usize,
) -> Option<(&[u8], LiteralInfo)> {
    let tail_start = cmdline.len() - nread;
    LITERAL_AT_EOL
        .captures(&cmdline[tail_start..])
        .and_then(|c| {
            let m0 = c.get(0)?;
            let length = std::str::from_utf8(c.get(1)?.as_bytes())
                .ok()?
                .parse::<u32>()
                .ok()?;
            Some((
                &cmdline[..tail_start + m0.start()],
                LiteralInfo {
                    length,
                    literal_plus: !c.get(2)?.as_bytes().is_empty(),
                },
            ))
        })
}
