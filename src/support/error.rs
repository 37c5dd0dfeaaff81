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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox or flag name")]
    UnsafeName,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox has inferiors")]
    MailboxHasInferiors,
    #[error("Mailbox is not selectable")]
    MailboxUnselectable,
    #[error("Mailbox read-only")]
    MailboxReadOnly,
    #[error("Operation not allowed for INBOX")]
    BadOperationOnInbox,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Message expunged")]
    ExpungedMessage,
    #[error("Non-existent message")]
    NxMessage,
    #[error("Unsupported/unknown flag")]
    NxFlag,
    #[error("Unparsable sequence set")]
    UnparsableSequenceSet,
    #[error("Unsupported charset")]
    BadCharset,
    #[error("Rename source and destination are the same")]
    RenameToSelf,
    #[error("Rename destination is child of self")]
    RenameIntoSelf,
    #[error("Too many active search contexts")]
    TooManyContexts,
    #[error("Command tag still referenced by an update context")]
    TagInUse,
    #[error("Mailbox state inconsistent: {0}")]
    Inconsistency(Inconsistency),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// The handled family of mailbox-inconsistency conditions.
///
/// These are raised from deep inside mailbox operations when the on-disk
/// state is observed to disagree with the in-memory snapshot. They propagate
/// to the command-engine boundary, which is the only place allowed to decide
/// what the client sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inconsistency {
    /// Re-run the command after an implicit resync. The command engine
    /// retries at most twice before degrading to `TellClientBad`.
    TryAgain,
    /// Respond with a tagged `BAD` and keep the session.
    TellClientBad,
    /// Send `* BYE` and close the session.
    Disconnect,
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Inconsistency::TryAgain => write!(f, "try again"),
            Inconsistency::TellClientBad => write!(f, "tell client bad"),
            Inconsistency::Disconnect => write!(f, "disconnect"),
        }
    }
}

impl Error {
    /// Whether this error indicates an unusable mailbox store, i.e. the
    /// worker should flush `* BYE` and terminate.
    pub fn is_fatal(&self) -> bool {
        match *self {
            Error::Io(ref e) => matches!(
                e.raw_os_error(),
                Some(nix::libc::ENOSPC) | Some(nix::libc::EIO)
            ),
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::DiskFull
                    | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}
