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

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::error;

use crate::{
    account::mailbox::{Context, Mailbox, Selected},
    account::user_server::UserServer,
    imap::lex::LexWriter,
    support::error::{Error, Inconsistency},
    support::log_prefix::LogPrefix,
};

pub(super) use crate::imap::syntax as s;

pub(super) static CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "LITERAL+",
    "IDLE",
    "NAMESPACE",
    "UIDPLUS",
    "MULTIAPPEND",
    "UNSELECT",
    "CHILDREN",
    "SORT",
    "ESORT",
    "ESEARCH",
    "CONTEXT=SEARCH",
    "CONTEXT=SORT",
    "LIST-EXTENDED",
    "LIST-STATUS",
    "MOVE",
    "AUTH=PLAIN",
];

pub(super) static TAGLINE: &str = concat!(
    "asimap ",
    env!("CARGO_PKG_VERSION"),
    " at your service"
);

/// Maximum search evaluations between cooperative yields, keeping other
/// clients of this worker responsive during a long scan.
pub(super) const SEARCH_YIELD_INTERVAL: usize = 128;

/// Receives commands in the raw AST defined in the `syntax` module and
/// emits responses in that same model.
///
/// While primarily a translation layer, it also manages high-level session
/// state (the selected mailbox, live update contexts) and handles the
/// cases where one IMAP command does several distinct things (`CLOSE` does
/// an implicit expunge, `FETCH BODY[...]` an implicit store of `\Seen`).
pub struct CommandProcessor {
    pub(super) log_prefix: LogPrefix,
    pub(super) server: Rc<RefCell<UserServer>>,
    pub(super) selected: Option<SelectedState>,
    /// Live RFC 5267 contexts, keyed by the tag of the command that
    /// created them.
    pub(super) contexts: HashMap<String, Context>,
    pub(super) logged_out: bool,
    /// Set when the store is unusable (disk full, database corruption);
    /// the worker must terminate once the final responses are flushed.
    pub(super) fatal: bool,
}

pub(super) struct SelectedState {
    pub(super) mailbox: Rc<RefCell<Mailbox>>,
    pub(super) sel: Selected,
}

/// Used for the convenient `?` operator. `Ok` and `Err` are mostly not
/// distinguished; the contained value goes down the wire either way,
/// though on `Err` no boundary poll happens.
pub(super) type CmdResult = Result<s::Response<'static>, s::Response<'static>>;

/// An operation that can either succeed with a value or fail with a
/// complete IMAP response.
pub(super) type PartialResult<T> = Result<T, s::Response<'static>>;

/// Accumulates the untagged responses of one command.
///
/// The session loop flushes the buffer to the socket at command
/// boundaries, and more eagerly while idling.
#[derive(Default)]
pub struct ResponseBuffer {
    pub(super) buf: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn untagged(&mut self, response: s::Response<'_>) {
        let mut line = s::ResponseLine {
            tag: None,
            response,
        };
        let mut lex = LexWriter::new(&mut self.buf);
        let _ = line.write_to(&mut lex);
        let _ = lex.verbatim("\r\n");
    }

    pub fn tagged(&mut self, line: s::ResponseLine<'_>) {
        let mut line = line;
        let mut lex = LexWriter::new(&mut self.buf);
        let _ = line.write_to(&mut lex);
        let _ = lex.verbatim("\r\n");
    }

    pub fn continuation(&mut self, prompt: &str) {
        self.buf.extend_from_slice(b"+ ");
        self.buf.extend_from_slice(prompt.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl CommandProcessor {
    pub fn new(
        log_prefix: LogPrefix,
        server: Rc<RefCell<UserServer>>,
    ) -> Self {
        CommandProcessor {
            log_prefix,
            server,
            selected: None,
            contexts: HashMap::new(),
            logged_out: false,
            fatal: false,
        }
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn fatal(&self) -> bool {
        self.fatal
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn has_selected(&self) -> bool {
        self.selected.is_some()
    }

    pub(super) fn parse_seqnum_range(
        &mut self,
        raw: &str,
    ) -> PartialResult<SeqRange<Seqnum>> {
        let max_seqnum = selected!(self)?.sel.max_seqnum();
        let seqrange = SeqRange::parse(
            raw,
            Seqnum::of(max_seqnum.max(1)).unwrap(),
        )
        .ok_or_else(|| bad(None, "Unparsable sequence set"))?;

        if seqrange.max().unwrap_or(0) > max_seqnum {
            // Not explicit in RFC 3501, but Crispin's consistent guidance
            // on the mailing list: a seqnum beyond the snapshot is a
            // client protocol error.
            return Err(bad(
                Some(s::RespTextCode::ClientBug(())),
                "Message sequence number out of range",
            ));
        }

        Ok(seqrange)
    }

    pub(super) fn parse_uid_range(
        &mut self,
        raw: &str,
    ) -> PartialResult<SeqRange<Uid>> {
        let max_uid =
            selected!(self)?.sel.max_uid().unwrap_or(Uid::MIN);
        SeqRange::parse(raw, max_uid)
            .ok_or_else(|| bad(None, "Unparsable sequence set"))
        // Clients are explicitly allowed to name UIDs that do not exist.
    }
}

pub(super) use crate::account::model::{SeqRange, Seqnum, Uid};

pub(super) fn success() -> CmdResult {
    Ok(ok(None, "done"))
}

pub(super) fn ok(
    code: Option<s::RespTextCode<'static>>,
    quip: &'static str,
) -> s::Response<'static> {
    s::Response::Cond(s::CondResponse {
        cond: s::RespCondType::Ok,
        code,
        quip: Some(Cow::Borrowed(quip)),
    })
}

pub(super) fn no(
    code: Option<s::RespTextCode<'static>>,
    quip: &'static str,
) -> s::Response<'static> {
    s::Response::Cond(s::CondResponse {
        cond: s::RespCondType::No,
        code,
        quip: Some(Cow::Borrowed(quip)),
    })
}

pub(super) fn bad(
    code: Option<s::RespTextCode<'static>>,
    quip: &'static str,
) -> s::Response<'static> {
    s::Response::Cond(s::CondResponse {
        cond: s::RespCondType::Bad,
        code,
        quip: Some(Cow::Borrowed(quip)),
    })
}

pub(super) fn bye(quip: &'static str) -> s::Response<'static> {
    s::Response::Cond(s::CondResponse {
        cond: s::RespCondType::Bye,
        code: None,
        quip: Some(Cow::Borrowed(quip)),
    })
}

/// Convert an error that escaped a command handler into the tagged
/// response the client sees. Only this boundary ever formats errors.
pub(super) fn map_error(
    log_prefix: &LogPrefix,
    e: Error,
) -> s::Response<'static> {
    match e {
        Error::NxMailbox => no(
            Some(s::RespTextCode::Nonexistent(())),
            "No such mailbox",
        ),
        Error::MailboxExists => no(
            Some(s::RespTextCode::AlreadyExists(())),
            "Mailbox already exists",
        ),
        Error::MailboxHasInferiors => {
            no(None, "Mailbox has inferiors")
        },
        Error::MailboxUnselectable => {
            no(None, "Mailbox is not selectable")
        },
        Error::MailboxReadOnly => no(None, "Mailbox is read-only"),
        Error::BadOperationOnInbox => {
            no(None, "Operation not permitted on INBOX")
        },
        Error::UnsafeName => no(None, "Unsafe mailbox name"),
        Error::NxMessage | Error::ExpungedMessage => {
            no(None, "Message no longer exists")
        },
        Error::NxFlag => no(None, "Unsupported flag"),
        Error::UnparsableSequenceSet => {
            bad(None, "Unparsable sequence set")
        },
        Error::BadCharset => no(
            Some(s::RespTextCode::BadCharset(vec![
                Cow::Borrowed("US-ASCII"),
                Cow::Borrowed("UTF-8"),
            ])),
            "Unsupported charset",
        ),
        Error::RenameToSelf => {
            no(None, "Rename source and destination are the same")
        },
        Error::RenameIntoSelf => {
            no(None, "Rename destination is child of source")
        },
        Error::TooManyContexts => {
            // The NOUPDATE quip carries the tag at the call site; this
            // fallback should not normally be reached.
            no(None, "Too many active contexts")
        },
        Error::TagInUse => bad(None, "Tag reuse"),
        Error::Inconsistency(Inconsistency::Disconnect) => {
            bye("Mailbox state lost")
        },
        Error::Inconsistency(..) => {
            bad(None, "Mailbox state changed underfoot; try again")
        },
        e => {
            error!("{} Unhandled internal error: {}", log_prefix, e);
            no(
                Some(s::RespTextCode::ServerBug(())),
                "Unexpected error; check server logs for details",
            )
        },
    }
}

pub(super) fn capability_data() -> s::CapabilityData<'static> {
    s::CapabilityData {
        capabilities: CAPABILITIES
            .iter()
            .copied()
            .map(Cow::Borrowed)
            .collect(),
    }
}
