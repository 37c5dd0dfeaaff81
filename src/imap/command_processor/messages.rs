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

//! Whole-message commands: APPEND, COPY, MOVE, EXPUNGE.

use std::borrow::Cow;

use super::defs::*;
use crate::account::model::*;
use crate::support::error::Error;

impl CommandProcessor {
    /// `APPEND`, with the items already assembled by the session loop
    /// (which owns the literal-reading protocol flow).
    pub fn cmd_append(
        &mut self,
        mailbox: &str,
        items: Vec<AppendItem>,
        out: &mut ResponseBuffer,
    ) -> s::Response<'static> {
        match self.do_append(mailbox, items) {
            Ok(response) => {
                self.command_boundary(true, false, out);
                response
            },
            Err(e) => map_error(&self.log_prefix, e),
        }
    }

    fn do_append(
        &mut self,
        mailbox: &str,
        items: Vec<AppendItem>,
    ) -> Result<s::Response<'static>, Error> {
        let mbox = match self.server.borrow_mut().get_mailbox(mailbox) {
            Ok(mbox) => mbox,
            Err(Error::NxMailbox) => {
                return Ok(no(
                    Some(s::RespTextCode::TryCreate(())),
                    "No such mailbox",
                ));
            },
            Err(e) => return Err(e),
        };

        {
            let store = self.server.borrow().store();
            mbox.borrow_mut().resync(&mut store.borrow_mut(), false)?;
        }

        let store = self.server.borrow().store();
        let result = mbox
            .borrow_mut()
            .append(&mut store.borrow_mut(), items)?;

        Ok(ok(
            Some(s::RespTextCode::AppendUid(s::AppendUidData {
                uid_validity: result.uidvalidity,
                uids: Cow::Owned(result.uids.to_string()),
            })),
            "APPEND completed",
        ))
    }

    pub(super) fn cmd_copy(
        &mut self,
        cmd: &s::CopyCommand<'_>,
        uid_command: bool,
    ) -> Result<s::Response<'static>, Error> {
        let uids = match self.resolve_set(&cmd.sequence_set, uid_command) {
            Ok(uids) => uids,
            Err(resp) => return Ok(resp),
        };
        if uids.is_empty() {
            // A UID COPY addressing only expunged messages is a no-op
            // success; a seqnum COPY cannot get here with an empty set.
            return Ok(ok(None, "COPY completed"));
        }

        let dest = match self.server.borrow_mut().get_mailbox(&cmd.mailbox)
        {
            Ok(dest) => dest,
            Err(Error::NxMailbox) => {
                return Ok(no(
                    Some(s::RespTextCode::TryCreate(())),
                    "No such mailbox",
                ));
            },
            Err(e) => return Err(e),
        };

        let state = match selected!(self) {
            Ok(state) => state,
            Err(resp) => return Ok(resp),
        };

        // Collect source material with the borrow released before the
        // destination is touched: the destination may be the source.
        let items = state.mailbox.borrow().export_messages(&uids)?;

        let store = self.server.borrow().store();
        let result = dest
            .borrow_mut()
            .append(&mut store.borrow_mut(), items)?;

        let mut from_uids = SeqRange::new();
        for &uid in &uids {
            from_uids.append(uid);
        }

        Ok(ok(
            Some(s::RespTextCode::CopyUid(s::CopyUidData {
                uid_validity: result.uidvalidity,
                from_uids: Cow::Owned(from_uids.to_string()),
                to_uids: Cow::Owned(result.uids.to_string()),
            })),
            "COPY completed",
        ))
    }

    pub(super) fn cmd_move(
        &mut self,
        cmd: &s::MoveCommand<'_>,
        uid_command: bool,
        _out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        if selected!(self)
            .map(|state| state.sel.read_only())
            .unwrap_or(true)
        {
            return Ok(no(None, "Mailbox is read-only"));
        }

        let copy_cmd = s::CopyCommand {
            sequence_set: cmd.sequence_set.clone(),
            mailbox: cmd.mailbox.clone(),
        };
        let uids = match self.resolve_set(&cmd.sequence_set, uid_command) {
            Ok(uids) => uids,
            Err(resp) => return Ok(resp),
        };

        let copied = self.cmd_copy(&copy_cmd, uid_command)?;
        let copyuid = match copied {
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                code,
                ..
            }) => code,
            other => return Ok(other),
        };

        // Copy succeeded; now expunge the source. The EXPUNGE responses
        // flow to this session at the command boundary (COPY/MOVE is the
        // one command where mid-command expunge reporting is even
        // permitted, but the boundary is never more than a moment away).
        let state = match selected!(self) {
            Ok(state) => state,
            Err(resp) => return Ok(resp),
        };
        let store = self.server.borrow().store();
        state
            .mailbox
            .borrow_mut()
            .expunge_uids(&mut store.borrow_mut(), &uids)?;

        Ok(s::Response::Cond(s::CondResponse {
            cond: s::RespCondType::Ok,
            code: copyuid,
            quip: Some(Cow::Borrowed("MOVE completed")),
        }))
    }

    pub(super) fn cmd_expunge(
        &mut self,
        filter: Option<SeqRange<Uid>>,
        _out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let state = match selected!(self) {
            Ok(state) => state,
            Err(resp) => return Ok(resp),
        };

        let store = self.server.borrow().store();
        state.mailbox.borrow_mut().expunge_deleted(
            &mut store.borrow_mut(),
            &state.sel,
            filter.as_ref(),
        )?;

        Ok(ok(None, "EXPUNGE completed"))
    }
}
