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

//! The `STORE` command.

use super::defs::*;
use crate::account::model::StoreRequest;
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) fn cmd_store(
        &mut self,
        cmd: &s::StoreCommand<'_>,
        uid_command: bool,
        _out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let uids = match self.resolve_set(&cmd.sequence_set, uid_command) {
            Ok(uids) => uids,
            Err(resp) => return Ok(resp),
        };

        let state = match selected!(self) {
            Ok(state) => state,
            Err(resp) => return Ok(resp),
        };

        let silent = cmd.silent;
        let request_ids = SeqRange::new();
        let request = StoreRequest {
            ids: &request_ids,
            flags: &cmd.flags,
            remove_listed: cmd.remove,
            remove_unlisted: !cmd.add && !cmd.remove,
            loud: !silent,
        };

        let store = self.server.borrow().store();
        state.mailbox.borrow_mut().store_flags(
            &mut store.borrow_mut(),
            &state.sel,
            &uids,
            &request,
        )?;

        if silent {
            // The session still learns about concurrent changes at the
            // boundary; only this command's own updates are suppressed.
            state
                .mailbox
                .borrow()
                .acknowledge_changes(&mut state.sel);
        }

        Ok(ok(None, "STORE completed"))
    }

    /// Resolve a wire sequence-set into concrete UIDs from the selected
    /// snapshot.
    pub(super) fn resolve_set(
        &mut self,
        raw: &str,
        uid_command: bool,
    ) -> PartialResult<Vec<Uid>> {
        if uid_command {
            let range = self.parse_uid_range(raw)?;
            Ok(selected!(self)?.sel.uids_in_range(&range))
        } else {
            let range = self.parse_seqnum_range(raw)?;
            Ok(selected!(self)?.sel.seqnum_range_to_uids(&range))
        }
    }
}
