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

//! The `STORE` operation.

use super::{Mailbox, Selected};
use crate::account::model::*;
use crate::account::storage;
use crate::support::error::Error;

impl Mailbox {
    /// Apply a flag mutation to the given UIDs.
    ///
    /// The mutation, `.mh_sequences` rewrite, and database persist all
    /// happen inside this one logical operation; on error the in-memory
    /// state is rolled back so the `NO` reply leaves the pre-command state.
    pub fn store_flags(
        &mut self,
        store: &mut storage::Store,
        sel: &Selected,
        uids: &[Uid],
        request: &StoreRequest<'_, Uid>,
    ) -> Result<(), Error> {
        if sel.read_only() {
            return Err(Error::MailboxReadOnly);
        }

        let saved_flags = self.flags.clone();
        let saved_generation = self.generation;
        let saved_changed = self.changed.clone();

        for &uid in uids {
            if self.entry_index(uid).is_none() {
                continue;
            }

            let mut modified = false;

            if request.remove_unlisted {
                // FLAGS form: everything not listed goes away.
                for (flag, set) in self.flags.iter_mut() {
                    if !request.flags.contains(flag) && set.remove(&uid) {
                        modified = true;
                    }
                }
            }

            for flag in request.flags {
                let set = self.flags.entry(flag.clone()).or_default();
                if request.remove_listed {
                    modified |= set.remove(&uid);
                } else {
                    modified |= set.insert(uid);
                }
            }

            if modified {
                self.bump(uid);
            }
        }

        let result = (|| {
            let target = self.sequences_for_disk();
            self.folder.write_sequences(&target)?;
            self.fingerprint = self.folder.fingerprint()?;
            self.persist(store)
        })();

        if result.is_err() {
            self.flags = saved_flags;
            self.generation = saved_generation;
            self.changed = saved_changed;
        }

        result
    }
}
