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

//! RFC 5267 update contexts: live search/sort result sets.
//!
//! A `SEARCH`/`SORT` with `RETURN (UPDATE ...)` leaves behind a context
//! keyed by its command tag. While the context is alive, every mailbox
//! change that toggles a message's membership produces `ADDTO`/`REMOVEFROM`
//! notifications, delivered to the owning session at its next command
//! boundary. Positions are 1-based ranks for sorted contexts and 0
//! otherwise; identifiers are always UIDs.

use super::search::SearchProgram;
use super::sort::SortCriterion;
use super::{Mailbox, Selected};
use crate::account::model::*;
use crate::support::error::Error;

/// Cap on live contexts per session; further UPDATE requests get NOUPDATE.
pub const MAX_CONTEXTS_PER_SESSION: usize = 8;

/// Which of the ESEARCH return data the client asked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextWants {
    pub min: bool,
    pub max: bool,
    pub all: bool,
    pub count: bool,
    pub partial: Option<(u32, u32)>,
}

pub struct Context {
    pub tag: String,
    /// Whether the originating command was a UID command.
    pub uid_command: bool,
    pub program: SearchProgram,
    pub sort: Option<Vec<SortCriterion>>,
    pub wants: ContextWants,
    /// The current result, in result order (rank order for sorts,
    /// ascending UID otherwise).
    pub result: Vec<Uid>,
}

/// One batch of membership changes for a context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextUpdate {
    /// `(position, uid)` pairs removed from the result.
    pub removed: Vec<(u32, Uid)>,
    /// `(position, uid)` pairs added to the result.
    pub added: Vec<(u32, Uid)>,
    /// New total count, if the context asked for COUNT.
    pub count: Option<usize>,
}

impl Context {
    pub fn new(
        tag: String,
        uid_command: bool,
        program: SearchProgram,
        sort: Option<Vec<SortCriterion>>,
        wants: ContextWants,
        result: Vec<Uid>,
    ) -> Self {
        Context {
            tag,
            uid_command,
            program,
            sort,
            wants,
            result,
        }
    }

    /// Re-evaluate the context against current mailbox state and return
    /// the membership diff, or `None` when nothing changed.
    pub fn update(
        &mut self,
        mailbox: &Mailbox,
        sel: &Selected,
    ) -> Result<Option<ContextUpdate>, Error> {
        let mut new_result = mailbox.search(sel, &self.program)?;
        if let Some(ref sort) = self.sort {
            new_result = mailbox.sort_uids(new_result, sort)?;
        }

        if new_result == self.result {
            return Ok(None);
        }

        let mut update = ContextUpdate::default();

        for (ix, &uid) in self.result.iter().enumerate() {
            if !new_result.contains(&uid) {
                let position = if self.sort.is_some() {
                    ix as u32 + 1
                } else {
                    0
                };
                update.removed.push((position, uid));
            }
        }

        for (ix, &uid) in new_result.iter().enumerate() {
            if !self.result.contains(&uid) {
                let position = if self.sort.is_some() {
                    ix as u32 + 1
                } else {
                    0
                };
                update.added.push((position, uid));
            }
        }

        self.result = new_result;
        update.count = self.wants.count.then_some(self.result.len());

        Ok(Some(update))
    }
}

#[cfg(test)]
mod test {
    use super::super::search::SearchOp;
    use super::super::test_fixture::TestFixture;
    use super::*;

    #[test]
    fn unseen_context_tracks_appends_and_stores() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        fixture.simple_append("INBOX");
        let (sel, _) = mbox.borrow_mut().select(false);

        let program = SearchProgram {
            op: SearchOp::Unseen,
        };
        let initial = mbox.borrow().search(&sel, &program).unwrap();
        let mut context = Context::new(
            "a".to_owned(),
            false,
            program,
            None,
            ContextWants {
                count: true,
                ..Default::default()
            },
            initial,
        );

        // Append another unseen message and drain the session so the
        // snapshot includes it.
        fixture.simple_append("INBOX");
        let mut sel = sel;
        mbox.borrow_mut().poll(&mut sel);

        let update = context
            .update(&mbox.borrow(), &sel)
            .unwrap()
            .expect("no update for append");
        assert_eq!(vec![(0, Uid::u(2))], update.added);
        assert!(update.removed.is_empty());
        assert_eq!(Some(2), update.count);

        // Mark the first message seen: it leaves the result.
        let ids = SeqRange::just(Uid::u(1));
        mbox.borrow_mut()
            .store_flags(
                &mut store.borrow_mut(),
                &sel,
                &[Uid::u(1)],
                &StoreRequest {
                    ids: &ids,
                    flags: &[Flag::Seen],
                    remove_listed: false,
                    remove_unlisted: false,
                    loud: false,
                },
            )
            .unwrap();

        let update = context
            .update(&mbox.borrow(), &sel)
            .unwrap()
            .expect("no update for store");
        assert_eq!(vec![(0, Uid::u(1))], update.removed);
        assert!(update.added.is_empty());
        assert_eq!(Some(1), update.count);

        // Re-running with no changes yields no update; replaying the
        // diffs reconstructed the same result a fresh search gives.
        assert!(context.update(&mbox.borrow(), &sel).unwrap().is_none());
        assert_eq!(
            mbox.borrow()
                .search(
                    &sel,
                    &SearchProgram {
                        op: SearchOp::Unseen
                    }
                )
                .unwrap(),
            context.result
        );
    }
}
