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

//! `EXPUNGE`, `UID EXPUNGE`, and the expunge half of `CLOSE`/`MOVE`.

use super::{Mailbox, Selected};
use crate::account::model::*;
use crate::account::storage;
use crate::support::error::Error;

impl Mailbox {
    /// Remove every message bearing `\Deleted` (optionally intersected
    /// with `filter`, for `UID EXPUNGE`) from the store.
    ///
    /// Sessions observe the removals through their next poll; nothing here
    /// touches any snapshot.
    pub fn expunge_deleted(
        &mut self,
        store: &mut storage::Store,
        sel: &Selected,
        filter: Option<&SeqRange<Uid>>,
    ) -> Result<Vec<Uid>, Error> {
        if sel.read_only() {
            return Err(Error::MailboxReadOnly);
        }

        let victims: Vec<Uid> = self
            .flags
            .get(&Flag::Deleted)
            .map(|deleted| {
                deleted
                    .iter()
                    .copied()
                    .filter(|&uid| {
                        filter.map_or(true, |f| f.contains(uid))
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.expunge_uids(store, &victims)?;
        Ok(victims)
    }

    /// Remove the given messages outright, as the source half of `MOVE`.
    pub fn expunge_uids(
        &mut self,
        store: &mut storage::Store,
        uids: &[Uid],
    ) -> Result<(), Error> {
        if uids.is_empty() {
            return Ok(());
        }

        for &uid in uids {
            if let Some(entry) = self.entry(uid) {
                match self.folder.remove_message(entry.key) {
                    // Someone else already removed the file; the UID dies
                    // all the same.
                    Ok(()) | Err(Error::ExpungedMessage) => (),
                    Err(e) => return Err(e),
                }
            }
        }

        let uid_set: std::collections::BTreeSet<Uid> =
            uids.iter().copied().collect();
        self.entries.retain(|e| !uid_set.contains(&e.uid));
        for set in self.flags.values_mut() {
            for uid in &uid_set {
                set.remove(uid);
            }
        }
        for uid in &uid_set {
            self.recent.remove(uid);
            self.changed.remove(uid);
        }
        self.generation += 1;

        let target = self.sequences_for_disk();
        self.folder.write_sequences(&target)?;
        self.fingerprint = self.folder.fingerprint()?;
        self.persist(store)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test_fixture::TestFixture;
    use super::*;

    fn flag_deleted(fixture: &TestFixture, uids: &[u32]) {
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();
        let (sel, _) = mbox.borrow_mut().select(false);
        let uids: Vec<Uid> = uids.iter().map(|&u| Uid::u(u)).collect();
        let ids = SeqRange::new();
        mbox.borrow_mut()
            .store_flags(
                &mut store.borrow_mut(),
                &sel,
                &uids,
                &StoreRequest {
                    ids: &ids,
                    flags: &[Flag::Deleted],
                    remove_listed: false,
                    remove_unlisted: false,
                    loud: false,
                },
            )
            .unwrap();
        mbox.borrow_mut()
            .deselect(sel, &mut store.borrow_mut())
            .unwrap();
    }

    #[test]
    fn uid_expunge_honours_subset() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        for _ in 0..9 {
            fixture.simple_append("INBOX");
        }
        flag_deleted(&fixture, &[5, 7, 9]);

        let (mut sel, _) = mbox.borrow_mut().select(false);
        let filter = SeqRange::parse("6:8", Uid::u(9)).unwrap();
        let expunged = mbox
            .borrow_mut()
            .expunge_deleted(&mut store.borrow_mut(), &sel, Some(&filter))
            .unwrap();

        assert_eq!(vec![Uid::u(7)], expunged);
        assert_eq!(8, mbox.borrow().exists());
        // UIDs 5 and 9 still carry \Deleted.
        assert!(mbox.borrow().test_flag(&Flag::Deleted, Uid::u(5)));
        assert!(mbox.borrow().test_flag(&Flag::Deleted, Uid::u(9)));

        // The session sees exactly one EXPUNGE, at UID 7's current seqnum.
        let poll = mbox.borrow_mut().poll(&mut sel);
        assert_eq!(vec![(Seqnum::u(7), Uid::u(7))], poll.expunge);
    }

    #[test]
    fn expunge_all_deleted() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        for _ in 0..3 {
            fixture.simple_append("INBOX");
        }
        flag_deleted(&fixture, &[1, 3]);

        let (mut sel, _) = mbox.borrow_mut().select(false);
        let expunged = mbox
            .borrow_mut()
            .expunge_deleted(&mut store.borrow_mut(), &sel, None)
            .unwrap();
        assert_eq!(vec![Uid::u(1), Uid::u(3)], expunged);

        let poll = mbox.borrow_mut().poll(&mut sel);
        // Ascending here; the session layer emits them in reverse.
        assert_eq!(
            vec![
                (Seqnum::u(1), Uid::u(1)),
                (Seqnum::u(3), Uid::u(3)),
            ],
            poll.expunge
        );
        assert_eq!(1, mbox.borrow().exists());

        // The message files are really gone.
        assert_matches!(
            Err(Error::ExpungedMessage),
            mbox.borrow().read_message(Uid::u(1))
        );
    }

    #[test]
    fn read_only_cannot_expunge() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();
        fixture.simple_append("INBOX");

        let (sel, _) = mbox.borrow_mut().select(true);
        assert_matches!(
            Err(Error::MailboxReadOnly),
            mbox.borrow_mut().expunge_deleted(
                &mut store.borrow_mut(),
                &sel,
                None
            )
        );
    }
}
