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

//! Session snapshots and the notification poll.

use std::collections::BTreeSet;

use super::Mailbox;
use crate::account::model::*;
use crate::account::storage;
use crate::support::error::Error;

/// The per-session view of a selected mailbox.
///
/// The snapshot maps sequence numbers (index + 1) to UIDs as this client
/// currently believes them to be. It only changes when the session drains
/// notifications at a command boundary, so concurrent sessions' sequence
/// numbers legitimately diverge until each has caught up.
#[derive(Clone, Debug)]
pub struct Selected {
    pub(super) read_only: bool,
    pub(super) snapshot: Vec<Uid>,
    /// UIDs this session reports as `\Recent`.
    pub(super) recent: BTreeSet<Uid>,
    /// Mailbox generation up to which flag changes have been reported.
    pub(super) seen_generation: u64,
}

impl Selected {
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn exists(&self) -> usize {
        self.snapshot.len()
    }

    pub fn max_seqnum(&self) -> u32 {
        self.snapshot.len() as u32
    }

    pub fn uid_of(&self, seqnum: Seqnum) -> Option<Uid> {
        self.snapshot.get(seqnum.to_index()).copied()
    }

    pub fn seqnum_of(&self, uid: Uid) -> Option<Seqnum> {
        self.snapshot
            .binary_search(&uid)
            .ok()
            .map(Seqnum::from_index)
    }

    /// The largest UID in this snapshot, for `*` resolution in UID sets.
    pub fn max_uid(&self) -> Option<Uid> {
        self.snapshot.last().copied()
    }

    /// Translate a seqnum set into the corresponding UIDs, ascending.
    pub fn seqnum_range_to_uids(
        &self,
        range: &SeqRange<Seqnum>,
    ) -> Vec<Uid> {
        range
            .items(self.max_seqnum())
            .filter_map(|sn| self.uid_of(sn))
            .collect()
    }

    /// UIDs of this snapshot contained in a UID set, ascending.
    pub fn uids_in_range(&self, range: &SeqRange<Uid>) -> Vec<Uid> {
        self.snapshot
            .iter()
            .copied()
            .filter(|&uid| range.contains(uid))
            .collect()
    }

    pub fn is_recent(&self, uid: Uid) -> bool {
        self.recent.contains(&uid)
    }
}

impl Mailbox {
    /// Begin a selected session against this mailbox.
    ///
    /// The caller must have run `resync` first so the snapshot reflects
    /// current reality.
    pub fn select(&mut self, read_only: bool) -> (Selected, SelectResponse) {
        let snapshot: Vec<Uid> = self.entries.iter().map(|e| e.uid).collect();
        let recent: BTreeSet<Uid> = self
            .recent
            .iter()
            .copied()
            .filter(|uid| self.entry_index(*uid).is_some())
            .collect();

        let seen = self.flags.get(&Flag::Seen);
        let unseen = snapshot
            .iter()
            .position(|uid| !seen.is_some_and(|s| s.contains(uid)))
            .map(Seqnum::from_index);

        let selected = Selected {
            read_only,
            snapshot: snapshot.clone(),
            recent: recent.clone(),
            seen_generation: self.generation,
        };

        self.selected_count += 1;

        let response = SelectResponse {
            flags: self.defined_flags(),
            exists: snapshot.len(),
            recent: recent.len(),
            unseen,
            uidnext: self.next_uid,
            uidvalidity: self.uidvalidity,
            read_only,
        };

        (selected, response)
    }

    /// End a selected session.
    ///
    /// When the last session leaves, the `\Recent` markers die with it:
    /// they are transient and scoped to the sessions that observed them.
    pub fn deselect(
        &mut self,
        _selected: Selected,
        store: &mut storage::Store,
    ) -> Result<(), Error> {
        self.selected_count = self.selected_count.saturating_sub(1);
        if 0 == self.selected_count {
            self.idle_since = chrono::Utc::now().timestamp();
            if !self.recent.is_empty() {
                self.recent.clear();
                if self.folder.exists() {
                    let target = self.sequences_for_disk();
                    self.folder.write_sequences(&target)?;
                    self.fingerprint = self.folder.fingerprint()?;
                    self.persist(store)?;
                }
            }
        }
        Ok(())
    }

    /// Compute the unsolicited responses a session is due, updating its
    /// snapshot accordingly.
    ///
    /// Expunges are returned ascending and must be *emitted* descending so
    /// every line's seqnum is correct at delivery time.
    pub fn poll(&mut self, sel: &mut Selected) -> PollResponse {
        // Expunges: messages in the snapshot that no longer exist.
        let expunge: Vec<(Seqnum, Uid)> = sel
            .snapshot
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, uid)| self.entry_index(uid).is_none())
            .map(|(ix, uid)| (Seqnum::from_index(ix), uid))
            .collect();

        sel.snapshot.retain(|&uid| self.entry_index(uid).is_some());
        for &(_, uid) in &expunge {
            sel.recent.remove(&uid);
        }

        // New messages: authoritative entries this snapshot has not seen.
        // UIDs ascend, so they all append at the end.
        let old_max = sel.snapshot.last().copied();
        let mut new_uids = Vec::new();
        for entry in &self.entries {
            if old_max.map_or(true, |max| entry.uid > max)
                && !sel.snapshot.contains(&entry.uid)
            {
                new_uids.push(entry.uid);
            }
        }
        sel.snapshot.extend(new_uids.iter().copied());
        sel.snapshot.sort_unstable();
        for &uid in &new_uids {
            if self.recent.contains(&uid) {
                sel.recent.insert(uid);
            }
        }

        // Flag updates this session has not yet been told about.
        let mut fetch: Vec<Uid> = sel
            .snapshot
            .iter()
            .copied()
            .filter(|uid| {
                self.changed
                    .get(uid)
                    .is_some_and(|&gen| gen > sel.seen_generation)
            })
            .collect();
        for &uid in &new_uids {
            if !fetch.contains(&uid) {
                fetch.push(uid);
            }
        }
        fetch.sort_unstable();
        sel.seen_generation = self.generation;

        PollResponse {
            expunge,
            exists: (!new_uids.is_empty()).then(|| sel.snapshot.len()),
            recent: (!new_uids.is_empty()).then(|| sel.recent.len()),
            fetch,
        }
    }

    /// The reduced poll used after FETCH/STORE/SEARCH, where EXPUNGE and
    /// EXISTS responses are forbidden: only flag updates for messages
    /// already in the snapshot are reported.
    pub fn mini_poll(&mut self, sel: &mut Selected) -> Vec<Uid> {
        let fetch: Vec<Uid> = sel
            .snapshot
            .iter()
            .copied()
            .filter(|uid| self.entry_index(*uid).is_some())
            .filter(|uid| {
                self.changed
                    .get(uid)
                    .is_some_and(|&gen| gen > sel.seen_generation)
            })
            .collect();
        sel.seen_generation = self.generation;
        fetch
    }

    /// Mark all current changes as already reported to `sel`, without
    /// emitting them. Used for the `.SILENT` STORE forms.
    pub fn acknowledge_changes(&self, sel: &mut Selected) {
        sel.seen_generation = self.generation;
    }

    /// Whether this session has pending expunge events it has not been
    /// told about.
    pub fn has_pending_expunge(&self, sel: &Selected) -> bool {
        sel.snapshot
            .iter()
            .any(|&uid| self.entry_index(uid).is_none())
    }
}

#[cfg(test)]
mod test {
    use super::super::test_fixture::TestFixture;
    use super::*;

    #[test]
    fn select_of_empty_mailbox() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let (_sel, response) = mbox.borrow_mut().select(false);
        assert_eq!(0, response.exists);
        assert_eq!(0, response.recent);
        assert_eq!(None, response.unseen);
        assert_eq!(Uid::MIN, response.uidnext);
        assert!(!response.read_only);
    }

    #[test]
    fn two_sessions_diverge_and_reconverge() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        for _ in 0..3 {
            fixture.deliver_externally("INBOX", b"x\r\n");
        }
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), false)
            .unwrap();

        let (mut sel1, r1) = mbox.borrow_mut().select(false);
        let (mut sel2, r2) = mbox.borrow_mut().select(false);
        assert_eq!(3, r1.exists);
        assert_eq!(3, r2.exists);

        // Message 2 (key 2, uid 2) disappears externally.
        let folder = mbox.borrow().folder().clone();
        folder.remove_message(MsgKey(2)).unwrap();
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), true)
            .unwrap();

        // Session 1 drains; session 2 has not yet.
        let poll1 = mbox.borrow_mut().poll(&mut sel1);
        assert_eq!(vec![(Seqnum::u(2), Uid::u(2))], poll1.expunge);
        assert_eq!(2, sel1.exists());
        assert_eq!(3, sel2.exists());
        assert!(mbox.borrow().has_pending_expunge(&sel2));

        // In session 2's stale snapshot, uid 3 is still seqnum 3.
        assert_eq!(Some(Seqnum::u(3)), sel2.seqnum_of(Uid::u(3)));
        // Session 1 has shifted it down.
        assert_eq!(Some(Seqnum::u(2)), sel1.seqnum_of(Uid::u(3)));

        let poll2 = mbox.borrow_mut().poll(&mut sel2);
        assert_eq!(vec![(Seqnum::u(2), Uid::u(2))], poll2.expunge);
        assert_eq!(sel1.snapshot, sel2.snapshot);
    }

    #[test]
    fn poll_reports_new_messages_once() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        let (mut sel, _) = mbox.borrow_mut().select(false);

        fixture.deliver_externally("INBOX", b"x\r\n");
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), false)
            .unwrap();

        let poll = mbox.borrow_mut().poll(&mut sel);
        assert_eq!(Some(1), poll.exists);
        assert_eq!(Some(1), poll.recent);
        assert_eq!(vec![Uid::u(1)], poll.fetch);

        let poll = mbox.borrow_mut().poll(&mut sel);
        assert_eq!(PollResponse::default(), poll);
    }

    #[test]
    fn mini_poll_withholds_expunges() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        fixture.deliver_externally("INBOX", b"x\r\n");
        fixture.deliver_externally("INBOX", b"y\r\n");
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), false)
            .unwrap();
        let (mut sel, _) = mbox.borrow_mut().select(false);

        let folder = mbox.borrow().folder().clone();
        folder.remove_message(MsgKey(1)).unwrap();
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), true)
            .unwrap();

        // The mini poll must not touch the snapshot.
        let fetch = mbox.borrow_mut().mini_poll(&mut sel);
        assert!(fetch.is_empty());
        assert_eq!(2, sel.exists());

        let poll = mbox.borrow_mut().poll(&mut sel);
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], poll.expunge);
    }

    #[test]
    fn recent_cleared_when_last_session_leaves() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        fixture.deliver_externally("INBOX", b"x\r\n");
        mbox.borrow_mut()
            .resync(&mut store.borrow_mut(), false)
            .unwrap();

        let (sel, response) = mbox.borrow_mut().select(false);
        assert_eq!(1, response.recent);

        mbox.borrow_mut()
            .deselect(sel, &mut store.borrow_mut())
            .unwrap();
        assert_eq!(0, mbox.borrow().recent_count());

        let (_sel, response) = mbox.borrow_mut().select(false);
        assert_eq!(0, response.recent);
    }
}
