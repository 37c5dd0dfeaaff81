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

//! The mailbox object: one per on-disk MH folder per worker process.
//!
//! The `Mailbox` owns the authoritative UID map, the resync protocol, and
//! the flag state. Every session that has the mailbox selected holds a
//! `Selected` snapshot; snapshots drift from the authoritative state as the
//! resync engine observes external changes and reconverge as each session
//! drains its notifications at command boundaries.
//!
//! This module is split into several submodules for manageability but is
//! best thought of as one single module.

mod context;
mod expunge;
mod fetch;
mod flags;
mod messages;
mod resync;
mod search;
mod select;
mod sort;

pub use self::context::{
    Context, ContextUpdate, ContextWants, MAX_CONTEXTS_PER_SESSION,
};
pub use self::fetch::MessageData;
pub use self::search::{SearchOp, SearchProgram};
pub use self::select::Selected;
pub use self::sort::SortCriterion;

use std::collections::{BTreeMap, BTreeSet};

use crate::account::mh::{FolderFingerprint, MhFolder};
use crate::account::model::*;
use crate::account::storage;
use crate::support::error::Error;

/// One entry of the authoritative UID map, sorted ascending by UID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub uid: Uid,
    pub key: MsgKey,
    pub metadata: MessageMetadata,
}

pub struct Mailbox {
    pub(super) name: String,
    pub(super) folder: MhFolder,
    pub(super) id: storage::MailboxId,
    pub(super) uidvalidity: u32,
    pub(super) next_uid: Uid,
    /// The authoritative message list, ascending by UID (and therefore by
    /// order of first observation).
    pub(super) entries: Vec<Entry>,
    /// Flag name to set-of-UIDs. `\Recent` is not here; see `recent`.
    pub(super) flags: BTreeMap<Flag, BTreeSet<Uid>>,
    /// UIDs carrying the session-transient `\Recent` marker.
    pub(super) recent: BTreeSet<Uid>,
    /// Change generation: bumped on every observable mutation; per-message
    /// generations let each session compute which FETCH updates it has not
    /// yet reported.
    pub(super) generation: u64,
    pub(super) changed: BTreeMap<Uid, u64>,
    /// Fingerprint of the folder at the last completed resync.
    pub(super) fingerprint: FolderFingerprint,
    /// Wall clock of the last resync, seconds since the epoch.
    pub(super) last_resync: i64,
    /// Number of `Selected` handles currently alive.
    pub(super) selected_count: usize,
    /// Seconds-since-epoch when the last selected session went away; used
    /// by the expiry sweep.
    pub(super) idle_since: i64,
    /// True while a resync runs, enforcing the at-most-one-resync rule.
    pub(super) resync_running: bool,
}

impl Mailbox {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> storage::MailboxId {
        self.id
    }

    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity
    }

    pub fn next_uid(&self) -> Uid {
        self.next_uid
    }

    pub fn exists(&self) -> usize {
        self.entries.len()
    }

    pub fn selected_count(&self) -> usize {
        self.selected_count
    }

    pub fn folder(&self) -> &MhFolder {
        &self.folder
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn last_resync(&self) -> i64 {
        self.last_resync
    }

    pub fn idle_since(&self) -> i64 {
        self.idle_since
    }

    /// Point this object at a new name and folder after a RENAME. UIDs,
    /// flags, and session snapshots all carry over untouched.
    pub(crate) fn rename_to(&mut self, name: String, folder: MhFolder) {
        self.name = name;
        self.folder = folder;
    }

    /// Index into `entries` of the given UID.
    pub(super) fn entry_index(&self, uid: Uid) -> Option<usize> {
        self.entries
            .binary_search_by_key(&uid, |e| e.uid)
            .ok()
    }

    pub fn entry(&self, uid: Uid) -> Option<&Entry> {
        self.entry_index(uid).map(|ix| &self.entries[ix])
    }

    /// The flags of one message.
    pub fn message_flags(&self, uid: Uid) -> Vec<Flag> {
        self.flags
            .iter()
            .filter(|(_, uids)| uids.contains(&uid))
            .map(|(flag, _)| flag.clone())
            .collect()
    }

    pub fn test_flag(&self, flag: &Flag, uid: Uid) -> bool {
        self.flags
            .get(flag)
            .is_some_and(|uids| uids.contains(&uid))
    }

    /// All flags that currently exist in this mailbox, system flags first.
    pub fn defined_flags(&self) -> Vec<Flag> {
        let mut out: Vec<Flag> = Flag::SYSTEM.to_vec();
        for flag in self.flags.keys() {
            if !out.contains(flag) {
                out.push(flag.clone());
            }
        }
        out
    }

    /// Count of messages not marked `\Seen`.
    pub fn unseen_count(&self) -> usize {
        let seen = self.flags.get(&Flag::Seen);
        self.entries
            .iter()
            .filter(|e| !seen.is_some_and(|s| s.contains(&e.uid)))
            .count()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    /// Whether the on-disk folder still exists.
    pub fn folder_exists(&self) -> bool {
        self.folder.exists()
    }

    pub(super) fn bump(&mut self, uid: Uid) {
        self.generation += 1;
        self.changed.insert(uid, self.generation);
    }

    /// Load the message content for a UID.
    pub fn read_message(&self, uid: Uid) -> Result<Vec<u8>, Error> {
        let entry = self.entry(uid).ok_or(Error::ExpungedMessage)?;
        self.folder.read_message(entry.key)
    }

    /// Persist the complete current state in one transaction.
    pub(super) fn persist(
        &mut self,
        store: &mut storage::Store,
    ) -> Result<(), Error> {
        let uids: Vec<storage::UidRow> = self
            .entries
            .iter()
            .map(|e| storage::UidRow {
                uid: e.uid,
                msg_key: e.key,
                metadata: e.metadata.clone(),
            })
            .collect();

        let mut sequences = BTreeMap::new();
        for (flag, set) in &self.flags {
            if set.is_empty() {
                continue;
            }
            let mut range = SeqRange::new();
            for &uid in set {
                range.append(uid);
            }
            sequences.insert(flag.to_string(), range);
        }

        store.save_mailbox_state(
            self.id,
            self.uidvalidity,
            self.next_uid,
            &uids,
            &sequences,
            self.last_resync,
        )
    }
}
