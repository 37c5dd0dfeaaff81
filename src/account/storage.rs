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

//! The per-user SQLite store.
//!
//! One worker process owns exactly one database, at
//! `<maildir-root>/.asimap/store.sqlite3`. It records everything about a
//! mailbox that cannot be reconstructed from the MH folder itself: the
//! UIDVALIDITY, the next UID, the UID ↔ message-key map with per-message
//! metadata, the persisted flag sets, and the user's subscriptions.
//!
//! All mutation entry points take a transaction so a failed persist leaves
//! the database at the pre-command state; the caller then rolls back its
//! in-memory state to match.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::prelude::*;
use log::info;
use rusqlite::OptionalExtension as _;

use crate::account::model::{MessageMetadata, MsgKey, SeqRange, Uid};
use crate::support::error::Error;

/// Database-side identity of a mailbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MailboxId(pub i64);

impl rusqlite::types::ToSql for MailboxId {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl rusqlite::types::FromSql for MailboxId {
    fn column_result(
        value: rusqlite::types::ValueRef<'_>,
    ) -> rusqlite::types::FromSqlResult<Self> {
        i64::column_result(value).map(MailboxId)
    }
}

/// The persisted portion of a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxRow {
    pub id: MailboxId,
    pub path: String,
    pub uidvalidity: u32,
    pub next_uid: Uid,
    pub attrs: String,
    pub last_resync: i64,
}

/// One persisted message entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidRow {
    pub uid: Uid,
    pub msg_key: MsgKey,
    pub metadata: MessageMetadata,
}

pub struct Store {
    cxn: rusqlite::Connection,
}

static MIGRATION_V1: &str = "\
CREATE TABLE `mailboxes` (\
  `id` INTEGER NOT NULL PRIMARY KEY, \
  `path` TEXT NOT NULL UNIQUE, \
  `uidvalidity` INTEGER NOT NULL, \
  `next_uid` INTEGER NOT NULL, \
  `attrs` TEXT NOT NULL DEFAULT '', \
  `last_resync` INTEGER NOT NULL DEFAULT 0\
) STRICT;\n\
CREATE TABLE `uids` (\
  `mailbox_id` INTEGER NOT NULL \
    REFERENCES `mailboxes` (`id`) ON DELETE CASCADE, \
  `uid` INTEGER NOT NULL, \
  `msg_key` INTEGER NOT NULL, \
  `size` INTEGER NOT NULL, \
  `internal_date` TEXT NOT NULL, \
  PRIMARY KEY (`mailbox_id`, `uid`)\
) STRICT;\n\
CREATE TABLE `sequences` (\
  `mailbox_id` INTEGER NOT NULL \
    REFERENCES `mailboxes` (`id`) ON DELETE CASCADE, \
  `flag` TEXT NOT NULL, \
  `uid_set` TEXT NOT NULL, \
  PRIMARY KEY (`mailbox_id`, `flag`)\
) STRICT;\n\
CREATE TABLE `subscriptions` (\
  `path` TEXT NOT NULL PRIMARY KEY\
) STRICT;\n";

impl Store {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open(path)?;
        cxn.execute_batch("PRAGMA foreign_keys = ON")?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        {
            let txn = cxn.transaction_with_behavior(
                rusqlite::TransactionBehavior::Exclusive,
            )?;
            txn.execute(
                "CREATE TABLE IF NOT EXISTS `migration` (\
                   `version` INTEGER NOT NULL PRIMARY KEY, \
                   `applied_at` TEXT NOT NULL\
                 ) STRICT",
                (),
            )?;

            let current_version = txn
                .query_row(
                    "SELECT MAX(`version`) FROM `migration`",
                    (),
                    |row| row.get::<_, Option<u32>>(0),
                )?
                .unwrap_or(0);

            if current_version < 1 {
                info!("Applying V1 migration to user store");
                txn.execute_batch(MIGRATION_V1)?;
                txn.execute(
                    "INSERT INTO `migration` (`version`, `applied_at`) \
                     VALUES (1, ?)",
                    (Utc::now().to_rfc3339(),),
                )?;
            }

            txn.commit()?;
        }

        Ok(Self { cxn })
    }

    /// Fetch the persisted state of the mailbox at `path`, if any.
    pub fn fetch_mailbox(
        &mut self,
        path: &str,
    ) -> Result<Option<MailboxRow>, Error> {
        self.cxn
            .query_row(
                "SELECT `id`, `path`, `uidvalidity`, `next_uid`, \
                        `attrs`, `last_resync` \
                 FROM `mailboxes` WHERE `path` = ?",
                (path,),
                mailbox_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Register a new mailbox with the given UIDVALIDITY.
    pub fn create_mailbox(
        &mut self,
        path: &str,
        uidvalidity: u32,
    ) -> Result<MailboxRow, Error> {
        let txn = self.cxn.transaction()?;
        let inserted = txn.execute(
            "INSERT OR IGNORE INTO `mailboxes` \
             (`path`, `uidvalidity`, `next_uid`) VALUES (?, ?, 1)",
            (path, uidvalidity),
        )?;
        if 0 == inserted {
            return Err(Error::MailboxExists);
        }

        let id = MailboxId(txn.last_insert_rowid());
        txn.commit()?;

        Ok(MailboxRow {
            id,
            path: path.to_owned(),
            uidvalidity,
            next_uid: Uid::MIN,
            attrs: String::new(),
            last_resync: 0,
        })
    }

    /// Drop a mailbox and, via cascade, its UID map and sequences.
    pub fn delete_mailbox(&mut self, id: MailboxId) -> Result<(), Error> {
        let deleted = self
            .cxn
            .execute("DELETE FROM `mailboxes` WHERE `id` = ?", (id,))?;
        if 0 == deleted {
            return Err(Error::NxMailbox);
        }
        Ok(())
    }

    /// Rename `old_path` and every descendant path under it.
    pub fn rename_mailbox(
        &mut self,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), Error> {
        let txn = self.cxn.transaction()?;

        let renamed = txn.execute(
            "UPDATE `mailboxes` SET `path` = ? WHERE `path` = ?",
            (new_path, old_path),
        )?;
        if 0 == renamed {
            return Err(Error::NxMailbox);
        }

        let prefix = format!("{}/", old_path);
        let new_prefix = format!("{}/", new_path);
        txn.execute(
            "UPDATE `mailboxes` \
             SET `path` = ? || substr(`path`, ?) \
             WHERE substr(`path`, 1, ?) = ?",
            (
                &new_prefix,
                prefix.len() as i64 + 1,
                prefix.len() as i64,
                &prefix,
            ),
        )?;
        txn.execute(
            "UPDATE OR IGNORE `subscriptions` \
             SET `path` = ? || substr(`path`, ?) \
             WHERE substr(`path`, 1, ?) = ?",
            (
                &new_prefix,
                prefix.len() as i64 + 1,
                prefix.len() as i64,
                &prefix,
            ),
        )?;

        txn.commit()?;
        Ok(())
    }

    /// Load the UID map for a mailbox, sorted ascending by UID.
    pub fn load_uids(&mut self, id: MailboxId) -> Result<Vec<UidRow>, Error> {
        self.cxn
            .prepare(
                "SELECT `uid`, `msg_key`, `size`, `internal_date` \
                 FROM `uids` WHERE `mailbox_id` = ? ORDER BY `uid`",
            )?
            .query_map((id,), uid_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Load the persisted flag sets for a mailbox.
    pub fn load_sequences(
        &mut self,
        id: MailboxId,
    ) -> Result<BTreeMap<String, SeqRange<Uid>>, Error> {
        let raw = self
            .cxn
            .prepare(
                "SELECT `flag`, `uid_set` FROM `sequences` \
                 WHERE `mailbox_id` = ?",
            )?
            .query_map((id,), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sequences = BTreeMap::new();
        for (flag, uid_set) in raw {
            if let Some(set) = SeqRange::parse(&uid_set, Uid::MAX) {
                sequences.insert(flag, set);
            }
        }
        Ok(sequences)
    }

    /// Persist the full post-resync state of one mailbox in a single
    /// transaction: `(uidvalidity, next_uid, UID map, flag sets,
    /// last_resync)`.
    pub fn save_mailbox_state(
        &mut self,
        id: MailboxId,
        uidvalidity: u32,
        next_uid: Uid,
        uids: &[UidRow],
        sequences: &BTreeMap<String, SeqRange<Uid>>,
        last_resync: i64,
    ) -> Result<(), Error> {
        let txn = self.cxn.transaction()?;

        let updated = txn.execute(
            "UPDATE `mailboxes` SET `uidvalidity` = ?, `next_uid` = ?, \
             `last_resync` = ? WHERE `id` = ?",
            (uidvalidity, u32::from(next_uid), last_resync, id),
        )?;
        if 0 == updated {
            return Err(Error::NxMailbox);
        }

        txn.execute("DELETE FROM `uids` WHERE `mailbox_id` = ?", (id,))?;
        {
            let mut insert = txn.prepare(
                "INSERT INTO `uids` \
                 (`mailbox_id`, `uid`, `msg_key`, `size`, `internal_date`) \
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for row in uids {
                insert.execute((
                    id,
                    u32::from(row.uid),
                    row.msg_key.0,
                    row.metadata.size,
                    row.metadata.internal_date.to_rfc3339(),
                ))?;
            }
        }

        txn.execute(
            "DELETE FROM `sequences` WHERE `mailbox_id` = ?",
            (id,),
        )?;
        {
            let mut insert = txn.prepare(
                "INSERT INTO `sequences` (`mailbox_id`, `flag`, `uid_set`) \
                 VALUES (?, ?, ?)",
            )?;
            for (flag, set) in sequences {
                if !set.is_empty() {
                    insert.execute((id, flag, set.to_string()))?;
                }
            }
        }

        txn.commit()?;
        Ok(())
    }

    /// All mailbox paths currently registered.
    pub fn all_mailbox_paths(&mut self) -> Result<Vec<String>, Error> {
        self.cxn
            .prepare("SELECT `path` FROM `mailboxes` ORDER BY `path`")?
            .query_map((), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn is_subscribed(&mut self, path: &str) -> Result<bool, Error> {
        let n: i64 = self.cxn.query_row(
            "SELECT COUNT(*) FROM `subscriptions` WHERE `path` = ?",
            (path,),
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn subscribe(&mut self, path: &str) -> Result<(), Error> {
        self.cxn.execute(
            "INSERT OR IGNORE INTO `subscriptions` (`path`) VALUES (?)",
            (path,),
        )?;
        Ok(())
    }

    pub fn unsubscribe(&mut self, path: &str) -> Result<(), Error> {
        self.cxn.execute(
            "DELETE FROM `subscriptions` WHERE `path` = ?",
            (path,),
        )?;
        Ok(())
    }

    pub fn subscriptions(&mut self) -> Result<Vec<String>, Error> {
        self.cxn
            .prepare("SELECT `path` FROM `subscriptions` ORDER BY `path`")?
            .query_map((), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn mailbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxRow> {
    Ok(MailboxRow {
        id: row.get(0)?,
        path: row.get(1)?,
        uidvalidity: row.get(2)?,
        next_uid: Uid::of(row.get(3)?).unwrap_or(Uid::MIN),
        attrs: row.get(4)?,
        last_resync: row.get(5)?,
    })
}

fn uid_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UidRow> {
    let internal_date: String = row.get(3)?;
    Ok(UidRow {
        uid: Uid::of(row.get(0)?).unwrap_or(Uid::MIN),
        msg_key: MsgKey(row.get(1)?),
        metadata: MessageMetadata {
            size: row.get(2)?,
            internal_date: DateTime::parse_from_rfc3339(&internal_date)
                .unwrap_or_else(|_| {
                    FixedOffset::east_opt(0)
                        .unwrap()
                        .timestamp_opt(0, 0)
                        .unwrap()
                }),
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("store.sqlite3")).unwrap();
        (dir, store)
    }

    fn uid_row(uid: u32, key: u32) -> UidRow {
        UidRow {
            uid: Uid::u(uid),
            msg_key: MsgKey(key),
            metadata: MessageMetadata {
                size: 100 + key,
                internal_date: FixedOffset::east_opt(3600)
                    .unwrap()
                    .with_ymd_and_hms(2020, 7, 4, 16, 31, 0)
                    .unwrap(),
            },
        }
    }

    #[test]
    fn create_fetch_save_load() {
        let (_dir, mut store) = fixture();

        assert!(store.fetch_mailbox("INBOX").unwrap().is_none());
        let row = store.create_mailbox("INBOX", 1_700_000_000).unwrap();
        assert_eq!(Uid::MIN, row.next_uid);
        assert_matches!(
            Err(Error::MailboxExists),
            store.create_mailbox("INBOX", 1)
        );

        let uids = vec![uid_row(1, 1), uid_row(2, 5)];
        let mut sequences = BTreeMap::new();
        sequences
            .insert("deleted".to_owned(), SeqRange::just(Uid::u(2)));
        store
            .save_mailbox_state(
                row.id,
                1_700_000_000,
                Uid::u(3),
                &uids,
                &sequences,
                42,
            )
            .unwrap();

        let row = store.fetch_mailbox("INBOX").unwrap().unwrap();
        assert_eq!(Uid::u(3), row.next_uid);
        assert_eq!(42, row.last_resync);
        assert_eq!(uids, store.load_uids(row.id).unwrap());

        let loaded = store.load_sequences(row.id).unwrap();
        assert!(loaded["deleted"].contains(Uid::u(2)));
        assert!(!loaded["deleted"].contains(Uid::u(1)));
    }

    #[test]
    fn rename_moves_children() {
        let (_dir, mut store) = fixture();
        store.create_mailbox("work", 1).unwrap();
        store.create_mailbox("work/2023", 2).unwrap();
        store.create_mailbox("work/2023/q1", 3).unwrap();
        store.create_mailbox("workother", 4).unwrap();
        store.subscribe("work/2023").unwrap();

        store.rename_mailbox("work", "archive").unwrap();

        let paths = store.all_mailbox_paths().unwrap();
        assert_eq!(
            vec![
                "archive".to_owned(),
                "archive/2023".to_owned(),
                "archive/2023/q1".to_owned(),
                "workother".to_owned(),
            ],
            paths
        );
        assert_eq!(
            vec!["archive/2023".to_owned()],
            store.subscriptions().unwrap()
        );
    }

    #[test]
    fn delete_cascades() {
        let (_dir, mut store) = fixture();
        let row = store.create_mailbox("trash", 1).unwrap();
        store
            .save_mailbox_state(
                row.id,
                1,
                Uid::u(2),
                &[uid_row(1, 1)],
                &BTreeMap::new(),
                0,
            )
            .unwrap();

        store.delete_mailbox(row.id).unwrap();
        assert!(store.fetch_mailbox("trash").unwrap().is_none());
        assert_matches!(Err(Error::NxMailbox), store.delete_mailbox(row.id));
    }

    #[test]
    fn subscriptions_are_a_set() {
        let (_dir, mut store) = fixture();
        assert!(!store.is_subscribed("INBOX").unwrap());
        store.subscribe("INBOX").unwrap();
        store.subscribe("INBOX").unwrap();
        assert!(store.is_subscribed("INBOX").unwrap());
        assert_eq!(vec!["INBOX".to_owned()], store.subscriptions().unwrap());
        store.unsubscribe("INBOX").unwrap();
        assert!(!store.is_subscribed("INBOX").unwrap());
    }
}
