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

//! Message insertion: `APPEND` (including MULTIAPPEND) and the receiving
//! half of `COPY`/`MOVE`.

use chrono::prelude::*;

use super::{Entry, Mailbox};
use crate::account::model::*;
use crate::account::storage;
use crate::support::error::Error;

impl Mailbox {
    /// Insert the given messages, assigning UIDs in ascending order.
    ///
    /// This is atomic in the MULTIAPPEND sense: on any failure, files
    /// already written for earlier items are removed and neither the
    /// in-memory nor persisted state changes.
    pub fn append(
        &mut self,
        store: &mut storage::Store,
        items: Vec<AppendItem>,
    ) -> Result<AppendResponse, Error> {
        // Write all the files first; nothing in `self` changes until every
        // octet is safely on disk.
        let mut written = Vec::new();
        for item in &items {
            match self.folder.add_message(&item.data) {
                Ok(key) => written.push(key),
                Err(e) => {
                    for &key in &written {
                        let _ = self.folder.remove_message(key);
                    }
                    return Err(e);
                },
            }
        }

        let saved_next_uid = self.next_uid;
        let saved_len = self.entries.len();
        let saved_flags = self.flags.clone();
        let saved_recent = self.recent.clone();
        let saved_generation = self.generation;
        let saved_changed = self.changed.clone();

        let mut uids = SeqRange::new();
        for (item, &key) in items.iter().zip(&written) {
            let uid = self.next_uid;
            self.next_uid = self.next_uid.next().ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "UID space exhausted",
                ))
            })?;

            self.entries.push(Entry {
                uid,
                key,
                metadata: MessageMetadata {
                    size: item.data.len() as u32,
                    internal_date: item
                        .internal_date
                        .unwrap_or_else(|| Utc::now().fixed_offset()),
                },
            });

            for flag in &item.flags {
                self.flags.entry(flag.clone()).or_default().insert(uid);
            }
            self.recent.insert(uid);
            self.bump(uid);
            uids.append(uid);
        }

        let result = (|| {
            let target = self.sequences_for_disk();
            self.folder.write_sequences(&target)?;
            self.fingerprint = self.folder.fingerprint()?;
            self.persist(store)
        })();

        if result.is_err() {
            for &key in &written {
                let _ = self.folder.remove_message(key);
            }
            self.next_uid = saved_next_uid;
            self.entries.truncate(saved_len);
            self.flags = saved_flags;
            self.recent = saved_recent;
            self.generation = saved_generation;
            self.changed = saved_changed;
            return Err(result.unwrap_err());
        }

        Ok(AppendResponse {
            uidvalidity: self.uidvalidity,
            uids,
        })
    }

    /// Build the `AppendItem`s representing the given messages of this
    /// mailbox, for transfer to a COPY/MOVE destination.
    ///
    /// `\Recent` does not travel; the destination assigns its own recency.
    pub fn export_messages(
        &self,
        uids: &[Uid],
    ) -> Result<Vec<AppendItem>, Error> {
        let mut items = Vec::with_capacity(uids.len());
        for &uid in uids {
            let entry = self.entry(uid).ok_or(Error::ExpungedMessage)?;
            let data = self.folder.read_message(entry.key)?;
            items.push(AppendItem {
                flags: self.message_flags(uid),
                internal_date: Some(entry.metadata.internal_date),
                data,
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_fixture::TestFixture;
    use super::*;

    #[test]
    fn multiappend_assigns_ascending_uids() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        let response = mbox
            .borrow_mut()
            .append(
                &mut store.borrow_mut(),
                vec![
                    AppendItem {
                        flags: vec![Flag::Seen],
                        internal_date: None,
                        data: b"Subject: a\r\n\r\n0123456789".to_vec(),
                    },
                    AppendItem {
                        flags: vec![],
                        internal_date: None,
                        data: b"Subject: b\r\n\r\n0123456789".to_vec(),
                    },
                ],
            )
            .unwrap();

        assert_eq!("1:2", response.uids.to_string());
        let mbox_ref = mbox.borrow();
        assert_eq!(2, mbox_ref.exists());
        assert!(mbox_ref.test_flag(&Flag::Seen, Uid::u(1)));
        assert!(!mbox_ref.test_flag(&Flag::Seen, Uid::u(2)));
        assert_eq!(2, mbox_ref.recent_count());

        // The seen/unseen split must be reflected on disk.
        let seq = mbox_ref.folder().read_sequences().unwrap();
        assert!(seq["Seen"].contains(&MsgKey(1)));
        assert!(seq["unseen"].contains(&MsgKey(2)));
        assert!(!seq["unseen"].contains(&MsgKey(1)));
    }

    #[test]
    fn append_round_trips_bytes_exactly() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        // Binary-ish content with mixed line endings and 8-bit octets.
        let payload =
            b"Subject: bytes\r\n\r\n\x01\x02\xffraw\nmixed\r\n".to_vec();
        mbox.borrow_mut()
            .append(
                &mut store.borrow_mut(),
                vec![AppendItem {
                    flags: vec![],
                    internal_date: None,
                    data: payload.clone(),
                }],
            )
            .unwrap();

        assert_eq!(payload, mbox.borrow().read_message(Uid::u(1)).unwrap());
    }

    #[test]
    fn appended_internal_date_is_kept() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        let date = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2020, 7, 4, 16, 31, 0)
            .unwrap();
        mbox.borrow_mut()
            .append(
                &mut store.borrow_mut(),
                vec![AppendItem {
                    flags: vec![],
                    internal_date: Some(date),
                    data: b"x".to_vec(),
                }],
            )
            .unwrap();

        assert_eq!(
            date,
            mbox.borrow().entry(Uid::u(1)).unwrap().metadata.internal_date
        );
    }

    #[test]
    fn uids_stay_monotonic_under_random_operations() {
        use proptest::prelude::*;

        // Each op is either an append (true) or an expunge of the n-th
        // currently-present message (false, index).
        let ops_strategy =
            proptest::collection::vec((any::<bool>(), 0usize..8), 1..24);

        let mut runner = proptest::test_runner::TestRunner::new(
            proptest::test_runner::Config {
                cases: 16,
                ..proptest::test_runner::Config::default()
            },
        );

        runner
            .run(&ops_strategy, |ops| {
                let fixture = TestFixture::new();
                let mbox = fixture.mailbox("INBOX");
                let store = fixture.store();

                let mut ever_assigned: Vec<u32> = Vec::new();

                for (is_append, n) in ops {
                    if is_append {
                        let response = mbox
                            .borrow_mut()
                            .append(
                                &mut store.borrow_mut(),
                                vec![AppendItem {
                                    flags: vec![],
                                    internal_date: None,
                                    data: b"x\r\n".to_vec(),
                                }],
                            )
                            .unwrap();
                        let uid: u32 = response
                            .uids
                            .items(u32::MAX)
                            .next()
                            .unwrap()
                            .into();
                        // Strictly greater than everything ever assigned.
                        prop_assert!(ever_assigned
                            .iter()
                            .all(|&prev| uid > prev));
                        ever_assigned.push(uid);
                    } else {
                        let victim = {
                            let m = mbox.borrow();
                            m.entries().get(n).map(|e| e.uid)
                        };
                        if let Some(victim) = victim {
                            mbox.borrow_mut()
                                .expunge_uids(
                                    &mut store.borrow_mut(),
                                    &[victim],
                                )
                                .unwrap();
                        }
                    }

                    // The live UID list is always strictly ascending.
                    let m = mbox.borrow();
                    let uids: Vec<u32> = m
                        .entries()
                        .iter()
                        .map(|e| e.uid.into())
                        .collect();
                    prop_assert!(uids.windows(2).all(|w| w[0] < w[1]));
                }

                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn export_carries_flags_and_date_but_not_recent() {
        let fixture = TestFixture::new();
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();

        mbox.borrow_mut()
            .append(
                &mut store.borrow_mut(),
                vec![AppendItem {
                    flags: vec![Flag::Flagged],
                    internal_date: None,
                    data: b"content".to_vec(),
                }],
            )
            .unwrap();

        let items = mbox.borrow().export_messages(&[Uid::u(1)]).unwrap();
        assert_eq!(1, items.len());
        assert_eq!(vec![Flag::Flagged], items[0].flags);
        assert_eq!(b"content".to_vec(), items[0].data);
        assert!(items[0].internal_date.is_some());
    }
}
