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

//! The RFC 5256 SORT subset.

use super::Mailbox;
use crate::account::model::*;
use crate::mime::encoded_word::ew_decode_unstructured;
use crate::mime::header;
use crate::support::error::Error;

/// One sort criterion. `Reverse` inverts the criterion that follows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortCriterion {
    Arrival,
    Cc,
    Date,
    From,
    Reverse,
    Size,
    Subject,
    To,
}

/// The values a message sorts by, extracted once per message.
#[derive(Clone, Debug, Default)]
struct SortKeys {
    arrival: i64,
    date: i64,
    cc: String,
    from: String,
    to: String,
    subject: String,
    size: u32,
}

impl Mailbox {
    /// Order `uids` by the given criteria.
    ///
    /// The sort is stable; the input must be in UID order so that the
    /// final tie-break is UID ascending.
    pub fn sort_uids(
        &self,
        uids: Vec<Uid>,
        criteria: &[SortCriterion],
    ) -> Result<Vec<Uid>, Error> {
        let mut keyed: Vec<(Uid, SortKeys)> = Vec::with_capacity(uids.len());
        for uid in uids {
            keyed.push((uid, self.sort_keys(uid)?));
        }

        // Apply criteria right to left so the leftmost criterion ends up
        // most significant under the stable sort.
        let mut reversed = Vec::new();
        let mut reverse_next = false;
        for &criterion in criteria {
            if SortCriterion::Reverse == criterion {
                reverse_next = true;
            } else {
                reversed.push((criterion, reverse_next));
                reverse_next = false;
            }
        }

        for &(criterion, reverse) in reversed.iter().rev() {
            keyed.sort_by(|(_, a), (_, b)| {
                let ord = match criterion {
                    SortCriterion::Arrival => a.arrival.cmp(&b.arrival),
                    SortCriterion::Date => a.date.cmp(&b.date),
                    SortCriterion::Cc => a.cc.cmp(&b.cc),
                    SortCriterion::From => a.from.cmp(&b.from),
                    SortCriterion::To => a.to.cmp(&b.to),
                    SortCriterion::Subject => a.subject.cmp(&b.subject),
                    SortCriterion::Size => a.size.cmp(&b.size),
                    SortCriterion::Reverse => unreachable!(),
                };
                if reverse {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        Ok(keyed.into_iter().map(|(uid, _)| uid).collect())
    }

    fn sort_keys(&self, uid: Uid) -> Result<SortKeys, Error> {
        let entry = self.entry(uid).ok_or(Error::ExpungedMessage)?;
        let mut keys = SortKeys {
            arrival: entry.metadata.internal_date.timestamp(),
            date: entry.metadata.internal_date.timestamp(),
            size: entry.metadata.size,
            ..SortKeys::default()
        };

        // A message that vanished mid-sort keeps its metadata keys and
        // sorts with empty strings for the header-derived ones.
        let Ok(data) = self.message_data(uid) else {
            return Ok(keys);
        };
        let part = data.part();

        if let Some(date) = part
            .header("Date")
            .and_then(|v| header::parse_datetime(&header::unfold(v)))
        {
            keys.date = date.timestamp();
        }

        keys.cc = first_address_sort_key(part.header("CC"));
        keys.from = first_address_sort_key(part.header("From"));
        keys.to = first_address_sort_key(part.header("To"));
        keys.subject = base_subject(
            &part
                .header("Subject")
                .map(|v| {
                    ew_decode_unstructured(&header::unfold(v)).into_owned()
                })
                .unwrap_or_default(),
        );

        Ok(keys)
    }
}

/// RFC 5256: addressing fields sort by the addr-mailbox (local part) of
/// the first address, case-folded.
fn first_address_sort_key(value: Option<&[u8]>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    for address in header::parse_address_list(value) {
        match address {
            header::Address::Mailbox(mb) => {
                return mb.local.to_lowercase()
            },
            header::Address::Group { boxes, .. } => {
                if let Some(mb) = boxes.into_iter().next() {
                    return mb.local.to_lowercase();
                }
            },
        }
    }
    String::new()
}

/// The RFC 5256 "base subject": strip reply/forward prefixes, bracketed
/// list tags, and the trailing "(fwd)" marker, case-folded.
fn base_subject(subject: &str) -> String {
    let mut s = subject.trim().to_lowercase();

    loop {
        let before = s.len();

        while let Some(rest) =
            s.strip_prefix("re:").or_else(|| s.strip_prefix("fwd:"))
                .or_else(|| s.strip_prefix("fw:"))
        {
            s = rest.trim_start().to_owned();
        }

        // "re[2]:" style.
        if let Some(bracket) = s.strip_prefix("re[") {
            if let Some((inside, rest)) = bracket.split_once("]:") {
                if inside.bytes().all(|b| b.is_ascii_digit()) {
                    s = rest.trim_start().to_owned();
                }
            }
        }

        // Leading "[listname]" tag.
        if s.starts_with('[') {
            if let Some(end) = s.find(']') {
                let rest = s[end + 1..].trim_start();
                if !rest.is_empty() {
                    s = rest.to_owned();
                }
            }
        }

        if let Some(rest) = s.strip_suffix("(fwd)") {
            s = rest.trim_end().to_owned();
        }

        if s.len() == before {
            return s;
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test_fixture::TestFixture;
    use super::*;

    fn append(fixture: &TestFixture, message: &str) {
        let mbox = fixture.mailbox("INBOX");
        let store = fixture.store();
        mbox.borrow_mut()
            .append(
                &mut store.borrow_mut(),
                vec![AppendItem {
                    flags: vec![],
                    internal_date: None,
                    data: message.replace('\n', "\r\n").into_bytes(),
                }],
            )
            .unwrap();
    }

    fn sort(fixture: &TestFixture, criteria: &[SortCriterion]) -> Vec<u32> {
        let mbox = fixture.mailbox("INBOX");
        let mbox = mbox.borrow();
        let uids: Vec<Uid> =
            mbox.entries.iter().map(|e| e.uid).collect();
        mbox.sort_uids(uids, criteria)
            .unwrap()
            .into_iter()
            .map(u32::from)
            .collect()
    }

    #[test]
    fn sort_by_subject_and_date() {
        let fixture = TestFixture::new();
        append(
            &fixture,
            "Date: Mon, 2 Jan 2023 10:00:00 +0000\n\
             Subject: zebra\n\nx\n",
        );
        append(
            &fixture,
            "Date: Sun, 1 Jan 2023 10:00:00 +0000\n\
             Subject: Re: apple\n\nx\n",
        );
        append(
            &fixture,
            "Date: Tue, 3 Jan 2023 10:00:00 +0000\n\
             Subject: apple\n\nx\n",
        );

        // Base subject folds "Re:" away; the tie between the two apples
        // breaks on UID order (stable sort).
        assert_eq!(vec![2, 3, 1], sort(&fixture, &[SortCriterion::Subject]));
        assert_eq!(vec![2, 1, 3], sort(&fixture, &[SortCriterion::Date]));
        assert_eq!(
            vec![3, 1, 2],
            sort(
                &fixture,
                &[SortCriterion::Reverse, SortCriterion::Date]
            )
        );
        // Subject first, then date within equal subjects.
        assert_eq!(
            vec![2, 3, 1],
            sort(
                &fixture,
                &[SortCriterion::Subject, SortCriterion::Date]
            )
        );
    }

    #[test]
    fn sort_by_from_uses_first_local_part() {
        let fixture = TestFixture::new();
        append(&fixture, "From: zoe@example.com\n\nx\n");
        append(&fixture, "From: \"Abby\" <abby@example.com>\n\nx\n");
        assert_eq!(vec![2, 1], sort(&fixture, &[SortCriterion::From]));
    }

    #[test]
    fn base_subject_rules() {
        assert_eq!("apple", base_subject("Re: Apple"));
        assert_eq!("apple", base_subject("re: fwd: APPLE"));
        assert_eq!("apple", base_subject("[list] Apple"));
        assert_eq!("apple", base_subject("Apple (fwd)"));
        assert_eq!("apple", base_subject("Re[2]: apple"));
        assert_eq!("", base_subject(""));
    }
}
