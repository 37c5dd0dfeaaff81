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

//! Evaluation of IMAP search programs against messages.
//!
//! A `SearchProgram` is the wire-independent form of a search command:
//! dates resolved, sequence sets parsed, charset already applied (the only
//! accepted charsets are US-ASCII and UTF-8, so "applied" means the strings
//! arrive here as UTF-8 and are case-folded once, up front).
//!
//! Message data is loaded lazily: flag- and metadata-only programs never
//! touch the message file.

use std::cell::RefCell;

use chrono::prelude::*;

use super::fetch::MessageData;
use super::{Mailbox, Selected};
use crate::account::model::*;
use crate::mime::encoded_word::ew_decode_unstructured;
use crate::mime::header;
use crate::mime::part::Part;
use crate::mime::quoted_printable::qp_decode;
use crate::support::error::Error;

/// One node of a search program.
///
/// String payloads are stored lowercased; matching is case-insensitive
/// substring per RFC 3501.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchOp {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    New,
    Old,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    Keyword(Flag),
    Unkeyword(Flag),
    Bcc(String),
    Body(String),
    Cc(String),
    From(String),
    Subject(String),
    Text(String),
    To(String),
    Header(String, String),
    Larger(u32),
    Smaller(u32),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    UidIn(SeqRange<Uid>),
    SeqnumIn(SeqRange<Seqnum>),
    Not(Box<SearchOp>),
    Or(Box<SearchOp>, Box<SearchOp>),
    And(Vec<SearchOp>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchProgram {
    pub op: SearchOp,
}

/// Lazily-loaded message state for one evaluation.
struct EvalContext<'a> {
    mailbox: &'a Mailbox,
    uid: Uid,
    seqnum: Option<Seqnum>,
    recent: bool,
    data: RefCell<Option<MessageData>>,
}

impl<'a> EvalContext<'a> {
    fn with_data<R>(
        &self,
        f: impl FnOnce(&MessageData) -> R,
    ) -> Result<R, Error> {
        {
            let mut slot = self.data.borrow_mut();
            if slot.is_none() {
                *slot = Some(self.mailbox.message_data(self.uid)?);
            }
        }
        Ok(f(self.data.borrow().as_ref().unwrap()))
    }
}

impl Mailbox {
    /// Evaluate `program` against the messages in `sel`'s snapshot,
    /// returning matching UIDs ascending.
    pub fn search(
        &self,
        sel: &Selected,
        program: &SearchProgram,
    ) -> Result<Vec<Uid>, Error> {
        let mut hits = Vec::new();
        for (ix, &uid) in sel.snapshot.iter().enumerate() {
            if self.search_one(
                program,
                uid,
                Some(Seqnum::from_index(ix)),
                sel.is_recent(uid),
            )? {
                hits.push(uid);
            }
        }
        Ok(hits)
    }

    /// Evaluate `program` against a single message.
    pub fn search_one(
        &self,
        program: &SearchProgram,
        uid: Uid,
        seqnum: Option<Seqnum>,
        recent: bool,
    ) -> Result<bool, Error> {
        if self.entry_index(uid).is_none() {
            return Ok(false);
        }

        let ctx = EvalContext {
            mailbox: self,
            uid,
            seqnum,
            recent,
            data: RefCell::new(None),
        };
        match eval(&program.op, &ctx) {
            // A message that vanishes mid-search simply doesn't match.
            Err(Error::ExpungedMessage) => Ok(false),
            r => r,
        }
    }
}

fn eval(op: &SearchOp, ctx: &EvalContext<'_>) -> Result<bool, Error> {
    let mailbox = ctx.mailbox;
    let uid = ctx.uid;

    Ok(match *op {
        SearchOp::All => true,
        SearchOp::Answered => mailbox.test_flag(&Flag::Answered, uid),
        SearchOp::Deleted => mailbox.test_flag(&Flag::Deleted, uid),
        SearchOp::Draft => mailbox.test_flag(&Flag::Draft, uid),
        SearchOp::Flagged => mailbox.test_flag(&Flag::Flagged, uid),
        SearchOp::Seen => mailbox.test_flag(&Flag::Seen, uid),
        SearchOp::Unanswered => !mailbox.test_flag(&Flag::Answered, uid),
        SearchOp::Undeleted => !mailbox.test_flag(&Flag::Deleted, uid),
        SearchOp::Undraft => !mailbox.test_flag(&Flag::Draft, uid),
        SearchOp::Unflagged => !mailbox.test_flag(&Flag::Flagged, uid),
        SearchOp::Unseen => !mailbox.test_flag(&Flag::Seen, uid),
        SearchOp::Recent => ctx.recent,
        SearchOp::Old => !ctx.recent,
        SearchOp::New => {
            ctx.recent && !mailbox.test_flag(&Flag::Seen, uid)
        },
        SearchOp::Keyword(ref kw) => mailbox.test_flag(kw, uid),
        SearchOp::Unkeyword(ref kw) => !mailbox.test_flag(kw, uid),

        SearchOp::Larger(n) => {
            mailbox.entry(uid).is_some_and(|e| e.metadata.size > n)
        },
        SearchOp::Smaller(n) => {
            mailbox.entry(uid).is_some_and(|e| e.metadata.size < n)
        },

        SearchOp::Before(date) => {
            internal_date_of(mailbox, uid).is_some_and(|d| d < date)
        },
        SearchOp::On(date) => {
            internal_date_of(mailbox, uid).is_some_and(|d| d == date)
        },
        SearchOp::Since(date) => {
            internal_date_of(mailbox, uid).is_some_and(|d| d >= date)
        },

        SearchOp::SentBefore(date) => ctx
            .with_data(|data| sent_date(data.part()))?
            .is_some_and(|d| d < date),
        SearchOp::SentOn(date) => ctx
            .with_data(|data| sent_date(data.part()))?
            .is_some_and(|d| d == date),
        SearchOp::SentSince(date) => ctx
            .with_data(|data| sent_date(data.part()))?
            .is_some_and(|d| d >= date),

        SearchOp::Bcc(ref needle) => {
            header_contains(ctx, "BCC", needle)?
        },
        SearchOp::Cc(ref needle) => header_contains(ctx, "CC", needle)?,
        SearchOp::From(ref needle) => {
            header_contains(ctx, "From", needle)?
        },
        SearchOp::To(ref needle) => header_contains(ctx, "To", needle)?,
        SearchOp::Subject(ref needle) => {
            header_contains(ctx, "Subject", needle)?
        },
        SearchOp::Header(ref name, ref needle) => {
            ctx.with_data(|data| {
                data.part().headers.iter().any(|h| {
                    h.name.eq_ignore_ascii_case(name)
                        && decoded_header(&h.value).contains(needle)
                })
            })?
        },

        SearchOp::Body(ref needle) => {
            ctx.with_data(|data| {
                text_content(data.raw(), data.part())
                    .to_lowercase()
                    .contains(needle)
            })?
        },
        SearchOp::Text(ref needle) => {
            ctx.with_data(|data| {
                let mut haystack = String::from_utf8_lossy(
                    data.header_block(),
                )
                .to_lowercase();
                haystack
                    .push_str(&text_content(data.raw(), data.part())
                        .to_lowercase());
                haystack.contains(needle)
            })?
        },

        SearchOp::UidIn(ref range) => range.contains(uid),
        SearchOp::SeqnumIn(ref range) => {
            ctx.seqnum.is_some_and(|sn| range.contains(sn))
        },

        SearchOp::Not(ref inner) => !eval(inner, ctx)?,
        SearchOp::Or(ref a, ref b) => eval(a, ctx)? || eval(b, ctx)?,
        SearchOp::And(ref ops) => {
            for inner in ops {
                if !eval(inner, ctx)? {
                    return Ok(false);
                }
            }
            true
        },
    })
}

fn internal_date_of(mailbox: &Mailbox, uid: Uid) -> Option<NaiveDate> {
    mailbox
        .entry(uid)
        .map(|e| e.metadata.internal_date.date_naive())
}

fn sent_date(part: &Part) -> Option<NaiveDate> {
    part.header("Date")
        .and_then(|v| header::parse_datetime(&header::unfold(v)))
        .map(|dt| dt.date_naive())
}

fn header_contains(
    ctx: &EvalContext<'_>,
    name: &str,
    needle: &str,
) -> Result<bool, Error> {
    ctx.with_data(|data| {
        data.part()
            .header(name)
            .map(|v| decoded_header(v).contains(needle))
            .unwrap_or(false)
    })
}

fn decoded_header(value: &[u8]) -> String {
    ew_decode_unstructured(&header::unfold(value)).to_lowercase()
}

/// Concatenated decoded content of every text/* leaf, in part order.
///
/// Transfer encodings are removed and charsets decoded; parts in unknown
/// charsets are matched as UTF-8-lossy text, which is the best that can be
/// done without refusing to search them at all.
pub(super) fn text_content(raw: &[u8], part: &Part) -> String {
    let mut out = String::new();
    collect_text(raw, part, &mut out);
    out
}

fn collect_text(raw: &[u8], part: &Part, out: &mut String) {
    if !part.children.is_empty() {
        for child in &part.children {
            collect_text(raw, child, out);
        }
        return;
    }

    if !part.content_type.is_type("text") {
        return;
    }

    let body = &raw[part.body_range.clone()];
    let decoded = match part
        .header("Content-Transfer-Encoding")
        .map(|v| header::unfold(v).trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("base64") => {
            let stripped: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::decode(stripped).unwrap_or_else(|_| body.to_vec())
        },
        Some("quoted-printable") => qp_decode(body).into_owned(),
        _ => body.to_vec(),
    };

    let charset = part
        .content_type
        .parm("charset")
        .unwrap_or("us-ascii");
    match encoding_rs::Encoding::for_label_no_replacement(
        charset.as_bytes(),
    ) {
        Some(encoding) => {
            out.push_str(&encoding.decode_with_bom_removal(&decoded).0)
        },
        None => out.push_str(&String::from_utf8_lossy(&decoded)),
    }
    out.push('\0');
}

#[cfg(test)]
mod test {
    use super::super::test_fixture::TestFixture;
    use super::*;

    fn fixture_with_message(message: &str) -> (TestFixture, Selected) {
        let fixture = TestFixture::new();
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
        let (sel, _) = mbox.borrow_mut().select(false);
        (fixture, sel)
    }

    fn run(fixture: &TestFixture, sel: &Selected, op: SearchOp) -> Vec<u32> {
        fixture
            .mailbox("INBOX")
            .borrow()
            .search(sel, &SearchProgram { op })
            .unwrap()
            .into_iter()
            .map(u32::from)
            .collect()
    }

    const MESSAGE: &str = "\
Date: Fri, 21 Nov 1997 09:55:06 -0600
From: \"John Doe\" <jdoe@machine.example>
To: Mary Smith <mary@x.test>
Subject: =?utf-8?q?Saying_Hello?=
Content-Type: text/plain; charset=utf-8

This is a message just to say hello. So, \"Hello\".
";

    #[test]
    fn flag_predicates() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::All));
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::Unseen));
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::Recent));
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::New));
        assert!(run(&fixture, &sel, SearchOp::Seen).is_empty());
        assert!(run(&fixture, &sel, SearchOp::Old).is_empty());
        assert!(run(&fixture, &sel, SearchOp::Answered).is_empty());
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::Unanswered));
    }

    #[test]
    fn text_predicates() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::From("jdoe".to_owned()))
        );
        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::From("john doe".to_owned()))
        );
        assert!(run(&fixture, &sel, SearchOp::From("mary".to_owned()))
            .is_empty());
        // Encoded-word subjects are matched decoded.
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::Subject("saying hello".to_owned())
            )
        );
        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::Body("just to say".to_owned()))
        );
        assert!(run(&fixture, &sel, SearchOp::Body("subject".to_owned()))
            .is_empty());
        // TEXT covers the headers too.
        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::Text("machine.example".to_owned()))
        );
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::Header(
                    "To".to_owned(),
                    "mary@x.test".to_owned()
                )
            )
        );
    }

    #[test]
    fn date_predicates() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        let sent = NaiveDate::from_ymd_opt(1997, 11, 21).unwrap();

        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::SentOn(sent))
        );
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::SentSince(sent.pred_opt().unwrap())
            )
        );
        assert!(run(&fixture, &sel, SearchOp::SentBefore(sent))
            .is_empty());

        // Internal date is "now" for this append.
        let today = Utc::now().date_naive();
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::Since(today.pred_opt().unwrap())
            )
        );
    }

    #[test]
    fn size_and_set_predicates() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        assert_eq!(vec![1], run(&fixture, &sel, SearchOp::Larger(10)));
        assert!(run(&fixture, &sel, SearchOp::Smaller(10)).is_empty());
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::UidIn(SeqRange::just(Uid::u(1)))
            )
        );
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::SeqnumIn(SeqRange::just(Seqnum::u(1)))
            )
        );
    }

    #[test]
    fn boolean_operators() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        assert_eq!(
            vec![1],
            run(
                &fixture,
                &sel,
                SearchOp::Or(
                    Box::new(SearchOp::Seen),
                    Box::new(SearchOp::Unseen)
                )
            )
        );
        assert!(run(
            &fixture,
            &sel,
            SearchOp::And(vec![SearchOp::Unseen, SearchOp::Seen])
        )
        .is_empty());
        assert!(run(&fixture, &sel, SearchOp::Not(Box::new(SearchOp::All)))
            .is_empty());
    }

    #[test]
    fn base64_body_is_searched_decoded() {
        let message = format!(
            "Content-Type: text/plain; charset=utf-8\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             {}\n",
            base64::encode("unique marker text")
        );
        let (fixture, sel) = fixture_with_message(&message);
        assert_eq!(
            vec![1],
            run(&fixture, &sel, SearchOp::Body("unique marker".to_owned()))
        );
    }

    #[test]
    fn searching_vanished_message_is_not_an_error() {
        let (fixture, sel) = fixture_with_message(MESSAGE);
        let mbox = fixture.mailbox("INBOX");
        // Remove the file behind the mailbox's back.
        let folder = mbox.borrow().folder().clone();
        folder.remove_message(MsgKey(1)).unwrap();

        // Body search needs the file; the message just doesn't match.
        assert!(run(&fixture, &sel, SearchOp::Body("hello".to_owned()))
            .is_empty());
    }
}
