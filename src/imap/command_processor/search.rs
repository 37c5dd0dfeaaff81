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

//! `SEARCH`, `SORT`, their ESEARCH/ESORT return options, and the CONTEXT
//! machinery.

use std::borrow::Cow;

use itertools::Itertools as _;

use super::defs::*;
use crate::account::mailbox::{
    Context, ContextWants, SearchOp, SearchProgram, SortCriterion,
    MAX_CONTEXTS_PER_SESSION,
};
use crate::account::model::*;
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) async fn cmd_search(
        &mut self,
        cmd: &s::SearchCommand<'_>,
        tag: &str,
        uid_command: bool,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        if let Err(resp) = selected!(self) {
            return Ok(resp);
        }
        if let Some(resp) = check_charset(cmd.charset.as_deref()) {
            return Ok(resp);
        }

        let program = match self.translate_keys(&cmd.keys) {
            Ok(op) => SearchProgram { op },
            Err(resp) => return Ok(resp),
        };

        let hits = self.run_search(&program).await?;

        self.emit_results(
            tag,
            uid_command,
            cmd.return_opts.as_deref(),
            program,
            None,
            hits,
            out,
        )
    }

    pub(super) async fn cmd_sort(
        &mut self,
        cmd: &s::SortCommand<'_>,
        tag: &str,
        uid_command: bool,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        if let Err(resp) = selected!(self) {
            return Ok(resp);
        }
        if let Some(resp) = check_charset(Some(&cmd.charset)) {
            return Ok(resp);
        }

        let program = match self.translate_keys(&cmd.criteria) {
            Ok(op) => SearchProgram { op },
            Err(resp) => return Ok(resp),
        };
        let criteria: Vec<SortCriterion> =
            cmd.keys.iter().map(|key| sort_criterion(*key)).collect();

        let hits = self.run_search(&program).await?;
        let sorted = {
            let state = match selected!(self) {
                Ok(state) => state,
                Err(resp) => return Ok(resp),
            };
            let mailbox = state.mailbox.borrow();
            mailbox.sort_uids(hits, &criteria)?
        };

        self.emit_results(
            tag,
            uid_command,
            cmd.return_opts.as_deref(),
            program,
            Some(criteria),
            sorted,
            out,
        )
    }

    pub(super) fn cmd_cancelupdate(
        &mut self,
        tags: &[Cow<'_, str>],
    ) -> Result<s::Response<'static>, Error> {
        for tag in tags {
            self.contexts.remove(tag.as_ref());
        }
        Ok(ok(None, "CANCELUPDATE completed"))
    }

    /// Run the search over the selected snapshot, yielding to other tasks
    /// between chunks so a big mailbox cannot monopolise the worker.
    async fn run_search(
        &mut self,
        program: &SearchProgram,
    ) -> Result<Vec<Uid>, Error> {
        let (mailbox, snapshot) = {
            let state = match selected!(self) {
                Ok(state) => state,
                Err(_) => return Err(Error::NxMailbox),
            };
            let snapshot: Vec<Uid> = (0..state.sel.exists())
                .filter_map(|ix| {
                    state.sel.uid_of(Seqnum::from_index(ix))
                })
                .collect();
            (std::rc::Rc::clone(&state.mailbox), snapshot)
        };

        let mut hits = Vec::new();
        for (n, chunk) in
            snapshot.chunks(SEARCH_YIELD_INTERVAL).enumerate()
        {
            if n > 0 {
                tokio::task::yield_now().await;
            }

            let state = match selected!(self) {
                Ok(state) => state,
                Err(_) => return Err(Error::NxMailbox),
            };
            let mbox = mailbox.borrow();
            for &uid in chunk {
                let seqnum = state.sel.seqnum_of(uid);
                if mbox.search_one(
                    program,
                    uid,
                    seqnum,
                    state.sel.is_recent(uid),
                )? {
                    hits.push(uid);
                }
            }
        }

        Ok(hits)
    }

    /// Emit either the classic SEARCH/SORT responses or the ESEARCH form,
    /// registering an update context when requested.
    #[allow(clippy::too_many_arguments)]
    fn emit_results(
        &mut self,
        tag: &str,
        uid_command: bool,
        return_opts: Option<&[s::SearchReturnOpt<'_>]>,
        program: SearchProgram,
        sort: Option<Vec<SortCriterion>>,
        hits: Vec<Uid>,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let state = match selected!(self) {
            Ok(state) => state,
            Err(resp) => return Ok(resp),
        };

        // Result identifiers: UIDs for UID commands, else seqnums, in
        // result order.
        let numbers: Vec<u32> = hits
            .iter()
            .filter_map(|&uid| {
                if uid_command {
                    Some(uid.into())
                } else {
                    state.sel.seqnum_of(uid).map(u32::from)
                }
            })
            .collect();

        let Some(return_opts) = return_opts else {
            // Classic output.
            out.untagged(if sort.is_some() {
                s::Response::Sort(numbers)
            } else {
                s::Response::Search(numbers)
            });
            return Ok(ok(
                None,
                if sort.is_some() {
                    "SORT completed"
                } else {
                    "SEARCH completed"
                },
            ));
        };

        let mut wants = ContextWants::default();
        let mut want_update = false;
        for opt in return_opts {
            match *opt {
                s::SearchReturnOpt::Min(()) => wants.min = true,
                s::SearchReturnOpt::Max(()) => wants.max = true,
                s::SearchReturnOpt::All(()) => wants.all = true,
                s::SearchReturnOpt::Count(()) => wants.count = true,
                s::SearchReturnOpt::Update(()) => want_update = true,
                s::SearchReturnOpt::Partial(ref range) => {
                    wants.partial = Some((range.start, range.end));
                },
            }
        }
        // RETURN () means ALL per RFC 4731.
        if !wants.min
            && !wants.max
            && !wants.all
            && !wants.count
            && !want_update
            && wants.partial.is_none()
        {
            wants.all = true;
        }

        if want_update
            && self.contexts.len() >= MAX_CONTEXTS_PER_SESSION
        {
            return Ok(s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::No,
                code: Some(s::RespTextCode::NoUpdate(Cow::Owned(
                    tag.to_owned(),
                ))),
                quip: Some(Cow::Borrowed("Too many active contexts")),
            }));
        }

        let mut esearch = s::EsearchResponse {
            tag: Cow::Owned(tag.to_owned()),
            uid: uid_command,
            min: None,
            max: None,
            count: None,
            all: None,
            addto: None,
            removefrom: None,
            partial: None,
        };

        if wants.min {
            esearch.min = numbers.iter().copied().min();
        }
        if wants.max {
            esearch.max = numbers.iter().copied().max();
        }
        if wants.count {
            esearch.count = Some(numbers.len() as u32);
        }
        if wants.all && !numbers.is_empty() {
            esearch.all = Some(Cow::Owned(format_result_set(
                &numbers,
                sort.is_some(),
            )));
        }
        if let Some((start, end)) = wants.partial {
            let lo = start.min(end).max(1) as usize;
            let hi = start.max(end) as usize;
            let slice: Vec<u32> = numbers
                .iter()
                .copied()
                .skip(lo - 1)
                .take(hi - lo + 1)
                .collect();
            esearch.partial = Some(s::EsearchPartial {
                start,
                end,
                ids: Cow::Owned(format_result_set(
                    &slice,
                    sort.is_some(),
                )),
            });
        }

        out.untagged(s::Response::Esearch(esearch));

        if want_update {
            self.contexts.insert(
                tag.to_owned(),
                Context::new(
                    tag.to_owned(),
                    uid_command,
                    program,
                    sort.clone(),
                    wants,
                    hits,
                ),
            );
        }

        Ok(ok(
            None,
            if sort.is_some() {
                "SORT completed"
            } else {
                "SEARCH completed"
            },
        ))
    }

    /// Translate the wire search keys into the evaluator's program form.
    pub(super) fn translate_keys(
        &mut self,
        keys: &[s::SearchKey<'_>],
    ) -> PartialResult<SearchOp> {
        let mut ops = Vec::with_capacity(keys.len());
        for key in keys {
            ops.push(self.translate_key(key)?);
        }
        Ok(if 1 == ops.len() {
            ops.pop().unwrap()
        } else {
            SearchOp::And(ops)
        })
    }

    fn translate_key(
        &mut self,
        key: &s::SearchKey<'_>,
    ) -> PartialResult<SearchOp> {
        Ok(match *key {
            s::SearchKey::Simple(simple) => match simple {
                s::SimpleSearchKey::All => SearchOp::All,
                s::SimpleSearchKey::Answered => SearchOp::Answered,
                s::SimpleSearchKey::Deleted => SearchOp::Deleted,
                s::SimpleSearchKey::Flagged => SearchOp::Flagged,
                s::SimpleSearchKey::New => SearchOp::New,
                s::SimpleSearchKey::Old => SearchOp::Old,
                s::SimpleSearchKey::Recent => SearchOp::Recent,
                s::SimpleSearchKey::Seen => SearchOp::Seen,
                s::SimpleSearchKey::Unanswered => SearchOp::Unanswered,
                s::SimpleSearchKey::Undeleted => SearchOp::Undeleted,
                s::SimpleSearchKey::Unflagged => SearchOp::Unflagged,
                s::SimpleSearchKey::Unseen => SearchOp::Unseen,
                s::SimpleSearchKey::Draft => SearchOp::Draft,
                s::SimpleSearchKey::Undraft => SearchOp::Undraft,
            },
            s::SearchKey::Text(ref text) => {
                let value = text.value.to_lowercase();
                match text.typ {
                    s::TextSearchKeyType::Bcc => SearchOp::Bcc(value),
                    s::TextSearchKeyType::Body => SearchOp::Body(value),
                    s::TextSearchKeyType::Cc => SearchOp::Cc(value),
                    s::TextSearchKeyType::From => SearchOp::From(value),
                    s::TextSearchKeyType::Subject => {
                        SearchOp::Subject(value)
                    },
                    s::TextSearchKeyType::Text => SearchOp::Text(value),
                    s::TextSearchKeyType::To => SearchOp::To(value),
                }
            },
            s::SearchKey::Date(ref date) => match date.typ {
                s::DateSearchKeyType::Before => {
                    SearchOp::Before(date.date)
                },
                s::DateSearchKeyType::On => SearchOp::On(date.date),
                s::DateSearchKeyType::Since => SearchOp::Since(date.date),
                s::DateSearchKeyType::SentBefore => {
                    SearchOp::SentBefore(date.date)
                },
                s::DateSearchKeyType::SentOn => {
                    SearchOp::SentOn(date.date)
                },
                s::DateSearchKeyType::SentSince => {
                    SearchOp::SentSince(date.date)
                },
            },
            s::SearchKey::Keyword(ref flag) => {
                SearchOp::Keyword(flag.clone())
            },
            s::SearchKey::Unkeyword(ref flag) => {
                SearchOp::Unkeyword(flag.clone())
            },
            s::SearchKey::Header(ref header) => SearchOp::Header(
                header.header.clone().into_owned(),
                header.value.to_lowercase(),
            ),
            s::SearchKey::Larger(n) => SearchOp::Larger(n),
            s::SearchKey::Smaller(n) => SearchOp::Smaller(n),
            s::SearchKey::Not(ref inner) => {
                SearchOp::Not(Box::new(self.translate_key(inner)?))
            },
            s::SearchKey::Or(ref or) => SearchOp::Or(
                Box::new(self.translate_key(&or.a)?),
                Box::new(self.translate_key(&or.b)?),
            ),
            s::SearchKey::And(ref keys) => {
                self.translate_keys(keys)?
            },
            s::SearchKey::Uid(ref raw) => {
                SearchOp::UidIn(self.parse_uid_range(raw)?)
            },
            s::SearchKey::Seqnum(ref raw) => {
                SearchOp::SeqnumIn(self.parse_seqnum_range(raw)?)
            },
        })
    }
}

fn sort_criterion(key: s::SortKey) -> SortCriterion {
    match key {
        s::SortKey::Arrival => SortCriterion::Arrival,
        s::SortKey::Cc => SortCriterion::Cc,
        s::SortKey::Date => SortCriterion::Date,
        s::SortKey::From => SortCriterion::From,
        s::SortKey::Reverse => SortCriterion::Reverse,
        s::SortKey::Size => SortCriterion::Size,
        s::SortKey::Subject => SortCriterion::Subject,
        s::SortKey::To => SortCriterion::To,
    }
}

fn check_charset(charset: Option<&str>) -> Option<s::Response<'static>> {
    match charset {
        None => None,
        Some(cs)
            if cs.eq_ignore_ascii_case("US-ASCII")
                || cs.eq_ignore_ascii_case("UTF-8") =>
        {
            None
        },
        Some(_) => Some(s::Response::Cond(s::CondResponse {
            cond: s::RespCondType::No,
            code: Some(s::RespTextCode::BadCharset(vec![
                Cow::Borrowed("US-ASCII"),
                Cow::Borrowed("UTF-8"),
            ])),
            quip: Some(Cow::Borrowed("Unsupported charset")),
        })),
    }
}

/// ESEARCH ALL uses the minimal set form for searches; sorted results must
/// preserve order, so runs are not collapsed there when order differs.
fn format_result_set(numbers: &[u32], ordered: bool) -> String {
    if ordered {
        return numbers.iter().join(",");
    }

    let mut range = SeqRange::<Uid>::new();
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for n in sorted {
        if let Some(uid) = Uid::of(n) {
            range.append(uid);
        }
    }
    range.to_string()
}
