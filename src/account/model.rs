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

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. A UID is never reused for the lifetime of one UIDVALIDITY.
///
/// In this implementation, UIDs are assigned strictly sequentially in the
/// order message keys are first observed on disk.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

// Not a useful default, but lets things containing SeqRange<Uid> derive
// Default.
impl Default for Uid {
    fn default() -> Self {
        Uid::MIN
    }
}

impl Uid {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };
    pub const MAX: Self = match NonZeroU32::new(u32::MAX) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        NonZeroU32::new(self.0.get().wrapping_add(1)).map(Uid)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The 1-based, dense index of a message in a mailbox snapshot.
///
/// Unlike UIDs, sequence numbers shift as EXPUNGE responses are delivered,
/// and every session tracks its own mapping.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl Default for Seqnum {
    fn default() -> Self {
        Seqnum::MIN
    }
}

impl Seqnum {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Seqnum(n),
        None => unreachable!(),
    };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of(u32::try_from(ix + 1).expect("seqnum overflow")).unwrap()
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(s: Seqnum) -> u32 {
        s.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

/// The integer filename a message has in its MH folder.
///
/// Keys are at least 1 and not necessarily dense; MH utilities are free to
/// recycle them, which is exactly why they cannot serve as UIDs.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
)]
#[serde(transparent)]
pub struct MsgKey(pub u32);

impl fmt::Display for MsgKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A "sequence set range" of sequence numbers or UIDs.
///
/// Internally, this is maintained as a minimal sorted set of inclusive
/// ranges. It does not maintain information on the original fragmentation,
/// ordering, or duplication.
///
/// The `Display` format puts this into minimal IMAP wire format: runs of
/// consecutive integers collapse to `a:b`. IMAP has no way to represent an
/// empty sequence set; `Display` produces an empty string in that case,
/// which is invalid on the wire and must be guarded by the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct SeqRange<T> {
    parts: BTreeMap<u32, u32>,
    _t: PhantomData<T>,
}

impl<T> SeqRange<T> {
    pub fn new() -> Self {
        SeqRange {
            parts: BTreeMap::new(),
            _t: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<T: TryFrom<u32> + Into<u32> + PartialOrd> SeqRange<T> {
    /// Create a range containing just the given item.
    pub fn just(item: T) -> Self {
        let mut this = SeqRange::new();
        this.append(item);
        this
    }

    /// Create a range containing a single simple range.
    pub fn range(start: T, end: T) -> Self {
        let mut this = SeqRange::new();
        this.insert(start, end);
        this
    }

    /// Append a single item to this range.
    ///
    /// The item must be strictly greater than all other items already
    /// inserted.
    pub fn append(&mut self, item: T) {
        let item: u32 = item.into();

        if let Some(end) = self.parts.values_mut().next_back() {
            assert!(item > *end);

            if item == *end + 1 {
                *end = item;
                return;
            }
        }

        self.parts.insert(item, item);
    }

    /// Insert the given inclusive range (which must be in the correct order)
    /// into this sequence set.
    pub fn insert(&mut self, start_incl: T, end_incl: T) {
        assert!(end_incl >= start_incl);
        self.insert_raw(start_incl.into(), end_incl.into());
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // If this range overlaps any later ranges, fuse them.
        loop {
            let following = self
                .parts
                .range((Excluded(start_incl), Unbounded))
                .next()
                .map(|(&start, &end)| (start, end));

            if let Some((following_start, following_end)) = following {
                if following_start - 1 <= end_incl {
                    end_incl = end_incl.max(following_end);
                    self.parts.remove(&following_start);
                    continue;
                }
            }

            break;
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(end_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end + 1 >= start_incl {
                if start_incl < preceding_start {
                    self.parts.remove(&preceding_start);
                    self.parts.insert(start_incl, end_incl.max(preceding_end));
                } else {
                    self.parts
                        .insert(preceding_start, end_incl.max(preceding_end));
                }
                return;
            }
        }

        self.parts.insert(start_incl, end_incl);
    }

    /// Return whether the given item is present in this set.
    pub fn contains(&self, v: T) -> bool {
        let v: u32 = v.into();
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Return an iterator over the items in this set.
    ///
    /// Invalid items and items greater than `max` are silently excluded.
    /// Items are delivered in strictly ascending order.
    pub fn items(&self, max: impl Into<u32>) -> impl Iterator<Item = T> + '_ {
        let max: u32 = max.into();
        self.parts
            .iter()
            .map(|(&start, &end)| (start, end))
            .filter(move |&(start, _)| start <= max)
            .flat_map(move |(start, end)| start..=end.min(max))
            .filter_map(|v| T::try_from(v).ok())
    }

    /// Parse the IMAP wire form of a sequence set.
    ///
    /// `splat` is used as the value of elements which specify `*`.
    pub fn parse(raw: &str, splat: T) -> Option<Self> {
        fn do_parse(r: &str, splat: u32) -> Option<u32> {
            if "*" == r {
                Some(splat)
            } else {
                r.parse().ok().filter(|&v| v > 0)
            }
        }

        let splat = splat.into();

        let mut this = Self::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = do_parse(only, splat)?;
                    this.insert_raw(only, only);
                },
                (Some(start), Some(end), None) => {
                    let start = do_parse(start, splat)?;
                    let end = do_parse(end, splat)?;
                    // RFC 3501 allows the endpoints in either order.
                    this.insert_raw(start.min(end), end.max(start));
                },
                _ => return None,
            }
        }

        Some(this)
    }

    /// Return the total number of items in the sequence set.
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(start, end)| end - start + 1)
            .sum::<u32>() as usize
    }

    /// Return the maximum value in this sequence set, raw.
    pub fn max(&self) -> Option<u32> {
        self.parts.values().next_back().copied()
    }
}

impl<T> fmt::Display for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl<T> fmt::Debug for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl<T> Default for SeqRange<T> {
    fn default() -> Self {
        SeqRange::new()
    }
}

/// A message flag.
///
/// System flags are top-level enum values; keywords are in the `Keyword`
/// case. The `Display` format is the exact string sent over the wire;
/// `FromStr` does the reverse conversion and also understands non-standard
/// casing of the system flags.
///
/// `\Recent` is not represented by this enum since it is not really a flag:
/// it is session-scoped state that can never be STOREd.
#[derive(Clone, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl Flag {
    pub const SYSTEM: &'static [Flag] = &[
        Flag::Answered,
        Flag::Flagged,
        Flag::Deleted,
        Flag::Seen,
        Flag::Draft,
    ];

    /// The MH sequence name this flag is stored under.
    ///
    /// `\Seen` is special: MH natively tracks `unseen`, so the `Seen`
    /// sequence is derived and the resync engine keeps the two
    /// complementary.
    pub fn mh_sequence_name(&self) -> &str {
        match *self {
            Flag::Answered => "replied",
            Flag::Deleted => "deleted",
            Flag::Draft => "draft",
            Flag::Flagged => "flagged",
            Flag::Seen => "Seen",
            Flag::Keyword(ref kw) => kw,
        }
    }

    /// The inverse of `mh_sequence_name`.
    ///
    /// Returns `None` for sequence names that do not surface as IMAP flags
    /// (`unseen`, `Recent`, `cur`).
    pub fn from_mh_sequence_name(name: &str) -> Option<Flag> {
        match name {
            "replied" => Some(Flag::Answered),
            "deleted" => Some(Flag::Deleted),
            "draft" => Some(Flag::Draft),
            "flagged" => Some(Flag::Flagged),
            "Seen" => Some(Flag::Seen),
            "unseen" | "Recent" | "cur" => None,
            kw => {
                if kw.as_bytes().iter().copied().all(is_atom_char) {
                    Some(Flag::Keyword(kw.to_owned()))
                } else {
                    None
                }
            },
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    !matches!(
        ch,
        0..=b' '
            | 127..=255
            | b'('
            | b')'
            | b'{'
            | b'*'
            | b'%'
            | b'\\'
            | b'"'
            | b']'
    )
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords compare ASCII-case-insensitively; there is no way to
            // get non-ASCII flags through RFC 3501 syntax anyway.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            },
            _ => false,
        }
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> std::cmp::Ordering {
        fn rank(f: &Flag) -> u8 {
            match *f {
                Flag::Answered => 0,
                Flag::Deleted => 1,
                Flag::Draft => 2,
                Flag::Flagged => 3,
                Flag::Seen => 4,
                Flag::Keyword(..) => 5,
            }
        }

        match (self, other) {
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => a
                .to_ascii_lowercase()
                .cmp(&b.to_ascii_lowercase()),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl std::hash::Hash for Flag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match *self {
            Flag::Answered => 1u8.hash(state),
            Flag::Deleted => 2u8.hash(state),
            Flag::Draft => 3u8.hash(state),
            Flag::Flagged => 4u8.hash(state),
            Flag::Seen => 5u8.hash(state),
            Flag::Keyword(ref kw) => {
                6u8.hash(state);
                for b in kw.as_bytes() {
                    b.to_ascii_lowercase().hash(state);
                }
            },
        }
    }
}

/// Attributes that may be applied to mailboxes in LIST-family responses.
#[derive(
    Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum MailboxAttribute {
    // RFC 3501
    Noselect,
    Noinferiors,
    Marked,
    Unmarked,
    // RFC 3348
    HasChildren,
    HasNoChildren,
    // RFC 5258
    NonExistent,
    Subscribed,
}

impl MailboxAttribute {
    pub fn name(&self) -> &'static str {
        match *self {
            MailboxAttribute::Noselect => "\\Noselect",
            MailboxAttribute::Noinferiors => "\\Noinferiors",
            MailboxAttribute::Marked => "\\Marked",
            MailboxAttribute::Unmarked => "\\Unmarked",
            MailboxAttribute::HasChildren => "\\HasChildren",
            MailboxAttribute::HasNoChildren => "\\HasNoChildren",
            MailboxAttribute::NonExistent => "\\NonExistent",
            MailboxAttribute::Subscribed => "\\Subscribed",
        }
    }
}

impl fmt::Display for MailboxAttribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for MailboxAttribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <MailboxAttribute as fmt::Display>::fmt(self, f)
    }
}

/// Metadata about one message, as stored in the per-user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// RFC822.SIZE: the size of the message file in octets.
    pub size: u32,
    /// INTERNALDATE: for messages discovered on disk this is the file's
    /// mtime at first observation; for APPEND it is the supplied date-time
    /// or the time of the append.
    pub internal_date: DateTime<FixedOffset>,
}

/// The `STATUS` command request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRequest {
    pub name: String,
    pub messages: bool,
    pub recent: bool,
    pub uidnext: bool,
    pub uidvalidity: bool,
    pub unseen: bool,
}

/// The `STATUS` response; fields are set iff requested.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusResponse {
    pub name: String,
    pub messages: Option<usize>,
    pub recent: Option<usize>,
    pub uidnext: Option<Uid>,
    pub uidvalidity: Option<u32>,
    pub unseen: Option<usize>,
}

/// Request used for implementing `LIST` and `LSUB`, including the RFC 5258
/// extended options and RFC 5819 STATUS return option.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListRequest {
    /// The "reference": prepended (with a `/` if needed) to every pattern.
    pub reference: String,
    /// Match mailboxes whose name matches any of these patterns.
    pub patterns: Vec<String>,
    /// Only match subscribed mailboxes, including ones that don't exist.
    pub select_subscribed: bool,
    /// RFC 5258 RECURSIVEMATCH: report non-matching parents of matching
    /// children with CHILDINFO.
    pub recursive_match: bool,
    /// Return `\Subscribed` where applicable.
    pub return_subscribed: bool,
    /// Return `\HasChildren`/`\HasNoChildren`.
    pub return_children: bool,
    /// RFC 5819: also return a STATUS response with these fields for every
    /// listed selectable mailbox.
    pub return_status: Option<StatusRequest>,
    /// Produce `LSUB`-style output (`\Noselect` in place of
    /// `\NonExistent`).
    pub lsub_style: bool,
}

/// A `LIST` or `LSUB` response line.
///
/// The hierarchy delimiter is always `/` and is not represented here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListResponse {
    pub name: String,
    pub attributes: Vec<MailboxAttribute>,
    /// If non-empty, emit a `("CHILDINFO" (...))` extension block.
    pub child_info: Vec<&'static str>,
    /// If present, emit a `* STATUS` response after the LIST line.
    pub status: Option<StatusResponse>,
}

/// Everything needed to respond to `SELECT` or `EXAMINE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectResponse {
    /// `* FLAGS (...)` and the `PERMANENTFLAGS` response code.
    pub flags: Vec<Flag>,
    /// `* n EXISTS`
    pub exists: usize,
    /// `* n RECENT`
    pub recent: usize,
    /// `* OK [UNSEEN n]` — seqnum of first unseen message, if any.
    pub unseen: Option<Seqnum>,
    /// `* OK [UIDNEXT n]`
    pub uidnext: Uid,
    /// `* OK [UIDVALIDITY n]`
    pub uidvalidity: u32,
    /// `TAG OK [READ-WRITE|READ-ONLY]`
    pub read_only: bool,
}

/// Unsolicited state changes to be delivered to one session at a command
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollResponse {
    /// Messages to report as expunged, ascending. They must be *sent* in
    /// descending order so that each line's seqnum is correct at the moment
    /// it is delivered.
    pub expunge: Vec<(Seqnum, Uid)>,
    /// If the mailbox size changed, the new size.
    pub exists: Option<usize>,
    /// If there are new messages, the new recent count.
    pub recent: Option<usize>,
    /// UIDs to report in unsolicited `FETCH (FLAGS ...)` responses.
    pub fetch: Vec<Uid>,
}

/// Request information for `STORE` / `UID STORE`.
#[derive(Clone, Debug)]
pub struct StoreRequest<'a, ID> {
    /// The message(s) to affect.
    pub ids: &'a SeqRange<ID>,
    /// The flags listed in the command.
    pub flags: &'a [Flag],
    /// `-FLAGS`: remove the listed flags instead of adding them.
    pub remove_listed: bool,
    /// `FLAGS`: also remove any flag not listed.
    pub remove_unlisted: bool,
    /// Whether to send untagged FETCH responses for the affected messages
    /// (i.e. the non-`.SILENT` forms).
    pub loud: bool,
}

/// The result of `APPEND` or `COPY` against a destination mailbox, used for
/// the UIDPLUS response codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    pub uidvalidity: u32,
    pub uids: SeqRange<Uid>,
}

/// The parsed content of one `APPEND` message item.
#[derive(Clone, Debug, Default)]
pub struct AppendItem {
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn seqrange_parsing() {
        assert_eq!(
            Some(SeqRange::just(Uid::u(1))),
            SeqRange::parse("1", Uid::u(10))
        );
        assert_eq!(
            Some(SeqRange::range(Uid::u(1), Uid::u(10))),
            SeqRange::parse("1:*", Uid::u(10))
        );
        assert_eq!(
            Some(SeqRange::range(Uid::u(4), Uid::u(10))),
            SeqRange::parse("*:4", Uid::u(10))
        );
        assert_eq!(None, SeqRange::<Uid>::parse("", Uid::u(10)));
        assert_eq!(None, SeqRange::<Uid>::parse("1:2:3", Uid::u(10)));
        assert_eq!(None, SeqRange::<Uid>::parse("0", Uid::u(10)));

        let mut expected = SeqRange::new();
        expected.insert(Uid::u(1), Uid::u(3));
        expected.append(Uid::u(5));
        assert_eq!(Some(expected), SeqRange::parse("1:3,5", Uid::u(10)));
    }

    #[test]
    fn seqrange_display_collapses_runs() {
        let mut r = SeqRange::<Uid>::new();
        r.append(Uid::u(1));
        r.append(Uid::u(2));
        r.append(Uid::u(3));
        r.append(Uid::u(5));
        r.append(Uid::u(7));
        r.append(Uid::u(8));
        assert_eq!("1:3,5,7:8", r.to_string());
    }

    #[test]
    fn flag_sequence_round_trip() {
        for flag in Flag::SYSTEM {
            assert_eq!(
                Some(flag.clone()),
                Flag::from_mh_sequence_name(flag.mh_sequence_name())
            );
        }
        assert_eq!(None, Flag::from_mh_sequence_name("unseen"));
        assert_eq!(None, Flag::from_mh_sequence_name("Recent"));
        assert_eq!(
            Some(Flag::Keyword("NotJunk".to_owned())),
            Flag::from_mh_sequence_name("NotJunk")
        );
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_eq!(
            Flag::Keyword("foo".to_owned()),
            "FOO".parse::<Flag>().unwrap()
        );
        assert_matches!(Err(Error::NxFlag), "\\Plugh".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "foo bar".parse::<Flag>());
    }

    proptest! {
        #[test]
        fn seqrange_matches_naive_set(
            ranges in prop::collection::vec((1u32..60, 0u32..5), 0..8)
        ) {
            let mut seqrange = SeqRange::<Uid>::new();
            let mut naive = HashSet::<u32>::new();

            for (start, extent) in ranges {
                seqrange.insert(
                    Uid::u(start), Uid::u(start + extent));
                naive.extend(start..=start + extent);
            }

            for v in 1u32..70 {
                prop_assert_eq!(
                    naive.contains(&v),
                    seqrange.contains(Uid::u(v)),
                    "disagreement on {}", v);
            }

            prop_assert_eq!(naive.len(), seqrange.len());

            // Round trip through the wire format.
            if !seqrange.is_empty() {
                let reparsed = SeqRange::<Uid>::parse(
                    &seqrange.to_string(), Uid::u(70)).unwrap();
                prop_assert_eq!(seqrange, reparsed);
            }
        }
    }
}
