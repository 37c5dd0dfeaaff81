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

//! Code for reading and writing IMAP requests and responses.
//!
//! Most of this is based on a set of macros which automatically generate AST
//! structs, parsers, and writer code, so that the three remain in sync and
//! have a natural correspondence to the standards' formal syntaxes.
//!
//! `APPEND` is not handled directly. This file provides code to recognise it
//! and parse its parts, but the full command is handled at the protocol
//! level since its literals can dwarf the command-line buffer.
//!
//! Sequence sets are recognised at a purely lexical level and returned as
//! strings; interpreting them requires context (EXISTS, NEXT-UID) that only
//! the selected mailbox has.
//!
//! The response *parsers* generated alongside the writers exist for the
//! test suite, which re-reads what the server wrote; they are not a general
//! IMAP client parser.

use std::borrow::Cow;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::str;

use chrono::prelude::*;
use nom::{
    branch::alt,
    bytes::complete::{is_a, is_not, tag, tag_no_case as kw},
    combinator::{map, map_opt, opt},
    multi, sequence, IResult,
};

use super::lex::LexWriter;
use crate::account::model::Flag;
use crate::mime::encoded_word::ew_decode;

include!("syntax-macros.rs");

// ==================== RESPONSES ====================

syntax_rule! {
    #[prefix("CAPABILITY")]
    struct CapabilityData<'a> {
        #[1* prefix(" ")]
        #[primitive(verbatim, normal_atom)]
        capabilities: Vec<Cow<'a, str>>,
    }
}

simple_enum! {
    enum RespCondType {
        Ok("OK"),
        No("NO"),
        Bad("BAD"),
        Bye("BYE"),
        Preauth("PREAUTH"),
    }
}

syntax_rule! {
    #[]
    struct CondResponse<'a> {
        #[]
        #[delegate]
        cond: RespCondType,
        #[opt surrounded(" [", "]")]
        #[delegate(RespTextCode)]
        code: Option<RespTextCode<'a>>,
        #[opt prefix(" ")]
        #[primitive(verbatim, text)]
        quip: Option<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[]
    enum RespTextCode<'a> {
        #[]
        #[tag("ALERT")]
        Alert(()),
        #[surrounded("BADCHARSET (", ")") 1*(" ")]
        #[primitive(verbatim, normal_atom)]
        BadCharset(Vec<Cow<'a, str>>),
        #[]
        #[delegate]
        Capability(CapabilityData<'a>),
        #[]
        #[tag("PARSE")]
        Parse(()),
        #[surrounded("PERMANENTFLAGS (", " \\*)") 0*(" ")]
        #[primitive(flag, flag)]
        PermanentFlags(Vec<Flag>),
        #[]
        #[tag("READ-ONLY")]
        ReadOnly(()),
        #[]
        #[tag("READ-WRITE")]
        ReadWrite(()),
        #[]
        #[tag("TRYCREATE")]
        TryCreate(()),
        #[]
        #[tag("ALREADYEXISTS")]
        AlreadyExists(()),
        #[]
        #[tag("NONEXISTENT")]
        Nonexistent(()),
        #[]
        #[tag("LIMIT")]
        Limit(()),
        #[]
        #[tag("SERVERBUG")]
        ServerBug(()),
        #[]
        #[tag("CLIENTBUG")]
        ClientBug(()),
        #[]
        #[tag("AUTHENTICATIONFAILED")]
        AuthenticationFailed(()),
        #[prefix("NOUPDATE ")]
        #[primitive(string, string)]
        NoUpdate(Cow<'a, str>),
        #[prefix("UIDNEXT ")]
        #[primitive(num_u32, number)]
        UidNext(u32),
        #[prefix("UIDVALIDITY ")]
        #[primitive(num_u32, number)]
        UidValidity(u32),
        #[prefix("UNSEEN ")]
        #[primitive(num_u32, number)]
        Unseen(u32),
        #[prefix("APPENDUID ")]
        #[delegate]
        AppendUid(AppendUidData<'a>),
        #[prefix("COPYUID ")]
        #[delegate]
        CopyUid(CopyUidData<'a>),
    }
}

syntax_rule! {
    #[]
    struct AppendUidData<'a> {
        #[suffix(" ")]
        #[primitive(num_u32, number)]
        uid_validity: u32,
        #[]
        #[primitive(verbatim, sequence_set)]
        uids: Cow<'a, str>,
    }
}

syntax_rule! {
    #[]
    struct CopyUidData<'a> {
        #[suffix(" ")]
        #[primitive(num_u32, number)]
        uid_validity: u32,
        #[suffix(" ")]
        #[primitive(verbatim, sequence_set)]
        from_uids: Cow<'a, str>,
        #[]
        #[primitive(verbatim, sequence_set)]
        to_uids: Cow<'a, str>,
    }
}

syntax_rule! {
    #[]
    struct MailboxList<'a> {
        // The hierarchy delimiter field is folded into the suffix since it
        // is always "/".
        #[surrounded("(", ") \"/\" ") 0*(" ")]
        #[primitive(verbatim, backslash_atom)]
        flags: Vec<Cow<'a, str>>,
        #[]
        #[primitive(mailbox, mailbox)]
        name: Cow<'a, str>,
        #[opt surrounded(" (\"CHILDINFO\" (", "))") 1*(" ")]
        #[primitive(string, string)]
        child_info: Option<Vec<Cow<'a, str>>>,
    }
}

syntax_rule! {
    #[]
    struct StatusResponseData<'a> {
        #[suffix(" ")]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
        #[surrounded("(", ")") 0*(" ")]
        #[delegate(StatusResponseAtt)]
        atts: Vec<StatusResponseAtt<'a>>,
    }
}

syntax_rule! {
    #[]
    struct StatusResponseAtt<'a> {
        #[suffix(" ")]
        #[delegate]
        att: StatusAtt,
        #[]
        #[primitive(num_u32, number)]
        value: u32,
        #[]
        #[phantom]
        _marker: PhantomData<&'a ()>,
    }
}

syntax_rule! {
    #[surrounded("(", ")")]
    struct Envelope<'a> {
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        date: Option<Cow<'a, str>>,
        #[suffix(" ")]
        #[primitive(encoded_nstring, nstring)]
        subject: Option<Cow<'a, str>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        from: Vec<Address<'a>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        sender: Vec<Address<'a>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        reply_to: Vec<Address<'a>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        to: Vec<Address<'a>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        cc: Vec<Address<'a>>,
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*]
        #[delegate(Address)]
        bcc: Vec<Address<'a>>,
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        in_reply_to: Option<Cow<'a, str>>,
        #[]
        #[primitive(nstring, nstring)]
        message_id: Option<Cow<'a, str>>,
    }
}

// The RealAddress/GroupDelim distinction is not part of RFC 3501 syntax,
// but groups put their display name into the "local part" of the
// delimiter, where encoded words may appear, unlike a real local part.
syntax_rule! {
    #[surrounded("(", ")")]
    enum Address<'a> {
        #[]
        #[delegate]
        Real(RealAddress<'a>),
        // Groups never have a display name, routing, or domain.
        #[surrounded("NIL NIL ", " NIL")]
        #[primitive(encoded_nstring, nstring)]
        GroupDelim(Option<Cow<'a, str>>),
    }
}

syntax_rule! {
    #[]
    struct RealAddress<'a> {
        #[suffix(" ")]
        #[primitive(encoded_nstring, nstring)]
        display_name: Option<Cow<'a, str>>,
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        routing: Option<Cow<'a, str>>,
        // nstrings in RFC 3501 syntax; the separate GroupDelim case covers
        // the NIL forms.
        #[suffix(" ")]
        #[primitive(string, string)]
        local_part: Cow<'a, str>,
        #[]
        #[primitive(string, string)]
        domain: Cow<'a, str>,
    }
}

syntax_rule! {
    #[surrounded("(", ")")]
    enum Body<'a> {
        #[]
        #[delegate]
        Multipart(BodyTypeMPart<'a>),
        #[]
        #[delegate]
        SinglePart(BodyType1Part<'a>),
    }
}

syntax_rule! {
    #[]
    struct BodyTypeMPart<'a> {
        // RFC 3501 makes this 1*, disregarding the possibility of a
        // multipart with no parts; 0* represents that as a leading space,
        // which is gross, but such is IMAP syntax.
        #[suffix(" ") 0*]
        #[delegate(Body)]
        bodies: Vec<Body<'a>>,
        #[]
        #[primitive(string, string)]
        media_subtype: Cow<'a, str>,
        #[opt prefix(" ")]
        #[delegate(BodyExtMPart)]
        ext: Option<BodyExtMPart<'a>>,
    }
}

syntax_rule! {
    #[]
    struct BodyExtMPart<'a> {
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*(" ")]
        #[primitive(string, string)]
        content_type_parms: Vec<Cow<'a, str>>,
        #[suffix(" ") nil]
        #[delegate(ContentDisposition)]
        content_disposition: Option<ContentDisposition<'a>>,
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        content_language: Option<Cow<'a, str>>,
        #[]
        #[primitive(nstring, nstring)]
        content_location: Option<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[]
    struct BodyType1Part<'a> {
        #[]
        #[delegate]
        core: ClassifiedBodyType1Part<'a>,
        #[opt prefix(" ")]
        #[delegate(BodyExt1Part)]
        ext: Option<BodyExt1Part<'a>>,
    }
}

syntax_rule! {
    #[]
    enum ClassifiedBodyType1Part<'a> {
        #[]
        #[delegate]
        Message(BodyTypeMsg<'a>),
        #[]
        #[delegate]
        Text(BodyTypeText<'a>),
        // Last so that greedy parsing can match the content-type prefixes
        // of the prior two.
        #[]
        #[delegate]
        Basic(BodyTypeBasic<'a>),
    }
}

syntax_rule! {
    #[]
    struct BodyTypeBasic<'a> {
        #[suffix(" ")]
        #[primitive(string, string)]
        media_type: Cow<'a, str>,
        #[suffix(" ")]
        #[primitive(string, string)]
        media_subtype: Cow<'a, str>,
        #[]
        #[delegate]
        body_fields: BodyFields<'a>,
    }
}

syntax_rule! {
    #[prefix("\"MESSAGE\" \"RFC822\" ")]
    struct BodyTypeMsg<'a> {
        #[suffix(" ")]
        #[delegate]
        body_fields: BodyFields<'a>,
        #[suffix(" ")]
        #[delegate]
        envelope: Envelope<'a>,
        #[suffix(" ") box]
        #[delegate(Body)]
        body: Box<Body<'a>>,
        #[]
        #[primitive(num_u32, number)]
        size_lines: u32,
    }
}

syntax_rule! {
    #[prefix("\"TEXT\" ")]
    struct BodyTypeText<'a> {
        #[suffix(" ")]
        #[primitive(string, string)]
        media_subtype: Cow<'a, str>,
        #[suffix(" ")]
        #[delegate]
        body_fields: BodyFields<'a>,
        #[]
        #[primitive(num_u32, number)]
        size_lines: u32,
    }
}

syntax_rule! {
    #[]
    struct BodyFields<'a> {
        #[suffix(" ") nil_if_empty surrounded("(", ")") 1*(" ")]
        #[primitive(string, string)]
        content_type_parms: Vec<Cow<'a, str>>,
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        content_id: Option<Cow<'a, str>>,
        #[suffix(" ")]
        #[primitive(encoded_nstring, nstring)]
        content_description: Option<Cow<'a, str>>,
        #[suffix(" ")]
        #[primitive(string, string)]
        content_transfer_encoding: Cow<'a, str>,
        #[]
        #[primitive(num_u32, number)]
        size_octets: u32,
    }
}

syntax_rule! {
    #[]
    struct BodyExt1Part<'a> {
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        md5: Option<Cow<'a, str>>,
        #[suffix(" ") nil]
        #[delegate(ContentDisposition)]
        content_disposition: Option<ContentDisposition<'a>>,
        #[suffix(" ")]
        #[primitive(nstring, nstring)]
        content_language: Option<Cow<'a, str>>,
        #[]
        #[primitive(nstring, nstring)]
        content_location: Option<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[surrounded("(", ")")]
    struct ContentDisposition<'a> {
        #[suffix(" ")]
        #[primitive(string, string)]
        disposition: Cow<'a, str>,
        #[nil_if_empty surrounded("(", ")") 1*(" ")]
        #[primitive(string, string)]
        parms: Vec<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[surrounded("(", ")")]
    struct MsgAtts<'a> {
        #[1*(" ")]
        #[delegate(MsgAtt)]
        atts: Vec<MsgAtt<'a>>,
    }
}

syntax_rule! {
    #[]
    enum MsgAtt<'a> {
        #[prefix("ENVELOPE ")]
        #[delegate]
        Envelope(Envelope<'a>),
        #[prefix("INTERNALDATE ")]
        #[primitive(datetime, datetime)]
        InternalDate(DateTime<FixedOffset>),
        #[prefix("RFC822.SIZE ")]
        #[primitive(num_u32, number)]
        Rfc822Size(u32),
        // The formal grammar permits NIL for these literals, but the
        // consistent guidance is to send empty strings instead, so the
        // NIL case is not represented.
        #[prefix("RFC822.HEADER ")]
        #[primitive(literal_bytes, literal_bytes)]
        Rfc822Header(Vec<u8>),
        #[prefix("RFC822.TEXT ")]
        #[primitive(literal_bytes, literal_bytes)]
        Rfc822Text(Vec<u8>),
        #[prefix("RFC822 ")]
        #[primitive(literal_bytes, literal_bytes)]
        Rfc822Full(Vec<u8>),
        #[prefix("BODY ")]
        #[delegate]
        ShortBodyStructure(Body<'a>),
        #[prefix("BODYSTRUCTURE ")]
        #[delegate]
        ExtendedBodyStructure(Body<'a>),
        #[prefix("BODY")]
        #[delegate]
        Body(MsgAttBody<'a>),
        #[prefix("UID ")]
        #[primitive(num_u32, number)]
        Uid(u32),
        #[surrounded("FLAGS (", ")")]
        #[delegate(FlagsFetch)]
        Flags(FlagsFetch<'a>),
    }
}

syntax_rule! {
    #[]
    struct MsgAttBody<'a> {
        #[surrounded("[", "]") opt]
        #[delegate(SectionSpec)]
        section: Option<SectionSpec<'a>>,
        #[opt surrounded("<", ">")]
        #[primitive(num_u32, number)]
        slice_origin: Option<u32>,
        #[prefix(" ")]
        #[primitive(literal_bytes, literal_bytes)]
        data: Vec<u8>,
    }
}

// This somewhat awkward enum accounts for the fact that \Recent is not a
// real flag. The FLAGS part of the FETCH response is the only place where
// \Recent can occur, so instead of another layer to represent it, this
// contortion ensures the correct number of spaces occur.
syntax_rule! {
    #[]
    enum FlagsFetch<'a> {
        #[prefix("\\Recent") 0* prefix(" ")]
        #[primitive(flag, flag)]
        Recent(Vec<Flag>),
        #[0*(" ")]
        #[primitive(flag, flag)]
        NotRecent(Vec<Flag>),
        // Never parsed in the server; moot marker case.
        #[prefix("\x00")]
        #[phantom]
        _Marker(PhantomData<&'a ()>),
    }
}

syntax_rule! {
    #[]
    struct FetchResponse<'a> {
        #[suffix(" FETCH ")]
        #[primitive(num_u32, number)]
        seqnum: u32,
        #[]
        #[delegate]
        atts: MsgAtts<'a>,
    }
}

syntax_rule! {
    #[]
    struct EsearchResponse<'a> {
        #[surrounded("ESEARCH (TAG \"", "\")")]
        #[primitive(verbatim, tag_atom)]
        tag: Cow<'a, str>,
        #[]
        #[cond(" UID")]
        uid: bool,
        #[opt prefix(" MIN ")]
        #[primitive(num_u32, number)]
        min: Option<u32>,
        #[opt prefix(" MAX ")]
        #[primitive(num_u32, number)]
        max: Option<u32>,
        #[opt prefix(" COUNT ")]
        #[primitive(num_u32, number)]
        count: Option<u32>,
        #[opt prefix(" ALL ")]
        #[primitive(verbatim, sequence_set)]
        all: Option<Cow<'a, str>>,
        #[opt surrounded(" ADDTO (", ")") 1*(" ")]
        #[delegate(ContextUpdateItem)]
        addto: Option<Vec<ContextUpdateItem<'a>>>,
        #[opt surrounded(" REMOVEFROM (", ")") 1*(" ")]
        #[delegate(ContextUpdateItem)]
        removefrom: Option<Vec<ContextUpdateItem<'a>>>,
        #[opt]
        #[delegate(EsearchPartial)]
        partial: Option<EsearchPartial<'a>>,
    }
}

syntax_rule! {
    #[]
    struct ContextUpdateItem<'a> {
        #[suffix(" ")]
        #[primitive(num_u32, number)]
        position: u32,
        #[]
        #[primitive(verbatim, sequence_set)]
        ids: Cow<'a, str>,
    }
}

syntax_rule! {
    #[surrounded(" PARTIAL (", ")")]
    struct EsearchPartial<'a> {
        #[suffix(":")]
        #[primitive(num_u32, number)]
        start: u32,
        #[suffix(" ")]
        #[primitive(num_u32, number)]
        end: u32,
        #[nil_if_empty]
        #[primitive(verbatim, sequence_set)]
        ids: Cow<'a, str>,
    }
}

syntax_rule! {
    #[]
    enum Response<'a> {
        #[]
        #[delegate]
        Cond(CondResponse<'a>),
        #[]
        #[delegate]
        Capability(CapabilityData<'a>),
        #[prefix("LIST ")]
        #[delegate]
        List(MailboxList<'a>),
        #[prefix("LSUB ")]
        #[delegate]
        Lsub(MailboxList<'a>),
        #[prefix("STATUS ")]
        #[delegate]
        Status(StatusResponseData<'a>),
        #[suffix(" EXISTS")]
        #[primitive(num_u32, number)]
        Exists(u32),
        #[suffix(" RECENT")]
        #[primitive(num_u32, number)]
        Recent(u32),
        #[suffix(" EXPUNGE")]
        #[primitive(num_u32, number)]
        Expunge(u32),
        #[surrounded("FLAGS (", ")") 0*(" ")]
        #[primitive(flag, flag)]
        Flags(Vec<Flag>),
        #[]
        #[delegate]
        Fetch(FetchResponse<'a>),
        #[prefix("SEARCH") 0* prefix(" ")]
        #[primitive(num_u32, number)]
        Search(Vec<u32>),
        #[prefix("SORT") 0* prefix(" ")]
        #[primitive(num_u32, number)]
        Sort(Vec<u32>),
        #[]
        #[delegate]
        Esearch(EsearchResponse<'a>),
        #[]
        #[tag("NAMESPACE ((\"\" \"/\")) NIL NIL")]
        Namespace(()),
    }
}

syntax_rule! {
    #[]
    struct ResponseLine<'a> {
        #[marked_opt("*") suffix(" ")]
        #[primitive(verbatim, tag_atom)]
        tag: Option<Cow<'a, str>>,
        #[]
        #[delegate]
        response: Response<'a>,
    }
}

// ==================== COMMANDS ====================

simple_enum! {
    enum SimpleCommand {
        Capability("CAPABILITY"),
        Check("CHECK"),
        Close("CLOSE"),
        Expunge("EXPUNGE"),
        Idle("IDLE"),
        LogOut("LOGOUT"),
        Namespace("NAMESPACE"),
        Noop("NOOP"),
        StartTls("STARTTLS"),
        Unselect("UNSELECT"),
    }
}

syntax_rule! {
    #[prefix("LOGIN ")]
    struct LogInCommand<'a> {
        #[suffix(" ")]
        #[primitive(astring, astring)]
        userid: Cow<'a, str>,
        #[]
        #[primitive(astring, astring)]
        password: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("CREATE ")]
    struct CreateCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("DELETE ")]
    struct DeleteCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("EXAMINE ")]
    struct ExamineCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("RENAME ")]
    struct RenameCommand<'a> {
        #[suffix(" ")]
        #[primitive(mailbox, mailbox)]
        src: Cow<'a, str>,
        #[]
        #[primitive(mailbox, mailbox)]
        dst: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("SELECT ")]
    struct SelectCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("SUBSCRIBE ")]
    struct SubscribeCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("UNSUBSCRIBE ")]
    struct UnsubscribeCommand<'a> {
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

simple_enum! {
    enum StatusAtt {
        Messages("MESSAGES"),
        Recent("RECENT"),
        UidNext("UIDNEXT"),
        UidValidity("UIDVALIDITY"),
        Unseen("UNSEEN"),
    }
}

syntax_rule! {
    #[prefix("STATUS ")]
    struct StatusCommand<'a> {
        #[suffix(" ")]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
        #[surrounded("(", ")") 1*(" ")]
        #[delegate(StatusAtt)]
        atts: Vec<StatusAtt>,
    }
}

simple_enum! {
    enum ListSelectOpt {
        RecursiveMatch("RECURSIVEMATCH"),
        Subscribed("SUBSCRIBED"),
    }
}

syntax_rule! {
    #[]
    enum ListReturnOpt<'a> {
        #[]
        #[tag("SUBSCRIBED")]
        Subscribed(()),
        #[]
        #[tag("CHILDREN")]
        Children(()),
        #[surrounded("STATUS (", ")") 1*(" ")]
        #[delegate(StatusAtt)]
        Status(Vec<StatusAtt>),
        // Never parsed; exists to tie the lifetime down.
        #[prefix("\x00")]
        #[phantom]
        _Marker(PhantomData<&'a ()>),
    }
}

syntax_rule! {
    #[]
    enum ListPattern<'a> {
        #[surrounded("(", ")") 1*(" ")]
        #[primitive(mailbox, list_mailbox)]
        Multi(Vec<Cow<'a, str>>),
        #[]
        #[primitive(mailbox, list_mailbox)]
        Single(Cow<'a, str>),
    }
}

syntax_rule! {
    #[prefix("LIST ")]
    struct ListCommand<'a> {
        #[opt surrounded("(", ") ") 0*(" ")]
        #[delegate(ListSelectOpt)]
        select_opts: Option<Vec<ListSelectOpt>>,
        #[suffix(" ")]
        #[primitive(mailbox, mailbox)]
        reference: Cow<'a, str>,
        #[]
        #[delegate]
        pattern: ListPattern<'a>,
        #[opt surrounded(" RETURN (", ")") 0*(" ")]
        #[delegate(ListReturnOpt)]
        return_opts: Option<Vec<ListReturnOpt<'a>>>,
    }
}

syntax_rule! {
    #[prefix("LSUB ")]
    struct LsubCommand<'a> {
        #[suffix(" ")]
        #[primitive(mailbox, mailbox)]
        reference: Cow<'a, str>,
        #[]
        #[primitive(mailbox, list_mailbox)]
        pattern: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("FETCH ")]
    struct FetchCommand<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, sequence_set)]
        sequence_set: Cow<'a, str>,
        #[]
        #[delegate]
        target: FetchCommandTarget<'a>,
    }
}

syntax_rule! {
    #[]
    enum FetchCommandTarget<'a> {
        #[]
        #[tag("ALL")]
        All(()),
        #[]
        #[tag("FULL")]
        Full(()),
        #[]
        #[tag("FAST")]
        Fast(()),
        #[]
        #[delegate]
        Single(FetchAtt<'a>),
        #[surrounded("(", ")") 1*(" ")]
        #[delegate(FetchAtt)]
        Multi(Vec<FetchAtt<'a>>),
    }
}

syntax_rule! {
    #[]
    enum FetchAtt<'a> {
        #[]
        #[tag("ENVELOPE")]
        Envelope(()),
        #[]
        #[tag("FLAGS")]
        Flags(()),
        #[]
        #[tag("INTERNALDATE")]
        InternalDate(()),
        #[prefix("RFC822") opt]
        #[delegate(FetchAttRfc822)]
        Rfc822(Option<FetchAttRfc822>),
        // Must come before the body structure cases to resolve the
        // ambiguity the correct way.
        #[prefix("BODY")]
        #[delegate]
        Body(FetchAttBody<'a>),
        #[]
        #[tag("BODYSTRUCTURE")]
        ExtendedBodyStructure(()),
        #[]
        #[tag("BODY")]
        ShortBodyStructure(()),
        #[]
        #[tag("UID")]
        Uid(()),
    }
}

simple_enum! {
    enum FetchAttRfc822 {
        Header(".HEADER"),
        Size(".SIZE"),
        Text(".TEXT"),
    }
}

syntax_rule! {
    #[]
    struct FetchAttBody<'a> {
        #[]
        #[cond(".PEEK")]
        peek: bool,
        #[surrounded("[", "]") opt]
        #[delegate(SectionSpec)]
        section: Option<SectionSpec<'a>>,
        #[opt]
        #[delegate(FetchAttBodySlice)]
        slice: Option<FetchAttBodySlice<'a>>,
    }
}

syntax_rule! {
    #[]
    enum SectionSpec<'a> {
        #[]
        #[delegate]
        TopLevel(SectionText<'a>),
        #[]
        #[delegate]
        Sub(SubSectionSpec<'a>),
    }
}

syntax_rule! {
    #[]
    struct SubSectionSpec<'a> {
        #[1*(".")]
        #[primitive(num_u32, number)]
        subscripts: Vec<u32>,
        #[opt prefix(".")]
        #[delegate(SectionText)]
        text: Option<SectionText<'a>>,
    }
}

syntax_rule! {
    #[]
    enum SectionText<'a> {
        #[prefix("HEADER.FIELDS")]
        #[delegate]
        HeaderFields(SectionTextHeaderField<'a>),
        #[]
        #[tag("HEADER")]
        Header(()),
        #[]
        #[tag("TEXT")]
        Text(()),
        #[]
        #[tag("MIME")]
        Mime(()),
    }
}

syntax_rule! {
    #[]
    struct SectionTextHeaderField<'a> {
        #[suffix(" ")]
        #[cond(".NOT")]
        negative: bool,
        #[surrounded("(", ")") 1*(" ")]
        #[primitive(astring, astring)]
        headers: Vec<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[surrounded("<", ">")]
    struct FetchAttBodySlice<'a> {
        #[suffix(".")]
        #[primitive(num_u32, number)]
        start: u32,
        #[]
        #[primitive(num_u32, number)]
        length: u32,
        #[]
        #[phantom]
        _marker: PhantomData<&'a ()>,
    }
}

syntax_rule! {
    #[prefix("STORE ")]
    struct StoreCommand<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, sequence_set)]
        sequence_set: Cow<'a, str>,
        #[]
        #[cond("+")]
        add: bool,
        #[]
        #[cond("-")]
        remove: bool,
        #[]
        #[tag("FLAGS")]
        _flags: (),
        #[]
        #[cond(".SILENT")]
        silent: bool,
        #[prefix(" ") maybe_surrounded("(", ")") 0*(" ")]
        #[primitive(flag, flag)]
        flags: Vec<Flag>,
    }
}

syntax_rule! {
    #[prefix("COPY ")]
    struct CopyCommand<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, sequence_set)]
        sequence_set: Cow<'a, str>,
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

syntax_rule! {
    #[prefix("MOVE ")]
    struct MoveCommand<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, sequence_set)]
        sequence_set: Cow<'a, str>,
        #[]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
    }
}

// SearchKey is broken into several smaller parts to prevent alt()
// expansions from getting too large.
simple_enum! {
    enum SimpleSearchKey {
        All("ALL"),
        Answered("ANSWERED"),
        Deleted("DELETED"),
        Flagged("FLAGGED"),
        New("NEW"),
        Old("OLD"),
        Recent("RECENT"),
        Seen("SEEN"),
        Unanswered("UNANSWERED"),
        Undeleted("UNDELETED"),
        Unflagged("UNFLAGGED"),
        Unseen("UNSEEN"),
        Draft("DRAFT"),
        Undraft("UNDRAFT"),
    }
}

syntax_rule! {
    #[]
    struct TextSearchKey<'a> {
        #[suffix(" ")]
        #[delegate]
        typ: TextSearchKeyType,
        #[]
        #[primitive(astring, astring)]
        value: Cow<'a, str>,
    }
}

simple_enum! {
    enum TextSearchKeyType {
        Bcc("BCC"),
        Body("BODY"),
        Cc("CC"),
        From("FROM"),
        Subject("SUBJECT"),
        Text("TEXT"),
        To("TO"),
    }
}

syntax_rule! {
    #[]
    struct DateSearchKey<'a> {
        #[suffix(" ")]
        #[delegate]
        typ: DateSearchKeyType,
        #[]
        #[primitive(date, date)]
        date: NaiveDate,
        #[]
        #[phantom]
        _marker: PhantomData<&'a ()>,
    }
}

simple_enum! {
    enum DateSearchKeyType {
        Before("BEFORE"),
        On("ON"),
        Since("SINCE"),
        SentBefore("SENTBEFORE"),
        SentOn("SENTON"),
        SentSince("SENTSINCE"),
    }
}

syntax_rule! {
    #[]
    enum SearchKey<'a> {
        #[]
        #[delegate]
        Simple(SimpleSearchKey),
        #[]
        #[delegate]
        Text(TextSearchKey<'a>),
        #[]
        #[delegate]
        Date(DateSearchKey<'a>),
        #[prefix("KEYWORD ")]
        #[primitive(flag, keyword)]
        Keyword(Flag),
        #[prefix("UNKEYWORD ")]
        #[primitive(flag, keyword)]
        Unkeyword(Flag),
        #[prefix("HEADER ")]
        #[delegate]
        Header(SearchKeyHeader<'a>),
        #[prefix("LARGER ")]
        #[primitive(num_u32, number)]
        Larger(u32),
        #[prefix("NOT ") box]
        #[delegate(SearchKey)]
        Not(Box<SearchKey<'a>>),
        #[prefix("OR ")]
        #[delegate]
        Or(SearchKeyOr<'a>),
        #[prefix("SMALLER ")]
        #[primitive(num_u32, number)]
        Smaller(u32),
        #[prefix("UID ")]
        #[primitive(verbatim, sequence_set)]
        Uid(Cow<'a, str>),
        #[]
        #[primitive(verbatim, sequence_set)]
        Seqnum(Cow<'a, str>),
        #[surrounded("(", ")") 1*(" ")]
        #[delegate(SearchKey)]
        And(Vec<SearchKey<'a>>),
    }
}

syntax_rule! {
    #[]
    struct SearchKeyHeader<'a> {
        #[suffix(" ")]
        #[primitive(astring, astring)]
        header: Cow<'a, str>,
        #[]
        #[primitive(astring, astring)]
        value: Cow<'a, str>,
    }
}

syntax_rule! {
    #[]
    struct SearchKeyOr<'a> {
        #[suffix(" ") box]
        #[delegate(SearchKey)]
        a: Box<SearchKey<'a>>,
        #[box]
        #[delegate(SearchKey)]
        b: Box<SearchKey<'a>>,
    }
}

syntax_rule! {
    #[]
    enum SearchReturnOpt<'a> {
        #[]
        #[tag("MIN")]
        Min(()),
        #[]
        #[tag("MAX")]
        Max(()),
        #[]
        #[tag("ALL")]
        All(()),
        #[]
        #[tag("COUNT")]
        Count(()),
        #[]
        #[tag("UPDATE")]
        Update(()),
        #[surrounded("PARTIAL (", ")")]
        #[delegate]
        Partial(PartialRange<'a>),
    }
}

syntax_rule! {
    #[]
    struct PartialRange<'a> {
        #[suffix(":")]
        #[primitive(num_u32, number)]
        start: u32,
        #[]
        #[primitive(num_u32, number)]
        end: u32,
        #[]
        #[phantom]
        _marker: PhantomData<&'a ()>,
    }
}

syntax_rule! {
    #[prefix("SEARCH ")]
    struct SearchCommand<'a> {
        #[opt surrounded("RETURN (", ") ") 0*(" ")]
        #[delegate(SearchReturnOpt)]
        return_opts: Option<Vec<SearchReturnOpt<'a>>>,
        #[opt surrounded("CHARSET ", " ")]
        #[primitive(astring, astring)]
        charset: Option<Cow<'a, str>>,
        #[1*(" ")]
        #[delegate(SearchKey)]
        keys: Vec<SearchKey<'a>>,
    }
}

simple_enum! {
    enum SortKey {
        Arrival("ARRIVAL"),
        Cc("CC"),
        Date("DATE"),
        From("FROM"),
        Reverse("REVERSE"),
        Size("SIZE"),
        Subject("SUBJECT"),
        To("TO"),
    }
}

syntax_rule! {
    #[prefix("SORT ")]
    struct SortCommand<'a> {
        #[opt surrounded("RETURN (", ") ") 0*(" ")]
        #[delegate(SearchReturnOpt)]
        return_opts: Option<Vec<SearchReturnOpt<'a>>>,
        #[surrounded("(", ") ") 1*(" ")]
        #[delegate(SortKey)]
        keys: Vec<SortKey>,
        #[suffix(" ")]
        #[primitive(astring, astring)]
        charset: Cow<'a, str>,
        #[1*(" ")]
        #[delegate(SearchKey)]
        criteria: Vec<SearchKey<'a>>,
    }
}

syntax_rule! {
    #[prefix("CANCELUPDATE ")]
    struct CancelUpdateCommand<'a> {
        #[1*(" ")]
        #[primitive(string, string)]
        tags: Vec<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[]
    enum UidCommand<'a> {
        #[]
        #[delegate]
        Copy(CopyCommand<'a>),
        #[]
        #[delegate]
        Move(MoveCommand<'a>),
        #[]
        #[delegate]
        Fetch(FetchCommand<'a>),
        #[]
        #[delegate]
        Search(SearchCommand<'a>),
        #[]
        #[delegate]
        Sort(SortCommand<'a>),
        #[]
        #[delegate]
        Store(StoreCommand<'a>),
        #[prefix("EXPUNGE ")]
        #[primitive(verbatim, sequence_set)]
        Expunge(Cow<'a, str>),
    }
}

syntax_rule! {
    #[]
    enum Command<'a> {
        #[]
        #[delegate]
        Simple(SimpleCommand),
        #[]
        #[delegate]
        Create(CreateCommand<'a>),
        #[]
        #[delegate]
        Delete(DeleteCommand<'a>),
        #[]
        #[delegate]
        Examine(ExamineCommand<'a>),
        #[]
        #[delegate]
        List(ListCommand<'a>),
        #[]
        #[delegate]
        Lsub(LsubCommand<'a>),
        #[]
        #[delegate]
        LogIn(LogInCommand<'a>),
        #[]
        #[delegate]
        Rename(RenameCommand<'a>),
        #[]
        #[delegate]
        Select(SelectCommand<'a>),
        #[]
        #[delegate]
        Status(StatusCommand<'a>),
        #[]
        #[delegate]
        Subscribe(SubscribeCommand<'a>),
        #[]
        #[delegate]
        Unsubscribe(UnsubscribeCommand<'a>),
        #[]
        #[delegate]
        Fetch(FetchCommand<'a>),
        #[]
        #[delegate]
        Store(StoreCommand<'a>),
        #[]
        #[delegate]
        Copy(CopyCommand<'a>),
        #[]
        #[delegate]
        Move(MoveCommand<'a>),
        #[]
        #[delegate]
        Search(SearchCommand<'a>),
        #[]
        #[delegate]
        Sort(SortCommand<'a>),
        #[]
        #[delegate]
        CancelUpdate(CancelUpdateCommand<'a>),
        #[prefix("UID ")]
        #[delegate]
        Uid(UidCommand<'a>),
    }
}

syntax_rule! {
    #[]
    struct CommandLine<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, tag_atom)]
        tag: Cow<'a, str>,
        #[]
        #[delegate]
        cmd: Command<'a>,
    }
}

syntax_rule! {
    #[]
    struct AppendCommandStart<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, tag_atom)]
        tag: Cow<'a, str>,
        #[prefix("APPEND ") suffix(" ")]
        #[primitive(mailbox, mailbox)]
        mailbox: Cow<'a, str>,
        #[]
        #[delegate]
        first_fragment: AppendFragment<'a>,
    }
}

syntax_rule! {
    #[]
    struct AppendFragment<'a> {
        #[opt surrounded("(", ") ") 0*(" ")]
        #[primitive(flag, flag)]
        flags: Option<Vec<Flag>>,
        #[opt suffix(" ")]
        #[primitive(datetime, datetime)]
        internal_date: Option<DateTime<FixedOffset>>,
        #[]
        #[phantom]
        _marker: PhantomData<&'a ()>,
    }
}

syntax_rule! {
    #[]
    struct AuthenticateCommandStart<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, tag_atom)]
        tag: Cow<'a, str>,
        #[prefix("AUTHENTICATE ")]
        #[primitive(verbatim, normal_atom)]
        mechanism: Cow<'a, str>,
        #[opt prefix(" ")]
        #[primitive(verbatim, base64_text)]
        initial_response: Option<Cow<'a, str>>,
    }
}

syntax_rule! {
    #[]
    struct UnknownCommandFragment<'a> {
        #[suffix(" ")]
        #[primitive(verbatim, tag_atom)]
        tag: Cow<'a, str>,
        #[]
        #[primitive(verbatim, text)]
        rest: Cow<'a, str>,
    }
}

// ==================== PRIMITIVE PARSERS ====================

fn normal_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        nom::bytes::complete::take_while1(|b| {
            !matches!(
                b,
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
        }),
        String::from_utf8_lossy,
    )(i)
}

// Not formally part of IMAP syntax; keeping the backslash prefix in the
// token makes flag handling uniform. The parser will initially accept
// garbage like "foo\bar", which a later stage rejects when coercing to an
// enum or safe name.
fn backslash_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        nom::bytes::complete::take_while1(|b| {
            !matches!(
                b,
                0..=b' '
                    | 127..=255
                    | b'('
                    | b')'
                    | b'{'
                    | b'*'
                    | b'%'
                    | b'"'
                    | b']'
            )
        }),
        String::from_utf8_lossy,
    )(i)
}

fn astring_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        nom::bytes::complete::take_while1(|b| {
            !matches!(
                b,
                0..=b' '
                    | 127..=255
                    | b'('
                    | b')'
                    | b'{'
                    | b'*'
                    | b'%'
                    | b'\\'
                    | b'"'
            )
        }),
        String::from_utf8_lossy,
    )(i)
}

fn tag_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        nom::bytes::complete::take_while1(|b| {
            !matches!(
                b,
                0..=b' '
                    | 127..=255
                    | b'('
                    | b')'
                    | b'{'
                    | b'*'
                    | b'%'
                    | b'\\'
                    | b'"'
                    | b'+'
            )
        }),
        String::from_utf8_lossy,
    )(i)
}

fn list_mailbox_atom(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(
        nom::bytes::complete::take_while1(|b| {
            !matches!(
                b,
                0..=b' ' | 127..=255 | b'(' | b')' | b'{' | b'\\' | b'"'
            )
        }),
        String::from_utf8_lossy,
    )(i)
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(nom::character::complete::digit1, |s| {
        str::from_utf8(s).ok().and_then(|s| s.parse::<u32>().ok())
    })(i)
}

fn literal(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = sequence::delimited(
        tag("{"),
        number,
        alt((tag("+}\r\n"), tag("}\r\n"))),
    )(i)?;
    nom::bytes::complete::take(len)(i)
}

fn literal_bytes(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((
        map(literal, |data| data.to_vec()),
        map(quoted, |s| s.into_owned().into_bytes()),
    ))(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    sequence::preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    sequence::delimited(
        tag("\""),
        multi::fold_many0(
            map(quoted_string_content, String::from_utf8_lossy),
            || Cow::Owned(String::new()),
            |mut accum: Cow<'_, str>, piece| {
                if accum.is_empty() {
                    piece
                } else {
                    Cow::to_mut(&mut accum).push_str(&piece);
                    accum
                }
            },
        ),
        tag("\""),
    )(i)
}

fn string(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    alt((quoted, map(literal, String::from_utf8_lossy)))(i)
}

fn astring(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    alt((astring_atom, string))(i)
}

fn nstring(i: &[u8]) -> IResult<&[u8], Option<Cow<'_, str>>> {
    alt((map(kw("NIL"), |_| None), map(string, Some)))(i)
}

fn mailbox(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    astring(i)
}

// "mailbox as used by LIST and LSUB", which naturally needs different
// syntax (wildcards are legal atom characters here).
fn list_mailbox(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    alt((list_mailbox_atom, string))(i)
}

fn sequence_set(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(is_a("0123456789:*,"), String::from_utf8_lossy)(i)
}

fn text(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(is_not("\r\n"), String::from_utf8_lossy)(i)
}

fn base64_text(i: &[u8]) -> IResult<&[u8], Cow<'_, str>> {
    map(is_a("ABCDEFGHIJKLMNOPQRSTUVWXYZ\
              abcdefghijklmnopqrstuvwxyz0123456789+/="),
        String::from_utf8_lossy)(i)
}

fn keyword(i: &[u8]) -> IResult<&[u8], Flag> {
    map_opt(normal_atom, |a| {
        ew_decode(&a)
            .map(Cow::Owned)
            .unwrap_or(a)
            .parse::<Flag>()
            .ok()
    })(i)
}

fn flag(i: &[u8]) -> IResult<&[u8], Flag> {
    alt((keyword, map_opt(backslash_atom, |s| s.parse::<Flag>().ok())))(i)
}

fn parse_u32_infallible(i: &[u8]) -> u32 {
    str::from_utf8(i).unwrap().parse::<u32>().unwrap()
}

fn one_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        nom::bytes::complete::take_while_m_n(1, 1, nom::character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn two_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        nom::bytes::complete::take_while_m_n(2, 2, nom::character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn four_digit(i: &[u8]) -> IResult<&[u8], u32> {
    map(
        nom::bytes::complete::take_while_m_n(4, 4, nom::character::is_digit),
        parse_u32_infallible,
    )(i)
}

fn time_of_day(i: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    sequence::tuple((
        two_digit,
        sequence::preceded(tag(":"), two_digit),
        sequence::preceded(tag(":"), two_digit),
    ))(i)
}

fn numeric_zone(i: &[u8]) -> IResult<&[u8], i32> {
    map(
        sequence::pair(
            alt((tag("+"), tag("-"))),
            sequence::pair(two_digit, two_digit),
        ),
        |(sign, (h, m))| {
            let n = (h * 60 + m) as i32;
            if b"-" == sign {
                -n
            } else {
                n
            }
        },
    )(i)
}

static MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct",
    "nov", "dec",
];

fn month(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(nom::bytes::complete::take(3usize), |name| {
        str::from_utf8(name).ok().and_then(|name| {
            MONTH_NAMES
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .map(|ix| ix as u32 + 1)
        })
    })(i)
}

fn date_text(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_opt(
        sequence::tuple((
            sequence::terminated(alt((two_digit, one_digit)), tag("-")),
            sequence::terminated(month, tag("-")),
            four_digit,
        )),
        |(d, m, y)| NaiveDate::from_ymd_opt(y as i32, m, d),
    )(i)
}

fn date(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    alt((
        date_text,
        sequence::delimited(tag("\""), date_text, tag("\"")),
    ))(i)
}

fn datetime_date(i: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_opt(
        sequence::tuple((
            sequence::terminated(
                alt((two_digit, sequence::preceded(tag(" "), one_digit))),
                tag("-"),
            ),
            sequence::terminated(month, tag("-")),
            four_digit,
        )),
        |(d, m, y)| NaiveDate::from_ymd_opt(y as i32, m, d),
    )(i)
}

fn datetime(i: &[u8]) -> IResult<&[u8], DateTime<FixedOffset>> {
    map_opt(
        sequence::delimited(
            tag("\""),
            sequence::tuple((
                sequence::terminated(datetime_date, tag(" ")),
                sequence::terminated(time_of_day, tag(" ")),
                numeric_zone,
            )),
            tag("\""),
        ),
        |(date, (h, m, s), zone)| {
            FixedOffset::east_opt(zone * 60).and_then(|offset| {
                date.and_hms_opt(h, m, s).and_then(|datetime| {
                    offset.from_local_datetime(&datetime).latest()
                })
            })
        },
    )(i)
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! assert_reversible {
        ($ty:ty, $expected_text:expr, $value:expr) => {{
            let value = &mut $value;
            let mut lex = LexWriter::new(Vec::<u8>::new());
            value.write_to(&mut lex).unwrap();
            let text = lex.into_inner();
            let text = str::from_utf8(&text).unwrap();
            assert_eq!($expected_text, text, "serialisation mismatch");

            let (trailing, read) = match <$ty>::parse(text.as_bytes()) {
                Ok(read) => read,
                Err(e) => panic!("Failed to parse `{}`: {}", text, e),
            };

            assert!(
                trailing.is_empty(),
                "didn't parse all of `{}`, `{}` remained",
                text,
                String::from_utf8_lossy(trailing)
            );
            assert_eq!(value, &read);
        }};
    }

    fn s(s: &str) -> Cow<'static, str> {
        Cow::Owned(s.to_owned())
    }

    fn ns(ns: &str) -> Option<Cow<'static, str>> {
        Some(s(ns))
    }

    #[test]
    fn envelope_syntax() {
        // RFC 3501 section 8 example
        assert_reversible!(
            Envelope,
            "(\"Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\" \
             \"IMAP4rev1 WG mtg summary and minutes\" \
             ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
             ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
             ((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
             ((NIL NIL \"imap\" \"cac.washington.edu\")) \
             ((NIL NIL \"minutes\" \"CNRI.Reston.VA.US\")\
             (\"John Klensin\" NIL \"KLENSIN\" \"MIT.EDU\")) NIL NIL \
             \"<B27397-0100000@cac.washington.edu>\")",
            Envelope {
                date: ns("Wed, 17 Jul 1996 02:23:25 -0700 (PDT)"),
                subject: ns("IMAP4rev1 WG mtg summary and minutes"),
                from: vec![Address::Real(RealAddress {
                    display_name: ns("Terry Gray"),
                    routing: None,
                    local_part: s("gray"),
                    domain: s("cac.washington.edu"),
                })],
                sender: vec![Address::Real(RealAddress {
                    display_name: ns("Terry Gray"),
                    routing: None,
                    local_part: s("gray"),
                    domain: s("cac.washington.edu"),
                })],
                reply_to: vec![Address::Real(RealAddress {
                    display_name: ns("Terry Gray"),
                    routing: None,
                    local_part: s("gray"),
                    domain: s("cac.washington.edu"),
                })],
                to: vec![Address::Real(RealAddress {
                    display_name: None,
                    routing: None,
                    local_part: s("imap"),
                    domain: s("cac.washington.edu"),
                })],
                cc: vec![
                    Address::Real(RealAddress {
                        display_name: None,
                        routing: None,
                        local_part: s("minutes"),
                        domain: s("CNRI.Reston.VA.US"),
                    }),
                    Address::Real(RealAddress {
                        display_name: ns("John Klensin"),
                        routing: None,
                        local_part: s("KLENSIN"),
                        domain: s("MIT.EDU"),
                    })
                ],
                bcc: vec![],
                in_reply_to: None,
                message_id: ns("<B27397-0100000@cac.washington.edu>"),
            }
        );
    }

    #[test]
    fn body_structure_syntax() {
        // RFC 3501 section 8 example
        assert_reversible!(
            Body,
            r#"("TEXT" "PLAIN" ("CHARSET" "US-ASCII") NIL NIL "7BIT" 3028 92)"#,
            Body::SinglePart(BodyType1Part {
                core: ClassifiedBodyType1Part::Text(BodyTypeText {
                    media_subtype: s("PLAIN"),
                    body_fields: BodyFields {
                        content_type_parms: vec![s("CHARSET"), s("US-ASCII")],
                        content_id: None,
                        content_description: None,
                        content_transfer_encoding: s("7BIT"),
                        size_octets: 3028,
                    },
                    size_lines: 92,
                }),
                ext: None,
            })
        );
    }

    #[test]
    fn command_syntax() {
        assert_reversible!(
            CommandLine,
            "a NOOP",
            CommandLine {
                tag: s("a"),
                cmd: Command::Simple(SimpleCommand::Noop),
            }
        );
        assert_reversible!(
            CommandLine,
            "b SELECT INBOX",
            CommandLine {
                tag: s("b"),
                cmd: Command::Select(SelectCommand {
                    mailbox: s("INBOX"),
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "3 RENAME old new",
            CommandLine {
                tag: s("3"),
                cmd: Command::Rename(RenameCommand {
                    src: s("old"),
                    dst: s("new"),
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "c STATUS work (MESSAGES UIDNEXT)",
            CommandLine {
                tag: s("c"),
                cmd: Command::Status(StatusCommand {
                    mailbox: s("work"),
                    atts: vec![StatusAtt::Messages, StatusAtt::UidNext],
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "d STORE 1:3,5 +FLAGS.SILENT (\\Seen)",
            CommandLine {
                tag: s("d"),
                cmd: Command::Store(StoreCommand {
                    sequence_set: s("1:3,5"),
                    add: true,
                    remove: false,
                    _flags: (),
                    silent: true,
                    flags: vec![Flag::Seen],
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "e UID EXPUNGE 6:8",
            CommandLine {
                tag: s("e"),
                cmd: Command::Uid(UidCommand::Expunge(s("6:8"))),
            }
        );
        assert_reversible!(
            CommandLine,
            "f CANCELUPDATE \"g\"",
            CommandLine {
                tag: s("f"),
                cmd: Command::CancelUpdate(CancelUpdateCommand {
                    tags: vec![s("g")],
                }),
            }
        );
    }

    #[test]
    fn fetch_syntax() {
        assert_reversible!(
            CommandLine,
            "g FETCH 1:* (FLAGS UID BODY.PEEK[HEADER.FIELDS (DATE \
             FROM)]<0.100>)",
            CommandLine {
                tag: s("g"),
                cmd: Command::Fetch(FetchCommand {
                    sequence_set: s("1:*"),
                    target: FetchCommandTarget::Multi(vec![
                        FetchAtt::Flags(()),
                        FetchAtt::Uid(()),
                        FetchAtt::Body(FetchAttBody {
                            peek: true,
                            section: Some(SectionSpec::TopLevel(
                                SectionText::HeaderFields(
                                    SectionTextHeaderField {
                                        negative: false,
                                        headers: vec![s("DATE"), s("FROM")],
                                    }
                                )
                            )),
                            slice: Some(FetchAttBodySlice {
                                start: 0,
                                length: 100,
                                _marker: PhantomData,
                            }),
                        }),
                    ]),
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "h FETCH 7 BODYSTRUCTURE",
            CommandLine {
                tag: s("h"),
                cmd: Command::Fetch(FetchCommand {
                    sequence_set: s("7"),
                    target: FetchCommandTarget::Single(
                        FetchAtt::ExtendedBodyStructure(())
                    ),
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "i FETCH 7 BODY[1.2.MIME]",
            CommandLine {
                tag: s("i"),
                cmd: Command::Fetch(FetchCommand {
                    sequence_set: s("7"),
                    target: FetchCommandTarget::Single(FetchAtt::Body(
                        FetchAttBody {
                            peek: false,
                            section: Some(SectionSpec::Sub(SubSectionSpec {
                                subscripts: vec![1, 2],
                                text: Some(SectionText::Mime(())),
                            })),
                            slice: None,
                        }
                    )),
                }),
            }
        );
    }

    #[test]
    fn search_syntax() {
        assert_reversible!(
            CommandLine,
            "j SEARCH UNSEEN LARGER 1024",
            CommandLine {
                tag: s("j"),
                cmd: Command::Search(SearchCommand {
                    return_opts: None,
                    charset: None,
                    keys: vec![
                        SearchKey::Simple(SimpleSearchKey::Unseen),
                        SearchKey::Larger(1024),
                    ],
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "k SEARCH RETURN (UPDATE COUNT) CHARSET UTF-8 OR FROM fred \
             NOT SUBJECT plugh",
            CommandLine {
                tag: s("k"),
                cmd: Command::Search(SearchCommand {
                    return_opts: Some(vec![
                        SearchReturnOpt::Update(()),
                        SearchReturnOpt::Count(()),
                    ]),
                    charset: ns("UTF-8"),
                    keys: vec![
                        SearchKey::Or(SearchKeyOr {
                            a: Box::new(SearchKey::Text(TextSearchKey {
                                typ: TextSearchKeyType::From,
                                value: s("fred"),
                            })),
                            b: Box::new(SearchKey::Not(Box::new(
                                SearchKey::Text(TextSearchKey {
                                    typ: TextSearchKeyType::Subject,
                                    value: s("plugh"),
                                })
                            ))),
                        }),
                    ],
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "l UID SORT RETURN (PARTIAL (1:10)) (REVERSE DATE SUBJECT) \
             UTF-8 SINCE \"1-Feb-1994\"",
            CommandLine {
                tag: s("l"),
                cmd: Command::Uid(UidCommand::Sort(SortCommand {
                    return_opts: Some(vec![SearchReturnOpt::Partial(
                        PartialRange {
                            start: 1,
                            end: 10,
                            _marker: PhantomData,
                        }
                    )]),
                    keys: vec![
                        SortKey::Reverse,
                        SortKey::Date,
                        SortKey::Subject,
                    ],
                    charset: s("UTF-8"),
                    criteria: vec![SearchKey::Date(DateSearchKey {
                        typ: DateSearchKeyType::Since,
                        date: NaiveDate::from_ymd_opt(1994, 2, 1).unwrap(),
                        _marker: PhantomData,
                    })],
                })),
            }
        );
    }

    #[test]
    fn list_syntax() {
        assert_reversible!(
            CommandLine,
            "m LIST \"\" \"*\"",
            CommandLine {
                tag: s("m"),
                cmd: Command::List(ListCommand {
                    select_opts: None,
                    reference: s(""),
                    pattern: ListPattern::Single(s("*")),
                    return_opts: None,
                }),
            }
        );
        assert_reversible!(
            CommandLine,
            "n LIST (SUBSCRIBED RECURSIVEMATCH) \"\" (INBOX \"work/%\") \
             RETURN (CHILDREN STATUS (MESSAGES UNSEEN))",
            CommandLine {
                tag: s("n"),
                cmd: Command::List(ListCommand {
                    select_opts: Some(vec![
                        ListSelectOpt::Subscribed,
                        ListSelectOpt::RecursiveMatch,
                    ]),
                    reference: s(""),
                    pattern: ListPattern::Multi(vec![
                        s("INBOX"),
                        s("work/%"),
                    ]),
                    return_opts: Some(vec![
                        ListReturnOpt::Children(()),
                        ListReturnOpt::Status(vec![
                            StatusAtt::Messages,
                            StatusAtt::Unseen,
                        ]),
                    ]),
                }),
            }
        );
    }

    #[test]
    fn append_start_syntax() {
        let (remaining, append) = AppendCommandStart::parse(
            b"A APPEND INBOX (\\Seen Flag) \" 4-Jul-2020 16:31:00 +0100\" ",
        )
        .unwrap();
        assert!(remaining.is_empty());
        assert_eq!("A", append.tag);
        assert_eq!("INBOX", append.mailbox);
        assert_eq!(
            Some(vec![Flag::Seen, Flag::Keyword("Flag".to_owned())]),
            append.first_fragment.flags
        );
        assert!(append.first_fragment.internal_date.is_some());

        let (remaining, append) =
            AppendCommandStart::parse(b"2 APPEND work/2023 ").unwrap();
        assert!(remaining.is_empty());
        assert_eq!("work/2023", append.mailbox);
        assert_eq!(None, append.first_fragment.flags);
        assert_eq!(None, append.first_fragment.internal_date);
    }

    #[test]
    fn response_syntax() {
        assert_reversible!(
            ResponseLine,
            "* 0 EXISTS",
            ResponseLine {
                tag: None,
                response: Response::Exists(0),
            }
        );
        assert_reversible!(
            ResponseLine,
            "* OK [UIDVALIDITY 1700000000]",
            ResponseLine {
                tag: None,
                response: Response::Cond(CondResponse {
                    cond: RespCondType::Ok,
                    code: Some(RespTextCode::UidValidity(1_700_000_000)),
                    quip: None,
                }),
            }
        );
        assert_reversible!(
            ResponseLine,
            "b OK [READ-WRITE] SELECT completed",
            ResponseLine {
                tag: ns("b"),
                response: Response::Cond(CondResponse {
                    cond: RespCondType::Ok,
                    code: Some(RespTextCode::ReadWrite(())),
                    quip: ns("SELECT completed"),
                }),
            }
        );
        assert_reversible!(
            ResponseLine,
            "a OK [APPENDUID 1700000000 1:2] APPEND completed",
            ResponseLine {
                tag: ns("a"),
                response: Response::Cond(CondResponse {
                    cond: RespCondType::Ok,
                    code: Some(RespTextCode::AppendUid(AppendUidData {
                        uid_validity: 1_700_000_000,
                        uids: s("1:2"),
                    })),
                    quip: ns("APPEND completed"),
                }),
            }
        );
        assert_reversible!(
            ResponseLine,
            "* LIST (\\HasNoChildren) \"/\" INBOX",
            ResponseLine {
                tag: None,
                response: Response::List(MailboxList {
                    flags: vec![s("\\HasNoChildren")],
                    name: s("INBOX"),
                    child_info: None,
                }),
            }
        );
        assert_reversible!(
            ResponseLine,
            "* ESEARCH (TAG \"a\") UID COUNT 17 ALL 4:10,12 \
             ADDTO (0 42)",
            ResponseLine {
                tag: None,
                response: Response::Esearch(EsearchResponse {
                    tag: s("a"),
                    uid: true,
                    min: None,
                    max: None,
                    count: Some(17),
                    all: Some(s("4:10,12")),
                    addto: Some(vec![ContextUpdateItem {
                        position: 0,
                        ids: s("42"),
                    }]),
                    removefrom: None,
                    partial: None,
                }),
            }
        );
        assert_reversible!(
            ResponseLine,
            "* 3 FETCH (UID 7 FLAGS (\\Recent \\Seen))",
            ResponseLine {
                tag: None,
                response: Response::Fetch(FetchResponse {
                    seqnum: 3,
                    atts: MsgAtts {
                        atts: vec![
                            MsgAtt::Uid(7),
                            MsgAtt::Flags(FlagsFetch::Recent(vec![
                                Flag::Seen
                            ])),
                        ],
                    },
                }),
            }
        );
    }
}
