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

//! The `FETCH` command and the conversions from parsed message data into
//! the response AST.

use std::borrow::Cow;

use super::defs::*;
use crate::account::mailbox::MessageData;
use crate::account::model::*;
use crate::mime::bodystructure::BodyStructure;
use crate::mime::envelope::{Envelope, EnvelopeAddress};
use crate::mime::section::{SectionSpec, SectionText};
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) async fn cmd_fetch(
        &mut self,
        cmd: &s::FetchCommand<'_>,
        uid_command: bool,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let uids = match self.resolve_set(&cmd.sequence_set, uid_command) {
            Ok(uids) => uids,
            Err(resp) => return Ok(resp),
        };

        let atts = expand_target(&cmd.target);

        for (n, &uid) in uids.iter().enumerate() {
            if n > 0 && 0 == n % SEARCH_YIELD_INTERVAL {
                tokio::task::yield_now().await;
            }

            match self.fetch_one(uid, &atts, uid_command) {
                Ok(Some(response)) => {
                    out.untagged(s::Response::Fetch(response))
                },
                // A message expunged by another session an instant ago
                // simply goes unreported; the expunge itself is announced
                // at the next permissible boundary.
                Ok(None) | Err(Error::ExpungedMessage) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(ok(None, "FETCH completed"))
    }

    fn fetch_one(
        &mut self,
        uid: Uid,
        atts: &[s::FetchAtt<'static>],
        uid_command: bool,
    ) -> Result<Option<s::FetchResponse<'static>>, Error> {
        // Decide whether this fetch implies setting \Seen before building
        // any response parts.
        let touches_body = atts.iter().any(|att| match *att {
            s::FetchAtt::Body(ref body) => !body.peek,
            s::FetchAtt::Rfc822(ref sub) => {
                !matches!(sub, Some(s::FetchAttRfc822::Size))
            },
            _ => false,
        });

        let state = self
            .selected
            .as_mut()
            .expect("fetch_one without selection");

        let Some(seqnum) = state.sel.seqnum_of(uid) else {
            return Ok(None);
        };

        let mut set_seen = false;
        if touches_body
            && !state.sel.read_only()
            && !state.mailbox.borrow().test_flag(&Flag::Seen, uid)
        {
            let store = self.server.borrow().store();
            let ids = SeqRange::just(uid);
            state.mailbox.borrow_mut().store_flags(
                &mut store.borrow_mut(),
                &state.sel,
                &[uid],
                &StoreRequest {
                    ids: &ids,
                    flags: &[Flag::Seen],
                    remove_listed: false,
                    remove_unlisted: false,
                    loud: false,
                },
            )?;
            // The flag change is reported in this very response.
            state
                .mailbox
                .borrow()
                .acknowledge_changes(&mut state.sel);
            set_seen = true;
        }

        let mailbox = state.mailbox.borrow();
        let Some(entry) = mailbox.entry(uid).cloned() else {
            return Ok(None);
        };

        // The message file is loaded at most once per message, and only
        // if some attribute actually needs it.
        let mut data: Option<MessageData> = None;
        let mut load =
            |mailbox: &crate::account::mailbox::Mailbox,
             data: &mut Option<MessageData>|
             -> Result<(), Error> {
                if data.is_none() {
                    *data = Some(mailbox.message_data(uid)?);
                }
                Ok(())
            };

        let mut out_atts: Vec<s::MsgAtt<'static>> = Vec::new();
        if uid_command {
            out_atts.push(s::MsgAtt::Uid(uid.into()));
        }

        let mut flags_requested = false;
        for att in atts {
            match *att {
                s::FetchAtt::Uid(()) => {
                    if !uid_command {
                        out_atts.push(s::MsgAtt::Uid(uid.into()));
                    }
                },
                s::FetchAtt::Flags(()) => {
                    flags_requested = true;
                    out_atts.push(flags_att(
                        &mailbox,
                        &state.sel,
                        uid,
                    ));
                },
                s::FetchAtt::InternalDate(()) => {
                    out_atts.push(s::MsgAtt::InternalDate(
                        entry.metadata.internal_date,
                    ));
                },
                s::FetchAtt::Envelope(()) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::Envelope(envelope_to_syntax(
                        data.as_ref().unwrap().envelope(),
                    )));
                },
                s::FetchAtt::ShortBodyStructure(()) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::ShortBodyStructure(
                        body_to_syntax(
                            data.as_ref().unwrap().body_structure(),
                            false,
                        ),
                    ));
                },
                s::FetchAtt::ExtendedBodyStructure(()) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::ExtendedBodyStructure(
                        body_to_syntax(
                            data.as_ref().unwrap().body_structure(),
                            true,
                        ),
                    ));
                },
                s::FetchAtt::Rfc822(None) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::Rfc822Full(
                        data.as_ref().unwrap().raw().to_vec(),
                    ));
                },
                s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Size)) => {
                    out_atts
                        .push(s::MsgAtt::Rfc822Size(entry.metadata.size));
                },
                s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Header)) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::Rfc822Header(
                        data.as_ref().unwrap().header_block().to_vec(),
                    ));
                },
                s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Text)) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(s::MsgAtt::Rfc822Text(
                        data.as_ref().unwrap().text_block().to_vec(),
                    ));
                },
                s::FetchAtt::Body(ref body) => {
                    load(&mailbox, &mut data)?;
                    out_atts.push(body_section_att(
                        data.as_ref().unwrap(),
                        body,
                    ));
                },
            }
        }

        if set_seen && !flags_requested {
            out_atts.push(flags_att(&mailbox, &state.sel, uid));
        }

        Ok(Some(s::FetchResponse {
            seqnum: seqnum.into(),
            atts: s::MsgAtts { atts: out_atts },
        }))
    }
}

fn flags_att(
    mailbox: &crate::account::mailbox::Mailbox,
    sel: &crate::account::mailbox::Selected,
    uid: Uid,
) -> s::MsgAtt<'static> {
    let flags = mailbox.message_flags(uid);
    s::MsgAtt::Flags(if sel.is_recent(uid) {
        s::FlagsFetch::Recent(flags)
    } else {
        s::FlagsFetch::NotRecent(flags)
    })
}

/// Expand the FETCH target into a concrete attribute list, resolving the
/// ALL/FULL/FAST macros.
fn expand_target(
    target: &s::FetchCommandTarget<'_>,
) -> Vec<s::FetchAtt<'static>> {
    match *target {
        s::FetchCommandTarget::All(()) => vec![
            s::FetchAtt::Flags(()),
            s::FetchAtt::InternalDate(()),
            s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Size)),
            s::FetchAtt::Envelope(()),
        ],
        s::FetchCommandTarget::Fast(()) => vec![
            s::FetchAtt::Flags(()),
            s::FetchAtt::InternalDate(()),
            s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Size)),
        ],
        s::FetchCommandTarget::Full(()) => vec![
            s::FetchAtt::Flags(()),
            s::FetchAtt::InternalDate(()),
            s::FetchAtt::Rfc822(Some(s::FetchAttRfc822::Size)),
            s::FetchAtt::Envelope(()),
            s::FetchAtt::ShortBodyStructure(()),
        ],
        s::FetchCommandTarget::Single(ref att) => vec![own_att(att)],
        s::FetchCommandTarget::Multi(ref atts) => {
            atts.iter().map(own_att).collect()
        },
    }
}

fn own_att(att: &s::FetchAtt<'_>) -> s::FetchAtt<'static> {
    match *att {
        s::FetchAtt::Envelope(()) => s::FetchAtt::Envelope(()),
        s::FetchAtt::Flags(()) => s::FetchAtt::Flags(()),
        s::FetchAtt::InternalDate(()) => s::FetchAtt::InternalDate(()),
        s::FetchAtt::Uid(()) => s::FetchAtt::Uid(()),
        s::FetchAtt::Rfc822(sub) => s::FetchAtt::Rfc822(sub),
        s::FetchAtt::ExtendedBodyStructure(()) => {
            s::FetchAtt::ExtendedBodyStructure(())
        },
        s::FetchAtt::ShortBodyStructure(()) => {
            s::FetchAtt::ShortBodyStructure(())
        },
        s::FetchAtt::Body(ref body) => s::FetchAtt::Body(own_body(body)),
    }
}

fn own_body(body: &s::FetchAttBody<'_>) -> s::FetchAttBody<'static> {
    s::FetchAttBody {
        peek: body.peek,
        section: body.section.as_ref().map(own_section),
        slice: body.slice.as_ref().map(|slice| s::FetchAttBodySlice {
            start: slice.start,
            length: slice.length,
            _marker: std::marker::PhantomData,
        }),
    }
}

fn own_section(section: &s::SectionSpec<'_>) -> s::SectionSpec<'static> {
    match *section {
        s::SectionSpec::TopLevel(ref text) => {
            s::SectionSpec::TopLevel(own_section_text(text))
        },
        s::SectionSpec::Sub(ref sub) => {
            s::SectionSpec::Sub(s::SubSectionSpec {
                subscripts: sub.subscripts.clone(),
                text: sub.text.as_ref().map(own_section_text),
            })
        },
    }
}

fn own_section_text(text: &s::SectionText<'_>) -> s::SectionText<'static> {
    match *text {
        s::SectionText::Header(()) => s::SectionText::Header(()),
        s::SectionText::Text(()) => s::SectionText::Text(()),
        s::SectionText::Mime(()) => s::SectionText::Mime(()),
        s::SectionText::HeaderFields(ref hf) => {
            s::SectionText::HeaderFields(s::SectionTextHeaderField {
                negative: hf.negative,
                headers: hf
                    .headers
                    .iter()
                    .map(|h| Cow::Owned(h.clone().into_owned()))
                    .collect(),
            })
        },
    }
}

/// Evaluate a BODY[section]<slice> item against a message.
fn body_section_att(
    data: &MessageData,
    body: &s::FetchAttBody<'static>,
) -> s::MsgAtt<'static> {
    let spec = body
        .section
        .as_ref()
        .map(section_to_spec)
        .unwrap_or_default();

    let content = data.section(&spec);

    let (content, slice_origin) = match body.slice {
        None => (content.into_owned(), None),
        Some(ref slice) => {
            let start = (slice.start as usize).min(content.len());
            let end =
                (start + slice.length as usize).min(content.len());
            (content[start..end].to_vec(), Some(slice.start))
        },
    };

    s::MsgAtt::Body(s::MsgAttBody {
        section: body.section.clone(),
        slice_origin,
        data: content,
    })
}

/// Translate the wire section AST into the evaluator's spec type.
fn section_to_spec(section: &s::SectionSpec<'_>) -> SectionSpec {
    let (subscripts, text) = match *section {
        s::SectionSpec::TopLevel(ref text) => (vec![], Some(text)),
        s::SectionSpec::Sub(ref sub) => {
            (sub.subscripts.clone(), sub.text.as_ref())
        },
    };

    SectionSpec {
        subscripts,
        text: text.map(|text| match *text {
            s::SectionText::Header(()) => SectionText::Header,
            s::SectionText::Text(()) => SectionText::Text,
            s::SectionText::Mime(()) => SectionText::Mime,
            s::SectionText::HeaderFields(ref hf) => {
                SectionText::HeaderFields {
                    negative: hf.negative,
                    headers: hf
                        .headers
                        .iter()
                        .map(|h| h.clone().into_owned())
                        .collect(),
                }
            },
        }),
    }
}

pub(super) fn envelope_to_syntax(env: Envelope) -> s::Envelope<'static> {
    fn addresses(
        list: Vec<EnvelopeAddress>,
    ) -> Vec<s::Address<'static>> {
        list.into_iter()
            .map(|addr| match (addr.local, addr.domain) {
                (Some(local), Some(domain)) => {
                    s::Address::Real(s::RealAddress {
                        display_name: addr.name.map(Cow::Owned),
                        routing: None,
                        local_part: Cow::Owned(local),
                        domain: Cow::Owned(domain),
                    })
                },
                (local, None) => {
                    s::Address::GroupDelim(local.map(Cow::Owned))
                },
                (None, Some(_)) => s::Address::GroupDelim(None),
            })
            .collect()
    }

    s::Envelope {
        date: env.date.map(Cow::Owned),
        subject: env.subject.map(Cow::Owned),
        from: addresses(env.from),
        sender: addresses(env.sender),
        reply_to: addresses(env.reply_to),
        to: addresses(env.to),
        cc: addresses(env.cc),
        bcc: addresses(env.bcc),
        in_reply_to: env.in_reply_to.map(Cow::Owned),
        message_id: env.message_id.map(Cow::Owned),
    }
}

pub(super) fn body_to_syntax(
    bs: BodyStructure,
    extended: bool,
) -> s::Body<'static> {
    if bs.is_multipart() {
        let ext = extended.then(|| s::BodyExtMPart {
            content_type_parms: flatten_parms(&bs.content_type_parms),
            content_disposition: disposition_to_syntax(&bs),
            content_language: bs.content_language.clone().map(Cow::Owned),
            content_location: bs.content_location.clone().map(Cow::Owned),
        });
        let media_subtype = bs.content_type.1.clone();

        return s::Body::Multipart(s::BodyTypeMPart {
            bodies: bs
                .children
                .into_iter()
                .map(|child| body_to_syntax(child, extended))
                .collect(),
            media_subtype: Cow::Owned(media_subtype),
            ext,
        });
    }

    let body_fields = s::BodyFields {
        content_type_parms: flatten_parms(&bs.content_type_parms),
        content_id: bs.content_id.clone().map(Cow::Owned),
        content_description: bs.content_description.clone().map(Cow::Owned),
        content_transfer_encoding: Cow::Owned(
            bs.content_transfer_encoding.clone(),
        ),
        size_octets: bs.size_octets,
    };

    let ext = extended.then(|| s::BodyExt1Part {
        md5: None,
        content_disposition: disposition_to_syntax(&bs),
        content_language: bs.content_language.clone().map(Cow::Owned),
        content_location: bs.content_location.clone().map(Cow::Owned),
    });

    let core = if bs.is_message_rfc822() && 1 == bs.children.len() {
        let mut bs = bs;
        let embedded = bs.children.pop().unwrap();
        s::ClassifiedBodyType1Part::Message(s::BodyTypeMsg {
            body_fields,
            envelope: envelope_to_syntax(embedded.envelope.clone()),
            body: Box::new(body_to_syntax(embedded, extended)),
            size_lines: bs.size_lines,
        })
    } else if bs.is_text() {
        s::ClassifiedBodyType1Part::Text(s::BodyTypeText {
            media_subtype: Cow::Owned(bs.content_type.1.clone()),
            body_fields,
            size_lines: bs.size_lines,
        })
    } else {
        s::ClassifiedBodyType1Part::Basic(s::BodyTypeBasic {
            media_type: Cow::Owned(bs.content_type.0.clone()),
            media_subtype: Cow::Owned(bs.content_type.1.clone()),
            body_fields,
        })
    };

    s::Body::SinglePart(s::BodyType1Part { core, ext })
}

fn disposition_to_syntax(
    bs: &BodyStructure,
) -> Option<s::ContentDisposition<'static>> {
    bs.content_disposition
        .as_ref()
        .map(|disposition| s::ContentDisposition {
            disposition: Cow::Owned(disposition.clone()),
            parms: flatten_parms(&bs.content_disposition_parms),
        })
}

fn flatten_parms(
    parms: &[(String, String)],
) -> Vec<Cow<'static, str>> {
    let mut out = Vec::with_capacity(parms.len() * 2);
    for (name, value) in parms {
        out.push(Cow::Owned(name.clone()));
        out.push(Cow::Owned(value.clone()));
    }
    out
}
