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

//! Mailbox-level commands: SELECT/EXAMINE, CREATE, DELETE, RENAME,
//! SUBSCRIBE, LIST/LSUB, STATUS, CLOSE, UNSELECT.

use std::borrow::Cow;
use std::collections::BTreeSet;

use super::defs::*;
use crate::account::model::*;
use crate::account::user_server::pattern_matches;
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) fn cmd_select(
        &mut self,
        mailbox: &str,
        read_only: bool,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        // Any currently selected mailbox is closed first, with UNSELECT
        // semantics: no expunge happens on a mere mailbox switch.
        self.close_session();

        let mbox = match self.server.borrow_mut().get_mailbox(mailbox) {
            Ok(mbox) => mbox,
            Err(Error::NxMailbox) | Err(Error::UnsafeName) => {
                return Ok(no(
                    Some(s::RespTextCode::Nonexistent(())),
                    "No such mailbox",
                ));
            },
            Err(e) => return Err(e),
        };

        {
            let store = self.server.borrow().store();
            mbox.borrow_mut().resync(&mut store.borrow_mut(), false)?;
        }

        let (sel, response) = mbox.borrow_mut().select(read_only);

        let bare_ok = |code| {
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                code: Some(code),
                quip: None,
            })
        };

        out.untagged(s::Response::Exists(response.exists as u32));
        out.untagged(s::Response::Recent(response.recent as u32));
        if let Some(unseen) = response.unseen {
            out.untagged(bare_ok(s::RespTextCode::Unseen(unseen.into())));
        }
        out.untagged(bare_ok(s::RespTextCode::UidValidity(
            response.uidvalidity,
        )));
        out.untagged(bare_ok(s::RespTextCode::UidNext(
            response.uidnext.into(),
        )));
        out.untagged(s::Response::Flags(response.flags.clone()));
        out.untagged(bare_ok(s::RespTextCode::PermanentFlags(
            response.flags,
        )));

        self.selected = Some(super::defs::SelectedState {
            mailbox: std::rc::Rc::clone(&mbox),
            sel,
        });

        Ok(ok(
            Some(if read_only {
                s::RespTextCode::ReadOnly(())
            } else {
                s::RespTextCode::ReadWrite(())
            }),
            if read_only {
                "EXAMINE completed"
            } else {
                "SELECT completed"
            },
        ))
    }

    pub(super) fn cmd_close(&mut self) -> Result<s::Response<'static>, Error> {
        let state = match self.selected.take() {
            Some(state) => state,
            None => return Ok(bad(None, "No mailbox selected")),
        };

        // CLOSE expunges \Deleted if the mailbox was opened read-write,
        // and never sends EXPUNGE responses to the closing session.
        if !state.sel.read_only() {
            let store = self.server.borrow().store();
            let _ = state.mailbox.borrow_mut().expunge_deleted(
                &mut store.borrow_mut(),
                &state.sel,
                None,
            );
        }

        self.contexts.clear();
        let store = self.server.borrow().store();
        state
            .mailbox
            .borrow_mut()
            .deselect(state.sel, &mut store.borrow_mut())?;
        Ok(ok(None, "CLOSE completed"))
    }

    pub(super) fn cmd_unselect(
        &mut self,
    ) -> Result<s::Response<'static>, Error> {
        if self.selected.is_none() {
            return Ok(bad(None, "No mailbox selected"));
        }

        // UNSELECT leaves \Deleted in place.
        self.close_session();
        Ok(ok(None, "UNSELECT completed"))
    }

    pub(super) fn cmd_create(
        &mut self,
        mailbox: &str,
    ) -> Result<s::Response<'static>, Error> {
        if mailbox.ends_with('/') {
            // Trailing hierarchy delimiter is explicitly ignorable per
            // RFC 3501.
            let trimmed = mailbox.trim_end_matches('/');
            self.server.borrow_mut().create_mailbox(trimmed)?;
        } else {
            self.server.borrow_mut().create_mailbox(mailbox)?;
        }
        Ok(ok(None, "CREATE completed"))
    }

    pub(super) fn cmd_delete(
        &mut self,
        mailbox: &str,
    ) -> Result<s::Response<'static>, Error> {
        self.server.borrow_mut().delete_mailbox(mailbox)?;
        Ok(ok(None, "DELETE completed"))
    }

    pub(super) fn cmd_rename(
        &mut self,
        src: &str,
        dst: &str,
    ) -> Result<s::Response<'static>, Error> {
        self.server.borrow_mut().rename_mailbox(src, dst)?;
        Ok(ok(None, "RENAME completed"))
    }

    pub(super) fn cmd_subscribe(
        &mut self,
        mailbox: &str,
    ) -> Result<s::Response<'static>, Error> {
        self.server.borrow_mut().subscribe(mailbox)?;
        Ok(ok(None, "SUBSCRIBE completed"))
    }

    pub(super) fn cmd_unsubscribe(
        &mut self,
        mailbox: &str,
    ) -> Result<s::Response<'static>, Error> {
        self.server.borrow_mut().unsubscribe(mailbox)?;
        Ok(ok(None, "UNSUBSCRIBE completed"))
    }

    pub(super) fn cmd_status(
        &mut self,
        cmd: &s::StatusCommand<'_>,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let mut request = StatusRequest {
            name: cmd.mailbox.clone().into_owned(),
            ..StatusRequest::default()
        };
        for att in &cmd.atts {
            match att {
                s::StatusAtt::Messages => request.messages = true,
                s::StatusAtt::Recent => request.recent = true,
                s::StatusAtt::UidNext => request.uidnext = true,
                s::StatusAtt::UidValidity => request.uidvalidity = true,
                s::StatusAtt::Unseen => request.unseen = true,
            }
        }

        let response = self.server.borrow_mut().status(&request)?;
        out.untagged(status_response(&response));
        Ok(ok(None, "STATUS completed"))
    }

    pub(super) fn cmd_list(
        &mut self,
        cmd: &s::ListCommand<'_>,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let mut request = ListRequest {
            reference: cmd.reference.clone().into_owned(),
            ..ListRequest::default()
        };

        match cmd.pattern {
            s::ListPattern::Single(ref p) => {
                request.patterns.push(p.clone().into_owned())
            },
            s::ListPattern::Multi(ref ps) => request
                .patterns
                .extend(ps.iter().map(|p| p.clone().into_owned())),
        }

        for opt in cmd.select_opts.iter().flatten() {
            match opt {
                s::ListSelectOpt::Subscribed => {
                    request.select_subscribed = true;
                },
                s::ListSelectOpt::RecursiveMatch => {
                    request.recursive_match = true;
                },
            }
        }

        for opt in cmd.return_opts.iter().flatten() {
            match *opt {
                s::ListReturnOpt::Subscribed(()) => {
                    request.return_subscribed = true;
                },
                s::ListReturnOpt::Children(()) => {
                    request.return_children = true;
                },
                s::ListReturnOpt::Status(ref atts) => {
                    let mut status = StatusRequest::default();
                    for att in atts {
                        match att {
                            s::StatusAtt::Messages => {
                                status.messages = true
                            },
                            s::StatusAtt::Recent => status.recent = true,
                            s::StatusAtt::UidNext => {
                                status.uidnext = true
                            },
                            s::StatusAtt::UidValidity => {
                                status.uidvalidity = true
                            },
                            s::StatusAtt::Unseen => status.unseen = true,
                        }
                    }
                    request.return_status = Some(status);
                },
                s::ListReturnOpt::_Marker(..) => (),
            }
        }

        // RECURSIVEMATCH without a selection option is a client error per
        // RFC 5258.
        if request.recursive_match && !request.select_subscribed {
            return Ok(bad(
                None,
                "RECURSIVEMATCH requires a selection option",
            ));
        }

        for response in self.list_mailboxes(&request)? {
            let status = response.status.clone();
            out.untagged(s::Response::List(list_line(&request, response)));
            if let Some(status) = status {
                out.untagged(status_response(&status));
            }
        }

        Ok(ok(None, "LIST completed"))
    }

    pub(super) fn cmd_lsub(
        &mut self,
        cmd: &s::LsubCommand<'_>,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        let request = ListRequest {
            reference: cmd.reference.clone().into_owned(),
            patterns: vec![cmd.pattern.clone().into_owned()],
            select_subscribed: true,
            lsub_style: true,
            ..ListRequest::default()
        };

        for response in self.list_mailboxes(&request)? {
            out.untagged(s::Response::Lsub(list_line(&request, response)));
        }

        Ok(ok(None, "LSUB completed"))
    }

    /// The shared LIST/LSUB implementation.
    fn list_mailboxes(
        &mut self,
        request: &ListRequest,
    ) -> Result<Vec<ListResponse>, Error> {
        let server = self.server.borrow();
        let existing = server.all_folders();
        let subscribed: BTreeSet<String> =
            server.subscriptions()?.into_iter().collect();
        drop(server);

        // Candidate namespace: existing folders, plus subscribed names
        // that no longer exist when selecting by subscription.
        let mut candidates: BTreeSet<String> =
            existing.iter().cloned().collect();
        if request.select_subscribed {
            candidates.extend(subscribed.iter().cloned());
        }

        let patterns: Vec<String> = request
            .patterns
            .iter()
            .map(|p| join_reference(&request.reference, p))
            .collect();

        let mut responses = Vec::new();
        for name in &candidates {
            let matched =
                patterns.iter().any(|p| pattern_matches(p, name));

            let is_subscribed = subscribed.contains(name);
            let exists = existing.contains(name);

            if matched && request.select_subscribed && !is_subscribed {
                // Not selected itself; might still be reported for
                // RECURSIVEMATCH below.
                if request.recursive_match {
                    let prefix = format!("{}/", name);
                    let has_subscribed_child = subscribed
                        .iter()
                        .any(|s| s.starts_with(&prefix));
                    if has_subscribed_child {
                        let mut attributes = Vec::new();
                        if !exists {
                            attributes.push(if request.lsub_style {
                                MailboxAttribute::Noselect
                            } else {
                                MailboxAttribute::NonExistent
                            });
                        }
                        responses.push(ListResponse {
                            name: name.clone(),
                            attributes,
                            child_info: vec!["SUBSCRIBED"],
                            status: None,
                        });
                    }
                }
                continue;
            }

            if !matched {
                continue;
            }

            let mut attributes = Vec::new();
            if !exists {
                attributes.push(if request.lsub_style {
                    MailboxAttribute::Noselect
                } else {
                    MailboxAttribute::NonExistent
                });
            } else {
                let server = self.server.borrow();
                if server.has_child_folders(name) {
                    attributes.push(MailboxAttribute::HasChildren);
                } else {
                    attributes.push(MailboxAttribute::HasNoChildren);
                }
                drop(server);

                match self.marked_attribute(name) {
                    Some(true) => {
                        attributes.push(MailboxAttribute::Marked)
                    },
                    Some(false) => {
                        attributes.push(MailboxAttribute::Unmarked)
                    },
                    None => (),
                }
            }
            if request.return_subscribed && is_subscribed {
                attributes.push(MailboxAttribute::Subscribed);
            }

            let status = match request.return_status {
                Some(ref status_request) if exists => {
                    let mut status_request = status_request.clone();
                    status_request.name = name.clone();
                    Some(
                        self.server
                            .borrow_mut()
                            .status(&status_request)?,
                    )
                },
                _ => None,
            };

            responses.push(ListResponse {
                name: name.clone(),
                attributes,
                child_info: vec![],
                status,
            });
        }

        responses.sort_by(|a, b| a.name.cmp(&b.name));
        responses.dedup_by(|a, b| a.name == b.name);
        Ok(responses)
    }

    /// `\Marked` if the folder has unseen or recent messages, judged from
    /// `.mh_sequences` alone so LIST does not force mailbox instantiation.
    fn marked_attribute(&self, name: &str) -> Option<bool> {
        let server = self.server.borrow();
        let folder = crate::account::mh::MhFolder::new(
            server.root().join(name),
            false,
        );
        drop(server);

        let sequences = folder.read_sequences().ok()?;
        let marked = sequences
            .get("unseen")
            .is_some_and(|s| !s.is_empty())
            || sequences.get("Recent").is_some_and(|s| !s.is_empty());
        Some(marked)
    }
}

fn join_reference(reference: &str, pattern: &str) -> String {
    if reference.is_empty() {
        return pattern.to_owned();
    }
    if reference.ends_with('/') {
        format!("{}{}", reference, pattern)
    } else {
        format!("{}/{}", reference, pattern)
    }
}

fn list_line(
    request: &ListRequest,
    response: ListResponse,
) -> s::MailboxList<'static> {
    s::MailboxList {
        flags: response
            .attributes
            .iter()
            .map(|a| Cow::Owned(a.name().to_owned()))
            .collect(),
        name: Cow::Owned(response.name),
        child_info: if response.child_info.is_empty() || request.lsub_style
        {
            None
        } else {
            Some(
                response
                    .child_info
                    .iter()
                    .map(|ci| Cow::Borrowed(*ci))
                    .collect(),
            )
        },
    }
}

fn status_response(response: &StatusResponse) -> s::Response<'static> {
    let mut atts = Vec::new();
    if let Some(messages) = response.messages {
        atts.push(s::StatusResponseAtt {
            att: s::StatusAtt::Messages,
            value: messages as u32,
            _marker: std::marker::PhantomData,
        });
    }
    if let Some(recent) = response.recent {
        atts.push(s::StatusResponseAtt {
            att: s::StatusAtt::Recent,
            value: recent as u32,
            _marker: std::marker::PhantomData,
        });
    }
    if let Some(uidnext) = response.uidnext {
        atts.push(s::StatusResponseAtt {
            att: s::StatusAtt::UidNext,
            value: uidnext.into(),
            _marker: std::marker::PhantomData,
        });
    }
    if let Some(uidvalidity) = response.uidvalidity {
        atts.push(s::StatusResponseAtt {
            att: s::StatusAtt::UidValidity,
            value: uidvalidity,
            _marker: std::marker::PhantomData,
        });
    }
    if let Some(unseen) = response.unseen {
        atts.push(s::StatusResponseAtt {
            att: s::StatusAtt::Unseen,
            value: unseen as u32,
            _marker: std::marker::PhantomData,
        });
    }

    s::Response::Status(s::StatusResponseData {
        mailbox: Cow::Owned(response.name.clone()),
        atts,
    })
}
