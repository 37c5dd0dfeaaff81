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

use std::borrow::Cow;

use log::{error, info};

use super::defs::*;
use crate::account::model::PollResponse;
use crate::support::error::{Error, Inconsistency};

impl CommandProcessor {
    /// Handle one regular command, writing untagged responses into `out`
    /// and returning the final tagged response. If the response condition
    /// is `BYE`, the connection is closed after sending it.
    pub async fn handle_command<'a>(
        &mut self,
        command_line: s::CommandLine<'a>,
        out: &mut ResponseBuffer,
    ) -> s::ResponseLine<'a> {
        let s::CommandLine { tag, cmd } = command_line;

        // A tag referenced by a live update context may not be reused
        // until CANCELUPDATE releases it.
        if self.contexts.contains_key(tag.as_ref()) {
            return s::ResponseLine {
                tag: Some(tag),
                response: bad(None, "Tag reuse"),
            };
        }

        // FETCH, STORE, SEARCH, and SORT (the non-UID versions) are the
        // cursed commands during which EXPUNGE responses must be withheld.
        let allow_full_poll = !matches!(
            cmd,
            s::Command::Fetch(..)
                | s::Command::Store(..)
                | s::Command::Search(..)
                | s::Command::Sort(..)
        );
        let uid_command = matches!(cmd, s::Command::Uid(..));

        // Implicit resync before the command touches the mailbox.
        if let Err(resp) = self.resync_selected() {
            return finalize(tag, resp);
        }

        let mut res = Err(Error::Inconsistency(Inconsistency::TryAgain));
        for attempt in 0..3 {
            if attempt > 0 {
                out.take();
                if self.force_resync().is_err() {
                    break;
                }
            }

            res = self.dispatch(&cmd, tag.as_ref(), out).await;
            match res {
                Err(Error::Inconsistency(Inconsistency::TryAgain))
                    if attempt < 2 => {},
                _ => break,
            }
        }

        let res = match res {
            Ok(res) => res,
            Err(e) => {
                if e.is_fatal() {
                    // Disk full or store corruption: answer this command
                    // NO, say goodbye, and let the worker die so the
                    // dispatcher applies its respawn backoff.
                    error!(
                        "{} Fatal store error: {}",
                        self.log_prefix, e
                    );
                    out.untagged(bye("Server error"));
                    self.logged_out = true;
                    self.fatal = true;
                }
                map_error(&self.log_prefix, e)
            },
        };

        if matches!(
            res,
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Ok,
                ..
            })
        ) {
            self.command_boundary(allow_full_poll, uid_command, out);
        } else if self
            .selected
            .as_ref()
            .is_some_and(|s| !s.mailbox.borrow().folder_exists())
        {
            // The selected mailbox was deleted underneath this session;
            // per RFC 2180 the client is disconnected rather than left to
            // flail.
            return s::ResponseLine {
                tag: None,
                response: bye("Mailbox deleted"),
            };
        }

        finalize(tag, res)
    }

    async fn dispatch(
        &mut self,
        cmd: &s::Command<'_>,
        tag: &str,
        out: &mut ResponseBuffer,
    ) -> Result<s::Response<'static>, Error> {
        match *cmd {
            s::Command::Simple(s::SimpleCommand::Capability) => {
                out.untagged(s::Response::Capability(capability_data()));
                Ok(ok(None, "CAPABILITY completed"))
            },
            s::Command::Simple(s::SimpleCommand::Noop) => {
                Ok(ok(None, "NOOP completed"))
            },
            s::Command::Simple(s::SimpleCommand::Check) => {
                Ok(ok(None, "CHECK completed"))
            },
            s::Command::Simple(s::SimpleCommand::LogOut) => {
                self.close_session();
                self.logged_out = true;
                out.untagged(bye("LOGOUT received"));
                Ok(ok(None, "LOGOUT completed"))
            },
            s::Command::Simple(s::SimpleCommand::Namespace) => {
                out.untagged(s::Response::Namespace(()));
                Ok(ok(None, "NAMESPACE completed"))
            },
            s::Command::Simple(s::SimpleCommand::StartTls) => {
                Ok(bad(None, "Already using TLS"))
            },
            s::Command::Simple(s::SimpleCommand::Idle) => {
                // Dispatched by the session loop, which owns the
                // continuation/DONE protocol flow.
                unreachable!("IDLE is handled by the session loop")
            },
            s::Command::Simple(s::SimpleCommand::Close) => {
                self.cmd_close()
            },
            s::Command::Simple(s::SimpleCommand::Unselect) => {
                self.cmd_unselect()
            },
            s::Command::Simple(s::SimpleCommand::Expunge) => {
                self.cmd_expunge(None, out)
            },

            s::Command::LogIn(..) => {
                Ok(bad(None, "Already logged in"))
            },

            s::Command::Select(ref cmd) => {
                self.cmd_select(&cmd.mailbox, false, out)
            },
            s::Command::Examine(ref cmd) => {
                self.cmd_select(&cmd.mailbox, true, out)
            },
            s::Command::Create(ref cmd) => self.cmd_create(&cmd.mailbox),
            s::Command::Delete(ref cmd) => self.cmd_delete(&cmd.mailbox),
            s::Command::Rename(ref cmd) => {
                self.cmd_rename(&cmd.src, &cmd.dst)
            },
            s::Command::Subscribe(ref cmd) => {
                self.cmd_subscribe(&cmd.mailbox)
            },
            s::Command::Unsubscribe(ref cmd) => {
                self.cmd_unsubscribe(&cmd.mailbox)
            },
            s::Command::List(ref cmd) => self.cmd_list(cmd, out),
            s::Command::Lsub(ref cmd) => self.cmd_lsub(cmd, out),
            s::Command::Status(ref cmd) => self.cmd_status(cmd, out),

            s::Command::Fetch(ref cmd) => {
                self.cmd_fetch(cmd, false, out).await
            },
            s::Command::Store(ref cmd) => self.cmd_store(cmd, false, out),
            s::Command::Copy(ref cmd) => self.cmd_copy(cmd, false),
            s::Command::Move(ref cmd) => self.cmd_move(cmd, false, out),
            s::Command::Search(ref cmd) => {
                self.cmd_search(cmd, tag, false, out).await
            },
            s::Command::Sort(ref cmd) => {
                self.cmd_sort(cmd, tag, false, out).await
            },
            s::Command::CancelUpdate(ref cmd) => {
                self.cmd_cancelupdate(&cmd.tags)
            },

            s::Command::Uid(s::UidCommand::Fetch(ref cmd)) => {
                self.cmd_fetch(cmd, true, out).await
            },
            s::Command::Uid(s::UidCommand::Store(ref cmd)) => {
                self.cmd_store(cmd, true, out)
            },
            s::Command::Uid(s::UidCommand::Copy(ref cmd)) => {
                self.cmd_copy(cmd, true)
            },
            s::Command::Uid(s::UidCommand::Move(ref cmd)) => {
                self.cmd_move(cmd, true, out)
            },
            s::Command::Uid(s::UidCommand::Search(ref cmd)) => {
                self.cmd_search(cmd, tag, true, out).await
            },
            s::Command::Uid(s::UidCommand::Sort(ref cmd)) => {
                self.cmd_sort(cmd, tag, true, out).await
            },
            s::Command::Uid(s::UidCommand::Expunge(ref uids)) => {
                let range = self.parse_uid_range(uids);
                match range {
                    Ok(range) => self.cmd_expunge(Some(range), out),
                    Err(resp) => Ok(resp),
                }
            },
        }
    }

    /// Implicit pre-command resync of the selected mailbox.
    fn resync_selected(&mut self) -> Result<(), s::Response<'static>> {
        let Some(mailbox) = self
            .selected
            .as_ref()
            .map(|state| std::rc::Rc::clone(&state.mailbox))
        else {
            return Ok(());
        };

        if !mailbox.borrow().folder_exists() {
            self.close_session();
            return Err(bye("Mailbox deleted"));
        }

        let store = self.server.borrow().store();
        let result =
            mailbox.borrow_mut().resync(&mut store.borrow_mut(), false);
        match result {
            Ok(_) => Ok(()),
            Err(Error::Inconsistency(Inconsistency::TryAgain)) => {
                // A torn read of .mh_sequences; the next attempt at the
                // command boundary gets a consistent view.
                Ok(())
            },
            Err(Error::NxMailbox) => {
                self.close_session();
                Err(bye("Mailbox deleted"))
            },
            Err(e) => {
                error!("{} Resync failed: {}", self.log_prefix, e);
                Err(map_error(&self.log_prefix, e))
            },
        }
    }

    fn force_resync(&mut self) -> Result<(), Error> {
        let Some(ref state) = self.selected else {
            return Ok(());
        };
        let store = self.server.borrow().store();
        let result = state
            .mailbox
            .borrow_mut()
            .resync(&mut store.borrow_mut(), true)
            .map(|_| ());
        result
    }

    /// Emit the untagged responses due at a command boundary: expunges
    /// (descending), EXISTS/RECENT, FETCH flag updates, and context
    /// updates.
    pub(super) fn command_boundary(
        &mut self,
        allow_full_poll: bool,
        uid_command: bool,
        out: &mut ResponseBuffer,
    ) {
        let Some(ref mut state) = self.selected else {
            return;
        };

        let poll = if allow_full_poll {
            state.mailbox.borrow_mut().poll(&mut state.sel)
        } else {
            PollResponse {
                fetch: state
                    .mailbox
                    .borrow_mut()
                    .mini_poll(&mut state.sel),
                ..PollResponse::default()
            }
        };

        for &(seqnum, _) in poll.expunge.iter().rev() {
            out.untagged(s::Response::Expunge(seqnum.into()));
        }
        if let Some(exists) = poll.exists {
            out.untagged(s::Response::Exists(exists as u32));
        }
        if let Some(recent) = poll.recent {
            out.untagged(s::Response::Recent(recent as u32));
        }

        for uid in poll.fetch {
            let mailbox = state.mailbox.borrow();
            let Some(seqnum) = state.sel.seqnum_of(uid) else {
                continue;
            };

            let flags = mailbox.message_flags(uid);
            let flags_fetch = if state.sel.is_recent(uid) {
                s::FlagsFetch::Recent(flags)
            } else {
                s::FlagsFetch::NotRecent(flags)
            };

            let mut atts = vec![s::MsgAtt::Flags(flags_fetch)];
            if uid_command {
                atts.push(s::MsgAtt::Uid(uid.into()));
            }

            out.untagged(s::Response::Fetch(s::FetchResponse {
                seqnum: seqnum.into(),
                atts: s::MsgAtts { atts },
            }));
        }

        self.emit_context_updates(out);
    }

    /// Re-evaluate this session's live contexts and emit their ESEARCH
    /// update responses.
    pub(super) fn emit_context_updates(&mut self, out: &mut ResponseBuffer) {
        let Some(ref state) = self.selected else {
            return;
        };

        for context in self.contexts.values_mut() {
            let update = match context
                .update(&state.mailbox.borrow(), &state.sel)
            {
                Ok(Some(update)) => update,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        "{} Context '{}' update failed: {}",
                        self.log_prefix, context.tag, e
                    );
                    continue;
                },
            };

            if let Some(count) = update.count {
                out.untagged(s::Response::Esearch(s::EsearchResponse {
                    tag: Cow::Owned(context.tag.clone()),
                    uid: context.uid_command,
                    min: None,
                    max: None,
                    count: Some(count as u32),
                    all: None,
                    addto: None,
                    removefrom: None,
                    partial: None,
                }));
            }

            let removefrom = context_items(&update.removed);
            let addto = context_items(&update.added);
            if removefrom.is_some() || addto.is_some() {
                out.untagged(s::Response::Esearch(s::EsearchResponse {
                    tag: Cow::Owned(context.tag.clone()),
                    uid: context.uid_command,
                    min: None,
                    max: None,
                    count: None,
                    all: None,
                    addto,
                    removefrom,
                    partial: None,
                }));
            }
        }
    }

    /// One step of the IDLE loop: resync, then stream any notifications.
    pub fn idle_tick(&mut self, out: &mut ResponseBuffer) {
        if self.resync_selected().is_err() {
            out.untagged(bye("Mailbox deleted"));
            return;
        }
        self.command_boundary(true, false, out);
    }

    /// Tear down session state on disconnect or logout.
    pub fn close_session(&mut self) {
        self.contexts.clear();
        if let Some(state) = self.selected.take() {
            let store = self.server.borrow().store();
            let deselect_result = state
                .mailbox
                .borrow_mut()
                .deselect(state.sel, &mut store.borrow_mut());
            if let Err(e) = deselect_result {
                info!("{} Deselect failed: {}", self.log_prefix, e);
            }
        }
    }
}

fn context_items(
    items: &[(u32, crate::account::model::Uid)],
) -> Option<Vec<s::ContextUpdateItem<'static>>> {
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .map(|&(position, uid)| s::ContextUpdateItem {
                position,
                ids: Cow::Owned(u32::from(uid).to_string()),
            })
            .collect(),
    )
}

fn finalize<'a>(
    tag: Cow<'a, str>,
    response: s::Response<'static>,
) -> s::ResponseLine<'a> {
    if matches!(
        response,
        s::Response::Cond(s::CondResponse {
            cond: s::RespCondType::Bye,
            ..
        })
    ) {
        // BYE is never tagged.
        s::ResponseLine {
            tag: None,
            response,
        }
    } else {
        s::ResponseLine {
            tag: Some(tag),
            response,
        }
    }
}
