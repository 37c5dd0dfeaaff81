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

//! The per-connection session loop inside a worker process.
//!
//! Connections arrive here already authenticated; the dispatcher handled
//! LOGIN and TLS. This loop owns the protocol-level concerns that the
//! command processor cannot: literal continuations, the APPEND data flow,
//! IDLE, inactivity timeouts, and frame tracing.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::command_processor::{CommandProcessor, ResponseBuffer};
use super::request_reader::{check_literal, LiteralInfo, RequestReader};
use super::syntax as s;
use crate::account::model::AppendItem;
use crate::support::error::Error;
use crate::support::trace::{Direction, TraceWriter};

const MAX_CMDLINE: usize = 65536;
/// Literals above this size are refused outright.
pub const LITERAL_SIZE_LIMIT: u32 = 20 * 1024 * 1024;
/// Sessions idle longer than this are disconnected.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// IDLE is terminated server-side before the famous 30-minute NAT rule.
const MAX_IDLE: Duration = Duration::from_secs(29 * 60);
/// How often an idling session looks for new state.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Session<R, W> {
    reader: RequestReader<R>,
    write: W,
    processor: CommandProcessor,
    out: ResponseBuffer,
    trace: Option<Rc<RefCell<TraceWriter>>>,
    session_id: u64,
    sent_bye: bool,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    pub fn new(
        read: R,
        write: W,
        processor: CommandProcessor,
        trace: Option<Rc<RefCell<TraceWriter>>>,
        session_id: u64,
    ) -> Self {
        Session {
            reader: RequestReader::new(read),
            write,
            processor,
            out: ResponseBuffer::new(),
            trace,
            session_id,
            sent_bye: false,
        }
    }

    /// Run the session until logout, disconnection, or error.
    pub async fn run(&mut self) -> Result<(), Error> {
        let mut cmdline = Vec::<u8>::new();

        while !self.sent_bye && !self.processor.logged_out() {
            cmdline.clear();
            let nread = match tokio::time::timeout(
                INACTIVITY_TIMEOUT,
                self.reader.read_line(&mut cmdline, MAX_CMDLINE),
            )
            .await
            {
                Err(_elapsed) => {
                    info!(
                        "{} Autologout after inactivity",
                        self.processor.log_prefix()
                    );
                    self.send_untagged_bye("Autologout; idle too long")
                        .await?;
                    break;
                },
                Ok(Err(e))
                    if std::io::ErrorKind::UnexpectedEof == e.kind() =>
                {
                    // Client went away without LOGOUT.
                    break;
                },
                Ok(result) => match result? {
                    Some(nread) => nread,
                    None => {
                        self.command_line_too_long(&mut cmdline).await?;
                        continue;
                    },
                },
            };

            self.trace_client(&cmdline);
            self.handle_line(&mut cmdline, nread).await?;
        }

        self.processor.close_session();
        Ok(())
    }

    /// Whether the processor hit an unrecoverable store error; the
    /// worker entry point terminates the process on this.
    pub fn fatal(&self) -> bool {
        self.processor.fatal()
    }

    /// Process one freshly-read line, which may be only the start of a
    /// command if it declares literals.
    async fn handle_line(
        &mut self,
        cmdline: &mut Vec<u8>,
        mut nread: usize,
    ) -> Result<(), Error> {
        // Accumulate literals until the command line is complete.
        while let Some((before_literal, lit)) =
            check_literal(cmdline, nread)
        {
            // APPEND gets special treatment since its literals can dwarf
            // the command-line limit.
            if let Ok((b"", append)) =
                s::AppendCommandStart::parse(before_literal)
            {
                let tag = append.tag.clone().into_owned();
                let mailbox = append.mailbox.clone().into_owned();
                let first = fragment_item(&append.first_fragment);
                return self.handle_append(tag, mailbox, first, lit).await;
            }

            if lit.length > LITERAL_SIZE_LIMIT
                || cmdline.len() + lit.length as usize > MAX_CMDLINE
            {
                return self.reject_literal(cmdline, lit).await;
            }

            if !lit.literal_plus {
                self.continuation("Ready for literal data").await?;
            }

            cmdline.extend_from_slice(b"\r\n");
            self.reader
                .read_literal(cmdline, lit.length)
                .await?;

            nread = match self.reader.read_line(cmdline, MAX_CMDLINE).await?
            {
                Some(nread) => nread,
                None => {
                    return self.command_line_too_long(cmdline).await;
                },
            };
        }

        // Line complete; parse and dispatch.
        if let Ok((b"", cmdline)) = s::CommandLine::parse(cmdline) {
            match cmdline {
                s::CommandLine {
                    tag,
                    cmd: s::Command::Simple(s::SimpleCommand::Idle),
                } => self.handle_idle(tag.into_owned()).await?,
                cmdline => {
                    let response = self
                        .processor
                        .handle_command(cmdline, &mut self.out)
                        .await;
                    self.send_tagged(response).await?;
                },
            }
        } else if let Ok((_, frag)) =
            s::UnknownCommandFragment::parse(cmdline)
        {
            self.send_tagged(s::ResponseLine {
                tag: Some(frag.tag),
                response: s::Response::Cond(s::CondResponse {
                    cond: s::RespCondType::Bad,
                    code: Some(s::RespTextCode::Parse(())),
                    quip: Some(Cow::Borrowed(
                        "Unrecognised command syntax",
                    )),
                }),
            })
            .await?;
        } else {
            self.send_untagged_bye(
                "That doesn't look anything like an IMAP command!",
            )
            .await?;
        }

        Ok(())
    }

    /// Drive the APPEND data flow: read each message literal, then either
    /// the next fragment or the command terminator.
    async fn handle_append(
        &mut self,
        tag: String,
        mailbox: String,
        mut item: AppendItem,
        mut lit: LiteralInfo,
    ) -> Result<(), Error> {
        let mut items = Vec::new();

        loop {
            if 0 == lit.length || lit.length > LITERAL_SIZE_LIMIT {
                if lit.literal_plus {
                    self.reader.discard_literal(lit.length).await?;
                }
                self.send_tagged(s::ResponseLine {
                    tag: Some(Cow::Owned(tag)),
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: if 0 == lit.length {
                            None
                        } else {
                            Some(s::RespTextCode::Limit(()))
                        },
                        quip: Some(Cow::Borrowed(if 0 == lit.length {
                            "APPEND aborted by 0-size literal"
                        } else {
                            "APPEND size limit exceeded"
                        })),
                    }),
                })
                .await?;
                return Ok(());
            }

            if !lit.literal_plus {
                self.continuation("Ready for literal data").await?;
            }

            item.data.reserve(lit.length as usize);
            self.reader
                .read_literal(&mut item.data, lit.length)
                .await?;
            items.push(std::mem::take(&mut item));

            // After the literal: either the end of the command or the
            // next MULTIAPPEND fragment.
            let mut line = Vec::new();
            let Some(nread) =
                self.reader.read_line(&mut line, MAX_CMDLINE).await?
            else {
                return self.command_line_too_long(&mut line).await;
            };

            if line.is_empty() {
                break;
            }

            let Some((before_literal, next_lit)) =
                check_literal(&line, nread)
            else {
                self.send_tagged(s::ResponseLine {
                    tag: Some(Cow::Owned(tag)),
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: Some(s::RespTextCode::Parse(())),
                        quip: Some(Cow::Borrowed(
                            "Bad APPEND syntax (no literal)",
                        )),
                    }),
                })
                .await?;
                return Ok(());
            };

            let fragment_text = before_literal
                .strip_prefix(b" ")
                .unwrap_or(before_literal);
            let Ok((b"", fragment)) =
                s::AppendFragment::parse(fragment_text)
            else {
                if next_lit.literal_plus {
                    self.reader
                        .discard_literal(next_lit.length)
                        .await?;
                }
                self.send_tagged(s::ResponseLine {
                    tag: Some(Cow::Owned(tag)),
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: Some(s::RespTextCode::Parse(())),
                        quip: Some(Cow::Borrowed("Bad APPEND syntax")),
                    }),
                })
                .await?;
                return Ok(());
            };

            item = fragment_item(&fragment);
            lit = next_lit;
        }

        let response =
            self.processor.cmd_append(&mailbox, items, &mut self.out);
        self.send_tagged(s::ResponseLine {
            tag: Some(Cow::Owned(tag)),
            response,
        })
        .await
    }

    /// The IDLE command: stream notifications until DONE or the server
    /// loses patience.
    async fn handle_idle(&mut self, tag: String) -> Result<(), Error> {
        if !self.processor.has_selected() {
            // RFC 2177 permits IDLE in authenticated state, but there is
            // nothing to watch without a selection; handle it anyway by
            // just waiting for DONE.
        }

        self.continuation("idling").await?;

        let started = tokio::time::Instant::now();
        let mut line = Vec::<u8>::new();

        let finished = loop {
            tokio::select! {
                read = self.reader.read_line(&mut line, MAX_CMDLINE) => {
                    match read {
                        Ok(Some(_)) => {
                            let done =
                                line.eq_ignore_ascii_case(b"DONE");
                            line.clear();
                            if done {
                                break true;
                            }
                            // Anything else mid-IDLE is a protocol
                            // error; RFC 2177 says to ignore it until
                            // DONE.
                        },
                        Ok(None) => line.clear(),
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {
                    self.processor.idle_tick(&mut self.out);
                    if !self.out.is_empty() {
                        // Borrow piecemeal: the read future in the other
                        // branch still holds the reader.
                        flush_parts(
                            &mut self.write,
                            &mut self.out,
                            &self.trace,
                            self.session_id,
                        )
                        .await?;
                    }
                    if started.elapsed() >= MAX_IDLE {
                        break false;
                    }
                },
            }
        };

        if finished {
            self.send_tagged(s::ResponseLine {
                tag: Some(Cow::Owned(tag)),
                response: s::Response::Cond(s::CondResponse {
                    cond: s::RespCondType::Ok,
                    code: None,
                    quip: Some(Cow::Borrowed("IDLE terminated")),
                }),
            })
            .await
        } else {
            self.send_untagged_bye("IDLE timed out; please re-issue")
                .await
        }
    }

    async fn reject_literal(
        &mut self,
        cmdline: &mut Vec<u8>,
        lit: LiteralInfo,
    ) -> Result<(), Error> {
        // A synchronising literal is refused before any of it exists on
        // the wire; a non-synchronising one has to be drained (or the
        // connection dropped) to preserve framing.
        if lit.literal_plus {
            if lit.length > LITERAL_SIZE_LIMIT {
                self.send_untagged_bye("Literal too large").await?;
                return Ok(());
            }
            self.reader.discard_literal(lit.length).await?;
        }

        let response =
            if let Ok((_, frag)) = s::UnknownCommandFragment::parse(cmdline)
            {
                s::ResponseLine {
                    tag: Some(Cow::Owned(frag.tag.into_owned())),
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: Some(s::RespTextCode::Limit(())),
                        quip: Some(Cow::Borrowed("Literal too large")),
                    }),
                }
            } else {
                s::ResponseLine {
                    tag: None,
                    response: s::Response::Cond(s::CondResponse {
                        cond: s::RespCondType::Bad,
                        code: Some(s::RespTextCode::Limit(())),
                        quip: Some(Cow::Borrowed("Literal too large")),
                    }),
                }
            };
        self.send_tagged(response).await?;
        cmdline.clear();
        Ok(())
    }

    async fn command_line_too_long(
        &mut self,
        cmdline: &mut Vec<u8>,
    ) -> Result<(), Error> {
        warn!(
            "{} Overlong command line",
            self.processor.log_prefix()
        );
        cmdline.clear();
        self.send_untagged_bye("Command line too long").await
    }

    async fn continuation(&mut self, prompt: &str) -> Result<(), Error> {
        self.out.continuation(prompt);
        self.flush().await
    }

    async fn send_tagged(
        &mut self,
        line: s::ResponseLine<'_>,
    ) -> Result<(), Error> {
        self.sent_bye |= matches!(
            line.response,
            s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Bye,
                ..
            })
        );
        self.out.tagged(line);
        self.flush().await
    }

    async fn send_untagged_bye(
        &mut self,
        quip: &'static str,
    ) -> Result<(), Error> {
        self.sent_bye = true;
        self.out.tagged(s::ResponseLine {
            tag: None,
            response: s::Response::Cond(s::CondResponse {
                cond: s::RespCondType::Bye,
                code: None,
                quip: Some(Cow::Borrowed(quip)),
            }),
        });
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), Error> {
        flush_parts(
            &mut self.write,
            &mut self.out,
            &self.trace,
            self.session_id,
        )
        .await
    }

    fn trace_client(&mut self, data: &[u8]) {
        if let Some(ref trace) = self.trace {
            trace.borrow_mut().frame(
                self.session_id,
                Direction::ClientToServer,
                data,
            );
        }
    }
}

async fn flush_parts<W: AsyncWrite + Unpin>(
    write: &mut W,
    out: &mut ResponseBuffer,
    trace: &Option<Rc<RefCell<TraceWriter>>>,
    session_id: u64,
) -> Result<(), Error> {
    let buf = out.take();
    if buf.is_empty() {
        return Ok(());
    }

    if let Some(trace) = trace {
        trace.borrow_mut().frame(
            session_id,
            Direction::ServerToClient,
            &buf,
        );
    }

    write.write_all(&buf).await?;
    write.flush().await?;
    Ok(())
}

fn fragment_item(fragment: &s::AppendFragment<'_>) -> AppendItem {
    AppendItem {
        flags: fragment.flags.clone().unwrap_or_default(),
        internal_date: fragment.internal_date,
        data: Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::account::user_server::UserServer;
    use crate::support::log_prefix::LogPrefix;
    use tokio::io::{AsyncReadExt as _, DuplexStream};

    struct TestClient {
        io: DuplexStream,
        _root: tempfile::TempDir,
    }

    impl TestClient {
        async fn send(&mut self, data: &str) {
            self.io.write_all(data.as_bytes()).await.unwrap();
        }

        /// Read until the tagged response for `tag` arrives.
        async fn read_until_tagged(&mut self, tag: &str) -> String {
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            let needle = format!("\r\n{} ", tag);
            loop {
                let n = self.io.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed waiting for {}", tag);
                collected.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&collected);
                let tagged_start = text.starts_with(&needle[2..]);
                if (text.contains(&needle) || tagged_start)
                    && text.ends_with("\r\n")
                {
                    return text.into_owned();
                }
            }
        }
    }

    fn spawn_session() -> (TestClient, tokio::task::JoinHandle<()>) {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("INBOX")).unwrap();
        let server = UserServer::new(root.path().to_owned(), false).unwrap();

        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let (read, write) = tokio::io::split(server_io);

        let processor = CommandProcessor::new(
            LogPrefix::new("test".to_owned(), 1),
            server,
        );
        let handle = tokio::task::spawn_local(async move {
            let mut session =
                Session::new(read, write, processor, None, 1);
            let _ = session.run().await;
        });

        (
            TestClient {
                io: client_io,
                _root: root,
            },
            handle,
        )
    }

    async fn run_scenario<F, Fut>(f: F)
    where
        F: FnOnce(TestClient) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let (client, handle) = spawn_session();
                f(client).await;
                handle.abort();
            })
            .await;
    }

    #[tokio::test]
    async fn select_empty_inbox() {
        run_scenario(|mut client| async move {
            client.send("b SELECT INBOX\r\n").await;
            let response = client.read_until_tagged("b").await;

            assert!(response.contains("* 0 EXISTS\r\n"), "{}", response);
            assert!(response.contains("* 0 RECENT\r\n"), "{}", response);
            assert!(
                response.contains("* OK [UIDVALIDITY "),
                "{}",
                response
            );
            assert!(
                response.contains("* OK [UIDNEXT 1]"),
                "{}",
                response
            );
            assert!(
                response.contains(
                    "* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \
                     \\Draft)"
                ),
                "{}",
                response
            );
            assert!(
                response
                    .contains("b OK [READ-WRITE] SELECT completed\r\n"),
                "{}",
                response
            );
        })
        .await;
    }

    #[tokio::test]
    async fn multiappend_uidplus_and_fetch_round_trip() {
        run_scenario(|mut client| async move {
            client.send("a SELECT INBOX\r\n").await;
            client.read_until_tagged("a").await;

            client
                .send(
                    "b APPEND INBOX {10+}\r\n0123456789 {10+}\r\nabcdefghij\r\n",
                )
                .await;
            let response = client.read_until_tagged("b").await;
            assert!(
                response.contains("[APPENDUID "),
                "{}",
                response
            );
            assert!(response.contains(" 1:2]"), "{}", response);
            assert!(response.contains("* 2 EXISTS\r\n"), "{}", response);
            assert!(response.contains("* 2 RECENT\r\n"), "{}", response);

            // APPEND-then-FETCH BODY[] returns octet-equal bytes.
            client.send("c FETCH 1 BODY[]\r\n").await;
            let response = client.read_until_tagged("c").await;
            assert!(
                response.contains("BODY[] {10}\r\n0123456789"),
                "{}",
                response
            );
        })
        .await;
    }

    #[tokio::test]
    async fn synchronizing_literal_gets_continuation() {
        run_scenario(|mut client| async move {
            client.send("a APPEND INBOX {5}\r\n").await;
            // Wait for the continuation.
            let mut buf = [0u8; 64];
            let n = client.io.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]);
            assert!(text.starts_with("+ "), "{}", text);

            client.send("HELLO\r\n").await;
            let response = client.read_until_tagged("a").await;
            assert!(response.contains("[APPENDUID "), "{}", response);
        })
        .await;
    }

    #[tokio::test]
    async fn uid_expunge_subset() {
        run_scenario(|mut client| async move {
            client.send("a SELECT INBOX\r\n").await;
            client.read_until_tagged("a").await;

            for (ix, tag) in
                ["m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9"]
                    .iter()
                    .enumerate()
            {
                client
                    .send(&format!(
                        "{} APPEND INBOX {{9+}}\r\nmessage {}\r\n",
                        tag, ix
                    ))
                    .await;
                client.read_until_tagged(tag).await;
            }

            client
                .send("d STORE 5,7,9 +FLAGS.SILENT (\\Deleted)\r\n")
                .await;
            client.read_until_tagged("d").await;

            client.send("e UID EXPUNGE 6:8\r\n").await;
            let response = client.read_until_tagged("e").await;

            // Exactly one EXPUNGE, at UID 7's current seqnum.
            assert!(
                response.contains("* 7 EXPUNGE\r\n"),
                "{}",
                response
            );
            assert_eq!(
                1,
                response.matches(" EXPUNGE\r\n").count(),
                "{}",
                response
            );

            // UIDs 5 and 9 remain.
            client.send("f UID FETCH 5,9 FLAGS\r\n").await;
            let response = client.read_until_tagged("f").await;
            assert!(response.contains("UID 5"), "{}", response);
            assert!(response.contains("UID 9"), "{}", response);
        })
        .await;
    }

    #[tokio::test]
    async fn context_update_across_append() {
        run_scenario(|mut client| async move {
            client.send("s SELECT INBOX\r\n").await;
            client.read_until_tagged("s").await;

            client
                .send("a SEARCH RETURN (UPDATE COUNT) UNSEEN\r\n")
                .await;
            let response = client.read_until_tagged("a").await;
            assert!(
                response.contains("* ESEARCH (TAG \"a\") COUNT 0"),
                "{}",
                response
            );

            // Reusing the context's tag is refused.
            client.send("a NOOP\r\n").await;
            let response = client.read_until_tagged("a").await;
            assert!(response.contains("a BAD Tag reuse"), "{}", response);

            client
                .send("b APPEND INBOX {7+}\r\nxy\r\nzzy\r\n")
                .await;
            let response = client.read_until_tagged("b").await;
            assert!(
                response.contains("* ESEARCH (TAG \"a\") COUNT 1"),
                "{}",
                response
            );
            assert!(
                response
                    .contains("* ESEARCH (TAG \"a\") ADDTO (0 1)"),
                "{}",
                response
            );

            // CANCELUPDATE releases the tag.
            client.send("c CANCELUPDATE \"a\"\r\n").await;
            client.read_until_tagged("c").await;
            client.send("a NOOP\r\n").await;
            let response = client.read_until_tagged("a").await;
            assert!(response.contains("a OK"), "{}", response);
        })
        .await;
    }

    #[tokio::test]
    async fn store_is_idempotent_over_the_wire() {
        run_scenario(|mut client| async move {
            client.send("a SELECT INBOX\r\n").await;
            client.read_until_tagged("a").await;
            client.send("b APPEND INBOX {4+}\r\nbody\r\n").await;
            client.read_until_tagged("b").await;

            client
                .send("c STORE 1 +FLAGS.SILENT (\\Seen)\r\n")
                .await;
            client.read_until_tagged("c").await;
            client.send("d FETCH 1 FLAGS\r\n").await;
            let first = client.read_until_tagged("d").await;

            client
                .send("e STORE 1 +FLAGS.SILENT (\\Seen)\r\n")
                .await;
            client.read_until_tagged("e").await;
            client.send("f FETCH 1 FLAGS\r\n").await;
            let second = client.read_until_tagged("f").await;

            let flags_of = |text: &str| {
                text.lines()
                    .find(|l| l.contains("FETCH (FLAGS"))
                    .map(str::to_owned)
            };
            assert_eq!(flags_of(&first), flags_of(&second));
        })
        .await;
    }

    #[tokio::test]
    async fn list_attributes_stable_across_select_cycle() {
        run_scenario(|mut client| async move {
            client.send("a CREATE work/reports\r\n").await;
            client.read_until_tagged("a").await;

            let list_lines = |text: &str| -> Vec<String> {
                text.lines()
                    .filter(|l| l.starts_with("* LIST"))
                    .map(str::to_owned)
                    .collect()
            };

            client.send("b LIST \"\" *\r\n").await;
            let before = list_lines(&client.read_until_tagged("b").await);
            assert!(!before.is_empty());

            client.send("c SELECT work/reports\r\n").await;
            client.read_until_tagged("c").await;
            client.send("d UNSELECT\r\n").await;
            client.read_until_tagged("d").await;

            client.send("e LIST \"\" *\r\n").await;
            let after = list_lines(&client.read_until_tagged("e").await);
            assert_eq!(before, after);
        })
        .await;
    }

    #[tokio::test]
    async fn bad_command_keeps_session() {
        run_scenario(|mut client| async move {
            client.send("a FROBNICATE\r\n").await;
            let response = client.read_until_tagged("a").await;
            assert!(response.contains("a BAD"), "{}", response);

            client.send("b NOOP\r\n").await;
            let response = client.read_until_tagged("b").await;
            assert!(response.contains("b OK"), "{}", response);
        })
        .await;
    }
}
