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

//! Entry point for a per-user worker process.
//!
//! The worker owns one user's mail store outright. It runs a
//! single-threaded cooperative runtime: one task per client connection
//! received over the control socket, plus one background task for the
//! folder scanner, resync timer, and expiry sweeps. It exits on its own
//! 30 minutes after the last client disconnects.

use std::cell::RefCell;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, warn};

use super::main::Options;
use crate::account::user_server::UserServer;
use crate::imap::command_processor::CommandProcessor;
use crate::imap::server::Session;
use crate::server::subprocess::{self, CONTROL_FD};
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::trace::TraceWriter;
use crate::support::unix_privileges;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn run(options: &Options, maildir: PathBuf) -> ! {
    // If the dispatcher could not drop privileges before exec (or we were
    // launched by hand as root), do it now; a worker must never touch the
    // store as root.
    let log_prefix = format!("worker:{}", maildir.display());
    if !unix_privileges::drop_to_maildir_owner(&log_prefix, &maildir) {
        EX_BIND.exit();
    }

    let use_locking = std::env::var_os("ENABLE_MH_FILE_LOCKING")
        .is_some_and(|v| !v.is_empty() && "0" != v);

    let trace = options
        .trace
        .then(|| options.trace_dir.clone())
        .flatten();

    info!("{} Worker starting", log_prefix);
    serve(maildir, use_locking, trace);
    info!("{} Worker exiting", log_prefix);
    EX_OK.exit()
}

#[tokio::main(flavor = "current_thread")]
async fn serve(
    maildir: PathBuf,
    use_locking: bool,
    trace_dir: Option<PathBuf>,
) {
    let server = match UserServer::new(maildir.clone(), use_locking) {
        Ok(server) => server,
        Err(e) => {
            error!(
                "Unable to open user store under '{}': {}",
                maildir.display(),
                e
            );
            return;
        },
    };

    // The control socket arrives on a well-known fd from the dispatcher.
    let control = unsafe {
        std::os::unix::net::UnixStream::from_raw_fd(CONTROL_FD)
    };
    if control.set_nonblocking(true).is_err() {
        error!("Control socket is not usable");
        return;
    }
    let control = match tokio::net::UnixStream::from_std(control) {
        Ok(control) => control,
        Err(e) => {
            error!("Control socket is not usable: {}", e);
            return;
        },
    };

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let trace: Rc<RefCell<Option<Rc<RefCell<TraceWriter>>>>> =
                Rc::new(RefCell::new(None));
            let mut session_counter = 0u64;

            let sweeper = {
                let server = Rc::clone(&server);
                tokio::task::spawn_local(async move {
                    loop {
                        tokio::time::sleep(SWEEP_INTERVAL).await;
                        server.borrow_mut().background_sweep();
                        if server.borrow().should_terminate() {
                            break;
                        }
                    }
                })
            };

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        if server.borrow().should_terminate() {
                            break;
                        }
                    },
                    ready = control.readable() => {
                        if ready.is_err() {
                            break;
                        }

                        use std::os::unix::io::AsRawFd as _;
                        let received = control.try_io(
                            tokio::io::Interest::READABLE,
                            || {
                                subprocess::receive_connection_fd(
                                    control.as_raw_fd(),
                                )
                            },
                        );

                        match received {
                            Ok(Some((username, stream))) => {
                                session_counter += 1;
                                spawn_session(
                                    &server,
                                    &trace,
                                    trace_dir.as_deref(),
                                    username,
                                    stream,
                                    session_counter,
                                );
                            },
                            Ok(None) => {
                                // Dispatcher went away; serve what we
                                // have and retire on the linger timer.
                                info!("Control socket closed");
                                break;
                            },
                            Err(ref e)
                                if std::io::ErrorKind::WouldBlock
                                    == e.kind() => {},
                            Err(e) => {
                                warn!("Control socket error: {}", e);
                                break;
                            },
                        }
                    },
                }
            }

            // No more new connections; let the active ones finish.
            let _ = sweeper.await;
        })
        .await;
}

fn spawn_session(
    server: &Rc<RefCell<UserServer>>,
    trace: &Rc<RefCell<Option<Rc<RefCell<TraceWriter>>>>>,
    trace_dir: Option<&std::path::Path>,
    username: String,
    stream: std::os::unix::net::UnixStream,
    session_id: u64,
) {
    if stream.set_nonblocking(true).is_err() {
        return;
    }
    let stream = match tokio::net::UnixStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Unable to adopt connection: {}", e);
            return;
        },
    };

    // The trace log is per user; one worker serves exactly one user, so
    // it is created lazily when the first connection names them.
    if let Some(trace_dir) = trace_dir {
        let mut slot = trace.borrow_mut();
        if slot.is_none() {
            *slot = Some(Rc::new(RefCell::new(TraceWriter::new(
                trace_dir, &username,
            ))));
        }
    }
    let trace_writer = trace.borrow().clone();

    let server = Rc::clone(server);
    let log_prefix = LogPrefix::new(username, session_id);

    tokio::task::spawn_local(async move {
        server.borrow_mut().connection_opened();

        let (read, write) = stream.into_split();
        let processor =
            CommandProcessor::new(log_prefix.clone(), Rc::clone(&server));
        let mut session =
            Session::new(read, write, processor, trace_writer, session_id);

        match session.run().await {
            Ok(()) => info!("{} Session ended", log_prefix),
            Err(e) => info!("{} Session ended abnormally: {}", log_prefix, e),
        }

        if session.fatal() {
            error!("{} Store unusable; worker terminating", log_prefix);
            std::process::exit(70);
        }

        server.borrow_mut().connection_closed();
    });
}
