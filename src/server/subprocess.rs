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

//! Per-user worker processes and the control-socket handover.
//!
//! The dispatcher keeps one control socket per live worker, created as a
//! socketpair and inherited across exec on fd 3. Each authenticated
//! connection becomes a fresh socketpair: one end travels to the worker
//! with `SCM_RIGHTS` behind a one-line `user <name>` preamble, the other
//! end is pumped against the TLS stream by the dispatcher's relay task.

use std::collections::HashMap;
use std::io::{self, IoSlice, Write as _};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use nix::sys::socket::{
    sendmsg, socketpair, AddressFamily, ControlMessage, MsgFlags, SockFlag,
    SockType,
};

use crate::support::error::Error;

/// The fd number the worker finds its control socket on.
pub const CONTROL_FD: RawFd = 3;

/// How long a crashed worker's slot stays poisoned before a respawn is
/// permitted.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(30);

struct Worker {
    control: std::os::unix::net::UnixStream,
    child: Child,
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<PathBuf, Worker>,
    poisoned: HashMap<PathBuf, Instant>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `username`'s new connection to their worker, spawning one if
    /// needed, and return the dispatcher-side socket to relay against.
    pub fn hand_connection(
        &mut self,
        username: &str,
        maildir: &Path,
    ) -> Result<std::os::unix::net::UnixStream, Error> {
        self.reap();

        if let Some(until) = self.poisoned.get(maildir) {
            if until.elapsed() < RESPAWN_BACKOFF {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "worker recently failed; backing off",
                )));
            }
            self.poisoned.remove(maildir);
        }

        if !self.workers.contains_key(maildir) {
            let worker = spawn_worker(maildir)?;
            info!(
                "Started worker pid {} for '{}'",
                worker.child.id(),
                maildir.display()
            );
            self.workers.insert(maildir.to_owned(), worker);
        }

        match self.try_hand(username, maildir) {
            Ok(stream) => Ok(stream),
            Err(first_err) => {
                // The worker likely self-terminated after its linger
                // period; one immediate respawn is legitimate.
                warn!(
                    "Handover to worker for '{}' failed ({}); respawning",
                    maildir.display(),
                    first_err
                );
                self.forget(maildir);
                let worker = spawn_worker(maildir)?;
                self.workers.insert(maildir.to_owned(), worker);
                self.try_hand(username, maildir).map_err(|e| {
                    self.poison(maildir);
                    e
                })
            },
        }
    }

    fn try_hand(
        &mut self,
        username: &str,
        maildir: &Path,
    ) -> Result<std::os::unix::net::UnixStream, Error> {
        let worker = self
            .workers
            .get_mut(maildir)
            .expect("worker just inserted");

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let preamble = format!("user {}\n", username);
        let fds = [theirs.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(preamble.as_bytes())];
        sendmsg::<()>(
            worker.control.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )?;
        drop(theirs);

        Ok(unsafe {
            std::os::unix::net::UnixStream::from_raw_fd(ours.into_raw_fd())
        })
    }

    /// Drop workers whose process has exited.
    fn reap(&mut self) {
        let dead: Vec<PathBuf> = self
            .workers
            .iter_mut()
            .filter_map(|(maildir, worker)| {
                match worker.child.try_wait() {
                    Ok(Some(status)) => {
                        if status.success() {
                            info!(
                                "Worker for '{}' exited normally",
                                maildir.display()
                            );
                        } else {
                            error!(
                                "Worker for '{}' died: {}",
                                maildir.display(),
                                status
                            );
                        }
                        Some((maildir.clone(), !status.success()))
                    },
                    Ok(None) => None,
                    Err(e) => {
                        warn!(
                            "Unable to check worker for '{}': {}",
                            maildir.display(),
                            e
                        );
                        None
                    },
                }
            })
            .map(|(maildir, crashed)| {
                if crashed {
                    self.poisoned
                        .insert(maildir.clone(), Instant::now());
                }
                maildir
            })
            .collect();

        for maildir in dead {
            self.workers.remove(&maildir);
        }
    }

    fn forget(&mut self, maildir: &Path) {
        if let Some(mut worker) = self.workers.remove(maildir) {
            let _ = worker.child.try_wait();
        }
    }

    fn poison(&mut self, maildir: &Path) {
        self.workers.remove(maildir);
        self.poisoned.insert(maildir.to_owned(), Instant::now());
    }
}

/// Fork+exec this same binary as the per-user worker, dropped to the
/// owner of the maildir, with the control socketpair on `CONTROL_FD`.
fn spawn_worker(maildir: &Path) -> Result<Worker, Error> {
    use std::os::unix::fs::MetadataExt;

    // Close-on-exec on both ends: the child's dup2 onto the well-known
    // fd clears the flag for the one descriptor the worker should keep,
    // and nothing else leaks across the exec.
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    // Resolve the target identity before forking; nothing in the child
    // between fork and exec may allocate or take locks.
    let md = maildir.metadata()?;
    let is_root = nix::unistd::ROOT == nix::unistd::getuid();
    let target_uid = md.uid();
    let target_gid = md.gid();

    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("user-server")
        .arg("--maildir")
        .arg(maildir)
        .stdin(std::process::Stdio::null());

    let control_fd = theirs.as_raw_fd();
    unsafe {
        command.pre_exec(move || {
            // Move the control socket to its well-known fd and clear
            // close-on-exec by virtue of the dup.
            if nix::libc::dup2(control_fd, CONTROL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }

            if is_root {
                if nix::libc::setgid(target_gid) < 0
                    || nix::libc::setgroups(1, &target_gid) < 0
                    || nix::libc::setuid(target_uid) < 0
                {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let child = command.spawn()?;
    drop(theirs);

    let control = unsafe {
        std::os::unix::net::UnixStream::from_raw_fd(ours.into_raw_fd())
    };
    Ok(Worker { control, child })
}

/// Worker-side: receive one connection (preamble + fd) from the control
/// socket. Returns `None` on clean EOF, i.e. the dispatcher went away.
///
/// On a non-blocking socket this surfaces `WouldBlock`, which composes
/// with `tokio::net::UnixStream::try_io`.
pub fn receive_connection_fd(
    fd: RawFd,
) -> io::Result<Option<(String, std::os::unix::net::UnixStream)>> {
    use nix::sys::socket::{recvmsg, RecvMsg};
    use std::io::IoSliceMut;

    let mut buf = [0u8; 256];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    // The iovec's borrow of `buf` must end before the preamble is read
    // back out of it.
    let (bytes, received_fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg: RecvMsg<'_, '_, ()> = recvmsg(
            fd,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let mut received_fd: Option<OwnedFd> = None;
        for cmsg in msg.cmsgs() {
            if let nix::sys::socket::ControlMessageOwned::ScmRights(fds) =
                cmsg
            {
                for raw in fds {
                    received_fd =
                        Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        (msg.bytes, received_fd)
    };

    if 0 == bytes {
        return Ok(None);
    }

    let fd = received_fd;
    let preamble = String::from_utf8_lossy(&buf[..bytes]);
    let username = preamble
        .trim()
        .strip_prefix("user ")
        .unwrap_or("")
        .to_owned();

    let Some(fd) = fd else {
        warn!("Control message without a socket; ignoring");
        return Ok(None);
    };
    if username.is_empty() {
        warn!("Control message without a user name; ignoring");
        return Ok(None);
    }

    let stream = unsafe {
        std::os::unix::net::UnixStream::from_raw_fd(fd.into_raw_fd())
    };
    Ok(Some((username, stream)))
}

/// Quick self-test hook used by the dispatcher at startup: confirm that
/// fd passing works on this platform before accepting connections.
pub fn self_test() -> Result<(), Error> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    let (c, d) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    let fds = [c.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(b"user test\n")];
    sendmsg::<()>(a.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;

    let stream_b = unsafe {
        std::os::unix::net::UnixStream::from_raw_fd(b.into_raw_fd())
    };
    let received = receive_connection_fd(stream_b.as_raw_fd())?;
    let Some((user, mut stream)) = received else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "fd passing self-test failed",
        )));
    };
    if "test" != user {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "fd passing preamble corrupted",
        )));
    }

    // Prove the passed fd is really connected to `d`.
    stream.write_all(b"ping")?;
    let mut readback = [0u8; 4];
    nix::unistd::read(d.as_raw_fd(), &mut readback)?;
    if b"ping" != &readback {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "fd passing data corrupted",
        )));
    }

    Ok(())
}
