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

//! The privileged listener.
//!
//! Each accepted connection gets an OS thread: the pre-authentication
//! dialogue is a tiny line-oriented protocol with no concurrency inside
//! one connection, and after handover the thread degenerates into a dumb
//! byte relay between the TLS stream and the worker's socketpair. All the
//! interesting concurrency lives in the per-user workers.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use openssl::ssl::{
    HandshakeError, SslAcceptor, SslFiletype, SslMethod, SslStream,
};

use super::auth::{self, AuthError};
use super::subprocess::WorkerRegistry;
use super::throttle::AuthThrottle;
use crate::imap::syntax as s;
use crate::support::error::Error;

const MAX_PREAUTH_LINE: u64 = 8192;
const PREAUTH_CAPABILITIES: &str =
    "IMAP4rev1 LITERAL+ IDLE NAMESPACE UIDPLUS MULTIAPPEND UNSELECT \
     CHILDREN SORT ESORT ESEARCH CONTEXT=SEARCH CONTEXT=SORT \
     LIST-EXTENDED LIST-STATUS MOVE AUTH=PLAIN";

pub struct DispatcherConfig {
    pub address: IpAddr,
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub pwfile: PathBuf,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    acceptor: Arc<SslAcceptor>,
    registry: Arc<Mutex<WorkerRegistry>>,
    throttle: Arc<Mutex<AuthThrottle>>,
}

impl Dispatcher {
    /// Build the TLS acceptor; certificate problems surface here so the
    /// CLI can exit with the documented code.
    pub fn new(config: DispatcherConfig) -> Result<Self, Error> {
        let mut acceptor =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor
            .set_private_key_file(&config.key, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(&config.cert)?;
        acceptor.check_private_key()?;

        Ok(Dispatcher {
            config,
            acceptor: Arc::new(acceptor.build()),
            registry: Arc::new(Mutex::new(WorkerRegistry::new())),
            throttle: Arc::new(Mutex::new(AuthThrottle::new())),
        })
    }

    /// Bind the listener; address problems surface here for the same
    /// reason.
    pub fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(
            self.config.address,
            self.config.port,
        ))
    }

    /// Accept connections forever.
    pub fn run(self, listener: TcpListener) -> ! {
        info!(
            "Listening for IMAPS on {}:{}",
            self.config.address, self.config.port
        );

        let this = Arc::new(self);
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&this);
                    std::thread::spawn(move || {
                        if let Err(e) = this.handle_connection(stream, peer)
                        {
                            info!("{} Connection ended: {}", peer, e);
                        }
                    });
                },
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                },
            }
        }
    }

    fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Error> {
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_secs(5 * 60)))?;
        stream.set_nonblocking(true)?;

        let tls = handshake(&self.acceptor, stream)?;
        let io = WrappedTls::new(tls);
        info!("{} TLS established", peer);

        let authenticated = self.preauth_dialogue(io.clone(), peer)?;
        let Some((username, maildir, pipelined)) = authenticated else {
            return Ok(()); // LOGOUT or auth lockout; already answered.
        };

        info!("{} Authenticated as '{}'", peer, username);

        let mut worker_stream = self
            .registry
            .lock()
            .unwrap()
            .hand_connection(&username, &maildir)?;

        // Commands the client pipelined behind its LOGIN are sitting in
        // the pre-auth read buffer; they belong to the worker.
        if !pipelined.is_empty() {
            worker_stream.write_all(&pipelined)?;
        }

        // After the handover the dispatcher forgets everything about the
        // session and just pumps bytes.
        relay(io, worker_stream)
    }

    /// The pre-authentication IMAP dialogue. Returns the authenticated
    /// identity plus any bytes the client pipelined behind its login, or
    /// None if the connection ended without authenticating.
    #[allow(clippy::type_complexity)]
    fn preauth_dialogue(
        &self,
        io: WrappedTls,
        peer: SocketAddr,
    ) -> Result<Option<(String, PathBuf, Vec<u8>)>, Error> {
        let mut reader = BufReader::new(io.clone());
        let mut write = io;

        write_line(
            &mut write,
            &format!(
                "* OK [CAPABILITY {}] asimap ready\r\n",
                PREAUTH_CAPABILITIES
            ),
        )?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let n = (&mut reader)
                .take(MAX_PREAUTH_LINE)
                .read_until(b'\n', &mut line)?;
            if 0 == n {
                return Ok(None);
            }
            while line.ends_with(b"\n") || line.ends_with(b"\r") {
                line.pop();
            }
            let mut nread = line.len();

            // LOGIN arguments may arrive as literals.
            while let Some((_, lit)) =
                crate::imap::request_reader::check_literal(&line, nread)
            {
                if lit.length as u64 > MAX_PREAUTH_LINE {
                    write_line(&mut write, "* BAD Literal too large\r\n")?;
                    return Ok(None);
                }
                if !lit.literal_plus {
                    write_line(&mut write, "+ Ready for literal data\r\n")?;
                }
                line.extend_from_slice(b"\r\n");
                let mut data = vec![0u8; lit.length as usize];
                reader.read_exact(&mut data)?;
                line.extend_from_slice(&data);

                let mut rest = Vec::new();
                (&mut reader)
                    .take(MAX_PREAUTH_LINE)
                    .read_until(b'\n', &mut rest)?;
                while rest.ends_with(b"\n") || rest.ends_with(b"\r") {
                    rest.pop();
                }
                nread = rest.len();
                line.extend_from_slice(&rest);
            }

            if let Ok((b"", auth_start)) =
                s::AuthenticateCommandStart::parse(&line)
            {
                let tag = auth_start.tag.clone().into_owned();
                if !auth_start.mechanism.eq_ignore_ascii_case("PLAIN") {
                    write_line(
                        &mut write,
                        &format!(
                            "{} NO Unsupported mechanism\r\n",
                            tag
                        ),
                    )?;
                    continue;
                }

                let b64 = match auth_start.initial_response {
                    Some(ref ir) => ir.clone().into_owned(),
                    None => {
                        write_line(&mut write, "+ \r\n")?;
                        let mut b64 = Vec::new();
                        (&mut reader)
                            .take(MAX_PREAUTH_LINE)
                            .read_until(b'\n', &mut b64)?;
                        String::from_utf8_lossy(&b64).trim().to_owned()
                    },
                };

                match auth::decode_sasl_plain(&b64) {
                    Some((username, password)) => {
                        if let Some(user) = self.try_login(
                            &mut write, &tag, peer, &username, &password,
                        )? {
                            return Ok(Some((
                                user.username,
                                user.maildir,
                                reader.buffer().to_vec(),
                            )));
                        }
                    },
                    None => {
                        write_line(
                            &mut write,
                            &format!("{} BAD Invalid SASL data\r\n", tag),
                        )?;
                    },
                }
                continue;
            }

            let Ok((b"", cmdline)) = s::CommandLine::parse(&line) else {
                if let Ok((_, frag)) =
                    s::UnknownCommandFragment::parse(&line)
                {
                    write_line(
                        &mut write,
                        &format!("{} BAD Unrecognised command\r\n", frag.tag),
                    )?;
                    continue;
                }
                write_line(
                    &mut write,
                    "* BAD That doesn't look anything like \
                     an IMAP command!\r\n",
                )?;
                return Ok(None);
            };

            let tag = cmdline.tag.into_owned();
            match cmdline.cmd {
                s::Command::Simple(s::SimpleCommand::Capability) => {
                    write_line(
                        &mut write,
                        &format!(
                            "* CAPABILITY {}\r\n{} OK done\r\n",
                            PREAUTH_CAPABILITIES, tag
                        ),
                    )?;
                },
                s::Command::Simple(s::SimpleCommand::Noop) => {
                    write_line(&mut write, &format!("{} OK done\r\n", tag))?;
                },
                s::Command::Simple(s::SimpleCommand::LogOut) => {
                    write_line(
                        &mut write,
                        &format!(
                            "* BYE see you soon\r\n{} OK done\r\n",
                            tag
                        ),
                    )?;
                    return Ok(None);
                },
                s::Command::Simple(s::SimpleCommand::StartTls) => {
                    write_line(
                        &mut write,
                        &format!("{} BAD Already using TLS\r\n", tag),
                    )?;
                },
                s::Command::LogIn(login) => {
                    let username = login.userid.into_owned();
                    let password = login.password.into_owned();
                    if let Some(user) = self.try_login(
                        &mut write, &tag, peer, &username, &password,
                    )? {
                        return Ok(Some((
                            user.username,
                            user.maildir,
                            reader.buffer().to_vec(),
                        )));
                    }
                },
                _ => {
                    write_line(
                        &mut write,
                        &format!("{} BAD Not logged in\r\n", tag),
                    )?;
                },
            }
        }
    }

    /// One authentication attempt, with throttling.
    fn try_login(
        &self,
        write: &mut WrappedTls,
        tag: &str,
        peer: SocketAddr,
        username: &str,
        password: &str,
    ) -> Result<Option<auth::PwUser>, Error> {
        if !self.throttle.lock().unwrap().check_allow(peer.ip()) {
            // Locked out: answer without touching the password file and
            // drop the connection.
            warn!("{} Auth throttled for '{}'", peer, username);
            write_line(
                write,
                &format!(
                    "{} NO [AUTHENTICATIONFAILED] \
                     Too many failures; try again later\r\n",
                    tag
                ),
            )?;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "auth throttled",
            )));
        }

        match auth::authenticate(&self.config.pwfile, username, password) {
            Ok(user) => {
                write_line(
                    write,
                    &format!("{} OK LOGIN completed\r\n", tag),
                )?;
                Ok(Some(user))
            },
            Err(AuthError::BadCredentials) => {
                info!("{} Failed login for '{}'", peer, username);
                self.throttle.lock().unwrap().login_failed(peer.ip());
                write_line(
                    write,
                    &format!(
                        "{} NO [AUTHENTICATIONFAILED] \
                         Invalid credentials\r\n",
                        tag
                    ),
                )?;
                Ok(None)
            },
            Err(AuthError::Unavailable) => {
                write_line(
                    write,
                    &format!(
                        "{} NO [SERVERBUG] \
                         Authentication temporarily unavailable\r\n",
                        tag
                    ),
                )?;
                Ok(None)
            },
        }
    }
}

fn write_line(write: &mut WrappedTls, line: &str) -> io::Result<()> {
    write.write_all(line.as_bytes())?;
    write.flush()
}

/// Pump bytes between the client TLS stream and the worker socket until
/// either side closes.
fn relay(
    client: WrappedTls,
    worker: std::os::unix::net::UnixStream,
) -> Result<(), Error> {
    let worker_read = worker.try_clone()?;
    let mut client_read = client.clone();
    let mut worker_write = worker;

    let upstream = std::thread::spawn(move || {
        let mut buf = [0u8; 16384];
        loop {
            match client_read.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if worker_write.write_all(&buf[..n]).is_err() {
                        break;
                    }
                },
            }
        }
        let _ = worker_write
            .shutdown(std::net::Shutdown::Write);
    });

    {
        let mut client_write = client;
        let mut worker_read = worker_read;
        let mut buf = [0u8; 16384];
        loop {
            match worker_read.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    if client_write.flush().is_err() {
                        break;
                    }
                },
            }
        }
        client_write.shutdown();
    }

    let _ = upstream.join();
    Ok(())
}

/// Complete a TLS handshake over a non-blocking socket.
fn handshake(
    acceptor: &SslAcceptor,
    stream: TcpStream,
) -> Result<SslStream<TcpStream>, Error> {
    let mut pending = match acceptor.accept(stream) {
        Ok(tls) => return Ok(tls),
        Err(HandshakeError::WouldBlock(mid)) => mid,
        Err(HandshakeError::Failure(e)) => {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                e.into_error(),
            )));
        },
        Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
    };

    loop {
        let fd = pending.get_ref().as_raw_fd();
        poll_fd(fd, true, true)?;
        match pending.handshake() {
            Ok(tls) => return Ok(tls),
            Err(HandshakeError::WouldBlock(mid)) => pending = mid,
            Err(HandshakeError::Failure(e)) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    e.into_error(),
                )));
            },
            Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),
        }
    }
}

/// Shared handle on one TLS stream over a non-blocking socket.
///
/// Reads and writes take the lock only for the duration of the underlying
/// SSL call; `WANT_READ`/`WANT_WRITE` conditions release the lock and
/// block in `poll`, so one direction stalling never wedges the other.
#[derive(Clone)]
struct WrappedTls {
    inner: Arc<Mutex<SslStream<TcpStream>>>,
    fd: RawFd,
}

impl WrappedTls {
    fn new(tls: SslStream<TcpStream>) -> Self {
        let fd = tls.get_ref().as_raw_fd();
        WrappedTls {
            inner: Arc::new(Mutex::new(tls)),
            fd,
        }
    }

    fn shutdown(&mut self) {
        let mut lock = self.inner.lock().unwrap();
        let _ = lock.shutdown();
        let _ = lock.get_ref().shutdown(std::net::Shutdown::Both);
    }

    fn on_error(&self, e: openssl::ssl::Error) -> io::Result<()> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                poll_fd(self.fd, true, false)
            },
            openssl::ssl::ErrorCode::WANT_WRITE => {
                poll_fd(self.fd, false, true)
            },
            _ => Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

impl Read for WrappedTls {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let res = {
                let mut lock = self.inner.lock().unwrap();
                lock.ssl_read(buf)
            };

            match res {
                Ok(n) => return Ok(n),
                Err(ref e)
                    if openssl::ssl::ErrorCode::ZERO_RETURN == e.code() =>
                {
                    return Ok(0);
                },
                Err(e) => self.on_error(e)?,
            }
        }
    }
}

impl Write for WrappedTls {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let res = {
                let mut lock = self.inner.lock().unwrap();
                lock.ssl_write(buf)
            };

            match res {
                Ok(n) => return Ok(n),
                Err(e) => self.on_error(e)?,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut lock = self.inner.lock().unwrap();
        lock.get_mut().flush()
    }
}

fn poll_fd(fd: RawFd, want_read: bool, want_write: bool) -> io::Result<()> {
    let mut flags = nix::poll::PollFlags::POLLERR;
    if want_read {
        flags |= nix::poll::PollFlags::POLLIN;
    }
    if want_write {
        flags |= nix::poll::PollFlags::POLLOUT;
    }

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [nix::poll::PollFd::new(&borrowed, flags)];

    match nix::poll::poll(&mut fds, 30 * 60_000) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Socket timed out",
        )),
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::EINTR) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}
