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

use std::net::IpAddr;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::support::sysexits::*;

/// IMAP4rev1 server exporting MH-style maildirs.
#[derive(StructOpt)]
#[structopt(name = "asimapd", max_term_width = 80)]
pub struct Options {
    /// Address to listen on.
    #[structopt(long, env = "ADDRESS", default_value = "0.0.0.0")]
    pub address: IpAddr,

    /// Port to listen on (IMAPS).
    #[structopt(long, env = "PORT", default_value = "993")]
    pub port: u16,

    /// Path to the PEM-encoded TLS certificate chain.
    #[structopt(
        long,
        env = "SSL_CERT",
        default_value = "/opt/asimap/ssl/cert.pem",
        parse(from_os_str)
    )]
    pub cert: PathBuf,

    /// Path to the PEM-encoded TLS private key.
    #[structopt(
        long,
        env = "SSL_KEY",
        default_value = "/opt/asimap/ssl/key.pem",
        parse(from_os_str)
    )]
    pub key: PathBuf,

    /// Enable the IMAP frame trace.
    #[structopt(long)]
    pub trace: bool,

    /// Directory for trace logs.
    #[structopt(long, env = "TRACE_DIR", parse(from_os_str))]
    pub trace_dir: Option<PathBuf>,

    /// Log at debug level. (Also enabled by the DEBUG environment
    /// variable.)
    #[structopt(long)]
    pub debug: bool,

    /// log4rs configuration file; overrides the built-in logging setup.
    #[structopt(long, env = "LOG_CONFIG", parse(from_os_str))]
    pub log_config: Option<PathBuf>,

    /// The password file (user:hash:maildir records).
    #[structopt(
        long,
        env = "PWFILE",
        default_value = "/var/db/asimapd_passwords.txt",
        parse(from_os_str)
    )]
    pub pwfile: PathBuf,

    #[structopt(subcommand)]
    pub command: Option<Command>,
}

#[derive(StructOpt)]
pub enum Command {
    /// Internal: serve one user's mail store. Spawned by the main server
    /// over a control socket; not for interactive use.
    #[structopt(name = "user-server", setting = structopt::clap::AppSettings::Hidden)]
    UserServer {
        /// The user's maildir root.
        #[structopt(long, parse(from_os_str))]
        maildir: PathBuf,
    },
}

pub fn main() {
    // Clap exits with status 1 by default; the documented contract is 2
    // for CLI errors, so take the long way around.
    let matches = match Options::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ structopt::clap::Error {
                kind: structopt::clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ structopt::clap::Error {
                kind: structopt::clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    };
    let mut options = Options::from_clap(&matches);

    // Flag-like settings can also arrive through the environment, which
    // is how container deployments and re-exec'd workers configure
    // themselves.
    options.debug |= std::env::var_os("DEBUG")
        .is_some_and(|v| !v.is_empty() && "0" != v);
    options.trace |= options.trace_dir.is_some();

    init_logging(&options);

    // Workers inherit their configuration through the environment, so
    // flags given only on the command line still reach them.
    if options.trace {
        if let Some(ref dir) = options.trace_dir {
            std::env::set_var("TRACE_DIR", dir);
        }
    }
    if options.debug {
        std::env::set_var("DEBUG", "1");
    }

    match options.command {
        Some(Command::UserServer { ref maildir }) => {
            super::user::run(&options, maildir.clone());
        },
        None => super::serve::run(options),
    }
}

fn init_logging(options: &Options) {
    if let Some(ref log_config) = options.log_config {
        log4rs::init_file(log_config, log4rs::config::Deserializers::new())
            .expect("Failed to initialise logging");
        return;
    }

    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; just write to stderr.
        crate::init_simple_log(options.debug);
        return;
    }

    // Daemonised without explicit configuration: syslog, like any other
    // mail-adjacent service.
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw() as u32,
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            let _ = log::set_boxed_logger(Box::new(
                syslog::BasicLogger::new(logger),
            ))
            .map(|()| {
                log::set_max_level(if options.debug {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                })
            });
        },
        Err(_) => crate::init_simple_log(options.debug),
    }
}
