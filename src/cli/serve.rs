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

//! Entry point for the main dispatcher process.

use log::error;

use super::main::Options;
use crate::server::dispatcher::{Dispatcher, DispatcherConfig};
use crate::server::subprocess;
use crate::support::sysexits::*;

pub fn run(options: Options) -> ! {
    if let Err(e) = subprocess::self_test() {
        error!("Connection handover self-test failed: {}", e);
        EX_BIND.exit();
    }

    let dispatcher = match Dispatcher::new(DispatcherConfig {
        address: options.address,
        port: options.port,
        cert: options.cert.clone(),
        key: options.key.clone(),
        pwfile: options.pwfile.clone(),
    }) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(
                "Unable to load TLS material from '{}' / '{}': {}",
                options.cert.display(),
                options.key.display(),
                e
            );
            EX_CERT.exit();
        },
    };

    let listener = match dispatcher.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Unable to bind {}:{}: {}",
                options.address, options.port, e
            );
            EX_BIND.exit();
        },
    };

    dispatcher.run(listener)
}
