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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text included at the start of every log statement for one
/// connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so the identity
/// learned at login shows up in log lines emitted by tasks spawned earlier.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: String,
    user: Option<String>,
    session: u64,
}

impl LogPrefix {
    pub fn new(peer: String, session: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer,
                user: None,
                session,
            })),
        }
    }

    pub fn set_user(&self, user: &str) {
        self.inner.lock().unwrap().user = Some(user.to_owned());
    }

    pub fn session(&self) -> u64 {
        self.inner.lock().unwrap().session
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}#{}", inner.peer, inner.session)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{}]", user)?;
        }
        Ok(())
    }
}
