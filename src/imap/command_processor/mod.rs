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

//! Implements most of the IMAP protocol, specifically that which is not
//! sensitive to the actual wire format.
//!
//! As with `account::mailbox`, this module is split into several
//! submodules for manageability, but is best thought of as one single
//! module.

// selected! is a macro instead of a method on CommandProcessor since there
// is no way to express that it borrows only one field --- as a method, the
// returned value is considered to borrow the whole CommandProcessor.
macro_rules! selected {
    ($this:expr) => {
        $this.selected.as_mut().ok_or_else(|| {
            crate::imap::command_processor::defs::bad(
                None,
                "No mailbox selected",
            )
        })
    };
}

mod commands;
mod defs;
mod fetch;
mod flags;
mod mailboxes;
mod messages;
mod search;

pub use self::defs::{CommandProcessor, ResponseBuffer};
