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

//! Buffered message data for FETCH, SEARCH, and SORT.

use std::borrow::Cow;

use super::Mailbox;
use crate::account::model::*;
use crate::mime::bodystructure::{self, BodyStructure};
use crate::mime::envelope::{self, Envelope};
use crate::mime::part::Part;
use crate::mime::section::{self, SectionSpec};
use crate::support::error::Error;

/// One message, fully buffered and segmented.
///
/// MH messages are single ordinary files; FETCH BODY[] needs every octet
/// anyway, so there is no benefit to streaming here and offsets into the
/// buffer give octet-exact section slicing for free.
pub struct MessageData {
    raw: Vec<u8>,
    part: Part,
}

impl MessageData {
    pub fn new(raw: Vec<u8>) -> Self {
        let part = Part::parse(&raw);
        MessageData { raw, part }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn part(&self) -> &Part {
        &self.part
    }

    pub fn envelope(&self) -> Envelope {
        envelope::envelope(&self.part)
    }

    pub fn body_structure(&self) -> BodyStructure {
        bodystructure::body_structure(&self.raw, &self.part)
    }

    /// The octets of `BODY[spec]`, before any partial-range slicing.
    ///
    /// A section that does not exist yields empty content, which the fetch
    /// layer sends as a zero-length literal.
    pub fn section(&self, spec: &SectionSpec) -> Cow<'_, [u8]> {
        section::fetch_section(&self.raw, &self.part, spec)
            .unwrap_or(Cow::Borrowed(&[]))
    }

    /// `RFC822.HEADER`: the header block of the message.
    pub fn header_block(&self) -> &[u8] {
        &self.raw[self.part.headers_range.start..self.part.body_range.start]
    }

    /// `RFC822.TEXT`: the body of the message.
    pub fn text_block(&self) -> &[u8] {
        &self.raw[self.part.body_range.clone()]
    }
}

impl Mailbox {
    /// Load and segment the message with the given UID.
    pub fn message_data(&self, uid: Uid) -> Result<MessageData, Error> {
        Ok(MessageData::new(self.read_message(uid)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn section_slicing_and_blocks() {
        let raw = b"Subject: x\r\n\r\nbody text\r\n".to_vec();
        let data = MessageData::new(raw.clone());

        assert_eq!(raw, data.raw());
        assert_eq!(b"Subject: x\r\n\r\n".to_vec(), data.header_block());
        assert_eq!(b"body text\r\n".to_vec(), data.text_block());
        assert_eq!(
            raw,
            data.section(&SectionSpec::default()).into_owned()
        );
    }
}
