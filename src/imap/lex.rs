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

//! Utilities for *writing* values under IMAP's lexical rules.
//!
//! This is write-only since IMAP's lexical syntax is not separable from its
//! grammar; reading happens in `syntax`.
//!
//! The encoding decisions are conservative. A string goes out as an atom
//! only if every character is in `a-zA-Z0-9?=+/_.-` and it is not "NIL"; as
//! a quoted string only if it is under the RFC's 1024-octet bound and free
//! of controls, backslash, double-quote, and 8-bit octets; and as a literal
//! otherwise. Data containing NUL, CR, LF, or 8-bit octets must always take
//! literal form.

use std::io::{self, Write};

use chrono::prelude::*;

use crate::account::model::Flag;
use crate::mime::encoded_word::ew_encode;

#[derive(Clone, Copy, Debug)]
pub struct LexWriter<W> {
    writer: W,
}

impl<W: Write> LexWriter<W> {
    pub fn new(writer: W) -> Self {
        LexWriter { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())
    }

    pub fn verbatim_bytes(&mut self, s: &[u8]) -> io::Result<()> {
        self.writer.write_all(s)
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn astring(&mut self, s: &str) -> io::Result<()> {
        if is_conservative_atom(s) {
            self.verbatim(s)
        } else {
            self.string(s)
        }
    }

    pub fn string(&mut self, s: &str) -> io::Result<()> {
        if is_quotable(s) {
            write!(self.writer, "\"{}\"", s)
        } else {
            self.literal(s.as_bytes())
        }
    }

    pub fn nstring(&mut self, s: &Option<impl AsRef<str>>) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(s.as_ref()),
        }
    }

    /// An nstring position whose value may contain non-ASCII text that is
    /// representable as encoded words (e.g. Content-Description).
    pub fn encoded_nstring(
        &mut self,
        s: &Option<impl AsRef<str>>,
    ) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(&ew_encode(s.as_ref())),
        }
    }

    pub fn mailbox(&mut self, s: &str) -> io::Result<()> {
        self.astring(s)
    }

    pub fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        write!(self.writer, "{{{}}}\r\n", data.len())?;
        self.writer.write_all(data)
    }

    pub fn literal_bytes(&mut self, data: &Vec<u8>) -> io::Result<()> {
        self.literal(data)
    }

    pub fn flag(&mut self, flag: &Flag) -> io::Result<()> {
        write!(self.writer, "{}", flag)
    }

    pub fn date(&mut self, date: &NaiveDate) -> io::Result<()> {
        write!(self.writer, "\"{}\"", date.format("%-d-%b-%Y"))
    }

    /// The RFC 3501 date-time form, `"DD-Mon-YYYY HH:MM:SS +HHMM"` with a
    /// space-padded day.
    pub fn datetime(
        &mut self,
        datetime: &DateTime<FixedOffset>,
    ) -> io::Result<()> {
        write!(
            self.writer,
            "\"{}\"",
            datetime.format("%_d-%b-%Y %H:%M:%S %z")
        )
    }

    pub fn num_u32(&mut self, value: &u32) -> io::Result<()> {
        write!(self.writer, "{}", *value)
    }

    pub fn num_u64(&mut self, value: &u64) -> io::Result<()> {
        write!(self.writer, "{}", *value)
    }
}

fn is_conservative_atom(s: &str) -> bool {
    !"nil".eq_ignore_ascii_case(s)
        && !s.is_empty()
        && s.bytes().all(|b| {
            matches!(
                b,
                b'a'..=b'z'
                    | b'A'..=b'Z'
                    | b'0'..=b'9'
                    | b'='
                    | b'?'
                    | b'/'
                    | b'+'
                    | b'_'
                    | b'.'
                    | b'-'
            )
        })
}

fn is_quotable(s: &str) -> bool {
    s.len() <= 1024
        && s.bytes().all(|b| match b {
            0..=31 | 127..=255 | b'\\' | b'"' => false,
            _ => true,
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn to_str(l: LexWriter<Vec<u8>>) -> String {
        String::from_utf8(l.into_inner()).unwrap()
    }

    #[test]
    fn astring_forms() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.astring("foo").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("nil").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("NIL").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo bar").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo\\ bar").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("föö").unwrap();

        assert_eq!(
            "foo \"nil\" \"NIL\" \"foo bar\" {8}\r\nfoo\\ bar \
             {5}\r\nföö",
            to_str(l),
        );
    }

    #[test]
    fn eight_bit_and_controls_force_literals() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.string("a\r\nb").unwrap();
        assert_eq!("{4}\r\na\r\nb", to_str(l));

        let mut l = LexWriter::new(Vec::<u8>::new());
        l.string("a\u{0}b").unwrap();
        assert_eq!("{3}\r\na\u{0}b", to_str(l));
    }

    #[test]
    fn datetime_format() {
        let dt = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2020, 7, 4, 16, 31, 0)
            .unwrap();
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.datetime(&dt).unwrap();
        assert_eq!("\" 4-Jul-2020 16:31:00 +0100\"", to_str(l));
    }

    #[test]
    fn flags() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.flag(&Flag::Flagged).unwrap();
        l.verbatim(" ").unwrap();
        l.flag(&Flag::Keyword("foo".to_owned())).unwrap();
        assert_eq!("\\Flagged foo", to_str(l));
    }
}
