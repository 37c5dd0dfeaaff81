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

//! Parsers for individual RFC 2822 header values.
//!
//! These implement the "obsolete"-inclusive grammar, which is 8-bit clean
//! and far more permissive than the strict productions; real mail requires
//! it. All parsers here are total: garbage input yields `None` or an empty
//! list, never a panic, because the input is whatever some mail agent wrote
//! a decade ago.

use std::borrow::Cow;

use chrono::prelude::*;

use super::encoded_word::ew_decode;

/// One parsed RFC 2822 mailbox (display-name + addr-spec).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mailbox {
    /// The display name, decoded, if present.
    pub name: Option<String>,
    /// The local part of the address.
    pub local: String,
    /// The domain of the address.
    pub domain: String,
}

/// One entry of an address list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Mailbox(Mailbox),
    Group { name: String, boxes: Vec<Mailbox> },
}

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub typ: String,
    pub subtype: String,
    pub parms: Vec<(String, String)>,
}

impl ContentType {
    pub fn is_type(&self, typ: &str) -> bool {
        self.typ.eq_ignore_ascii_case(typ)
    }

    pub fn is(&self, typ: &str, subtype: &str) -> bool {
        self.is_type(typ) && self.subtype.eq_ignore_ascii_case(subtype)
    }

    pub fn parm(&self, name: &str) -> Option<&str> {
        self.parms
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl Default for ContentType {
    /// The RFC 2045 default for a part with no Content-Type header.
    fn default() -> Self {
        ContentType {
            typ: "text".to_owned(),
            subtype: "plain".to_owned(),
            parms: vec![(
                "charset".to_owned(),
                "us-ascii".to_owned(),
            )],
        }
    }
}

/// A parsed `Content-Disposition` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    pub disposition: String,
    pub parms: Vec<(String, String)>,
}

/// Parse an address-list header value (From, To, CC, BCC, Sender,
/// Reply-To).
///
/// Unparsable fragments are skipped rather than failing the whole list.
pub fn parse_address_list(value: &[u8]) -> Vec<Address> {
    let mut p = Cursor::new(value);
    let mut addresses = Vec::new();

    loop {
        p.skip_cfws();
        while p.eat(b',') {
            p.skip_cfws();
        }
        if p.at_end() {
            break;
        }

        match parse_address(&mut p) {
            Some(addr) => addresses.push(addr),
            // Resynchronise at the next comma so one bad entry doesn't
            // swallow the rest of the list.
            None => {
                while !p.at_end() && !p.eat(b',') {
                    p.ix += 1;
                }
            },
        }
    }

    addresses
}

fn parse_address(p: &mut Cursor<'_>) -> Option<Address> {
    // Try a bare addr-spec first; `foo@bar.com, ...` is the common case.
    let save = p.ix;
    if let Some((local, domain)) = parse_addr_spec(p) {
        return Some(Address::Mailbox(Mailbox {
            name: None,
            local,
            domain,
        }));
    }
    p.ix = save;

    let name_words = parse_phrase(p);
    p.skip_cfws();

    if p.eat(b':') {
        // Group.
        let mut boxes = Vec::new();
        loop {
            p.skip_cfws();
            while p.eat(b',') {
                p.skip_cfws();
            }
            if p.eat(b';') || p.at_end() {
                break;
            }
            match parse_mailbox(p) {
                Some(mb) => boxes.push(mb),
                None => {
                    while !p.at_end()
                        && p.peek() != Some(b',')
                        && p.peek() != Some(b';')
                    {
                        p.ix += 1;
                    }
                },
            }
        }
        return Some(Address::Group {
            name: decode_phrase(&name_words),
            boxes,
        });
    }

    if p.eat(b'<') {
        let (local, domain) = parse_angle_tail(p)?;
        return Some(Address::Mailbox(Mailbox {
            name: if name_words.is_empty() {
                None
            } else {
                Some(decode_phrase(&name_words))
            },
            local,
            domain,
        }));
    }

    None
}

fn parse_mailbox(p: &mut Cursor<'_>) -> Option<Mailbox> {
    let save = p.ix;
    if let Some((local, domain)) = parse_addr_spec(p) {
        return Some(Mailbox {
            name: None,
            local,
            domain,
        });
    }
    p.ix = save;

    let name_words = parse_phrase(p);
    p.skip_cfws();
    if !p.eat(b'<') {
        return None;
    }
    let (local, domain) = parse_angle_tail(p)?;
    Some(Mailbox {
        name: if name_words.is_empty() {
            None
        } else {
            Some(decode_phrase(&name_words))
        },
        local,
        domain,
    })
}

/// Parse the content of an angle-addr after the `<`, including the RFC 2822
/// §4.4 obsolete routing information, which is discarded.
fn parse_angle_tail(p: &mut Cursor<'_>) -> Option<(String, String)> {
    p.skip_cfws();
    if Some(b'@') == p.peek() {
        while let Some(b) = p.peek() {
            p.ix += 1;
            if b == b':' {
                break;
            }
            if b == b'>' {
                return None;
            }
        }
    }

    let spec = parse_addr_spec(p)?;
    p.skip_cfws();
    p.eat(b'>');
    Some(spec)
}

fn parse_addr_spec(p: &mut Cursor<'_>) -> Option<(String, String)> {
    let local = parse_dotted_words(p)?;
    p.skip_cfws();
    if !p.eat(b'@') {
        return None;
    }
    p.skip_cfws();

    let domain = if Some(b'[') == p.peek() {
        // Domain literal, kept verbatim including brackets.
        let start = p.ix;
        while let Some(b) = p.peek() {
            p.ix += 1;
            if b == b']' {
                break;
            }
        }
        String::from_utf8_lossy(&p.data[start..p.ix]).into_owned()
    } else {
        parse_dotted_words(p)?
    };

    Some((local, domain))
}

/// `word *("." word)`, joined back together with dots. Covers dot-atoms,
/// quoted-string locals, and the obsolete `word . word` form.
fn parse_dotted_words(p: &mut Cursor<'_>) -> Option<String> {
    let mut out = parse_word(p)?;
    loop {
        let save = p.ix;
        p.skip_cfws();
        if !p.eat(b'.') {
            p.ix = save;
            break;
        }
        p.skip_cfws();
        match parse_word(p) {
            Some(w) => {
                out.push('.');
                out.push_str(&w);
            },
            None => {
                p.ix = save;
                break;
            },
        }
    }
    Some(out)
}

/// Phrase: a run of words, with the obsolete unquoted-dot extension.
fn parse_phrase(p: &mut Cursor<'_>) -> Vec<String> {
    let mut words = Vec::new();
    loop {
        let save = p.ix;
        p.skip_cfws();
        if let Some(w) = parse_word(p) {
            words.push(w);
        } else if !words.is_empty() && p.eat(b'.') {
            words.push(".".to_owned());
        } else {
            p.ix = save;
            break;
        }
    }
    words
}

fn parse_word(p: &mut Cursor<'_>) -> Option<String> {
    p.skip_cfws();
    match p.peek() {
        Some(b'"') => {
            p.ix += 1;
            let mut out = Vec::new();
            while let Some(b) = p.peek() {
                p.ix += 1;
                match b {
                    b'"' => break,
                    b'\\' => {
                        if let Some(next) = p.peek() {
                            out.push(next);
                            p.ix += 1;
                        }
                    },
                    b'\r' | b'\n' => out.push(b' '),
                    b => out.push(b),
                }
            }
            Some(String::from_utf8_lossy(&out).into_owned())
        },
        Some(b) if is_atext(b) => {
            let start = p.ix;
            while p.peek().is_some_and(is_atext) {
                p.ix += 1;
            }
            Some(String::from_utf8_lossy(&p.data[start..p.ix]).into_owned())
        },
        _ => None,
    }
}

/// Join phrase words into a display string, decoding encoded words and
/// deleting the whitespace between adjacent encoded words.
fn decode_phrase(words: &[String]) -> String {
    let mut out = String::new();
    let mut last_was_encoded = false;
    for word in words {
        match ew_decode(word) {
            Some(decoded) => {
                if !out.is_empty() && !last_was_encoded {
                    out.push(' ');
                }
                out.push_str(&decoded);
                last_was_encoded = true;
            },
            None => {
                if !out.is_empty() && "." != word {
                    out.push(' ');
                }
                out.push_str(word);
                last_was_encoded = false;
            },
        }
    }
    out
}

// RFC 2822 atext, amended by RFC 6532 to include all non-ASCII octets.
fn is_atext(ch: u8) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            b'!' | b'#'..=b'\'' | b'*' | b'+' | b'-' | b'/' | b'=' | b'?'
                | b'^' | b'_' | b'`' | b'{'..=b'~'
        )
        || ch >= 0x80
}

/// Parse an RFC 2822 date-time, including the obsolete 2/3-digit years and
/// named zones.
pub fn parse_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    let stripped = strip_comments(value.as_bytes());
    let value = String::from_utf8_lossy(&stripped);
    // Discard the optional day-of-week.
    let value = match value.split_once(',') {
        Some((_, rest)) => rest,
        None => value.as_ref(),
    };

    let mut tokens = value.split_ascii_whitespace();

    let day: u32 = tokens.next()?.parse().ok()?;
    let month = month_number(tokens.next()?)?;
    let year_str = tokens.next()?;
    let mut year: i32 = year_str.parse().ok()?;
    // RFC 2822 §4.3 Y2K interpretations.
    if year_str.len() == 2 && year < 50 {
        year += 2000;
    } else if year_str.len() < 4 {
        year += 1900;
    }

    let time = tokens.next()?;
    let mut hms = time.split(':');
    let hour: u32 = hms.next()?.parse().ok()?;
    let minute: u32 = hms.next()?.parse().ok()?;
    let second: u32 = hms.next().map_or(Some(0), |s| s.parse().ok())?;

    let zone = tokens.next().map_or(0, zone_offset_minutes);

    FixedOffset::east_opt(zone * 60).and_then(|off| {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .and_then(|dt| off.from_local_datetime(&dt).latest())
    })
}

fn month_number(name: &str) -> Option<u32> {
    static MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep",
        "oct", "nov", "dec",
    ];
    let name = name.get(..3)?;
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|ix| ix as u32 + 1)
}

fn zone_offset_minutes(zone: &str) -> i32 {
    if let Some(rest) = zone.strip_prefix('+') {
        return numeric_zone(rest);
    }
    if let Some(rest) = zone.strip_prefix('-') {
        return -numeric_zone(rest);
    }

    match zone.to_ascii_uppercase().as_str() {
        "UT" | "GMT" | "UTC" | "Z" => 0,
        "EDT" => -4 * 60,
        "EST" | "CDT" => -5 * 60,
        "CST" | "MDT" => -6 * 60,
        "MST" | "PDT" => -7 * 60,
        "PST" => -8 * 60,
        // Military zones and unknown names are defined by RFC 2822 to be
        // treated as +0000.
        _ => 0,
    }
}

fn numeric_zone(digits: &str) -> i32 {
    if digits.len() != 4 {
        return 0;
    }
    let Ok(n) = digits.parse::<i32>() else {
        return 0;
    };
    (n / 100) * 60 + (n % 100)
}

/// Parse a Content-Type header value.
pub fn parse_content_type(value: &[u8]) -> Option<ContentType> {
    let mut p = Cursor::new(value);
    p.skip_cfws();
    let typ = parse_token(&mut p)?;
    p.skip_cfws();
    if !p.eat(b'/') {
        return None;
    }
    p.skip_cfws();
    let subtype = parse_token(&mut p)?;
    let parms = parse_parms(&mut p);

    Some(ContentType {
        typ,
        subtype,
        parms,
    })
}

/// Parse a Content-Disposition header value.
pub fn parse_content_disposition(value: &[u8]) -> Option<ContentDisposition> {
    let mut p = Cursor::new(value);
    p.skip_cfws();
    let disposition = parse_token(&mut p)?;
    let parms = parse_parms(&mut p);
    Some(ContentDisposition {
        disposition,
        parms,
    })
}

fn parse_parms(p: &mut Cursor<'_>) -> Vec<(String, String)> {
    let mut parms = Vec::new();
    loop {
        p.skip_cfws();
        if !p.eat(b';') {
            break;
        }
        p.skip_cfws();
        let Some(name) = parse_token(p) else {
            continue;
        };
        p.skip_cfws();
        if !p.eat(b'=') {
            continue;
        }
        p.skip_cfws();
        let value = match p.peek() {
            Some(b'"') => parse_word(p),
            _ => parse_token(p),
        };
        if let Some(value) = value {
            parms.push((name, value));
        }
    }
    parms
}

// RFC 2045 token: anything but controls, space, and tspecials.
fn parse_token(p: &mut Cursor<'_>) -> Option<String> {
    fn is_token_char(ch: u8) -> bool {
        !matches!(
            ch,
            0..=b' '
                | 127
                | b'('
                | b')'
                | b'<'
                | b'>'
                | b'@'
                | b','
                | b';'
                | b':'
                | b'\\'
                | b'"'
                | b'/'
                | b'['
                | b']'
                | b'?'
                | b'='
        )
    }

    let start = p.ix;
    while p.peek().is_some_and(is_token_char) {
        p.ix += 1;
    }
    if p.ix == start {
        None
    } else {
        Some(String::from_utf8_lossy(&p.data[start..p.ix]).into_owned())
    }
}

fn strip_comments(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut depth = 0usize;
    let mut ix = 0;
    while ix < value.len() {
        match value[ix] {
            b'(' => depth += 1,
            b')' if depth > 0 => depth -= 1,
            b'\\' if depth > 0 => ix += 1,
            b if depth == 0 => out.push(b),
            _ => (),
        }
        ix += 1;
    }
    out
}

/// The raw value of a header with line folding removed, as a string.
pub fn unfold(value: &[u8]) -> Cow<'_, str> {
    if !value.contains(&b'\n') {
        return String::from_utf8_lossy(value);
    }

    let mut out = Vec::with_capacity(value.len());
    for &b in value {
        if b != b'\r' && b != b'\n' {
            out.push(b);
        }
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

struct Cursor<'a> {
    data: &'a [u8],
    ix: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, ix: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.ix).copied()
    }

    fn at_end(&self) -> bool {
        self.ix >= self.data.len()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if Some(ch) == self.peek() {
            self.ix += 1;
            true
        } else {
            false
        }
    }

    /// Skip comments and folding whitespace, with nesting and quoted pairs.
    fn skip_cfws(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.ix += 1;
                },
                Some(b'(') => {
                    self.ix += 1;
                    let mut depth = 1usize;
                    while depth > 0 {
                        match self.peek() {
                            Some(b'(') => depth += 1,
                            Some(b')') => depth -= 1,
                            Some(b'\\') => self.ix += 1,
                            None => return,
                            _ => (),
                        }
                        self.ix += 1;
                    }
                },
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mb(name: Option<&str>, local: &str, domain: &str) -> Mailbox {
        Mailbox {
            name: name.map(str::to_owned),
            local: local.to_owned(),
            domain: domain.to_owned(),
        }
    }

    #[test]
    fn address_forms() {
        assert_eq!(
            vec![Address::Mailbox(mb(None, "foo", "bar.com"))],
            parse_address_list(b"foo@bar.com")
        );
        assert_eq!(
            vec![Address::Mailbox(mb(
                Some("John Doe"),
                "jdoe",
                "machine.example"
            ))],
            parse_address_list(b"John Doe <jdoe@machine.example>")
        );
        assert_eq!(
            vec![Address::Mailbox(mb(
                Some("Joe Q. Public"),
                "john.q.public",
                "example.com"
            ))],
            parse_address_list(
                b"\"Joe Q. Public\" <john.q.public@example.com>"
            )
        );
        assert_eq!(
            vec![
                Address::Mailbox(mb(Some("Mary Smith"), "mary", "x.test")),
                Address::Mailbox(mb(None, "jdoe", "example.org")),
                Address::Mailbox(mb(Some("Who?"), "one", "y.test")),
            ],
            parse_address_list(
                b"Mary Smith <mary@x.test>, jdoe@example.org, \
                  Who? <one@y.test>"
            )
        );
    }

    #[test]
    fn address_groups() {
        assert_eq!(
            vec![Address::Group {
                name: "A Group".to_owned(),
                boxes: vec![
                    mb(Some("Chris Jones"), "c", "a.test"),
                    mb(None, "joe", "where.test"),
                ],
            }],
            parse_address_list(
                b"A Group:Chris Jones <c@a.test>, joe@where.test;"
            )
        );
        assert_eq!(
            vec![Address::Group {
                name: "Undisclosed recipients".to_owned(),
                boxes: vec![],
            }],
            parse_address_list(b"Undisclosed recipients:;")
        );
    }

    #[test]
    fn address_obsolete_and_damaged_forms() {
        // Comments and extra whitespace.
        assert_eq!(
            vec![Address::Mailbox(mb(Some("Pete"), "pete", "silly.test"))],
            parse_address_list(
                b"Pete(A nice \\) chap) <pete(his account)@\
                  silly.test(his host)>"
            )
        );

        // Encoded word in display name.
        assert_eq!(
            vec![Address::Mailbox(mb(
                Some("Nobody in particular"),
                "nobody",
                "example.com"
            ))],
            parse_address_list(
                b"=?utf-8?q?Nobody_in_particular?= <nobody@example.com>"
            )
        );

        // Unparsable garbage does not take the rest of the list with it.
        assert_eq!(
            vec![Address::Mailbox(mb(None, "ok", "example.com"))],
            parse_address_list(b"<<<garbage, ok@example.com")
        );
    }

    #[test]
    fn datetimes() {
        let dt = parse_datetime("Fri, 21 Nov 1997 09:55:06 -0600").unwrap();
        assert_eq!("1997-11-21T09:55:06-06:00", dt.to_rfc3339());

        let dt =
            parse_datetime("21 Nov 97 09:55:06 GMT (comment)").unwrap();
        assert_eq!("1997-11-21T09:55:06+00:00", dt.to_rfc3339());

        let dt = parse_datetime("Thu, 13\n      Feb\n        1969\n  \
                                 23:32\n               -0330")
            .unwrap();
        assert_eq!("1969-02-13T23:32:00-03:30", dt.to_rfc3339());

        assert_eq!(None, parse_datetime("not a date"));
    }

    #[test]
    fn content_types() {
        let ct =
            parse_content_type(b"text/plain; charset=\"US-ASCII\"").unwrap();
        assert!(ct.is("text", "plain"));
        assert_eq!(Some("US-ASCII"), ct.parm("charset"));

        let ct = parse_content_type(
            b"multipart/mixed;\r\n boundary=\"simple boundary\"",
        )
        .unwrap();
        assert!(ct.is_type("multipart"));
        assert_eq!(Some("simple boundary"), ct.parm("boundary"));

        assert_eq!(None, parse_content_type(b"garbage"));
    }

    #[test]
    fn content_dispositions() {
        let cd = parse_content_disposition(
            b"attachment; filename=\"foo.dat\"",
        )
        .unwrap();
        assert_eq!("attachment", cd.disposition);
        assert_eq!(
            vec![("filename".to_owned(), "foo.dat".to_owned())],
            cd.parms
        );
    }
}
