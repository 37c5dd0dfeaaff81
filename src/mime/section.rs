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

//! Resolution of `BODY[section]` specifications against a part tree.

use std::borrow::Cow;
use std::ops::Range;

use super::part::Part;

/// A parsed section specification, independent of the wire syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionSpec {
    pub subscripts: Vec<u32>,
    pub text: Option<SectionText>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionText {
    /// `HEADER`: the full header block of a message, including the blank
    /// line.
    Header,
    /// `HEADER.FIELDS` / `HEADER.FIELDS.NOT`.
    HeaderFields {
        negative: bool,
        headers: Vec<String>,
    },
    /// `TEXT`: the body of a message.
    Text,
    /// `MIME`: the part's own MIME header block.
    Mime,
}

/// Resolve `spec` against the message rooted at `root`, yielding the
/// content octets.
///
/// Returns `None` for sections that do not exist in this message (RFC 3501
/// defines fetching those as returning NIL-ish empty content; the caller
/// maps `None` to an empty literal).
pub fn fetch_section<'a>(
    data: &'a [u8],
    root: &Part,
    spec: &SectionSpec,
) -> Option<Cow<'a, [u8]>> {
    let mut part = root;
    let mut at_message = true;

    for (ix, &sub) in spec.subscripts.iter().enumerate() {
        if 0 == sub {
            return None;
        }

        // Subscripts within an rfc822 part number the embedded message's
        // parts.
        let content = embedded_message(part);

        if content.is_multipart() {
            part = content.children.get(sub as usize - 1)?;
        } else if 1 == sub && ix + 1 == spec.subscripts.len() {
            // A non-multipart body can be addressed as part 1 of its
            // message.
            part = content;
        } else {
            return None;
        }
        at_message = false;
    }

    let range = match spec.text {
        None => {
            if spec.subscripts.is_empty() {
                // BODY[]: the entire message.
                full_range(part)
            } else {
                part.body_range.clone()
            }
        },
        Some(SectionText::Header) => {
            let msg = target_message(part, at_message)?;
            msg.headers_range.start..msg.body_range.start
        },
        Some(SectionText::Text) => {
            let msg = target_message(part, at_message)?;
            msg.body_range.clone()
        },
        Some(SectionText::Mime) => {
            // MIME is only valid after a part number.
            if spec.subscripts.is_empty() {
                return None;
            }
            part.headers_range.start..part.body_range.start
        },
        Some(SectionText::HeaderFields {
            negative,
            ref headers,
        }) => {
            let msg = target_message(part, at_message)?;
            return Some(Cow::Owned(filter_headers(
                data, msg, negative, headers,
            )));
        },
    };

    Some(Cow::Borrowed(&data[range]))
}

/// The embedded message of an rfc822 part, or the part itself.
fn embedded_message(part: &Part) -> &Part {
    if part.is_message_rfc822() && 1 == part.children.len() {
        &part.children[0]
    } else {
        part
    }
}

/// The message that `HEADER`/`TEXT` apply to after subscript navigation.
fn target_message(part: &Part, at_message: bool) -> Option<&Part> {
    if at_message {
        Some(part)
    } else if part.is_message_rfc822() {
        Some(embedded_message(part))
    } else {
        None
    }
}

fn full_range(part: &Part) -> Range<usize> {
    part.headers_range.start..part.body_range.end
}

fn filter_headers(
    data: &[u8],
    msg: &Part,
    negative: bool,
    names: &[String],
) -> Vec<u8> {
    let mut out = Vec::new();
    for header in &msg.headers {
        let listed = names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&header.name));
        if listed != negative {
            out.extend_from_slice(&data[header.raw.clone()]);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const MESSAGE: &str = "From: fred@example.com\n\
                           Subject: sections\n\
                           Content-Type: multipart/mixed; boundary=b\n\
                           \n\
                           --b\n\
                           Content-Type: text/plain\n\
                           \n\
                           part one\n\
                           --b\n\
                           Content-Type: message/rfc822\n\
                           \n\
                           Subject: inner\n\
                           \n\
                           inner body\n\
                           --b--\n";

    fn fetch(spec: &SectionSpec) -> Option<Vec<u8>> {
        let data = MESSAGE.replace('\n', "\r\n").into_bytes();
        let root = Part::parse(&data);
        fetch_section(&data, &root, spec).map(|c| c.into_owned())
    }

    fn s(subscripts: &[u32], text: Option<SectionText>) -> SectionSpec {
        SectionSpec {
            subscripts: subscripts.to_vec(),
            text,
        }
    }

    #[test]
    fn whole_message() {
        let got = fetch(&s(&[], None)).unwrap();
        assert_eq!(MESSAGE.replace('\n', "\r\n").into_bytes(), got);
    }

    #[test]
    fn header_and_text() {
        let header = fetch(&s(&[], Some(SectionText::Header))).unwrap();
        assert!(header.starts_with(b"From: fred@example.com\r\n"));
        assert!(header.ends_with(b"\r\n\r\n"));

        let text = fetch(&s(&[], Some(SectionText::Text))).unwrap();
        assert!(text.starts_with(b"--b\r\n"));
    }

    #[test]
    fn numbered_parts() {
        assert_eq!(b"part one".to_vec(), fetch(&s(&[1], None)).unwrap());

        // Part 2 is the embedded message; its content is the full inner
        // message.
        let inner = fetch(&s(&[2], None)).unwrap();
        assert!(inner.starts_with(b"Subject: inner\r\n"));

        // 2.HEADER and 2.TEXT address the embedded message.
        let inner_hdr =
            fetch(&s(&[2], Some(SectionText::Header))).unwrap();
        assert_eq!(b"Subject: inner\r\n\r\n".to_vec(), inner_hdr);
        assert_eq!(
            b"inner body".to_vec(),
            fetch(&s(&[2], Some(SectionText::Text))).unwrap()
        );

        // 2.1 is the body of the embedded (non-multipart) message.
        assert_eq!(
            b"inner body".to_vec(),
            fetch(&s(&[2, 1], None)).unwrap()
        );

        assert_eq!(None, fetch(&s(&[3], None)));
        assert_eq!(None, fetch(&s(&[0], None)));
    }

    #[test]
    fn mime_header() {
        let mime = fetch(&s(&[1], Some(SectionText::Mime))).unwrap();
        assert_eq!(b"Content-Type: text/plain\r\n\r\n".to_vec(), mime);
        // MIME without a part number is invalid.
        assert_eq!(None, fetch(&s(&[], Some(SectionText::Mime))));
    }

    #[test]
    fn header_fields() {
        let got = fetch(&s(
            &[],
            Some(SectionText::HeaderFields {
                negative: false,
                headers: vec!["subject".to_owned()],
            }),
        ))
        .unwrap();
        assert_eq!(b"Subject: sections\r\n\r\n".to_vec(), got);

        let got = fetch(&s(
            &[],
            Some(SectionText::HeaderFields {
                negative: true,
                headers: vec!["subject".to_owned()],
            }),
        ))
        .unwrap();
        assert!(got.starts_with(b"From: fred@example.com\r\n"));
        assert!(!got
            .windows(b"Subject".len())
            .any(|w| w.eq_ignore_ascii_case(b"Subject")));
    }
}
