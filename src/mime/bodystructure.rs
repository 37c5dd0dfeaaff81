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

//! Computation of the RFC 3501 `BODY`/`BODYSTRUCTURE` data.
//!
//! The wire format is wildly non-uniform across content types; this module
//! computes the union of every field for every part, and the fetch layer
//! transforms the result into the convoluted wire shape. The mapping,
//! with § marking the basic/extended boundary:
//!
//! - `multipart/*`: (child)(child)(...) content-subtype §
//!   (content-type-parms) (content-disposition parms) content-language
//!   content-location
//! - `message/rfc822`: type subtype (parms) content-id content-description
//!   content-transfer-encoding size-octets (envelope) (bodystructure)
//!   size-lines § md5 (disposition) language location
//! - `text/*`: type subtype (parms) content-id content-description
//!   content-transfer-encoding size-octets size-lines § …
//! - `*/*`: type subtype (parms) content-id content-description
//!   content-transfer-encoding size-octets § …
//!
//! Headers here can legally contain octets outside latin-1 even though the
//! wire can't always carry them; `content_description` is decoded and
//! re-encoded as encoded words on output, while id/location fall back to
//! raw 8-bit and get sent as literals.

use super::encoded_word::ew_decode_unstructured;
use super::envelope::{self, Envelope};
use super::header;
use super::part::Part;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyStructure {
    /// The content type and subtype of this part.
    pub content_type: (String, String),
    /// Parameters on the content type, flattened to name/value pairs.
    pub content_type_parms: Vec<(String, String)>,
    /// The `Content-Disposition`, if set.
    pub content_disposition: Option<String>,
    pub content_disposition_parms: Vec<(String, String)>,
    pub content_language: Option<String>,
    pub content_location: Option<String>,
    pub content_id: Option<String>,
    /// The `Content-Description`, decoded.
    pub content_description: Option<String>,
    /// The `Content-Transfer-Encoding`, defaulting to `7BIT`.
    pub content_transfer_encoding: String,
    /// Size of the content in encoded form.
    pub size_octets: u32,
    /// Lines of the content in encoded form.
    pub size_lines: u32,
    /// The envelope of this part's headers (only sent for message/rfc822).
    pub envelope: Envelope,
    /// Children of a multipart, or the single embedded message of a
    /// message/rfc822.
    pub children: Vec<BodyStructure>,
}

impl BodyStructure {
    pub fn is_multipart(&self) -> bool {
        self.content_type.0.eq_ignore_ascii_case("multipart")
    }

    pub fn is_message_rfc822(&self) -> bool {
        self.content_type.0.eq_ignore_ascii_case("message")
            && self.content_type.1.eq_ignore_ascii_case("rfc822")
    }

    pub fn is_text(&self) -> bool {
        self.content_type.0.eq_ignore_ascii_case("text")
    }
}

/// Compute the body structure of the (sub)message rooted at `part`.
pub fn body_structure(data: &[u8], part: &Part) -> BodyStructure {
    let mut bs = BodyStructure {
        content_type: (
            part.content_type.typ.clone(),
            part.content_type.subtype.clone(),
        ),
        content_type_parms: part.content_type.parms.clone(),
        content_transfer_encoding: part
            .header("Content-Transfer-Encoding")
            .map(|v| header::unfold(v).trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "7BIT".to_owned()),
        content_id: part
            .header("Content-ID")
            .map(|v| header::unfold(v).trim().to_owned()),
        content_description: part.header("Content-Description").map(|v| {
            ew_decode_unstructured(&header::unfold(v)).into_owned()
        }),
        content_language: part
            .header("Content-Language")
            .map(|v| header::unfold(v).trim().to_owned()),
        content_location: part
            .header("Content-Location")
            .map(|v| header::unfold(v).trim().to_owned()),
        size_octets: part.body_range.len() as u32,
        size_lines: part.body_lines(data),
        envelope: envelope::envelope(part),
        children: part
            .children
            .iter()
            .map(|child| body_structure(data, child))
            .collect(),
        ..Default::default()
    };

    if let Some(cd) = part
        .header("Content-Disposition")
        .and_then(|v| header::parse_content_disposition(v))
    {
        bs.content_disposition = Some(cd.disposition);
        bs.content_disposition_parms = cd.parms;
    }

    bs
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(message: &str) -> (Vec<u8>, BodyStructure) {
        let data = message.replace('\n', "\r\n").into_bytes();
        let part = Part::parse(&data);
        let bs = body_structure(&data, &part);
        (data, bs)
    }

    #[test]
    fn simple_text() {
        let (_, bs) = parse(
            "Content-Type: text/plain; charset=US-ASCII\n\
             \n\
             Hello.\n",
        );
        assert_eq!(
            ("text".to_owned(), "plain".to_owned()),
            bs.content_type
        );
        assert_eq!(
            vec![("charset".to_owned(), "US-ASCII".to_owned())],
            bs.content_type_parms
        );
        assert_eq!("7BIT", bs.content_transfer_encoding);
        assert_eq!(8, bs.size_octets);
        assert_eq!(1, bs.size_lines);
        assert!(bs.children.is_empty());
    }

    #[test]
    fn multipart_structure() {
        let (_, bs) = parse(
            "Content-Type: multipart/mixed; boundary=bound\n\
             \n\
             --bound\n\
             Content-Type: text/plain\n\
             Content-Transfer-Encoding: quoted-printable\n\
             \n\
             A\n\
             --bound\n\
             Content-Type: image/png\n\
             Content-Disposition: attachment; filename=x.png\n\
             Content-Description: =?utf-8?q?a_picture?=\n\
             \n\
             B\n\
             --bound--\n",
        );
        assert!(bs.is_multipart());
        assert_eq!(2, bs.children.len());
        assert_eq!(
            "QUOTED-PRINTABLE".to_ascii_uppercase(),
            bs.children[0].content_transfer_encoding.to_ascii_uppercase()
        );
        assert_eq!(
            Some("attachment".to_owned()),
            bs.children[1].content_disposition
        );
        assert_eq!(
            vec![("filename".to_owned(), "x.png".to_owned())],
            bs.children[1].content_disposition_parms
        );
        assert_eq!(
            Some("a picture".to_owned()),
            bs.children[1].content_description
        );
    }

    #[test]
    fn embedded_message() {
        let (_, bs) = parse(
            "Content-Type: message/rfc822\n\
             \n\
             Subject: inner\n\
             \n\
             inner body\n",
        );
        assert!(bs.is_message_rfc822());
        assert_eq!(1, bs.children.len());
        assert_eq!(
            Some("inner".to_owned()),
            bs.children[0].envelope.subject
        );
    }
}
