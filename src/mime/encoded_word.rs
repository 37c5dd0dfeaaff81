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

//! RFC 2047 encoded words.

use std::borrow::Cow;
use std::iter;

use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

use super::quoted_printable::qp_decode;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([!->@-~]*)\?([!->@-~]*)\?([!->@-~]*)\?=$").unwrap();
}

/// Decode all encoded words in the given unstructured string.
///
/// Whitespace between adjacent encoded words is deleted per RFC 2047;
/// whitespace elsewhere is untouched.
pub fn ew_decode_unstructured(text: &str) -> Cow<'_, str> {
    let mut transformed = String::new();

    let mut untransformed_ix = 0;
    let mut word_start = 0;
    let mut last_was_encoded = false;

    for word_end in text
        .as_bytes()
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, c)| c == b' ' || c == b'\t' || c == b'\n' || c == b'\r')
        .map(|(ix, _)| ix)
        .chain(iter::once(text.len()))
    {
        let word = &text[word_start..word_end];

        if let Some(decoded) = ew_decode(word) {
            if !last_was_encoded {
                transformed.push_str(&text[untransformed_ix..word_start]);
            }
            transformed.push_str(&decoded);
            untransformed_ix = word_end;
            last_was_encoded = true;
        } else if !word.is_empty() {
            last_was_encoded = false;
        }

        word_start = word_end + 1;
    }

    if !transformed.is_empty() {
        transformed.push_str(&text[untransformed_ix..]);
        Cow::Owned(transformed)
    } else {
        Cow::Borrowed(text)
    }
}

/// Test if `word` (in its entirety) is an RFC 2047 encoded word; decode it
/// if so.
///
/// Returns `None` if it is not an encoded word or could not be decoded.
/// The RFC's 75-character limit is deliberately not enforced: real agents
/// generate longer words and every major client decodes them.
pub fn ew_decode(word: &str) -> Option<String> {
    let captures = ENCODED_WORD.captures(word)?;

    let charset = captures.get(1).unwrap().as_str();
    let transfer_encoding = captures.get(2).unwrap().as_str();
    let mut content =
        Cow::Borrowed(captures.get(3).unwrap().as_str().as_bytes());

    // _ stands for ASCII space regardless of charset, before transfer
    // decoding.
    if content.contains(&b'_') {
        for b in content.to_mut() {
            if *b == b'_' {
                *b = b' ';
            }
        }
    }

    let content = decode_xfer(transfer_encoding, &content)?;
    decode_charset(charset, &content).map(|r| r.into_owned())
}

/// Encode `s` as one or more encoded words if it is not pure ASCII;
/// otherwise return it borrowed.
///
/// Used when 8-bit header data must cross a 7-bit-only position in a
/// response (e.g. BODYSTRUCTURE Content-Description).
pub fn ew_encode(s: &str) -> Cow<'_, str> {
    if s.is_ascii() {
        return Cow::Borrowed(s);
    }

    let mut total_accum = String::new();
    let mut part_accum = String::new();
    let mut first = true;
    // Copy whole characters one at a time, breaking into separate words
    // before the base64 form can exceed the 75-character limit. Multi-byte
    // characters may not be split, hence the conservative cut-off.
    for c in s.chars() {
        part_accum.push(c);
        if part_accum.len() > 40 {
            encode_part(&mut total_accum, &part_accum, first);
            part_accum.clear();
            first = false;
        }
    }

    encode_part(&mut total_accum, &part_accum, first);
    Cow::Owned(total_accum)
}

fn encode_part(dst: &mut String, src: &str, first: bool) {
    if src.is_empty() {
        return;
    }

    if !first {
        dst.push(' ');
    }

    dst.push_str("=?utf-8?b?");
    dst.push_str(&base64::encode_config(src, base64::STANDARD_NO_PAD));
    dst.push_str("?=");
}

fn decode_xfer<'a>(xfer: &str, content: &'a [u8]) -> Option<Cow<'a, [u8]>> {
    match xfer {
        "q" | "Q" => Some(qp_decode(content)),
        "b" | "B" => base64::decode(content).ok().map(Cow::Owned),
        _ => None,
    }
}

fn decode_charset<'a>(
    charset: &str,
    content: &'a [u8],
) -> Option<Cow<'a, str>> {
    // RFC 2184 allows a language suffix on the charset; discard it.
    let charset = charset.split('*').next().unwrap();

    Some(
        Encoding::for_label_no_replacement(charset.as_bytes())?
            .decode_with_bom_removal(content)
            .0,
    )
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decode_words() {
        assert_eq!(None, ew_decode("hello world"));
        assert_eq!("test", ew_decode("=?us-ascii?q?test?=").unwrap());

        // Examples from RFC 2047
        assert_eq!(
            "Keith Moore",
            ew_decode("=?US-ASCII?Q?Keith_Moore?=").unwrap()
        );
        assert_eq!(
            "Keld Jørn Simonsen",
            ew_decode("=?ISO-8859-1?Q?Keld_J=F8rn_Simonsen?=").unwrap()
        );
        assert_eq!("André", ew_decode("=?ISO-8859-1?Q?Andr=E9?=").unwrap());
        assert_eq!(
            "If you can read this yo",
            ew_decode("=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?=")
                .unwrap()
        );
        // RFC 2045 language suffix silliness
        assert_eq!(
            "Keith Moore",
            ew_decode("=?US-ASCII*EN?Q?Keith_Moore?=").unwrap()
        );
    }

    #[test]
    fn decode_unstructured() {
        assert_eq!("hello world", ew_decode_unstructured("hello world"));
        assert_eq!(
            "this is a test",
            ew_decode_unstructured("=?us-ascii?q?this?= is a test")
        );
        assert_eq!(
            "this isa test",
            ew_decode_unstructured(
                "this =?us-ascii?q?is?= \t\r\n=?us-ascii?q?a?= test"
            )
        );
        assert_eq!("", ew_decode_unstructured(""));
    }

    #[test]
    fn encode_round_trips() {
        assert_eq!("plain", ew_encode("plain"));
        let encoded = ew_encode("föö bär");
        assert_eq!("föö bär", ew_decode(&encoded).unwrap());
    }

    proptest! {
        #[test]
        fn ew_decode_never_panics(s in r"=\?(.*|us-ascii)\?(.*|q|b)\?.*\?=") {
            ew_decode(&s);
        }
    }
}
