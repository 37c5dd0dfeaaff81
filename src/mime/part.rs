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

//! Segmentation of a buffered message into its MIME part tree.
//!
//! MH messages are individual files of very ordinary size, and FETCH BODY[]
//! needs the full octets anyway, so the whole message is held in memory and
//! parts are represented as byte ranges into it. Nothing here decodes
//! transfer encodings; the ranges always measure the encoded form, which is
//! what RFC 3501 sizes and sections are defined over.

use std::ops::Range;

use super::header::{self, ContentType};

/// Nesting depth bound. Anything deeper is treated as an opaque leaf; mail
/// nested that far is hostile, not real.
const MAX_DEPTH: u32 = 20;

/// One header of a part.
#[derive(Debug, Clone)]
pub struct Header {
    /// The header name in its original case.
    pub name: String,
    /// The header value: the bytes after the colon (and one optional space),
    /// folding intact.
    pub value: Vec<u8>,
    /// The range of the complete folded header line(s) in the message,
    /// including the final CRLF.
    pub raw: Range<usize>,
}

/// One part of a message; the root `Part` is the message itself.
#[derive(Debug, Clone)]
pub struct Part {
    /// Range of this part's header block, excluding the blank separator
    /// line.
    pub headers_range: Range<usize>,
    /// Range of this part's body, i.e. everything after the blank line.
    pub body_range: Range<usize>,
    pub headers: Vec<Header>,
    pub content_type: ContentType,
    /// Children: the enclosed parts of a multipart, or the single embedded
    /// message of a message/rfc822.
    pub children: Vec<Part>,
}

impl Part {
    /// Parse the full message in `data`.
    pub fn parse(data: &[u8]) -> Part {
        parse_range(data, 0..data.len(), 0)
    }

    /// The first header with the given name, if any.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.is_type("multipart")
    }

    pub fn is_message_rfc822(&self) -> bool {
        self.content_type.is("message", "rfc822")
    }

    /// Number of lines in the body, in encoded form.
    pub fn body_lines(&self, data: &[u8]) -> u32 {
        memchr::memchr_iter(b'\n', &data[self.body_range.clone()]).count()
            as u32
    }
}

fn parse_range(data: &[u8], range: Range<usize>, depth: u32) -> Part {
    let (headers, headers_range, body_range) =
        split_headers(data, range.clone());

    let content_type = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Type"))
        .and_then(|h| header::parse_content_type(&h.value))
        .unwrap_or_default();

    let mut part = Part {
        headers_range,
        body_range: body_range.clone(),
        headers,
        content_type,
        children: Vec::new(),
    };

    if depth >= MAX_DEPTH {
        return part;
    }

    if part.is_multipart() {
        if let Some(boundary) =
            part.content_type.parm("boundary").map(str::to_owned)
        {
            part.children = split_multipart(
                data,
                body_range,
                boundary.as_bytes(),
                depth + 1,
            );
        }
    } else if part.is_message_rfc822() {
        part.children = vec![parse_range(data, body_range, depth + 1)];
    }

    part
}

/// Split `range` into the header block and body, parsing the headers.
fn split_headers(
    data: &[u8],
    range: Range<usize>,
) -> (Vec<Header>, Range<usize>, Range<usize>) {
    let mut headers = Vec::new();
    let mut ix = range.start;
    let headers_start = ix;

    loop {
        if ix >= range.end {
            // No body at all.
            return (headers, headers_start..ix, ix..ix);
        }

        let line_end = memchr::memchr(b'\n', &data[ix..range.end])
            .map(|off| ix + off + 1)
            .unwrap_or(range.end);
        let line = &data[ix..line_end];
        let trimmed = trim_crlf(line);

        if trimmed.is_empty() {
            // Blank line: body starts after it.
            return (headers, headers_start..ix, line_end..range.end);
        }

        // Gather continuation lines.
        let mut value_end = line_end;
        while value_end < range.end
            && (data[value_end] == b' ' || data[value_end] == b'\t')
        {
            value_end = memchr::memchr(b'\n', &data[value_end..range.end])
                .map(|off| value_end + off + 1)
                .unwrap_or(range.end);
        }

        let full = &data[ix..value_end];
        if let Some(colon) = memchr::memchr(b':', trimmed) {
            let name =
                String::from_utf8_lossy(&trimmed[..colon]).trim().to_owned();
            let mut value = full[colon + 1..].to_vec();
            // Drop one leading space by convention.
            if value.first() == Some(&b' ') {
                value.remove(0);
            }
            while value.last() == Some(&b'\n') || value.last() == Some(&b'\r')
            {
                value.pop();
            }
            headers.push(Header {
                name,
                value,
                raw: ix..value_end,
            });
        }
        // Lines without a colon are silently skipped; mbox-style `From `
        // lines and similar garbage land here.

        ix = value_end;
    }
}

fn split_multipart(
    data: &[u8],
    body: Range<usize>,
    boundary: &[u8],
    depth: u32,
) -> Vec<Part> {
    let mut children = Vec::new();
    let mut child_start: Option<usize> = None;
    let mut ix = body.start;

    while ix < body.end {
        let line_end = memchr::memchr(b'\n', &data[ix..body.end])
            .map(|off| ix + off + 1)
            .unwrap_or(body.end);
        let line = trim_crlf(&data[ix..line_end]);

        let (is_delim, is_final) = classify_boundary(line, boundary);
        if is_delim {
            if let Some(start) = child_start {
                // The CRLF before the delimiter belongs to the delimiter,
                // not the part.
                let mut end = ix;
                if end > start && data[end - 1] == b'\n' {
                    end -= 1;
                    if end > start && data[end - 1] == b'\r' {
                        end -= 1;
                    }
                }
                children.push(parse_range(data, start..end, depth));
            }
            child_start = if is_final { None } else { Some(line_end) };
            if is_final {
                break;
            }
        }

        ix = line_end;
    }

    // Tolerate a missing final delimiter.
    if let Some(start) = child_start {
        if start < body.end {
            children.push(parse_range(data, start..body.end, depth));
        }
    }

    children
}

fn classify_boundary(line: &[u8], boundary: &[u8]) -> (bool, bool) {
    let Some(rest) = line.strip_prefix(b"--") else {
        return (false, false);
    };
    let Some(rest) = rest.strip_prefix(boundary) else {
        return (false, false);
    };
    // Trailing whitespace after the delimiter is legal.
    if rest.iter().all(|&b| b == b' ' || b == b'\t') {
        (true, false)
    } else if let Some(rest) = rest.strip_prefix(b"--") {
        (
            rest.iter().all(|&b| b == b' ' || b == b'\t'),
            true,
        )
    } else {
        (false, false)
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut line = line;
    if line.ends_with(b"\n") {
        line = &line[..line.len() - 1];
    }
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    line
}

#[cfg(test)]
mod test {
    use super::*;

    fn crlf(s: &str) -> Vec<u8> {
        s.replace('\n', "\r\n").into_bytes()
    }

    #[test]
    fn simple_message() {
        let data = crlf(
            "From: foo@bar.com\n\
             Subject: a test\n\
             \tof folding\n\
             Content-Type: text/plain; charset=utf-8\n\
             \n\
             The body.\n",
        );
        let part = Part::parse(&data);

        assert_eq!(3, part.headers.len());
        assert_eq!(b"foo@bar.com".to_vec(), part.header("from").unwrap());
        assert_eq!(
            b"a test\r\n\tof folding".to_vec(),
            part.header("Subject").unwrap()
        );
        assert!(part.content_type.is("text", "plain"));
        assert_eq!(
            b"The body.\r\n".to_vec(),
            data[part.body_range.clone()].to_vec()
        );
        assert_eq!(1, part.body_lines(&data));
        assert!(part.children.is_empty());
    }

    #[test]
    fn message_without_body() {
        let data = crlf("Subject: nothing\n");
        let part = Part::parse(&data);
        assert_eq!(1, part.headers.len());
        assert!(part.body_range.is_empty());
    }

    #[test]
    fn multipart_segmentation() {
        let data = crlf(
            "Content-Type: multipart/mixed; boundary=bound\n\
             \n\
             This is the prologue.\n\
             --bound\n\
             Content-Type: text/plain\n\
             \n\
             Content A\n\
             --bound\n\
             Content-Type: application/octet-stream\n\
             \n\
             Content B\n\
             --bound--\n\
             Epilogue.\n",
        );
        let part = Part::parse(&data);

        assert_eq!(2, part.children.len());
        assert!(part.children[0].content_type.is("text", "plain"));
        assert_eq!(
            b"Content A".to_vec(),
            data[part.children[0].body_range.clone()].to_vec()
        );
        assert!(part.children[1]
            .content_type
            .is("application", "octet-stream"));
        assert_eq!(
            b"Content B".to_vec(),
            data[part.children[1].body_range.clone()].to_vec()
        );
    }

    #[test]
    fn nested_multipart_and_rfc822() {
        let data = crlf(
            "Content-Type: multipart/mixed; boundary=outer\n\
             \n\
             --outer\n\
             Content-Type: message/rfc822\n\
             \n\
             Subject: inner\n\
             Content-Type: multipart/alternative; boundary=inner\n\
             \n\
             --inner\n\
             Content-Type: text/html\n\
             \n\
             <b>hi</b>\n\
             --inner--\n\
             --outer--\n",
        );
        let part = Part::parse(&data);

        assert_eq!(1, part.children.len());
        let msg = &part.children[0];
        assert!(msg.is_message_rfc822());
        assert_eq!(1, msg.children.len());

        let inner = &msg.children[0];
        assert_eq!(b"inner".to_vec(), inner.header("subject").unwrap());
        assert_eq!(1, inner.children.len());
        assert!(inner.children[0].content_type.is("text", "html"));
    }

    #[test]
    fn missing_final_delimiter() {
        let data = crlf(
            "Content-Type: multipart/mixed; boundary=b\n\
             \n\
             --b\n\
             \n\
             truncated part\n",
        );
        let part = Part::parse(&data);
        assert_eq!(1, part.children.len());
    }

    #[test]
    fn default_content_type() {
        let part = Part::parse(b"X: y\r\n\r\nbody");
        assert!(part.content_type.is("text", "plain"));
        assert_eq!(Some("us-ascii"), part.content_type.parm("charset"));
    }
}
