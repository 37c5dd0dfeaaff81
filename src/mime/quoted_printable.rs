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

use std::borrow::Cow;

/// Decode quoted-printable `data`.
///
/// Decoding is lenient: malformed escapes pass through literally, since
/// mangling the user's mail is worse than tolerating a bad encoder. Soft
/// line breaks (`=` at end of line) are removed.
pub fn qp_decode(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&b'=') {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut ix = 0;
    while ix < data.len() {
        let b = data[ix];
        if b != b'=' {
            out.push(b);
            ix += 1;
            continue;
        }

        // Soft line break, DOS or UNIX form.
        if data[ix + 1..].starts_with(b"\r\n") {
            ix += 3;
        } else if data[ix + 1..].starts_with(b"\n") {
            ix += 2;
        } else if let Some((h, l)) = data
            .get(ix + 1)
            .and_then(|&h| hex_val(h))
            .zip(data.get(ix + 2).and_then(|&l| hex_val(l)))
        {
            out.push((h << 4) | l);
            ix += 3;
        } else {
            out.push(b);
            ix += 1;
        }
    }

    Cow::Owned(out)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(b"hello".to_vec(), qp_decode(b"hello").into_owned());
        assert_eq!(
            "Keld Jørn".as_bytes().to_vec(),
            qp_decode(b"Keld J=C3=B8rn").into_owned()
        );
        assert_eq!(
            b"joined line".to_vec(),
            qp_decode(b"joined =\r\nline").into_owned()
        );
        assert_eq!(
            b"joined line".to_vec(),
            qp_decode(b"joined =\nline").into_owned()
        );
        // Malformed escapes pass through.
        assert_eq!(b"=XY".to_vec(), qp_decode(b"=XY").into_owned());
        assert_eq!(b"=".to_vec(), qp_decode(b"=").into_owned());
    }
}
