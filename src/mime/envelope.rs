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

use super::encoded_word::ew_decode_unstructured;
use super::header;
use super::part::Part;

/// The `ENVELOPE` structure defined by RFC 3501, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// The `Date` header, verbatim.
    ///
    /// RFC 3501 assumes this can never be absent since RFC 2822 requires
    /// it; for messages that lack it anyway we return NIL.
    pub date: Option<String>,
    /// The `Subject` header, decoded.
    pub subject: Option<String>,
    /// The `From` header.
    pub from: Vec<EnvelopeAddress>,
    /// The `Sender` header; if absent, a copy of `from`.
    pub sender: Vec<EnvelopeAddress>,
    /// The `Reply-To` header; if absent, a copy of `from`.
    pub reply_to: Vec<EnvelopeAddress>,
    pub to: Vec<EnvelopeAddress>,
    pub cc: Vec<EnvelopeAddress>,
    pub bcc: Vec<EnvelopeAddress>,
    /// The `In-Reply-To` header, trimmed.
    pub in_reply_to: Option<String>,
    /// The `Message-ID` header, trimmed.
    pub message_id: Option<String>,
}

/// One address, or group delimiter, of an RFC 3501 `ENVELOPE`.
///
/// RFC 3501 flattens groups into the address list: a group is opened by an
/// "address" with a local part but no domain, and closed by an "address"
/// with neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeAddress {
    /// The display name, decoded, if present.
    pub name: Option<String>,
    /// The local part; for a group-open pseudo-address, the group name.
    /// `None` only for the group-close delimiter.
    pub local: Option<String>,
    /// The domain; `None` for both group delimiters.
    pub domain: Option<String>,
}

impl EnvelopeAddress {
    fn of(mb: header::Mailbox) -> Self {
        EnvelopeAddress {
            name: mb.name,
            local: Some(mb.local),
            domain: Some(mb.domain),
        }
    }
}

/// Compute the ENVELOPE of the given (sub)message.
pub fn envelope(part: &Part) -> Envelope {
    let mut env = Envelope {
        date: part
            .header("Date")
            .map(|v| header::unfold(v).trim().to_owned()),
        subject: part
            .header("Subject")
            .map(|v| ew_decode_unstructured(&header::unfold(v)).into_owned()),
        from: address_list(part, "From"),
        sender: address_list(part, "Sender"),
        reply_to: address_list(part, "Reply-To"),
        to: address_list(part, "To"),
        cc: address_list(part, "CC"),
        bcc: address_list(part, "BCC"),
        in_reply_to: part
            .header("In-Reply-To")
            .map(|v| header::unfold(v).trim().to_owned()),
        message_id: part
            .header("Message-ID")
            .map(|v| header::unfold(v).trim().to_owned()),
    };

    if env.sender.is_empty() {
        env.sender = env.from.clone();
    }
    if env.reply_to.is_empty() {
        env.reply_to = env.from.clone();
    }

    env
}

fn address_list(part: &Part, name: &str) -> Vec<EnvelopeAddress> {
    let Some(value) = part.header(name) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for address in header::parse_address_list(value) {
        match address {
            header::Address::Mailbox(mb) => out.push(EnvelopeAddress::of(mb)),
            header::Address::Group { name, boxes } => {
                out.push(EnvelopeAddress {
                    name: None,
                    local: Some(name),
                    domain: None,
                });
                out.extend(boxes.into_iter().map(EnvelopeAddress::of));
                out.push(EnvelopeAddress::default());
            },
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(message: &str) -> Envelope {
        let data = message.replace('\n', "\r\n").into_bytes();
        envelope(&Part::parse(&data))
    }

    #[test]
    fn full_envelope() {
        let env = parse(
            "Date: Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\n\
             From: Terry Gray <gray@cac.washington.edu>\n\
             Subject: IMAP4rev1 WG mtg summary and minutes\n\
             To: imap@cac.washington.edu\n\
             cc: minutes@CNRI.Reston.VA.US, \
             John Klensin <KLENSIN@MIT.EDU>\n\
             Message-Id: <B27397-0100000@cac.washington.edu>\n\
             \n\
             Hello, Joe, do you think we can meet at 3:30 tomorrow?\n",
        );

        assert_eq!(
            Some("Wed, 17 Jul 1996 02:23:25 -0700 (PDT)".to_owned()),
            env.date
        );
        assert_eq!(
            Some("IMAP4rev1 WG mtg summary and minutes".to_owned()),
            env.subject
        );
        assert_eq!(1, env.from.len());
        assert_eq!(Some("Terry Gray".to_owned()), env.from[0].name);
        assert_eq!(Some("gray".to_owned()), env.from[0].local);
        // Sender and Reply-To default to From.
        assert_eq!(env.from, env.sender);
        assert_eq!(env.from, env.reply_to);
        assert_eq!(2, env.cc.len());
        assert!(env.bcc.is_empty());
        assert_eq!(
            Some("<B27397-0100000@cac.washington.edu>".to_owned()),
            env.message_id
        );
    }

    #[test]
    fn group_flattening() {
        let env = parse(
            "To: Some List: a@b.com, c@d.com;\n\
             \n\
             x\n",
        );

        assert_eq!(4, env.to.len());
        assert_eq!(Some("Some List".to_owned()), env.to[0].local);
        assert_eq!(None, env.to[0].domain);
        assert_eq!(Some("a".to_owned()), env.to[1].local);
        assert_eq!(Some("c".to_owned()), env.to[2].local);
        assert_eq!(None, env.to[3].local);
        assert_eq!(None, env.to[3].domain);
    }

    #[test]
    fn decoded_subject() {
        let env = parse("Subject: =?utf-8?q?Hello_world?=\n\nx\n");
        assert_eq!(Some("Hello world".to_owned()), env.subject);
    }
}
