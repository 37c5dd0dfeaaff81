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

//! The password file and its hash verification.
//!
//! The file is newline-separated `user:hash:maildir-root` records; `#`
//! starts a comment and whitespace around fields is ignored. Relative
//! maildir paths resolve against the password file's own directory, since
//! other services read the same file without knowing our working
//! directory. The file is opened fresh for every authentication so edits
//! take effect immediately.
//!
//! Hashes use the Django-compatible record format so account passwords
//! can be maintained by an ordinary web front end:
//! `pbkdf2_sha256$<iterations>$<salt>$<base64-digest>`.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

/// One account from the password file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PwUser {
    pub username: String,
    pub maildir: PathBuf,
    pw_hash: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// No such user, bad password, or unusable hash. Deliberately one
    /// variant: the caller must not be able to distinguish them, and
    /// neither may a network observer.
    BadCredentials,
    /// The password file itself could not be read.
    Unavailable,
}

/// Authenticate `username`/`password` against the password file at
/// `pwfile`.
pub fn authenticate(
    pwfile: &Path,
    username: &str,
    password: &str,
) -> Result<PwUser, AuthError> {
    let content = fs::read_to_string(pwfile).map_err(|e| {
        warn!("Unable to read password file '{}': {}", pwfile.display(), e);
        AuthError::Unavailable
    })?;

    let base = pwfile.parent().unwrap_or_else(|| Path::new("."));

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(3, ':');
        let (Some(user), Some(hash), Some(maildir)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!("Malformed password file record skipped");
            continue;
        };

        if user.trim() != username {
            continue;
        }

        if verify_password(password, hash.trim()) {
            let maildir = Path::new(maildir.trim());
            let maildir = if maildir.is_absolute() {
                maildir.to_owned()
            } else {
                base.join(maildir)
            };
            return Ok(PwUser {
                username: username.to_owned(),
                maildir,
                pw_hash: hash.trim().to_owned(),
            });
        }

        return Err(AuthError::BadCredentials);
    }

    // Burn roughly the same time for a nonexistent user as for a wrong
    // password so the difference is not observable.
    verify_password(password, DUMMY_HASH);
    Err(AuthError::BadCredentials)
}

/// Decode the SASL PLAIN initial response: `[authzid] NUL authcid NUL
/// passwd`.
pub fn decode_sasl_plain(b64: &str) -> Option<(String, String)> {
    let raw = base64::decode(b64.trim()).ok()?;
    let mut parts = raw.split(|&b| 0 == b);
    let _authzid = parts.next()?;
    let authcid = String::from_utf8(parts.next()?.to_vec()).ok()?;
    let passwd = String::from_utf8(parts.next()?.to_vec()).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((authcid, passwd))
}

static DUMMY_HASH: &str =
    "pbkdf2_sha256$260000$qTkbkUCjjgCrCLbP$\
     2Catkaru2rbYr1EvUob2mTNa7gRJ8Vc1QyyOCyFVaNc=";

fn verify_password(password: &str, encoded: &str) -> bool {
    // Django's "unusable password" marker.
    if encoded.starts_with('!') {
        return false;
    }

    let mut fields = encoded.split('$');
    let (Some(algorithm), Some(iterations), Some(salt), Some(digest_b64)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return false;
    };

    let digest = match algorithm {
        "pbkdf2_sha256" => openssl::hash::MessageDigest::sha256(),
        "pbkdf2_sha1" => openssl::hash::MessageDigest::sha1(),
        _ => return false,
    };

    let Ok(iterations) = iterations.parse::<usize>() else {
        return false;
    };
    let Ok(expected) = base64::decode(digest_b64) else {
        return false;
    };

    let mut derived = vec![0u8; expected.len()];
    if openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        salt.as_bytes(),
        iterations,
        digest,
        &mut derived,
    )
    .is_err()
    {
        return false;
    }

    !expected.is_empty() && openssl::memcmp::eq(&derived, &expected)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    // "sekret" under 1000 rounds of pbkdf2_sha256 with salt "salt".
    fn make_hash(password: &str) -> String {
        let mut derived = vec![0u8; 32];
        openssl::pkcs5::pbkdf2_hmac(
            password.as_bytes(),
            b"salt",
            1000,
            openssl::hash::MessageDigest::sha256(),
            &mut derived,
        )
        .unwrap();
        format!("pbkdf2_sha256$1000$salt${}", base64::encode(&derived))
    }

    fn write_pwfile(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("passwords.txt");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn verifies_correct_password() {
        let dir = tempfile::TempDir::new().unwrap();
        let pwfile = write_pwfile(
            dir.path(),
            &format!(
                "# a comment\n\
                 fred:{}:/srv/mail/fred\n",
                make_hash("sekret")
            ),
        );

        let user = authenticate(&pwfile, "fred", "sekret").unwrap();
        assert_eq!("fred", user.username);
        assert_eq!(PathBuf::from("/srv/mail/fred"), user.maildir);

        assert_eq!(
            Err(AuthError::BadCredentials),
            authenticate(&pwfile, "fred", "wrong")
        );
        assert_eq!(
            Err(AuthError::BadCredentials),
            authenticate(&pwfile, "nobody", "sekret")
        );
    }

    #[test]
    fn relative_maildir_resolves_against_pwfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let pwfile = write_pwfile(
            dir.path(),
            &format!("fred:{}:fred-mail\n", make_hash("pw")),
        );

        let user = authenticate(&pwfile, "fred", "pw").unwrap();
        assert_eq!(dir.path().join("fred-mail"), user.maildir);
    }

    #[test]
    fn unusable_and_malformed_hashes_fail_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let pwfile = write_pwfile(
            dir.path(),
            "a:!disabled:/mail/a\n\
             b:not-a-hash:/mail/b\n\
             c:pbkdf2_md5$1$x$AAAA:/mail/c\n",
        );

        for user in ["a", "b", "c"] {
            assert_eq!(
                Err(AuthError::BadCredentials),
                authenticate(&pwfile, user, "anything")
            );
        }
    }

    #[test]
    fn missing_pwfile_is_unavailable() {
        assert_eq!(
            Err(AuthError::Unavailable),
            authenticate(Path::new("/nonexistent/pw"), "a", "b")
        );
    }

    #[test]
    fn sasl_plain_decoding() {
        let b64 = base64::encode(b"\0fred\0sekret");
        assert_eq!(
            Some(("fred".to_owned(), "sekret".to_owned())),
            decode_sasl_plain(&b64)
        );
        let b64 = base64::encode(b"admin\0fred\0sekret");
        assert_eq!(
            Some(("fred".to_owned(), "sekret".to_owned())),
            decode_sasl_plain(&b64)
        );
        assert_eq!(None, decode_sasl_plain("****"));
        assert_eq!(None, decode_sasl_plain(&base64::encode(b"no-nuls")));
    }
}
