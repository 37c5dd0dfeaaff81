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

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::{error, warn};

/// Given the path to a user's maildir root, drop privileges to its owner.
///
/// If the current process is not running as root, does nothing.
///
/// If running as root, the process switches its GID, supplementary groups,
/// and UID to the owner of that directory. This runs in the forked child
/// between `fork` and `exec` of the per-user worker, so failure here means
/// the child must exit without serving anyone.
///
/// Returns whether the operation succeeded. If false, the process is in an
/// indeterminate state and needs to exit soon.
pub fn drop_to_maildir_owner(log_prefix: &str, maildir: &Path) -> bool {
    if nix::unistd::ROOT != nix::unistd::getuid() {
        return true;
    }

    let md = match maildir.metadata() {
        Ok(md) => md,
        Err(e) => {
            error!(
                "{} Failed to stat '{}': {}",
                log_prefix,
                maildir.display(),
                e
            );
            return false;
        },
    };

    let target_uid = nix::unistd::Uid::from_raw(md.uid() as nix::libc::uid_t);
    let (has_user_groups, target_gid) =
        match nix::unistd::User::from_uid(target_uid) {
            Ok(Some(user)) => {
                match nix::unistd::initgroups(
                    &std::ffi::CString::new(user.name.clone())
                        .expect("Got UNIX user name with NUL?"),
                    user.gid,
                ) {
                    Ok(()) => (true, user.gid),
                    Err(e) => {
                        warn!(
                            "{} Failed to init groups for user: {}",
                            log_prefix, e
                        );
                        (false, user.gid)
                    },
                }
            },
            Ok(None) => {
                warn!(
                    "{} No passwd entry for UID {}, assuming GID {}",
                    log_prefix,
                    target_uid,
                    md.gid()
                );
                (
                    false,
                    nix::unistd::Gid::from_raw(md.gid() as nix::libc::gid_t),
                )
            },
            Err(e) => {
                warn!(
                    "{} Failed to look up passwd entry for UID {}, \
                     assuming GID {}: {}",
                    log_prefix,
                    target_uid,
                    md.gid(),
                    e
                );
                (
                    false,
                    nix::unistd::Gid::from_raw(md.gid() as nix::libc::gid_t),
                )
            },
        };

    if let Err(e) = if has_user_groups {
        Ok(())
    } else {
        nix::unistd::setgroups(&[target_gid])
    }
    .and_then(|()| nix::unistd::setgid(target_gid))
    .and_then(|()| nix::unistd::setuid(target_uid))
    {
        error!(
            "{} Failed to drop privileges to {}:{}: {}",
            log_prefix, target_uid, target_gid, e
        );
        return false;
    }

    if nix::unistd::ROOT == nix::unistd::getuid() {
        error!(
            "{} Worker is still root! Ensure maildir roots are not \
             owned by root, or run asimapd as a non-root user.",
            log_prefix
        );
        return false;
    }

    true
}
