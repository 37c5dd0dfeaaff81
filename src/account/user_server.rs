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

//! The per-user server: owns every mailbox object for one user and the
//! background folder-scanner work.
//!
//! Exactly one worker process runs per user; within it, everything is
//! single-threaded and reached through `Rc<RefCell<...>>` handles. One
//! task per client connection plus one background task (driven from the
//! worker entry point) cooperate over these structures; commands against a
//! single mailbox serialize naturally because no task holds a borrow
//! across an await point.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use chrono::prelude::*;
use log::{info, warn};

use crate::account::mailbox::Mailbox;
use crate::account::mh::{MhFolder, SEQUENCES_FILE};
use crate::account::model::*;
use crate::account::storage::Store;
use crate::support::error::Error;

/// Seconds between background resyncs of any one mailbox.
pub const RESYNC_INTERVAL: i64 = 5 * 60;
/// Seconds a mailbox may sit with no selected sessions before its
/// in-memory object is flushed.
pub const MAILBOX_EXPIRY: i64 = 10 * 60;
/// Seconds the worker lingers after its last connection closes.
pub const WORKER_LINGER: i64 = 30 * 60;

pub struct UserServer {
    root: PathBuf,
    store: Rc<RefCell<Store>>,
    mailboxes: HashMap<String, Rc<RefCell<Mailbox>>>,
    use_locking: bool,
    active_connections: usize,
    last_disconnect: i64,
}

impl UserServer {
    pub fn new(
        root: PathBuf,
        use_locking: bool,
    ) -> Result<Rc<RefCell<Self>>, Error> {
        let state_dir = root.join(".asimap");
        fs::create_dir_all(&state_dir)?;
        let store = Store::open(&state_dir.join("store.sqlite3"))?;

        Ok(Rc::new(RefCell::new(UserServer {
            root,
            store: Rc::new(RefCell::new(store)),
            mailboxes: HashMap::new(),
            use_locking,
            active_connections: 0,
            last_disconnect: Utc::now().timestamp(),
        })))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> Rc<RefCell<Store>> {
        Rc::clone(&self.store)
    }

    pub fn connection_opened(&mut self) {
        self.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
        if 0 == self.active_connections {
            self.last_disconnect = Utc::now().timestamp();
        }
    }

    /// Whether the worker has outlived its linger period with no clients.
    pub fn should_terminate(&self) -> bool {
        0 == self.active_connections
            && Utc::now().timestamp() - self.last_disconnect > WORKER_LINGER
    }

    /// Canonicalise and validate an IMAP mailbox name.
    ///
    /// The hierarchy separator is `/` with the root at `""`. Anything that
    /// could escape the maildir (absolute paths, `.` components, `..`) or
    /// collide with the state directory is refused.
    pub fn canonical_name(&self, name: &str) -> Result<String, Error> {
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(Error::UnsafeName);
        }
        if "inbox".eq_ignore_ascii_case(name) {
            return Ok("INBOX".to_owned());
        }

        for part in name.split('/') {
            if part.is_empty()
                || part.starts_with('.')
                || part.contains('\0')
                || part.bytes().all(|b| b.is_ascii_digit())
                || SEQUENCES_FILE == part
            {
                return Err(Error::UnsafeName);
            }
        }

        let path = Path::new(name);
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(..)))
        {
            return Err(Error::UnsafeName);
        }

        Ok(name.to_owned())
    }

    fn folder_for(&self, name: &str) -> MhFolder {
        MhFolder::new(self.root.join(name), self.use_locking)
    }

    pub fn folder_exists(&self, name: &str) -> bool {
        self.folder_for(name).exists()
    }

    /// Look up or lazily instantiate the mailbox object for `name`,
    /// running an initial resync if it was just loaded.
    pub fn get_mailbox(
        &mut self,
        name: &str,
    ) -> Result<Rc<RefCell<Mailbox>>, Error> {
        let name = self.canonical_name(name)?;

        if let Some(mbox) = self.mailboxes.get(&name) {
            return Ok(Rc::clone(mbox));
        }

        let folder = self.folder_for(&name);
        if !folder.exists() {
            if "INBOX" == name {
                // INBOX always exists, materialising on first touch.
                folder.create()?;
            } else {
                return Err(Error::NxMailbox);
            }
        }

        let mut mailbox = Mailbox::open(
            name.clone(),
            folder,
            &mut self.store.borrow_mut(),
        )?;
        mailbox.resync(&mut self.store.borrow_mut(), true)?;

        let mailbox = Rc::new(RefCell::new(mailbox));
        self.mailboxes.insert(name, Rc::clone(&mailbox));
        Ok(mailbox)
    }

    /// Run the on-demand resync of a mailbox if one is loaded for `name`.
    pub fn resync_mailbox(&mut self, name: &str) -> Result<bool, Error> {
        let mbox = self.get_mailbox(name)?;
        let mut mbox = mbox.borrow_mut();
        mbox.resync(&mut self.store.borrow_mut(), false)
    }

    pub fn create_mailbox(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        if "INBOX" == name {
            return Err(Error::MailboxExists);
        }

        let folder = self.folder_for(&name);
        if folder.exists() {
            return Err(Error::MailboxExists);
        }

        folder.create()?;

        // A row left over from a previous life of this name means the
        // folder vanished without a DELETE; its UIDs are not trustworthy
        // for the new mailbox, so it is replaced wholesale and the fresh
        // epoch-second UIDVALIDITY takes effect.
        if let Some(row) = self.store.borrow_mut().fetch_mailbox(&name)? {
            self.store.borrow_mut().delete_mailbox(row.id)?;
        }

        // Intermediate hierarchy created implicitly by create_dir_all gets
        // picked up by LIST via the filesystem walk; only the named leaf
        // needs a UIDVALIDITY now.
        let uidvalidity = Utc::now().timestamp() as u32;
        self.store
            .borrow_mut()
            .create_mailbox(&name, uidvalidity)
            .map(|_| ())
    }

    /// Delete a mailbox per RFC 3501/2180 semantics.
    ///
    /// A mailbox with child folders loses its messages but remains as a
    /// hierarchy node; a leaf is removed outright. The caller is
    /// responsible for disconnecting sessions that had it selected.
    pub fn delete_mailbox(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        if "INBOX" == name {
            return Err(Error::BadOperationOnInbox);
        }

        let folder = self.folder_for(&name);
        if !folder.exists() {
            return Err(Error::NxMailbox);
        }

        let has_children = self.has_child_folders(&name);

        for key in folder.list_keys()? {
            let _ = folder.remove_message(key);
        }
        let _ = fs::remove_file(folder.path().join(SEQUENCES_FILE));
        if !has_children {
            fs::remove_dir(folder.path())?;
        }

        if let Some(mbox) = self.mailboxes.remove(&name) {
            // Sessions still holding the object observe the folder's
            // absence at their next resync and get disconnected.
            info!(
                "Mailbox '{}' deleted with {} selected session(s)",
                name,
                mbox.borrow().selected_count()
            );
        }

        if let Some(row) = self.store.borrow_mut().fetch_mailbox(&name)? {
            self.store.borrow_mut().delete_mailbox(row.id)?;
        }
        self.store.borrow_mut().unsubscribe(&name)?;
        Ok(())
    }

    /// Rename a mailbox.
    ///
    /// The RFC 3501 special case applies to INBOX: its messages move to
    /// the new mailbox and an empty INBOX is left behind. Loaded mailbox
    /// objects are renamed in place so selected sessions keep working and
    /// discover the change through subsequent operations.
    pub fn rename_mailbox(
        &mut self,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), Error> {
        let old_name = self.canonical_name(old_name)?;
        let new_name = self.canonical_name(new_name)?;

        if old_name == new_name {
            return Err(Error::RenameToSelf);
        }
        if new_name.starts_with(&format!("{}/", old_name)) {
            return Err(Error::RenameIntoSelf);
        }
        if self.folder_exists(&new_name) {
            return Err(Error::MailboxExists);
        }

        if "INBOX" == old_name {
            return self.rename_inbox(&new_name);
        }

        let old_folder = self.folder_for(&old_name);
        if !old_folder.exists() {
            return Err(Error::NxMailbox);
        }

        let new_path = self.root.join(&new_name);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(old_folder.path(), &new_path)?;

        // Carry persisted state (UIDVALIDITY et al) across the rename.
        match self
            .store
            .borrow_mut()
            .rename_mailbox(&old_name, &new_name)
        {
            Ok(()) | Err(Error::NxMailbox) => (),
            Err(e) => return Err(e),
        }

        // Re-key loaded objects, including children.
        let prefix = format!("{}/", old_name);
        let affected: Vec<String> = self
            .mailboxes
            .keys()
            .filter(|k| **k == old_name || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in affected {
            let mbox = self.mailboxes.remove(&key).unwrap();
            let renamed = if key == old_name {
                new_name.clone()
            } else {
                format!("{}{}", new_name, &key[old_name.len()..])
            };
            {
                let mut m = mbox.borrow_mut();
                m.rename_to(
                    renamed.clone(),
                    self.folder_for(&renamed),
                );
            }
            self.mailboxes.insert(renamed, mbox);
        }

        Ok(())
    }

    fn rename_inbox(&mut self, new_name: &str) -> Result<(), Error> {
        self.create_mailbox(new_name)?;

        let inbox = self.get_mailbox("INBOX")?;
        let dest = self.get_mailbox(new_name)?;

        let mut inbox = inbox.borrow_mut();
        let dest_uids: Vec<Uid> =
            inbox.entries().iter().map(|e| e.uid).collect();
        let items = inbox.export_messages(&dest_uids)?;
        dest.borrow_mut()
            .append(&mut self.store.borrow_mut(), items)?;
        inbox.expunge_uids(&mut self.store.borrow_mut(), &dest_uids)?;
        Ok(())
    }

    /// Whether `name` has any child folders on disk.
    pub fn has_child_folders(&self, name: &str) -> bool {
        let path = self.root.join(name);
        fs::read_dir(path)
            .map(|entries| {
                entries.flatten().any(|e| {
                    e.file_type().map(|t| t.is_dir()).unwrap_or(false)
                        && e.file_name()
                            .to_str()
                            .is_some_and(|n| !n.starts_with('.'))
                })
            })
            .unwrap_or(false)
    }

    /// Enumerate every folder under the maildir root, canonical names in
    /// sorted order. INBOX is always present.
    pub fn all_folders(&self) -> Vec<String> {
        let mut out = vec!["INBOX".to_owned()];
        walk_folders(&self.root, "", &mut out);
        out.sort();
        out.dedup();
        out
    }

    pub fn subscribe(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        if !self.folder_exists(&name) {
            return Err(Error::NxMailbox);
        }
        self.store.borrow_mut().subscribe(&name)
    }

    pub fn unsubscribe(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        self.store.borrow_mut().unsubscribe(&name)
    }

    pub fn subscriptions(&self) -> Result<Vec<String>, Error> {
        self.store.borrow_mut().subscriptions()
    }

    pub fn is_subscribed(&self, name: &str) -> Result<bool, Error> {
        self.store.borrow_mut().is_subscribed(name)
    }

    /// Compute the `STATUS` data for a mailbox, loading it if necessary.
    pub fn status(
        &mut self,
        request: &StatusRequest,
    ) -> Result<StatusResponse, Error> {
        let mbox = self.get_mailbox(&request.name)?;
        mbox.borrow_mut()
            .resync(&mut self.store.borrow_mut(), false)?;
        let mbox = mbox.borrow();

        Ok(StatusResponse {
            name: mbox.name().to_owned(),
            messages: request.messages.then(|| mbox.exists()),
            recent: request.recent.then(|| mbox.recent_count()),
            uidnext: request.uidnext.then(|| mbox.next_uid()),
            uidvalidity: request.uidvalidity.then(|| mbox.uidvalidity()),
            unseen: request.unseen.then(|| mbox.unseen_count()),
        })
    }

    /// The periodic background sweep: find new folders, resync stale
    /// loaded mailboxes, and expire idle ones.
    pub fn background_sweep(&mut self) {
        let now = Utc::now().timestamp();

        // Resync loaded mailboxes that have not been looked at recently.
        let stale: Vec<Rc<RefCell<Mailbox>>> = self
            .mailboxes
            .values()
            .filter(|m| {
                let m = m.borrow();
                now - m.last_resync() >= RESYNC_INTERVAL
            })
            .map(Rc::clone)
            .collect();
        for mbox in stale {
            let name = mbox.borrow().name().to_owned();
            if !mbox.borrow().folder_exists() {
                continue;
            }
            if let Err(e) = mbox
                .borrow_mut()
                .resync(&mut self.store.borrow_mut(), false)
            {
                warn!("Background resync of '{}' failed: {}", name, e);
            }
        }

        // Expire mailboxes nobody is using.
        let expired: Vec<String> = self
            .mailboxes
            .iter()
            .filter(|(_, m)| {
                let m = m.borrow();
                0 == m.selected_count()
                    && now - m.idle_since() >= MAILBOX_EXPIRY
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            info!("Expiring idle mailbox '{}'", name);
            self.mailboxes.remove(&name);
        }
    }
}

fn walk_folders(root: &Path, prefix: &str, out: &mut Vec<String>) {
    let dir = if prefix.is_empty() {
        root.to_owned()
    } else {
        root.join(prefix)
    };

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned)
        else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let full = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        out.push(full.clone());
        walk_folders(root, &full, out);
    }
}

/// IMAP LIST wildcard matching: `*` matches anything, `%` anything except
/// the hierarchy delimiter. The namespace is case-sensitive except for
/// INBOX itself.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], n)
                    || (!n.is_empty() && matches(p, &n[1..]))
            },
            (Some(b'%'), _) => {
                matches(&p[1..], n)
                    || (n.first().is_some_and(|&c| c != b'/')
                        && matches(p, &n[1..]))
            },
            (Some(&pc), Some(&nc)) if pc == nc => {
                matches(&p[1..], &n[1..])
            },
            _ => false,
        }
    }

    if "INBOX" == name {
        return matches(
            pattern.to_ascii_uppercase().as_bytes(),
            b"INBOX",
        );
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Rc<RefCell<UserServer>>) {
        let dir = tempfile::TempDir::new().unwrap();
        let server = UserServer::new(dir.path().to_owned(), false).unwrap();
        (dir, server)
    }

    #[test]
    fn inbox_materialises_on_demand() {
        let (_dir, server) = fixture();
        let mbox = server.borrow_mut().get_mailbox("inbox").unwrap();
        assert_eq!("INBOX", mbox.borrow().name());
        assert!(server.borrow().folder_exists("INBOX"));
    }

    #[test]
    fn unsafe_names_are_refused() {
        let (_dir, server) = fixture();
        let server = server.borrow();
        assert_matches!(Err(Error::UnsafeName), server.canonical_name(""));
        assert_matches!(
            Err(Error::UnsafeName),
            server.canonical_name("../etc")
        );
        assert_matches!(
            Err(Error::UnsafeName),
            server.canonical_name(".asimap")
        );
        assert_matches!(
            Err(Error::UnsafeName),
            server.canonical_name("work/.hidden")
        );
        // Numeric components would collide with message files.
        assert_matches!(
            Err(Error::UnsafeName),
            server.canonical_name("work/123")
        );
        assert_eq!(
            "work/2023x".to_owned(),
            server.canonical_name("work/2023x").unwrap()
        );
    }

    #[test]
    fn create_delete_cycle() {
        let (_dir, server) = fixture();

        server.borrow_mut().create_mailbox("work/projects").unwrap();
        assert!(server.borrow().folder_exists("work/projects"));
        assert_matches!(
            Err(Error::MailboxExists),
            server.borrow_mut().create_mailbox("work/projects")
        );

        // "work" exists as an intermediate node with children.
        assert!(server.borrow().has_child_folders("work"));

        // Deleting the parent keeps the hierarchy node.
        server.borrow_mut().delete_mailbox("work").unwrap();
        assert!(server.borrow().folder_exists("work"));

        server.borrow_mut().delete_mailbox("work/projects").unwrap();
        assert!(!server.borrow().folder_exists("work/projects"));

        assert_matches!(
            Err(Error::BadOperationOnInbox),
            server.borrow_mut().delete_mailbox("INBOX")
        );
    }

    #[test]
    fn rename_preserves_uid_state() {
        let (_dir, server) = fixture();
        server.borrow_mut().create_mailbox("old").unwrap();

        let (uidvalidity, next_uid) = {
            let mbox = server.borrow_mut().get_mailbox("old").unwrap();
            let folder = mbox.borrow().folder().clone();
            folder.add_message(b"x\r\n").unwrap();
            let store = server.borrow().store();
            mbox.borrow_mut()
                .resync(&mut store.borrow_mut(), true)
                .unwrap();
            let m = mbox.borrow();
            (m.uidvalidity(), m.next_uid())
        };

        server.borrow_mut().rename_mailbox("old", "new").unwrap();
        assert!(!server.borrow().folder_exists("old"));

        let mbox = server.borrow_mut().get_mailbox("new").unwrap();
        let m = mbox.borrow();
        assert_eq!(uidvalidity, m.uidvalidity());
        assert_eq!(next_uid, m.next_uid());
        assert_eq!(1, m.exists());
    }

    #[test]
    fn rename_inbox_moves_messages_and_leaves_empty_inbox() {
        let (_dir, server) = fixture();

        {
            let mbox = server.borrow_mut().get_mailbox("INBOX").unwrap();
            let folder = mbox.borrow().folder().clone();
            folder.add_message(b"one\r\n").unwrap();
            folder.add_message(b"two\r\n").unwrap();
            let store = server.borrow().store();
            mbox.borrow_mut()
                .resync(&mut store.borrow_mut(), true)
                .unwrap();
        }

        server
            .borrow_mut()
            .rename_mailbox("INBOX", "archive")
            .unwrap();

        let inbox = server.borrow_mut().get_mailbox("INBOX").unwrap();
        assert_eq!(0, inbox.borrow().exists());

        let archive = server.borrow_mut().get_mailbox("archive").unwrap();
        assert_eq!(2, archive.borrow().exists());
    }

    #[test]
    fn folder_enumeration() {
        let (_dir, server) = fixture();
        server.borrow_mut().create_mailbox("b").unwrap();
        server.borrow_mut().create_mailbox("a/x").unwrap();

        assert_eq!(
            vec![
                "INBOX".to_owned(),
                "a".to_owned(),
                "a/x".to_owned(),
                "b".to_owned()
            ],
            server.borrow().all_folders()
        );
    }

    #[test]
    fn wildcards() {
        assert!(pattern_matches("*", "work/2023x"));
        assert!(pattern_matches("work/*", "work/a/b"));
        assert!(pattern_matches("work/%", "work/a"));
        assert!(!pattern_matches("work/%", "work/a/b"));
        assert!(pattern_matches("%", "work"));
        assert!(!pattern_matches("%", "work/a"));
        assert!(pattern_matches("inbox", "INBOX"));
        assert!(pattern_matches("*x", "work/2023x"));
        assert!(!pattern_matches("", "work"));
        assert!(pattern_matches("", ""));
    }

    #[test]
    fn worker_linger_accounting() {
        let (_dir, server) = fixture();
        let mut server = server.borrow_mut();
        assert!(!server.should_terminate());
        server.connection_opened();
        server.connection_closed();
        // Just disconnected: the linger period has not elapsed.
        assert!(!server.should_terminate());
    }
}
