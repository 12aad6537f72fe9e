//! Per-session data store.
//!
//! Layout under the storage roots:
//! - `<data_dir>/<phone>/database.json`: `{chats:{}, users:{}}`
//! - `<sessions_dir>/<phone>/`: authentication material (credentials + library keys)
//!
//! One shared in-process [`Session`] per id. Saves are whole-document overwrites and
//! are serialized per session.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    domain::SessionId,
    persist::{read_json, remove_dir_if_exists, write_json_atomic},
    Result,
};

/// Credentials file written inside a session's auth directory.
pub const CREDS_FILE_NAME: &str = "creds.json";

/// A keyed canned response. `image` is a hosted image URL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReply {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    #[serde(rename = "isBanned", default)]
    pub is_banned: bool,
    /// Upper-cased key → reply.
    #[serde(rename = "listStr", default)]
    pub stored_replies: BTreeMap<String, StoredReply>,
    #[serde(rename = "welcome", default = "default_true")]
    pub welcome_enabled: bool,
    #[serde(rename = "detect", default = "default_true")]
    pub detect_enabled: bool,
    #[serde(rename = "delete", default = "default_true")]
    pub auto_delete_enabled: bool,
}

impl Default for ChatRecord {
    fn default() -> Self {
        Self {
            is_banned: false,
            stored_replies: BTreeMap::new(),
            welcome_enabled: true,
            detect_enabled: true,
            auto_delete_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub banned: bool,
    #[serde(rename = "name", default)]
    pub display_name: String,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub premium: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub chats: BTreeMap<String, ChatRecord>,
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
}

fn default_true() -> bool {
    true
}

/// One WhatsApp bot identity's isolated data.
pub struct Session {
    id: SessionId,
    path: PathBuf,
    data: Mutex<SessionData>,
    write_lock: Mutex<()>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Lock the in-memory document for reading or mutation. Call
    /// [`SessionStore::save`] after mutating.
    pub async fn lock(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().await
    }

    pub async fn snapshot(&self) -> SessionData {
        self.data.lock().await.clone()
    }
}

pub struct SessionStore {
    data_dir: PathBuf,
    sessions_dir: PathBuf,
    open: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionStore {
    pub fn new(data_dir: impl Into<PathBuf>, sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sessions_dir: sessions_dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn document_path(&self, id: &SessionId) -> PathBuf {
        self.data_dir.join(id.as_str()).join("database.json")
    }

    pub fn auth_dir(&self, id: &SessionId) -> PathBuf {
        self.sessions_dir.join(id.as_str())
    }

    /// Return the shared instance for `id`, loading or initializing it on first use.
    pub async fn open(&self, id: &SessionId) -> Result<Arc<Session>> {
        let mut open = self.open.lock().await;
        if let Some(s) = open.get(id) {
            return Ok(s.clone());
        }

        let path = self.document_path(id);
        let (data, fresh) = match read_json::<SessionData>(&path) {
            Ok(Some(data)) => (data, false),
            Ok(None) => (SessionData::default(), true),
            Err(e) => {
                tracing::error!(session = %id, "failed to load session document, reinitializing: {e}");
                (SessionData::default(), true)
            }
        };
        if fresh {
            write_json_atomic(&path, &data)?;
        }

        let session = Arc::new(Session {
            id: id.clone(),
            path,
            data: Mutex::new(data),
            write_lock: Mutex::new(()),
        });
        open.insert(id.clone(), session.clone());
        Ok(session)
    }

    /// Fetch the chat record, creating (and persisting) it on first sight.
    pub async fn init_chat(&self, session: &Session, chat_id: &str) -> Result<ChatRecord> {
        let created = {
            let mut data = session.lock().await;
            if let Some(chat) = data.chats.get(chat_id) {
                return Ok(chat.clone());
            }
            let chat = ChatRecord::default();
            data.chats.insert(chat_id.to_string(), chat.clone());
            chat
        };
        self.save(session).await?;
        Ok(created)
    }

    /// Fetch the user record, creating (and persisting) it on first sight.
    pub async fn init_user(&self, session: &Session, user_id: &str) -> Result<UserRecord> {
        let created = {
            let mut data = session.lock().await;
            if let Some(user) = data.users.get(user_id) {
                return Ok(user.clone());
            }
            let user = UserRecord::default();
            data.users.insert(user_id.to_string(), user.clone());
            user
        };
        self.save(session).await?;
        Ok(created)
    }

    /// Overwrite the persisted document with the current in-memory state.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let _write = session.write_lock.lock().await;
        let snapshot = session.snapshot().await;
        write_json_atomic(&session.path, &snapshot).inspect_err(|e| {
            tracing::error!(session = %session.id, "failed to save session document: {e}");
        })
    }

    /// Drop the in-memory instance and delete the session document and auth material.
    pub async fn destroy(&self, id: &SessionId) -> Result<()> {
        let removed = self.open.lock().await.remove(id);
        if let Some(session) = removed {
            // Wait out an in-flight save so it cannot recreate the document.
            let _write = session.write_lock.lock().await;
        }
        remove_dir_if_exists(&self.data_dir.join(id.as_str()))?;
        self.purge_auth(id)?;
        tracing::info!(session = %id, "session destroyed");
        Ok(())
    }

    /// Persist updated credentials for the connection library.
    pub fn save_creds(&self, id: &SessionId, creds: &serde_json::Value) -> Result<()> {
        write_json_atomic(&self.auth_dir(id).join(CREDS_FILE_NAME), creds)
    }

    pub fn load_creds(&self, id: &SessionId) -> Result<Option<serde_json::Value>> {
        read_json(&self.auth_dir(id).join(CREDS_FILE_NAME))
    }

    /// Remove only the auth material; chat/user data survive for re-pairing.
    pub fn purge_auth(&self, id: &SessionId) -> Result<bool> {
        remove_dir_if_exists(&self.auth_dir(id))
    }

    pub fn has_auth(&self, id: &SessionId) -> bool {
        self.auth_dir(id).is_dir()
    }

    /// Session ids with auth material on disk (sessions paired before a restart).
    pub fn stored_session_ids(&self) -> Result<Vec<SessionId>> {
        list_session_dirs(&self.sessions_dir)
    }

    /// Save every open session; used at teardown.
    pub async fn flush_all(&self) -> Result<()> {
        let sessions: Vec<Arc<Session>> = self.open.lock().await.values().cloned().collect();
        let mut first_err = None;
        for s in sessions {
            if let Err(e) = self.save(&s).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_open(&self, id: &SessionId) -> bool {
        self.open.lock().await.contains_key(id)
    }
}

fn list_session_dirs(root: &Path) -> Result<Vec<SessionId>> {
    let rd = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(root)?;
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for ent in rd.flatten() {
        if !ent.path().is_dir() {
            continue;
        }
        if let Some(id) = SessionId::parse(&ent.file_name().to_string_lossy()) {
            out.push(id);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("databases"), dir.path().join("sessions"))
    }

    #[tokio::test]
    async fn open_initializes_and_persists_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let s = store.open(&sid("6281111")).await.unwrap();

        let raw = std::fs::read_to_string(store.document_path(s.id())).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v, serde_json::json!({"chats": {}, "users": {}}));
    }

    #[tokio::test]
    async fn open_is_idempotent_and_shares_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let a = store.open(&sid("6281111")).await.unwrap();
        store.init_chat(&a, "123@g.us").await.unwrap();

        let path = store.document_path(a.id());
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();

        let b = store.open(&sid("6281111")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(b.snapshot().await.chats.contains_key("123@g.us"));
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn init_chat_and_user_create_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let s = store.open(&sid("6281111")).await.unwrap();

        let chat = store.init_chat(&s, "123@g.us").await.unwrap();
        assert!(!chat.is_banned);
        assert!(chat.welcome_enabled && chat.detect_enabled && chat.auto_delete_enabled);

        {
            let mut data = s.lock().await;
            data.chats.get_mut("123@g.us").unwrap().is_banned = true;
        }
        store.save(&s).await.unwrap();
        assert!(store.init_chat(&s, "123@g.us").await.unwrap().is_banned);

        let user = store.init_user(&s, "62999@s.whatsapp.net").await.unwrap();
        assert_eq!(user, UserRecord::default());
    }

    #[tokio::test]
    async fn document_uses_wire_field_names_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(&dir);
            let s = store.open(&sid("6281111")).await.unwrap();
            store.init_chat(&s, "123@g.us").await.unwrap();
            {
                let mut data = s.lock().await;
                data.chats
                    .get_mut("123@g.us")
                    .unwrap()
                    .stored_replies
                    .insert(
                        "PRICE".to_string(),
                        StoredReply {
                            text: "10k".to_string(),
                            image: None,
                        },
                    );
            }
            store.save(&s).await.unwrap();
        }

        let store = store(&dir);
        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(store.document_path(&sid("6281111"))).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["chats"]["123@g.us"]["listStr"]["PRICE"]["text"], "10k");
        assert_eq!(raw["chats"]["123@g.us"]["isBanned"], false);
        assert_eq!(raw["chats"]["123@g.us"]["welcome"], true);

        let s = store.open(&sid("6281111")).await.unwrap();
        let data = s.snapshot().await;
        assert_eq!(data.chats["123@g.us"].stored_replies["PRICE"].text, "10k");
    }

    #[tokio::test]
    async fn destroy_removes_document_auth_and_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = sid("6281111");
        let s = store.open(&id).await.unwrap();
        store.init_chat(&s, "123@g.us").await.unwrap();
        store
            .save_creds(&id, &serde_json::json!({"registered": true}))
            .unwrap();
        assert!(store.has_auth(&id));

        store.destroy(&id).await.unwrap();
        assert!(!store.is_open(&id).await);
        assert!(!store.document_path(&id).exists());
        assert!(!store.has_auth(&id));

        // Re-opening starts from scratch.
        let again = store.open(&id).await.unwrap();
        assert!(again.snapshot().await.chats.is_empty());
    }

    #[tokio::test]
    async fn purge_auth_keeps_chat_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = sid("6281111");
        let s = store.open(&id).await.unwrap();
        store.init_chat(&s, "123@g.us").await.unwrap();
        store
            .save_creds(&id, &serde_json::json!({"registered": true}))
            .unwrap();

        assert!(store.purge_auth(&id).unwrap());
        assert!(store.load_creds(&id).unwrap().is_none());
        assert!(store.document_path(&id).exists());
    }

    #[tokio::test]
    async fn stored_session_ids_lists_auth_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.stored_session_ids().unwrap().is_empty());

        store
            .save_creds(&sid("6282222"), &serde_json::json!({}))
            .unwrap();
        store
            .save_creds(&sid("6281111"), &serde_json::json!({}))
            .unwrap();
        std::fs::create_dir_all(dir.path().join("sessions/not-a-phone")).unwrap();
        std::fs::write(dir.path().join("sessions/12345"), "file").unwrap();

        assert_eq!(
            store.stored_session_ids().unwrap(),
            vec![sid("6281111"), sid("6282222")]
        );
    }
}
