//! Chat sessions and message history.
//!
//! A session groups role-tagged messages for replay into the prompt context on
//! later turns. The title is set once, from the first user message; every new
//! message bumps `updated_at_ms`. Persistence on the chat path is best-effort:
//! failures are logged and never fail the request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::db::{current_timestamp_ms, decode, encode, MetaDb, MetaStoreError};

pub const SESSION_ID_MAX_LEN: usize = 64;
const TITLE_MAX_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub store_id: Option<String>,
    pub title: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub store_id: Option<String>,
    pub role: String,
    pub content: String,
    pub created_at_ms: i64,
}

/// Normalize a caller-supplied session id; empty or absent ids get a fresh
/// UUID, long ids are clamped.
pub fn sanitize_session_id(raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return Uuid::new_v4().to_string();
    }
    let mut end = trimmed.len().min(SESSION_ID_MAX_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

pub fn trim_title(title: &str) -> Option<String> {
    let clean = title.trim();
    if clean.is_empty() {
        return None;
    }
    if clean.chars().count() <= TITLE_MAX_LEN {
        return Some(clean.to_string());
    }
    let prefix: String = clean.chars().take(TITLE_MAX_LEN).collect();
    Some(format!("{prefix}…"))
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: MetaDb,
}

impl HistoryStore {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        match self.db.chat_sessions.get(&rtxn, session_id)? {
            Some(raw) => Ok(Some(decode(raw)?)),
            None => Ok(None),
        }
    }

    /// Create or refresh the session row. A session belonging to another user
    /// is reported as not-found to avoid leaking its existence.
    pub fn ensure_session(
        &self,
        user_id: &str,
        store_id: Option<&str>,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<(), MetaStoreError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.db.write_txn()?;
        let session = match self.db.chat_sessions.get(&wtxn, session_id)? {
            Some(raw) => {
                let mut session: ChatSession = decode(raw)?;
                if session.user_id != user_id {
                    return Err(MetaStoreError::NotFound(session_id.to_string()));
                }
                session.updated_at_ms = now_ms;
                if session.title.is_none() {
                    session.title = title.and_then(trim_title);
                }
                if session.store_id.is_none() {
                    session.store_id = store_id.map(str::to_string);
                }
                session
            }
            None => ChatSession {
                id: session_id.to_string(),
                user_id: user_id.to_string(),
                store_id: store_id.map(str::to_string),
                title: title.and_then(trim_title),
                updated_at_ms: now_ms,
            },
        };
        let encoded = encode(&session)?;
        self.db.chat_sessions.put(&mut wtxn, session_id, &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Append a message and bump the session. Callers on the chat path treat
    /// errors as telemetry only.
    pub fn persist_message(
        &self,
        user_id: &str,
        store_id: Option<&str>,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), MetaStoreError> {
        if content.is_empty() {
            return Ok(());
        }
        let now_ms = current_timestamp_ms();
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            store_id: store_id.map(str::to_string),
            role: role.to_string(),
            content: content.to_string(),
            created_at_ms: now_ms,
        };
        let key = format!(
            "{}|{:020}|{}",
            session_id,
            now_ms.max(0),
            &message.id[..8.min(message.id.len())]
        );
        let mut wtxn = self.db.write_txn()?;
        let encoded = encode(&message)?;
        self.db.chat_messages.put(&mut wtxn, &key, &encoded)?;
        if let Some(raw) = self.db.chat_sessions.get(&wtxn, session_id)? {
            let mut session: ChatSession = decode(raw)?;
            session.updated_at_ms = now_ms;
            if session.title.is_none() && role == "user" {
                session.title = trim_title(content);
            }
            let encoded = encode(&session)?;
            self.db.chat_sessions.put(&mut wtxn, session_id, &encoded)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// The most recent `limit` messages of a session in chronological order,
    /// optionally restricted to one store.
    pub fn load_history(
        &self,
        user_id: &str,
        session_id: &str,
        store_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MetaStoreError> {
        let prefix = format!("{session_id}|");
        let rtxn = self.db.read_txn()?;
        let mut rows = Vec::new();
        for entry in self.db.chat_messages.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            let message: ChatMessage = decode(raw)?;
            if message.user_id != user_id {
                continue;
            }
            if let Some(store_id) = store_id {
                if message.store_id.as_deref() != Some(store_id) {
                    continue;
                }
            }
            rows.push(message);
        }
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, MetaStoreError> {
        let prefix = format!("{session_id}|");
        let rtxn = self.db.read_txn()?;
        let mut rows = Vec::new();
        for entry in self.db.chat_messages.prefix_iter(&rtxn, &prefix)? {
            let (_, raw) = entry?;
            rows.push(decode(raw)?);
        }
        Ok(rows)
    }

    pub fn list_sessions(
        &self,
        user_id: &str,
        store_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChatSession>, MetaStoreError> {
        let rtxn = self.db.read_txn()?;
        let mut out = Vec::new();
        for entry in self.db.chat_sessions.iter(&rtxn)? {
            let (_, raw) = entry?;
            let session: ChatSession = decode(raw)?;
            if session.user_id != user_id {
                continue;
            }
            if let Some(store_id) = store_id {
                if session.store_id.as_deref() != Some(store_id) {
                    continue;
                }
            }
            out.push(session);
        }
        out.sort_by_key(|s| std::cmp::Reverse(s.updated_at_ms));
        out.truncate(limit.clamp(1, 200));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn history() -> (TempDir, HistoryStore) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = MetaDb::open(&paths).expect("open env");
        (temp, HistoryStore::new(db))
    }

    #[test]
    fn session_ids_are_normalized() {
        assert_eq!(sanitize_session_id(Some("  abc  ")), "abc");
        let generated = sanitize_session_id(None);
        assert!(!generated.is_empty());
        let clamped = sanitize_session_id(Some(&"s".repeat(200)));
        assert_eq!(clamped.len(), SESSION_ID_MAX_LEN);
    }

    #[test]
    fn title_is_set_once_from_first_user_message() {
        let (_temp, history) = history();
        history
            .ensure_session("user-a", None, "sess", Some("first question"))
            .expect("ensure");
        history
            .persist_message("user-a", None, "sess", "assistant", "answer")
            .expect("persist");
        history
            .persist_message("user-a", None, "sess", "user", "second question")
            .expect("persist");

        let session = history.get_session("sess").expect("get").expect("present");
        assert_eq!(session.title.as_deref(), Some("first question"));
    }

    #[test]
    fn long_titles_are_trimmed_with_ellipsis() {
        let title = trim_title(&"t".repeat(80)).expect("title");
        assert_eq!(title.chars().count(), 51);
        assert!(title.ends_with('…'));
        assert_eq!(trim_title("   "), None);
    }

    #[test]
    fn foreign_session_reads_as_not_found() {
        let (_temp, history) = history();
        history
            .ensure_session("user-a", None, "sess", None)
            .expect("ensure");
        let err = history
            .ensure_session("user-b", None, "sess", None)
            .expect_err("foreign session rejected");
        assert!(matches!(err, MetaStoreError::NotFound(_)));
    }

    #[test]
    fn history_returns_most_recent_in_order() {
        let (_temp, history) = history();
        history
            .ensure_session("user-a", None, "sess", None)
            .expect("ensure");
        for i in 0..6 {
            history
                .persist_message("user-a", None, "sess", "user", &format!("m{i}"))
                .expect("persist");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let rows = history
            .load_history("user-a", "sess", None, 4)
            .expect("load");
        let contents: Vec<_> = rows.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4", "m5"]);
    }
}
