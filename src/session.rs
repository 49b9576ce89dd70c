use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A message projected down to what the completion API accepts.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Debug)]
struct SessionEntry {
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    messages: Vec<Message>,
}

impl SessionEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self { created_at: now, last_activity: now, messages: Vec::new() }
    }
}

/// In-memory session map shared across request handlers. All operations take
/// the lock only for the duration of the map access, never across an await.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
    max_history: usize,
}

impl SessionStore {
    pub fn new(max_history: usize) -> Self {
        Self { inner: Arc::default(), max_history }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Touches an existing session, creates one under the given id, or mints
    /// a fresh id when none is supplied.
    pub fn create_or_touch(&self, id: Option<&str>) -> String {
        let now = Utc::now();
        let id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let mut map = self.lock();
        map.entry(id.clone())
            .and_modify(|s| s.last_activity = now)
            .or_insert_with(|| SessionEntry::new(now));
        id
    }

    pub fn append(&self, id: &str, role: Role, content: &str, context: Option<serde_json::Value>) {
        let now = Utc::now();
        let msg = Message { role, content: content.to_string(), context, timestamp: now };
        let mut map = self.lock();
        let entry = map.entry(id.to_string()).or_insert_with(|| SessionEntry::new(now));
        entry.messages.push(msg);
        entry.last_activity = now;
        let len = entry.messages.len();
        if len > self.max_history {
            entry.messages.drain(..len - self.max_history);
        }
    }

    pub fn history(&self, id: &str) -> Vec<Message> {
        self.lock().get(id).map(|s| s.messages.clone()).unwrap_or_default()
    }

    pub fn history_for_completion(&self, id: &str) -> Vec<HistoryEntry> {
        self.lock()
            .get(id)
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| HistoryEntry { role: m.role, content: m.content.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent user message and its context, replayed by the stream
    /// endpoint.
    pub fn last_user_message(&self, id: &str) -> Option<(String, Option<serde_json::Value>)> {
        self.lock().get(id).and_then(|s| {
            s.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| (m.content.clone(), m.context.clone()))
        })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Removes sessions idle longer than the TTL; returns how many were dropped.
    pub fn sweep(&self, ttl_secs: u64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs as i64);
        let mut map = self.lock();
        let before = map.len();
        map.retain(|id, s| {
            let keep = s.last_activity >= cutoff;
            if !keep {
                tracing::debug!(session = %id, created_at = %s.created_at, "expiring idle session");
            }
            keep
        });
        before - map.len()
    }

    /// Periodic sweep task tied to process lifecycle; stops when the token is
    /// cancelled.
    pub fn spawn_sweeper(
        &self,
        interval_secs: u64,
        ttl_secs: u64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let removed = store.sweep(ttl_secs);
                        if removed > 0 {
                            info!(removed, "swept expired chat sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_or_touch_mints_touches_and_adopts_ids() {
        let store = SessionStore::new(50);
        let minted = store.create_or_touch(None);
        assert!(store.exists(&minted));

        let adopted = store.create_or_touch(Some("caller-chosen"));
        assert_eq!(adopted, "caller-chosen");
        assert!(store.exists("caller-chosen"));
        assert_eq!(store.len(), 2);

        let again = store.create_or_touch(Some(&minted));
        assert_eq!(again, minted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn append_creates_session_and_preserves_order() {
        let store = SessionStore::new(50);
        store.append("s1", Role::User, "first", None);
        store.append("s1", Role::Assistant, "second", None);
        let history = store.history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "second");
    }

    #[test]
    fn history_truncates_oldest_first() {
        let store = SessionStore::new(3);
        for i in 0..4 {
            store.append("s1", Role::User, &format!("m{i}"), None);
        }
        let history = store.history("s1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m1");
        assert_eq!(history[2].content, "m3");
    }

    #[test]
    fn completion_history_strips_context() {
        let store = SessionStore::new(50);
        store.append("s1", Role::User, "hello", Some(serde_json::json!({"current_node": "root"})));
        let history = store.history_for_completion("s1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "hello");
        assert!(store.history_for_completion("missing").is_empty());
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let store = SessionStore::new(50);
        store.append("s1", Role::User, "question", Some(serde_json::json!({"page_type": "node"})));
        store.append("s1", Role::Assistant, "answer", None);
        let (content, context) = store.last_user_message("s1").unwrap();
        assert_eq!(content, "question");
        assert_eq!(context.unwrap()["page_type"], "node");
        assert!(store.last_user_message("missing").is_none());
    }

    #[test]
    fn sweep_removes_expired_and_keeps_recent() {
        let store = SessionStore::new(50);
        store.append("old", Role::User, "hi", None);
        store.append("fresh", Role::User, "hi", None);
        {
            let mut map = store.lock();
            map.get_mut("old").unwrap().last_activity = Utc::now() - chrono::Duration::seconds(7200);
        }
        let removed = store.sweep(3600);
        assert_eq!(removed, 1);
        assert!(!store.exists("old"));
        assert!(store.exists("fresh"));
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let store = SessionStore::new(50);
        let cancel = CancellationToken::new();
        let handle = store.spawn_sweeper(1, 3600, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
