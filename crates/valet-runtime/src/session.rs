use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use uuid::Uuid;

use valet_core::Message;

/// A conversation session. History is append-only and lives here;
/// the loop works on a snapshot and the runner appends the new turns.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub name: Option<String>,
    /// Source channel + external chat ID for channel-born sessions.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub message_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            channel: None,
            chat_id: None,
            message_count: 0,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Manages all active sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    histories: Arc<RwLock<HashMap<Uuid, Vec<Message>>>>,
    /// Per-session run locks — prevents concurrent agent runs on the same session.
    run_locks: Arc<RwLock<HashMap<Uuid, Arc<TokioMutex<()>>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Uuid {
        let session = Session::new();
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        id
    }

    /// Find a session for a given channel + chat, or lazily materialize one.
    pub async fn find_or_create(&self, channel: &str, chat_id: &str) -> Uuid {
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.channel.as_deref() == Some(channel)
                    && session.chat_id.as_deref() == Some(chat_id)
                {
                    return *id;
                }
            }
        }
        let mut session = Session::new();
        session.channel = Some(channel.to_string());
        session.chat_id = Some(chat_id.to_string());
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn set_name(&self, id: Uuid, name: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.name = Some(name.to_string());
        }
    }

    /// Snapshot of a session's history.
    pub async fn history(&self, id: Uuid) -> Vec<Message> {
        self.histories
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Append messages to a session's history.
    pub async fn append(&self, id: Uuid, messages: Vec<Message>) {
        let count = messages.len();
        self.histories
            .write()
            .await
            .entry(id)
            .or_default()
            .extend(messages);
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.message_count += count;
        }
    }

    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Get the per-session run lock. Callers hold the guard for the duration
    /// of their loop run so two runs never interleave on one conversation.
    pub async fn run_lock(&self, session_id: Uuid) -> Arc<TokioMutex<()>> {
        {
            let locks = self.run_locks.read().await;
            if let Some(lock) = locks.get(&session_id) {
                return Arc::clone(lock);
            }
        }
        let mut locks = self.run_locks.write().await;
        Arc::clone(
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_core::Role;

    #[tokio::test]
    async fn test_find_or_create_is_stable() {
        let manager = SessionManager::new();
        let a = manager.find_or_create("telegram", "chat-1").await;
        let b = manager.find_or_create("telegram", "chat-1").await;
        let c = manager.find_or_create("telegram", "chat-2").await;
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_history_append_only() {
        let manager = SessionManager::new();
        let id = manager.create().await;
        manager
            .append(id, vec![Message::text(Role::User, "one")])
            .await;
        manager
            .append(id, vec![Message::text(Role::Assistant, "two")])
            .await;
        let history = manager.history(id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text_content(), "one");
        assert_eq!(manager.get(id).await.unwrap().message_count, 2);
    }
}
