//! Flat record store for finished results.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::cell::Cell;
use std::path::Path;

use crate::error::StoreError;
use crate::request::{Role, Target, Turn};
use crate::result::ResultContainer;

/// Where finished results are handed for keeping.
pub trait RecordStore {
    /// Store a finished result and return the id of the first row written.
    fn insert(&self, record: &ResultContainer) -> Result<i64, StoreError>;
}

/// A chat row as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn turn(&self) -> Turn {
        Turn::new(self.role, self.content.clone())
    }
}

/// A chat thread; every chat row belongs to exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// A generated image as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub id: i64,
    pub model: String,
    pub prompt: String,
    pub revised_prompt: Option<String>,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

const UNTITLED: &str = "New Chat";
const TITLE_CHARS: usize = 40;

/// Chat rows are written to the current conversation, which is created on
/// demand if none is selected.
pub struct SqliteStore {
    conn: Connection,
    current: Cell<Option<i64>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn,
            current: Cell::new(None),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT NOT NULL,
                finish_reason TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                elapsed_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                prompt TEXT NOT NULL,
                revised_prompt TEXT,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Databases written before conversations existed lack the column
        let has_conversation_id = self
            .conn
            .prepare("SELECT 1 FROM pragma_table_info('messages') WHERE name = 'conversation_id'")?
            .exists([])?;
        if !has_conversation_id {
            tracing::info!("Adding conversation_id to messages table");
            self.conn.execute(
                "ALTER TABLE messages ADD COLUMN conversation_id INTEGER REFERENCES conversations(id)",
                [],
            )?;
        }
        Ok(())
    }

    pub fn current_conversation(&self) -> Option<i64> {
        self.current.get()
    }

    pub fn select_conversation(&self, id: i64) {
        self.current.set(Some(id));
    }

    /// Start a fresh conversation and make it current. An empty current
    /// conversation is reused instead of piling up blank threads.
    pub fn new_conversation(&self) -> Result<i64, StoreError> {
        if let Some(id) = self.current.get() {
            if self.message_count(id)? == 0 {
                return Ok(id);
            }
        }
        self.create_conversation()
    }

    /// Select the most recent conversation, creating one if there is none.
    pub fn open_latest_conversation(&self) -> Result<i64, StoreError> {
        let latest: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM conversations", [], |row| row.get(0))?;
        match latest {
            Some(id) => {
                self.current.set(Some(id));
                Ok(id)
            }
            None => self.create_conversation(),
        }
    }

    /// All conversations, newest first.
    pub fn conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, created_at FROM conversations ORDER BY id DESC")?;
        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(2)?;
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: parse_timestamp(&created_at),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_conversation(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        self.conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if self.current.get() == Some(id) {
            self.current.set(None);
        }
        Ok(())
    }

    fn create_conversation(&self) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO conversations (title, created_at) VALUES (?1, ?2)",
            params![UNTITLED, Utc::now().to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.current.set(Some(id));
        tracing::debug!("Created conversation {}", id);
        Ok(id)
    }

    fn ensure_conversation(&self) -> Result<i64, StoreError> {
        match self.current.get() {
            Some(id) => Ok(id),
            None => self.create_conversation(),
        }
    }

    fn message_count(&self, conversation_id: i64) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Record what the user sent, so history survives a restart. The first
    /// prompt of an untitled conversation becomes its title.
    pub fn insert_user_turn(&self, model: &str, content: &str) -> Result<i64, StoreError> {
        let conversation_id = self.ensure_conversation()?;
        self.conn.execute(
            "INSERT INTO messages (conversation_id, role, content, model, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, Role::User.as_str(), content, model, Utc::now().to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();

        let title: String = content.trim().chars().take(TITLE_CHARS).collect();
        if !title.is_empty() {
            self.conn.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2 AND title = ?3",
                params![title, conversation_id, UNTITLED],
            )?;
        }
        Ok(id)
    }

    /// The last `limit` rows of the current conversation, oldest first.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let Some(conversation_id) = self.current.get() else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, model, finish_reason, total_tokens, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
            let role: String = row.get(1)?;
            let created_at: String = row.get(6)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                role: Role::parse(&role).unwrap_or(Role::Assistant),
                content: row.get(2)?,
                model: row.get(3)?,
                finish_reason: row.get(4)?,
                total_tokens: row.get(5)?,
                created_at: parse_timestamp(&created_at),
            })
        })?;

        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// The last `limit` generated images, newest first.
    pub fn recent_images(&self, limit: usize) -> Result<Vec<StoredImage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, model, prompt, revised_prompt, data, created_at
             FROM images ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let created_at: String = row.get(5)?;
            Ok(StoredImage {
                id: row.get(0)?,
                model: row.get(1)?,
                prompt: row.get(2)?,
                revised_prompt: row.get(3)?,
                data: row.get(4)?,
                created_at: parse_timestamp(&created_at),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn image_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn insert_message(&self, record: &ResultContainer) -> Result<i64, StoreError> {
        let conversation_id = self.ensure_conversation()?;
        self.conn.execute(
            "INSERT INTO messages
                (conversation_id, role, content, model, finish_reason, prompt_tokens, completion_tokens, total_tokens, elapsed_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                conversation_id,
                record.role.as_str(),
                record.content,
                record.model,
                record.finish_reason.as_ref().map(|r| r.as_str().to_string()),
                record.usage.prompt_tokens,
                record.usage.completion_tokens,
                record.usage.total_tokens,
                record.elapsed.as_millis() as i64,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_images(&self, record: &ResultContainer) -> Result<i64, StoreError> {
        let mut first = None;
        for image in &record.images {
            self.conn.execute(
                "INSERT INTO images (model, prompt, revised_prompt, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.model,
                    record.prompt,
                    record.revised_prompt,
                    image,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            first.get_or_insert(self.conn.last_insert_rowid());
        }
        Ok(first.unwrap_or_default())
    }
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl RecordStore for SqliteStore {
    fn insert(&self, record: &ResultContainer) -> Result<i64, StoreError> {
        match record.target {
            Target::Chat => self.insert_message(record),
            Target::Image => self.insert_images(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestDescriptor;
    use crate::result::{FinishReason, Usage};

    fn reply(content: &str) -> ResultContainer {
        let mut record = ResultContainer::for_request(&RequestDescriptor::chat("llama3.2", "q"));
        record.content = content.to_string();
        record
    }

    #[test]
    fn test_chat_records_come_back_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_user_turn("llama3.2", "hello").unwrap();

        let mut record = reply("Hi there!");
        record.finish_reason = Some(FinishReason::Stop);
        record.usage = Usage::new(3, 4);
        store.insert(&record).unwrap();

        let messages = store.recent_messages(10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Hi there!");
        assert_eq!(messages[1].finish_reason.as_deref(), Some("stop"));
        assert_eq!(messages[1].total_tokens, Some(7));

        let recent = store.recent_messages(1).unwrap();
        assert_eq!(recent[0].role, Role::Assistant);
    }

    #[test]
    fn test_new_conversation_starts_empty_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_user_turn("m", "secret old topic").unwrap();
            store.insert(&reply("old answer")).unwrap();
            let old = store.current_conversation().unwrap();

            let fresh = store.new_conversation().unwrap();
            assert_ne!(fresh, old);
            assert!(store.recent_messages(10).unwrap().is_empty());
        }

        let store = SqliteStore::open(&path).unwrap();
        store.open_latest_conversation().unwrap();
        assert!(store.recent_messages(10).unwrap().is_empty());

        let conversations = store.conversations().unwrap();
        assert_eq!(conversations.len(), 2);
        store.select_conversation(conversations[1].id);
        let contents: Vec<String> = store.recent_messages(10).unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["secret old topic", "old answer"]);
    }

    #[test]
    fn test_first_prompt_titles_the_conversation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.new_conversation().unwrap();
        assert_eq!(store.new_conversation().unwrap(), id);

        store.insert_user_turn("m", "  How do lighthouses work?").unwrap();
        store.insert_user_turn("m", "second question").unwrap();
        assert_eq!(store.conversations().unwrap()[0].title, "How do lighthouses work?");
    }

    #[test]
    fn test_delete_conversation_removes_its_messages() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_user_turn("m", "keep").unwrap();
        let kept = store.current_conversation().unwrap();
        let doomed = store.new_conversation().unwrap();
        store.insert_user_turn("m", "drop").unwrap();

        store.delete_conversation(doomed).unwrap();
        assert_eq!(store.current_conversation(), None);
        assert!(store.recent_messages(10).unwrap().is_empty());
        assert_eq!(store.conversations().unwrap().len(), 1);

        store.select_conversation(kept);
        assert_eq!(store.recent_messages(10).unwrap()[0].content, "keep");
    }

    #[test]
    fn test_legacy_messages_table_gains_conversation_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "CREATE TABLE messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    model TEXT NOT NULL,
                    finish_reason TEXT,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    total_tokens INTEGER,
                    elapsed_ms INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )",
                [],
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        store.insert_user_turn("m", "after upgrade").unwrap();
        assert_eq!(store.recent_messages(10).unwrap().len(), 1);
    }

    #[test]
    fn test_one_row_per_image_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = ResultContainer::for_request(&RequestDescriptor::image("dall-e-3", "a cat"));
        record.images = vec![vec![1, 2], vec![3]];
        record.revised_prompt = Some("a small cat".to_string());

        let id = store.insert(&record).unwrap();
        assert!(id > 0);
        assert_eq!(store.image_count().unwrap(), 2);
        assert!(store.recent_messages(10).unwrap().is_empty());

        let images = store.recent_images(10).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].data, vec![3]);
        assert_eq!(images[1].id, id);
        assert_eq!(images[1].revised_prompt.as_deref(), Some("a small cat"));
        assert_eq!(store.recent_images(1).unwrap().len(), 1);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("conversations.db");
        let store = SqliteStore::open(&path).unwrap();
        store.insert_user_turn("m", "x").unwrap();
        assert!(path.exists());
    }
}
