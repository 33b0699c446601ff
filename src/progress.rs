use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{ReaderError, Result};

#[cfg(feature = "progress-sqlite")]
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSource {
    #[default]
    Local,
    Online,
}

impl BookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSource::Local => "local",
            BookSource::Online => "online",
        }
    }
}

impl fmt::Display for BookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookSource {
    type Err = ReaderError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(BookSource::Local),
            "online" => Ok(BookSource::Online),
            other => Err(ReaderError::format(format!("unknown book source {other:?}"))),
        }
    }
}

/// Store key: a local file and a remote book may share a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgressKey {
    pub book: String,
    pub source: BookSource,
}

impl ProgressKey {
    pub fn new(book: impl Into<String>, source: BookSource) -> Self {
        Self {
            book: book.into(),
            source,
        }
    }

    /// Parses `"{book}|{source}"`. A key without `|` names a local book.
    /// The source is taken after the last `|`, so book names may contain it.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.rsplit_once('|') {
            Some((book, source)) => Ok(Self::new(book, source.parse()?)),
            None => Ok(Self::new(raw, BookSource::Local)),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.book, self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressRecord {
    pub source: BookSource,
    /// Canonical (1-based) chapter index.
    pub chapter: u32,
    pub page: usize,
    #[serde(alias = "last_read")]
    pub last_read_at: DateTime<Utc>,
    #[serde(alias = "last_chapter")]
    pub last_chapter: String,
}

impl ProgressRecord {
    pub fn now(source: BookSource, chapter: u32, page: usize, last_chapter: impl Into<String>) -> Self {
        Self {
            source,
            chapter,
            page,
            last_read_at: Utc::now(),
            last_chapter: last_chapter.into(),
        }
    }
}

pub trait ProgressStore: Send + Sync {
    fn get(&self, book: &str, source: BookSource) -> Result<Option<ProgressRecord>>;
    /// Stores `record` under `(book, source)`. Empty names are ignored.
    fn set(&self, book: &str, source: BookSource, record: ProgressRecord) -> Result<()>;
    fn delete(&self, book: &str, source: BookSource) -> Result<bool>;
    fn list(&self) -> Result<Vec<(ProgressKey, ProgressRecord)>>;
}

type ProgressMap = BTreeMap<ProgressKey, ProgressRecord>;

#[derive(Default)]
pub struct InMemoryProgressStore {
    inner: Mutex<ProgressMap>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, book: &str, source: BookSource) -> Result<Option<ProgressRecord>> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.get(&ProgressKey::new(book, source)).cloned())
    }

    fn set(&self, book: &str, source: BookSource, mut record: ProgressRecord) -> Result<()> {
        if book.is_empty() {
            return Ok(());
        }
        record.source = source;
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(ProgressKey::new(book, source), record);
        Ok(())
    }

    fn delete(&self, book: &str, source: BookSource) -> Result<bool> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.remove(&ProgressKey::new(book, source)).is_some())
    }

    fn list(&self) -> Result<Vec<(ProgressKey, ProgressRecord)>> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Flat JSON object mapping `"{book}|{source}"` to a record. Every write
/// rewrites the whole file through a temp file and rename.
pub struct JsonProgressStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<ProgressMap> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ProgressMap::new()),
            Err(err) => return Err(err.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(ProgressMap::new());
        }

        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
        let mut map = ProgressMap::new();
        for (raw_key, value) in raw {
            let key = match ProgressKey::parse(&raw_key) {
                Ok(key) => key,
                Err(err) => {
                    log::warn!("[progress] skipping entry {:?}: {}", raw_key, err);
                    continue;
                }
            };
            let explicit_source = value.get("source").is_some();
            let mut record: ProgressRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("[progress] skipping entry {:?}: {}", raw_key, err);
                    continue;
                }
            };
            if !explicit_source {
                record.source = key.source;
            }
            if key.book.is_empty() {
                continue;
            }
            map.insert(ProgressKey::new(key.book, record.source), record);
        }
        Ok(map)
    }

    fn save(&self, map: &ProgressMap) -> Result<()> {
        let raw: BTreeMap<String, &ProgressRecord> =
            map.iter().map(|(key, record)| (key.to_string(), record)).collect();
        let json = serde_json::to_vec_pretty(&raw)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl ProgressStore for JsonProgressStore {
    fn get(&self, book: &str, source: BookSource) -> Result<Option<ProgressRecord>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.load()?.remove(&ProgressKey::new(book, source)))
    }

    fn set(&self, book: &str, source: BookSource, mut record: ProgressRecord) -> Result<()> {
        if book.is_empty() {
            return Ok(());
        }
        record.source = source;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load()?;
        map.insert(ProgressKey::new(book, source), record);
        self.save(&map)
    }

    fn delete(&self, book: &str, source: BookSource) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load()?;
        if map.remove(&ProgressKey::new(book, source)).is_none() {
            return Ok(false);
        }
        self.save(&map)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<(ProgressKey, ProgressRecord)>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.load()?.into_iter().collect())
    }
}

// -----------------------------
// SQLite-backed ProgressStore
// -----------------------------

#[cfg(feature = "progress-sqlite")]
pub struct SqliteProgressStore {
    db_path: PathBuf,
}

#[cfg(feature = "progress-sqlite")]
impl SqliteProgressStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reading_progress (
                book TEXT NOT NULL,
                source TEXT NOT NULL,
                chapter INTEGER NOT NULL,
                page INTEGER NOT NULL,
                last_read_at INTEGER NOT NULL,
                last_chapter TEXT NOT NULL,
                PRIMARY KEY (book, source)
            );",
        )?;
        Ok(conn)
    }

    fn row_to_record(source: &str, chapter: i64, page: i64, last_read_ms: i64, last_chapter: String) -> Result<ProgressRecord> {
        Ok(ProgressRecord {
            source: source.parse()?,
            chapter: u32::try_from(chapter).unwrap_or(0),
            page: usize::try_from(page).unwrap_or(0),
            last_read_at: DateTime::from_timestamp_millis(last_read_ms).unwrap_or_default(),
            last_chapter,
        })
    }
}

#[cfg(feature = "progress-sqlite")]
impl ProgressStore for SqliteProgressStore {
    fn get(&self, book: &str, source: BookSource) -> Result<Option<ProgressRecord>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT chapter, page, last_read_at, last_chapter
                 FROM reading_progress WHERE book = ?1 AND source = ?2",
                params![book, source.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(chapter, page, ms, last_chapter)| {
            Self::row_to_record(source.as_str(), chapter, page, ms, last_chapter)
        })
        .transpose()
    }

    fn set(&self, book: &str, source: BookSource, record: ProgressRecord) -> Result<()> {
        if book.is_empty() {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO reading_progress (book, source, chapter, page, last_read_at, last_chapter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(book, source) DO UPDATE SET
                chapter = excluded.chapter,
                page = excluded.page,
                last_read_at = excluded.last_read_at,
                last_chapter = excluded.last_chapter",
            params![
                book,
                source.as_str(),
                i64::from(record.chapter),
                record.page as i64,
                record.last_read_at.timestamp_millis(),
                record.last_chapter,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, book: &str, source: BookSource) -> Result<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM reading_progress WHERE book = ?1 AND source = ?2",
            params![book, source.as_str()],
        )?;
        Ok(affected > 0)
    }

    fn list(&self) -> Result<Vec<(ProgressKey, ProgressRecord)>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT book, source, chapter, page, last_read_at, last_chapter
             FROM reading_progress ORDER BY book, source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (book, source, chapter, page, ms, last_chapter) = row?;
            let record = Self::row_to_record(&source, chapter, page, ms, last_chapter)?;
            out.push((ProgressKey::new(book, record.source), record));
        }
        Ok(out)
    }
}
