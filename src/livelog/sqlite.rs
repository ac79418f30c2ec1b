//! Cross-process ring backend on SQLite segment files
//!
//! Each segment is a small SQLite file in a shared directory. The file name
//! carries a token derived from the installation path and the execution mode,
//! so two installations never share a segment while the web server and
//! command-line tools of one installation write to separate ones. SQLite's
//! file lock serializes appends across processes; its busy timeout bounds
//! how long a writer waits for it.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{collect_since, Level, LiveLogError, LogLine, SharedRingStore};
use crate::config::ExecMode;

const CREATE_SEGMENT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS livelog (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    level TEXT NOT NULL,
    line TEXT NOT NULL
)
"#;

const INSERT_LINE: &str = r#"
INSERT INTO livelog (key, level, line) VALUES (?, ?, ?)
ON CONFLICT (key) DO UPDATE SET level = excluded.level, line = excluded.line
"#;

// Drop everything older than the newest `capacity` rows (by insertion order)
const TRIM_SEGMENT: &str = r#"
DELETE FROM livelog
WHERE seq <= (SELECT seq FROM livelog ORDER BY seq DESC LIMIT 1 OFFSET ?)
"#;

const SELECT_AFTER: &str = "SELECT key, level, line FROM livelog WHERE key > ? ORDER BY key";

/// Stable 32-bit token for an installation path and a project character (FNV-1a)
pub fn segment_token(installation: &Path, project: char) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let canonical = installation
        .canonicalize()
        .unwrap_or_else(|_| installation.to_path_buf());
    let mut project_bytes = [0u8; 4];
    let project = project.encode_utf8(&mut project_bytes).as_bytes();

    canonical
        .to_string_lossy()
        .as_bytes()
        .iter()
        .chain(project)
        .fold(FNV_OFFSET, |hash, byte| (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME))
}

struct Segment {
    path: PathBuf,
    pool: SqlitePool,
    ready: OnceCell<()>,
}

impl Segment {
    fn open(path: PathBuf, lock_timeout: Duration) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(lock_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(lock_timeout)
            .connect_lazy_with(options);
        Self {
            path,
            pool,
            ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<(), LiveLogError> {
        self.ready
            .get_or_try_init(|| async {
                sqlx::query(CREATE_SEGMENT_TABLE).execute(&self.pool).await?;
                debug!("Live log segment ready at {}", self.path.display());
                Ok::<(), sqlx::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn append(&self, line: &LogLine, capacity: usize) -> Result<(), LiveLogError> {
        self.ensure_table().await?;

        // Rolled back on drop if any statement fails
        let mut tx = self.pool.begin().await?;
        sqlx::query(INSERT_LINE)
            .bind(&line.key)
            .bind(line.level.as_str())
            .bind(&line.line)
            .execute(&mut *tx)
            .await?;
        sqlx::query(TRIM_SEGMENT)
            .bind(i64::try_from(capacity).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_after(&self, cursor: &str) -> Result<Vec<LogLine>, LiveLogError> {
        self.ensure_table().await?;

        let rows: Vec<(String, String, String)> = sqlx::query_as(SELECT_AFTER)
            .bind(cursor)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, level, line)| LogLine {
                key,
                level: Level::from_name(&level),
                line,
            })
            .collect())
    }
}

/// Ring shared by every process of one installation
pub struct SqliteRingStore {
    segments: [Segment; 2],
    writer: usize,
    capacity: usize,
}

impl SqliteRingStore {
    /// Open (lazily) the web and command-line segments of an installation
    ///
    /// Appends go to the segment of `mode`; reads merge both. Each segment
    /// keeps `capacity` lines, so the merged view holds up to twice that.
    pub fn open(
        directory: &Path,
        installation: &Path,
        mode: ExecMode,
        capacity: usize,
        lock_timeout: Duration,
    ) -> Result<Self, LiveLogError> {
        std::fs::create_dir_all(directory)?;

        let segment_path = |project: char| {
            directory.join(format!(
                "livelog-{:08x}.sqlite",
                segment_token(installation, project)
            ))
        };
        let segments = [
            Segment::open(segment_path(ExecMode::Web.project()), lock_timeout),
            Segment::open(segment_path(ExecMode::Cli.project()), lock_timeout),
        ];
        let writer = match mode {
            ExecMode::Web => 0,
            ExecMode::Cli => 1,
        };

        Ok(Self {
            segments,
            writer,
            capacity: capacity.max(1),
        })
    }

    pub fn writer_path(&self) -> &Path {
        &self.segments[self.writer].path
    }
}

#[async_trait]
impl SharedRingStore for SqliteRingStore {
    async fn append(&self, line: &LogLine) -> Result<(), LiveLogError> {
        self.segments[self.writer].append(line, self.capacity).await
    }

    async fn read_since(&self, cursor: &str) -> Result<Vec<LogLine>, LiveLogError> {
        let mut lines = Vec::new();
        for segment in &self.segments {
            lines.extend(segment.read_after(cursor).await?);
        }
        Ok(collect_since(lines, cursor))
    }
}
