//! Database module

mod record;
mod schema;
pub mod write_buffer;

pub use record::{Context, Scheme, StatRecord, TrafficEvent, Verb};
pub use write_buffer::{FlushReport, StatisticsBuffer};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::conversion::{data_shorten, number_shorten};

/// Upsert-capable store for aggregate rows
#[async_trait]
pub trait StatStore: Send + Sync {
    /// Insert the record, or merge it into the row sharing its natural key
    async fn upsert(&self, record: &StatRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", config.url))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Negative cache_size is in KiB
            .pragma("cache_size", format!("-{}", config.cache_size_mb * 1024));
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(schema::CREATE_STATISTICS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TS_SITE)
            .execute(&self.pool)
            .await?;
        tracing::debug!("Table \"statistics\" created");
        Ok(())
    }

    /// Fetch the aggregate row for the record's natural key
    pub async fn find_record(&self, key: &StatRecord) -> Result<Option<StatRecord>> {
        let row: Option<StatRow> = sqlx::query_as(
            r#"
            SELECT timestamp, site, context, id, verb, scheme, authority, endpoint, code,
                   hit, latency_min, latency_avg, latency_max, kb_in, kb_out
            FROM statistics
            WHERE timestamp = ? AND site = ? AND context = ? AND id = ? AND verb = ?
              AND scheme = ? AND authority = ? AND endpoint = ? AND code = ?
            "#,
        )
        .bind(key.timestamp.format("%Y-%m-%d").to_string())
        .bind(key.site)
        .bind(key.context.as_str())
        .bind(&key.id)
        .bind(key.verb.as_str())
        .bind(key.scheme.as_str())
        .bind(&key.authority)
        .bind(&key.endpoint)
        .bind(i64::from(key.code))
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    pub async fn get_oldest_date(&self) -> Result<Option<NaiveDate>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT timestamp FROM statistics ORDER BY timestamp ASC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((ts,)) => Ok(Some(NaiveDate::parse_from_str(&ts, "%Y-%m-%d")?)),
            None => Ok(None),
        }
    }

    pub async fn get_distinct_contexts(&self, days: i64, site: Option<i64>) -> Result<Vec<Context>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT context
            FROM statistics
            WHERE timestamp >= ? AND (? IS NULL OR site = ?)
            ORDER BY context
            "#,
        )
        .bind(since_date(days))
        .bind(site)
        .bind(site)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(c,)| Context::from_name(&c)).collect())
    }

    pub async fn get_context_stats(&self, days: i64, site: Option<i64>) -> Result<Vec<ContextStat>> {
        let rows: Vec<(String, i64, f64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT context,
                   SUM(hit) AS hits,
                   CAST(SUM(latency_avg * hit) AS REAL) / SUM(hit),
                   MIN(latency_min),
                   MAX(latency_max),
                   SUM(kb_in),
                   SUM(kb_out)
            FROM statistics
            WHERE timestamp >= ? AND (? IS NULL OR site = ?) AND hit > 0
            GROUP BY context
            ORDER BY hits DESC
            "#,
        )
        .bind(since_date(days))
        .bind(site)
        .bind(site)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(context, hits, latency_avg, latency_min, latency_max, kb_in, kb_out)| ContextStat {
                context: Context::from_name(&context),
                hits,
                latency_avg,
                latency_min,
                latency_max,
                kb_in,
                kb_out,
                hits_short: number_shorten(hits as f64, 2),
                data_in_short: data_shorten(kb_in as f64 * 1024.0, 2),
                data_out_short: data_shorten(kb_out as f64 * 1024.0, 2),
            })
            .collect())
    }
}

#[async_trait]
impl StatStore for Database {
    async fn upsert(&self, record: &StatRecord) -> Result<()> {
        sqlx::query(schema::UPSERT_STATISTICS)
            .bind(record.timestamp.format("%Y-%m-%d").to_string())
            .bind(record.site)
            .bind(record.context.as_str())
            .bind(&record.id)
            .bind(record.verb.as_str())
            .bind(record.scheme.as_str())
            .bind(&record.authority)
            .bind(&record.endpoint)
            .bind(i64::from(record.code))
            .bind(i64::from(record.hit))
            .bind(i64::from(record.latency_min))
            .bind(i64::from(record.latency_avg))
            .bind(i64::from(record.latency_max))
            .bind(i64::from(record.kb_in))
            .bind(i64::from(record.kb_out))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

type StatRow = (
    String,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
);

fn row_to_record(row: StatRow) -> Result<StatRecord> {
    let (timestamp, site, context, id, verb, scheme, authority, endpoint, code, hit, latency_min, latency_avg, latency_max, kb_in, kb_out) = row;
    Ok(StatRecord {
        timestamp: NaiveDate::parse_from_str(&timestamp, "%Y-%m-%d")?,
        site,
        context: Context::from_name(&context),
        id,
        verb: Verb::from_name(&verb),
        scheme: Scheme::from_name(&scheme),
        authority,
        endpoint,
        code: u16::try_from(code)?,
        hit: u32::try_from(hit)?,
        latency_min: u32::try_from(latency_min)?,
        latency_avg: u32::try_from(latency_avg)?,
        latency_max: u32::try_from(latency_max)?,
        kb_in: u32::try_from(kb_in)?,
        kb_out: u32::try_from(kb_out)?,
    })
}

/// First day (inclusive) of a window covering the last `days` days
///
/// Windows reaching past the earliest representable date cover everything.
fn since_date(days: i64) -> String {
    let today = Utc::now().date_naive();
    Duration::try_days(days.max(1) - 1)
        .and_then(|back| today.checked_sub_signed(back))
        .unwrap_or(NaiveDate::MIN)
        .format("%Y-%m-%d")
        .to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextStat {
    pub context: Context,
    pub hits: i64,
    pub latency_avg: f64,
    pub latency_min: i64,
    pub latency_max: i64,
    pub kb_in: i64,
    pub kb_out: i64,
    pub hits_short: String,
    pub data_in_short: String,
    pub data_out_short: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("traffic.db").to_string_lossy().into_owned(),
            cache_size_mb: 4,
        };
        let db = Database::new(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        (db, dir)
    }

    fn record(latency: u32, kb_in: u32) -> StatRecord {
        let mut r = StatRecord::new();
        r.context = Context::Outbound;
        r.verb = Verb::Get;
        r.scheme = Scheme::Https;
        r.authority = "api.example.com".to_string();
        r.endpoint = "/v1/items".to_string();
        r.code = 200;
        r.latency_min = latency;
        r.latency_avg = latency;
        r.latency_max = latency;
        r.kb_in = kb_in;
        r
    }

    /// Sequential application of the stored running-average formula
    fn sequential_avg(latencies: &[u32]) -> u32 {
        let mut avg = 0u32;
        for (hit, latency) in latencies.iter().enumerate() {
            if hit == 0 {
                avg = *latency;
            } else {
                let hit = hit as f64;
                avg = ((f64::from(avg) * hit + f64::from(*latency)) / (hit + 1.0)).round() as u32;
            }
        }
        avg
    }

    #[tokio::test]
    async fn test_three_records_merge_into_one_row() {
        let (db, _dir) = setup_db().await;
        for (latency, kb) in [(100, 1), (200, 2), (300, 3)] {
            db.upsert(&record(latency, kb)).await.unwrap();
        }

        let row = db.find_record(&record(0, 0)).await.unwrap().unwrap();
        assert_eq!(row.hit, 3);
        assert_eq!(row.latency_min, 100);
        assert_eq!(row.latency_max, 300);
        assert_eq!(row.latency_avg, 200);
        assert_eq!(row.latency_avg, sequential_avg(&[100, 200, 300]));
        assert_eq!(row.kb_in, 6);
    }

    #[tokio::test]
    async fn test_running_average_is_sequential_not_batch() {
        let (db, _dir) = setup_db().await;
        let latencies = [10, 11, 10];
        for latency in latencies {
            db.upsert(&record(latency, 0)).await.unwrap();
        }

        let row = db.find_record(&record(0, 0)).await.unwrap().unwrap();
        // 10 -> round(10.5) = 11 -> round((11 * 2 + 10) / 3) = 11, while the batch mean rounds to 10
        assert_eq!(row.latency_avg, 11);
        assert_eq!(row.latency_avg, sequential_avg(&latencies));
        assert_eq!(row.hit, 3);
    }

    #[tokio::test]
    async fn test_min_max_are_monotonic() {
        let (db, _dir) = setup_db().await;
        let mut last_min = u32::MAX;
        let mut last_max = 0;
        for latency in [50, 70, 20, 90, 60, 10, 95] {
            db.upsert(&record(latency, 0)).await.unwrap();
            let row = db.find_record(&record(0, 0)).await.unwrap().unwrap();
            assert!(row.latency_min <= last_min);
            assert!(row.latency_max >= last_max);
            last_min = row.latency_min;
            last_max = row.latency_max;
        }
        assert_eq!((last_min, last_max), (10, 95));
    }

    #[tokio::test]
    async fn test_distinct_natural_keys_stay_separate() {
        let (db, _dir) = setup_db().await;
        let ok = record(10, 1);
        let mut failed = record(30, 1);
        failed.code = 503;
        db.upsert(&ok).await.unwrap();
        db.upsert(&failed).await.unwrap();
        db.upsert(&ok).await.unwrap();

        assert_eq!(db.find_record(&ok).await.unwrap().unwrap().hit, 2);
        assert_eq!(db.find_record(&failed).await.unwrap().unwrap().hit, 1);
    }

    #[tokio::test]
    async fn test_context_stats_and_oldest_date() {
        let (db, _dir) = setup_db().await;
        assert_eq!(db.get_oldest_date().await.unwrap(), None);

        db.upsert(&record(100, 2048)).await.unwrap();
        db.upsert(&record(300, 0)).await.unwrap();
        let mut inbound = record(40, 1);
        inbound.context = Context::Inbound;
        inbound.site = 7;
        db.upsert(&inbound).await.unwrap();

        let stats = db.get_context_stats(30, None).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].context, Context::Outbound);
        assert_eq!(stats[0].hits, 2);
        assert_eq!(stats[0].latency_avg, 200.0);
        assert_eq!(stats[0].data_in_short, "2M");

        let site_contexts = db.get_distinct_contexts(30, Some(7)).await.unwrap();
        assert_eq!(site_contexts, vec![Context::Inbound]);

        assert_eq!(db.get_oldest_date().await.unwrap(), Some(Utc::now().date_naive()));
    }

    #[tokio::test]
    async fn test_oversized_window_covers_all_rows() {
        let (db, _dir) = setup_db().await;
        let mut old = record(50, 0);
        old.timestamp = NaiveDate::from_ymd_opt(2001, 1, 1).unwrap();
        db.upsert(&old).await.unwrap();
        db.upsert(&record(150, 0)).await.unwrap();

        let stats = db.get_context_stats(100_000_000, None).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].hits, 2);

        let contexts = db.get_distinct_contexts(i64::MAX, None).await.unwrap();
        assert_eq!(contexts, vec![Context::Outbound]);

        // Only today's row falls inside a one-day window
        assert_eq!(db.get_context_stats(1, None).await.unwrap()[0].hits, 1);
    }
}
