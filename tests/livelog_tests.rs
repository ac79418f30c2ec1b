use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use traffic::config::{DatabaseConfig, ExecMode, LiveLogBackend, LiveLogConfig, StatisticsConfig};
use traffic::db::{Context, Database, StatRecord, TrafficEvent};
use traffic::lifecycle::Lifecycle;
use traffic::livelog::{Level, LiveLog, LogCursor, MemoryRingStore};

fn sqlite_config(dir: &TempDir, mode: ExecMode, buffer: usize) -> LiveLogConfig {
    LiveLogConfig {
        backend: LiveLogBackend::Sqlite,
        buffer,
        directory: Some(dir.path().join("livelog")),
        installation: Some(dir.path().to_path_buf()),
        exec_mode: mode,
        ..LiveLogConfig::default()
    }
}

#[tokio::test]
async fn test_shared_ring_keeps_newest_lines() {
    let dir = tempfile::tempdir().unwrap();
    let live_log = LiveLog::from_config(&sqlite_config(&dir, ExecMode::Web, 4000));
    assert!(live_log.is_enabled());

    for i in 0..4001 {
        live_log.append(Level::Info, format!("line {}", i)).await;
    }

    let (lines, index) = live_log.read_since("0").await;
    assert_eq!(lines.len(), 4000);
    assert_eq!(lines[0].line, "line 1");
    assert_eq!(lines[3999].line, "line 4000");
    assert_eq!(index, lines[3999].key);
}

#[tokio::test]
async fn test_web_and_cli_share_one_view() {
    let dir = tempfile::tempdir().unwrap();
    let web = LiveLog::from_config(&sqlite_config(&dir, ExecMode::Web, 100));
    let cli = LiveLog::from_config(&sqlite_config(&dir, ExecMode::Cli, 100));

    web.append(Level::Info, "served page").await;
    cli.append(Level::Notice, "cron finished").await;

    let mut cursor = LogCursor::new();
    let lines = cursor.poll(&web).await;
    let texts: Vec<&str> = lines.iter().map(|l| l.line.as_str()).collect();
    assert_eq!(texts, vec!["served page", "cron finished"]);

    // A second poll with nothing new returns nothing and keeps the position
    let position = cursor.position().to_string();
    assert!(cursor.poll(&web).await.is_empty());
    assert_eq!(cursor.position(), position);

    cli.append(Level::Error, "cron failed").await;
    let lines = cursor.poll(&web).await;
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].level, Level::Error);
}

#[tokio::test]
async fn test_unusable_directory_disables_live_log() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let config = LiveLogConfig {
        directory: Some(blocker.join("livelog")),
        ..sqlite_config(&dir, ExecMode::Web, 10)
    };
    let live_log = LiveLog::from_config(&config);
    assert!(!live_log.is_enabled());

    // Still safe to use
    live_log.append(Level::Info, "dropped").await;
    let (lines, index) = live_log.read_since("42").await;
    assert!(lines.is_empty());
    assert_eq!(index, "42");
}

#[tokio::test]
async fn test_lifecycle_records_then_flushes_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(&DatabaseConfig {
        url: dir.path().join("traffic.db").to_string_lossy().into_owned(),
        cache_size_mb: 4,
    })
    .await
    .unwrap();
    db.run_migrations().await.unwrap();

    let live_log = LiveLog::new(Arc::new(MemoryRingStore::new(100, Duration::from_secs(1))));
    let lifecycle = Lifecycle::new(&StatisticsConfig::default(), live_log.clone());

    for latency in [10, 11, 10] {
        let event = TrafficEvent::new(Context::Outbound, "get", "https", "cdn.example", "/asset.js")
            .with_response(200, latency);
        lifecycle.record(&event).await;
    }
    assert_eq!(lifecycle.pending(), 3);

    lifecycle.finish(&db).await;
    assert_eq!(lifecycle.pending(), 0);

    let probe = TrafficEvent::new(Context::Outbound, "get", "https", "cdn.example", "/asset.js").with_response(200, 0);
    let key = StatRecord::from_event(&probe);
    let row = db.find_record(&key).await.unwrap().unwrap();
    assert_eq!(row.hit, 3);
    assert_eq!(row.latency_min, 10);
    assert_eq!(row.latency_max, 11);
    assert_eq!(row.latency_avg, 11);

    // Every recorded call also reached the live log
    let (lines, _) = live_log.read_since("0").await;
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| l.line.starts_with("outbound GET https://cdn.example/asset.js 200")));

    // Finishing again writes nothing more
    lifecycle.finish(&db).await;
    let row = db.find_record(&key).await.unwrap().unwrap();
    assert_eq!(row.hit, 3);
}
