//! Database schema definitions

// One row per natural key; hit/latency/kb columns are aggregates
pub const CREATE_STATISTICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS statistics (
    timestamp TEXT NOT NULL DEFAULT '0000-00-00',   -- YYYY-MM-DD (UTC day)
    site INTEGER NOT NULL DEFAULT 0,
    context TEXT NOT NULL DEFAULT 'unknown',
    id TEXT NOT NULL DEFAULT '-',
    verb TEXT NOT NULL DEFAULT 'unknown',
    scheme TEXT NOT NULL DEFAULT 'unknown',
    authority TEXT NOT NULL DEFAULT '-',
    endpoint TEXT NOT NULL DEFAULT '-',
    code INTEGER NOT NULL DEFAULT 0,
    hit INTEGER NOT NULL DEFAULT 0,
    latency_min INTEGER NOT NULL DEFAULT 0,
    latency_avg INTEGER NOT NULL DEFAULT 0,
    latency_max INTEGER NOT NULL DEFAULT 0,
    kb_in INTEGER NOT NULL DEFAULT 0,
    kb_out INTEGER NOT NULL DEFAULT 0,
    UNIQUE (timestamp, site, context, id, verb, scheme, authority, endpoint, code)
)
"#;

// For date-range dashboards filtered by site
pub const CREATE_INDEX_TS_SITE: &str =
    "CREATE INDEX IF NOT EXISTS idx_statistics_ts_site ON statistics(timestamp, site)";

// Insert a raw record or merge it into the existing aggregate row.
// Unqualified columns on the right-hand side are the pre-update values,
// so latency_avg is weighted by the hit count before the increment.
pub const UPSERT_STATISTICS: &str = r#"
INSERT INTO statistics (
    timestamp, site, context, id, verb, scheme, authority, endpoint, code,
    hit, latency_min, latency_avg, latency_max, kb_in, kb_out
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (timestamp, site, context, id, verb, scheme, authority, endpoint, code) DO UPDATE SET
    hit = hit + 1,
    kb_in = kb_in + excluded.kb_in,
    kb_out = kb_out + excluded.kb_out,
    latency_min = MIN(latency_min, excluded.latency_min),
    latency_max = MAX(latency_max, excluded.latency_max),
    latency_avg = CAST(ROUND(((latency_avg * hit) + excluded.latency_avg) * 1.0 / (hit + 1)) AS INTEGER)
"#;
