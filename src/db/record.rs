//! Statistics records and the traffic events they are built from

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const ID_WIDTH: usize = 40;
const AUTHORITY_WIDTH: usize = 250;
const ENDPOINT_WIDTH: usize = 250;

/// Origin of an observed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

impl Context {
    pub const ALL: &'static [Context] = &[Context::Inbound, Context::Outbound, Context::Unknown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Context::Inbound => "inbound",
            Context::Outbound => "outbound",
            Context::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(name.trim()))
            .unwrap_or_default()
    }
}

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    #[default]
    Unknown,
}

impl Verb {
    pub const ALL: &'static [Verb] = &[
        Verb::Get,
        Verb::Head,
        Verb::Post,
        Verb::Put,
        Verb::Delete,
        Verb::Connect,
        Verb::Options,
        Verb::Trace,
        Verb::Patch,
        Verb::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Head => "head",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Delete => "delete",
            Verb::Connect => "connect",
            Verb::Options => "options",
            Verb::Trace => "trace",
            Verb::Patch => "patch",
            Verb::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(name.trim()))
            .unwrap_or_default()
    }
}

/// URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    #[default]
    Unknown,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => Scheme::Unknown,
        }
    }
}

/// One observed call, before normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEvent {
    pub at: DateTime<Utc>,
    pub site: i64,
    pub context: Context,
    pub id: String,
    pub verb: String,
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
    pub code: u16,
    pub latency_ms: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficEvent {
    pub fn new(context: Context, verb: &str, scheme: &str, authority: &str, endpoint: &str) -> Self {
        Self {
            at: Utc::now(),
            site: 0,
            context,
            id: "-".to_string(),
            verb: verb.to_string(),
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
            code: 0,
            latency_ms: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn with_response(mut self, code: u16, latency_ms: u32) -> Self {
        self.code = code;
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_sizes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
        self
    }

    pub fn with_site(mut self, site: i64) -> Self {
        self.site = site;
        self
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }

    pub fn with_time(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// Full URL as shown in log lines
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.to_ascii_lowercase(), self.authority, self.endpoint)
    }
}

/// One row of the statistics table, or one raw record waiting to be merged into it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub timestamp: NaiveDate,
    pub site: i64,
    pub context: Context,
    pub id: String,
    pub verb: Verb,
    pub scheme: Scheme,
    pub authority: String,
    pub endpoint: String,
    pub code: u16,
    pub hit: u32,
    pub latency_min: u32,
    pub latency_avg: u32,
    pub latency_max: u32,
    pub kb_in: u32,
    pub kb_out: u32,
}

impl StatRecord {
    /// An empty record for today
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now().date_naive(),
            site: 0,
            context: Context::Unknown,
            id: "-".to_string(),
            verb: Verb::Unknown,
            scheme: Scheme::Unknown,
            authority: "-".to_string(),
            endpoint: "-".to_string(),
            code: 0,
            hit: 1,
            latency_min: 0,
            latency_avg: 0,
            latency_max: 0,
            kb_in: 0,
            kb_out: 0,
        }
    }

    /// Normalize a traffic event into a mergeable record
    pub fn from_event(event: &TrafficEvent) -> Self {
        Self {
            timestamp: event.at.date_naive(),
            site: event.site,
            context: event.context,
            id: or_dash(truncate(event.id.trim(), ID_WIDTH)),
            verb: Verb::from_name(&event.verb),
            scheme: Scheme::from_name(&event.scheme),
            authority: or_dash(truncate(&event.authority.trim().to_ascii_lowercase(), AUTHORITY_WIDTH)),
            endpoint: or_dash(truncate(strip_query(&event.endpoint), ENDPOINT_WIDTH)),
            code: event.code,
            hit: 1,
            latency_min: event.latency_ms,
            latency_avg: event.latency_ms,
            latency_max: event.latency_ms,
            kb_in: to_kb(event.bytes_in),
            kb_out: to_kb(event.bytes_out),
        }
    }
}

impl Default for StatRecord {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_query(endpoint: &str) -> &str {
    let end = endpoint.find(['?', '#']).unwrap_or(endpoint.len());
    endpoint[..end].trim()
}

fn truncate(value: &str, width: usize) -> &str {
    match value.char_indices().nth(width) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn to_kb(bytes: u64) -> u32 {
    u32::try_from(bytes.div_ceil(1024)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_record_defaults() {
        let record = StatRecord::new();
        assert_eq!(record.site, 0);
        assert_eq!(record.context, Context::Unknown);
        assert_eq!(record.id, "-");
        assert_eq!(record.authority, "-");
        assert_eq!(record.endpoint, "-");
        assert_eq!(record.hit, 1);
        assert_eq!(record.code, 0);
    }

    #[test]
    fn test_from_event_normalizes_fields() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();
        let event = TrafficEvent::new(Context::Outbound, "POST", "HTTPS", "API.Example.com", "/v1/items?page=2#top")
            .with_response(201, 87)
            .with_sizes(1, 2049)
            .with_time(at);

        let record = StatRecord::from_event(&event);
        assert_eq!(record.timestamp, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(record.verb, Verb::Post);
        assert_eq!(record.scheme, Scheme::Https);
        assert_eq!(record.authority, "api.example.com");
        assert_eq!(record.endpoint, "/v1/items");
        assert_eq!(record.code, 201);
        assert_eq!((record.latency_min, record.latency_avg, record.latency_max), (87, 87, 87));
        assert_eq!(record.kb_in, 1);
        assert_eq!(record.kb_out, 3);
        assert_eq!(record.hit, 1);
    }

    #[test]
    fn test_unknown_enum_values_fall_back() {
        let event = TrafficEvent::new(Context::Outbound, "PURGE", "ftp", "", "");
        let record = StatRecord::from_event(&event);
        assert_eq!(record.verb, Verb::Unknown);
        assert_eq!(record.scheme, Scheme::Unknown);
        assert_eq!(record.authority, "-");
        assert_eq!(record.endpoint, "-");
        assert_eq!(Context::from_name("sideways"), Context::Unknown);
    }

    #[test]
    fn test_long_identifiers_are_truncated() {
        let long = "x".repeat(300);
        let event = TrafficEvent::new(Context::Inbound, "get", "http", &long, &format!("/{}", long))
            .with_id(long.clone());
        let record = StatRecord::from_event(&event);
        assert_eq!(record.id.len(), ID_WIDTH);
        assert_eq!(record.authority.len(), AUTHORITY_WIDTH);
        assert_eq!(record.endpoint.len(), ENDPOINT_WIDTH);
    }

    #[test]
    fn test_zero_bytes_is_zero_kb() {
        assert_eq!(to_kb(0), 0);
        assert_eq!(to_kb(1024), 1);
        assert_eq!(to_kb(1025), 2);
    }
}
