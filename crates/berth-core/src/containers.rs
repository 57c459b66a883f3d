//! Lenient parsing of engine and compose CLI output.
//!
//! Compose has printed `ps --format json` as one array, a single object, and
//! one object per line depending on its version. All of them normalize to a
//! list of [`ContainerRecord`]s here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RUNNING: &str = "running";

/// One container as reported by `compose ps`. Fields are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ContainerRecord(Map<String, Value>);

impl ContainerRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `Name`, falling back to `Names` for older compose releases.
    pub fn name(&self) -> Option<&str> {
        self.text("Name").or_else(|| self.text("Names"))
    }

    pub fn state(&self) -> Option<&str> {
        self.text("State")
    }

    pub fn is_running(&self) -> bool {
        self.state() == Some(RUNNING)
    }
}

fn collect(value: Value, out: &mut Vec<ContainerRecord>) {
    match value {
        Value::Object(map) => out.push(ContainerRecord(map)),
        Value::Array(items) => out.extend(items.into_iter().filter_map(|item| match item {
            Value::Object(map) => Some(ContainerRecord(map)),
            _ => None,
        })),
        _ => {}
    }
}

/// Parse `compose ps --format json` output of any compose release.
/// Unparsable lines and non-object entries are skipped.
pub fn parse_compose_ps(stdout: &str) -> Vec<ContainerRecord> {
    let text = stdout.trim();
    let mut records = Vec::new();
    if text.is_empty() {
        return records;
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        collect(value, &mut records);
        return records;
    }
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            collect(value, &mut records);
        }
    }
    records
}

/// The record an instance is judged by: the first running one, else the first.
pub fn select_primary(records: &[ContainerRecord]) -> Option<&ContainerRecord> {
    records
        .iter()
        .find(|r| r.is_running())
        .or_else(|| records.first())
}

/// First of `patterns` found (case-insensitively) in the process rows of
/// `top` output. The header row is ignored.
pub fn top_matches(stdout: &str, patterns: &[String]) -> Option<String> {
    stdout.lines().skip(1).find_map(|row| {
        let row = row.to_lowercase();
        patterns
            .iter()
            .find(|p| !p.is_empty() && row.contains(&p.to_lowercase()))
            .cloned()
    })
}

/// Resource usage snapshot of one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStats {
    pub memory_usage: String,
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// `"12.5%"` as `12.5`; anything unparsable is `0.0`.
pub fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').trim().parse().unwrap_or(0.0)
}

impl ContainerStats {
    /// Parse `stats --no-stream --format {{json .}}` output.
    pub fn from_json(stdout: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(stdout.trim()).ok()?;
        let obj = value.as_object()?;
        let field = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default();
        Some(Self {
            memory_usage: field("MemUsage").to_owned(),
            memory_percent: parse_percent(field("MemPerc")),
            cpu_percent: parse_percent(field("CPUPerc")),
        })
    }

    /// Parse `{{.MemUsage}}@@{{.MemPerc}}@@{{.CPUPerc}}` output. Only the used
    /// half of `"803MiB / 16GiB"` is kept.
    pub fn from_delimited(stdout: &str) -> Option<Self> {
        let mut parts = stdout.trim().split("@@");
        let (usage, mem, cpu) = (parts.next()?, parts.next()?, parts.next()?);
        if usage.trim().is_empty() {
            return None;
        }
        let used = usage.split('/').next().unwrap_or(usage).trim();
        Some(Self {
            memory_usage: used.to_owned(),
            memory_percent: parse_percent(mem),
            cpu_percent: parse_percent(cpu),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let out = r#"[{"Name":"berth-mc-abc","State":"running"},{"Name":"x","State":"exited"}]"#;
        let records = parse_compose_ps(out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name(), Some("berth-mc-abc"));
        assert!(records[0].is_running());
    }

    #[test]
    fn parses_single_object() {
        let records = parse_compose_ps(r#"{"Names":"berth-mc-abc","State":"exited"}"#);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), Some("berth-mc-abc"));
        assert!(!records[0].is_running());
    }

    #[test]
    fn parses_ndjson_with_noise() {
        let out = "{\"Name\":\"a\",\"State\":\"exited\"}\n\
                   warning: something\n\
                   \n\
                   [{\"Name\":\"b\",\"State\":\"running\"}, 3]\n\
                   \"text\"\n";
        let records = parse_compose_ps(out);
        let names: Vec<_> = records.iter().filter_map(ContainerRecord::name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn empty_output_is_no_records() {
        assert!(parse_compose_ps("").is_empty());
        assert!(parse_compose_ps("  \n ").is_empty());
        assert!(parse_compose_ps("[]").is_empty());
        assert!(parse_compose_ps("42").is_empty());
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let records = parse_compose_ps(r#"{"Name":"a","Health":"healthy"}"#);
        assert_eq!(records[0].get("Health"), Some(&Value::from("healthy")));
    }

    #[test]
    fn primary_prefers_running() {
        let records = parse_compose_ps(
            r#"[{"Name":"a","State":"exited"},{"Name":"b","State":"running"}]"#,
        );
        assert_eq!(select_primary(&records).and_then(ContainerRecord::name), Some("b"));

        let stopped = parse_compose_ps(r#"[{"Name":"a","State":"exited"}]"#);
        assert_eq!(select_primary(&stopped).and_then(ContainerRecord::name), Some("a"));
        assert!(select_primary(&[]).is_none());
    }

    #[test]
    fn top_skips_header_and_ignores_case() {
        let out = "UID PID PPID C STIME TTY TIME CMD\n\
                   1000 4242 1 0 10:00 ? 00:00:01 /srv/PalServer-Linux-Shipping\n";
        let patterns = vec!["palserver".to_owned()];
        assert_eq!(top_matches(out, &patterns).as_deref(), Some("palserver"));

        let header_only = vec!["cmd".to_owned()];
        assert_eq!(top_matches("UID PID CMD\n", &header_only), None);
    }

    #[test]
    fn stats_from_json() {
        let s = ContainerStats::from_json(
            r#"{"MemUsage":"256MiB / 4GiB","MemPerc":"6.25%","CPUPerc":"--"}"#,
        )
        .unwrap();
        assert_eq!(s.memory_usage, "256MiB / 4GiB");
        assert!((s.memory_percent - 6.25).abs() < f64::EPSILON);
        assert!(s.cpu_percent.abs() < f64::EPSILON);
        assert!(ContainerStats::from_json("not json").is_none());
        assert!(ContainerStats::from_json("").is_none());
    }

    #[test]
    fn stats_from_delimited() {
        let s = ContainerStats::from_delimited("803MiB / 16GiB@@4.90%@@12.50%\n").unwrap();
        assert_eq!(s.memory_usage, "803MiB");
        assert!((s.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert!(ContainerStats::from_delimited("803MiB@@4.90%").is_none());
        assert!(ContainerStats::from_delimited("").is_none());
    }
}
