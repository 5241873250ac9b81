//! Alert signal extraction.
//!
//! Turns the raw subject+body of a monitoring mail into a typed
//! [`AlertSignal`]. Extraction is total: every branch has a default, so a
//! malformed mail still yields a signal and never fails the pipeline.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used inside alert bodies ("Trap Time:", "Finished time:").
pub const ALERT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Alert classification, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    Reachability,
    Disk,
    Backup,
    Unknown,
}

impl AlertType {
    /// Canonical uppercase form used in incident keys and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Reachability => "REACHABILITY",
            AlertType::Disk => "DISK",
            AlertType::Backup => "BACKUP",
            AlertType::Unknown => "UNKNOWN",
        }
    }

    /// Parse the stored uppercase form. Anything unrecognized is Unknown.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "REACHABILITY" => AlertType::Reachability,
            "DISK" => AlertType::Disk,
            "BACKUP" => AlertType::Backup,
            _ => AlertType::Unknown,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity. Monitoring mails carry exactly two levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Critical => "Critical",
        }
    }

    /// Parse the stored form. Anything that is not critical is Info.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("critical") {
            Severity::Critical
        } else {
            Severity::Info
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured signal per alert mail. Immutable once extracted.
#[derive(Debug, Clone)]
pub struct AlertSignal {
    /// `HOST_TYPE`, the incident identity this signal belongs to.
    pub incident_key: String,
    pub host: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// Disk usage percentage. 0.0 for non-DISK alerts.
    pub usage: f64,
    /// Embedded alert time, falling back to the mail date or processing time.
    pub timestamp: NaiveDateTime,
    /// Combined subject+body the signal was extracted from.
    pub raw: String,
}

const REACHABILITY_KEYWORDS: &[&str] = &["reachability", "ping", "unreachable", "respond"];

// Host in "Alarm: HOST(...)" / "Notice: HOST(...)" subjects.
static ALARM_HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:alarm|notice):\s+([A-Z0-9]+)\(").unwrap());

// Backup job names carry the host as SITE_HOST[_-]Backup.
static BACKUP_HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([A-Z][A-Z0-9]*)[_-]([A-Z0-9]+)[_-]?Backup").unwrap());

static USAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)is\s+["']?([0-9.]+)\s*%["']?"#).unwrap());

static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([0-9.]+)\s*%").unwrap());

static TRAP_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Trap Time:\s*(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})").unwrap()
});

static FINISHED_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Finished time:\s*(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})").unwrap()
});

/// Extract a structured signal from one alert mail.
///
/// `header_date` is the mail's own date header, used when the body carries
/// no embedded time; `now` is the final fallback.
pub fn extract(
    subject: &str,
    body: &str,
    header_date: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> AlertSignal {
    let raw = format!("{} {}", subject, body);
    let lower = raw.to_lowercase();

    let alert_type = classify(&lower);
    let host = extract_host(subject);
    let usage = if alert_type == AlertType::Disk {
        extract_usage(&raw)
    } else {
        0.0
    };
    let severity = extract_severity(&lower, alert_type);
    let timestamp = extract_timestamp(body, alert_type)
        .or(header_date)
        .unwrap_or(now);

    AlertSignal {
        incident_key: format!("{}_{}", host, alert_type.as_str()),
        host,
        alert_type,
        severity,
        usage,
        timestamp,
        raw,
    }
}

/// Classification priority: DISK, then REACHABILITY, then BACKUP.
/// "disk" wins even when reachability words are also present.
fn classify(lower: &str) -> AlertType {
    if lower.contains("disk") {
        AlertType::Disk
    } else if REACHABILITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        AlertType::Reachability
    } else if lower.contains("backup") {
        AlertType::Backup
    } else {
        AlertType::Unknown
    }
}

/// Host priority: alarm/notice subject pattern, then backup job name,
/// then the literal "UNKNOWN". Unknown hosts of one alert type all merge
/// into a single incident; that collision is accepted behavior.
fn extract_host(subject: &str) -> String {
    if let Some(caps) = ALARM_HOST_RE.captures(subject) {
        return caps[1].to_uppercase();
    }
    if let Some(caps) = BACKUP_HOST_RE.captures(subject) {
        return format!("{}_{}", caps[1].to_uppercase(), caps[2].to_uppercase());
    }
    "UNKNOWN".to_string()
}

/// Disk usage: the `is "X%"` phrasing wins; otherwise the first percentage
/// in the text that is not exactly 90.00, which the monitoring system
/// emits as a threshold placeholder alongside the real reading.
fn extract_usage(raw: &str) -> f64 {
    if let Some(caps) = USAGE_RE.captures(raw) {
        if let Ok(v) = caps[1].parse::<f64>() {
            return v;
        }
    }
    for caps in PERCENT_RE.captures_iter(raw) {
        if let Ok(v) = caps[1].parse::<f64>() {
            if v != 90.0 {
                return v;
            }
        }
    }
    0.0
}

fn extract_severity(lower: &str, alert_type: AlertType) -> Severity {
    let mut severity = if lower.contains("[critical]") {
        Severity::Critical
    } else {
        Severity::Info
    };

    if alert_type == AlertType::Backup {
        // "part succeeded" is a partial failure and must be checked before
        // the success keywords it contains.
        severity = if lower.contains("part succeeded") {
            Severity::Critical
        } else if lower.contains("succeeded") || lower.contains("success") {
            Severity::Info
        } else if lower.contains("fail") {
            Severity::Critical
        } else {
            Severity::Info
        };
    }

    severity
}

fn extract_timestamp(body: &str, alert_type: AlertType) -> Option<NaiveDateTime> {
    if let Some(ts) = parse_time_capture(&TRAP_TIME_RE, body) {
        return Some(ts);
    }
    if alert_type == AlertType::Backup {
        if let Some(ts) = parse_time_capture(&FINISHED_TIME_RE, body) {
            return Some(ts);
        }
    }
    None
}

fn parse_time_capture(re: &Regex, body: &str) -> Option<NaiveDateTime> {
    let caps = re.captures(body)?;
    NaiveDateTime::parse_from_str(&caps[1], ALERT_TIME_FORMAT).ok()
}

/// Trap time embedded in a body, for scheduler ordering. Messages without
/// a parseable trap time sort after everything that has one.
pub fn embedded_trap_time(body: &str) -> Option<NaiveDateTime> {
    parse_time_capture(&TRAP_TIME_RE, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, ALERT_TIME_FORMAT).unwrap()
    }

    fn now() -> NaiveDateTime {
        ts("2026-02-11 12:00:00")
    }

    #[test]
    fn test_classify_priority() {
        assert_eq!(classify("disk space on device"), AlertType::Disk);
        // disk wins even when reachability words are present
        assert_eq!(classify("disk not responding ping"), AlertType::Disk);
        assert_eq!(classify("host unreachable"), AlertType::Reachability);
        assert_eq!(classify("device does not respond"), AlertType::Reachability);
        assert_eq!(classify("nightly backup report"), AlertType::Backup);
        assert_eq!(classify("hello world"), AlertType::Unknown);
    }

    #[test]
    fn test_host_from_alarm_subject() {
        let sig = extract(
            "Alarm: SW01(10.1.2.3) [Critical] Reachability problem",
            "Trap Time: 2026-02-11 11:55:00",
            None,
            now(),
        );
        assert_eq!(sig.host, "SW01");
        assert_eq!(sig.incident_key, "SW01_REACHABILITY");
        assert_eq!(sig.severity, Severity::Critical);
        assert_eq!(sig.timestamp, ts("2026-02-11 11:55:00"));
    }

    #[test]
    fn test_host_from_notice_subject() {
        let sig = extract("Notice: RTR7(core) [Info] ping restored", "", None, now());
        assert_eq!(sig.host, "RTR7");
        assert_eq!(sig.alert_type, AlertType::Reachability);
        assert_eq!(sig.severity, Severity::Info);
    }

    #[test]
    fn test_host_from_backup_job_name() {
        let sig = extract("HQ_NAS1_Backup finished", "Backup succeeded", None, now());
        assert_eq!(sig.host, "HQ_NAS1");
        assert_eq!(sig.alert_type, AlertType::Backup);
        assert_eq!(sig.incident_key, "HQ_NAS1_BACKUP");
    }

    #[test]
    fn test_unknown_hosts_merge_into_one_key() {
        let a = extract("something about ping", "", None, now());
        let b = extract("another unreachable device", "", None, now());
        assert_eq!(a.host, "UNKNOWN");
        assert_eq!(a.incident_key, b.incident_key);
    }

    #[test]
    fn test_usage_primary_pattern() {
        let sig = extract(
            "Alarm: DB2(x) [Critical] Disk usage",
            "Current usage is \"95.5%\" on /var",
            None,
            now(),
        );
        assert_eq!(sig.usage, 95.5);
    }

    #[test]
    fn test_usage_skips_threshold_placeholder() {
        // 90.00 is the configured threshold echoed back by the monitor, not
        // the reading itself.
        let sig = extract(
            "Alarm: DB2(x) [Critical] Disk usage",
            "threshold 90.00% exceeded, current 93.2%",
            None,
            now(),
        );
        assert_eq!(sig.usage, 93.2);
    }

    #[test]
    fn test_usage_zero_for_non_disk() {
        let sig = extract(
            "Alarm: SW01(x) [Critical] unreachable at 99%",
            "",
            None,
            now(),
        );
        assert_eq!(sig.usage, 0.0);
    }

    #[test]
    fn test_backup_part_succeeded_is_critical() {
        let sig = extract("HQ_NAS1_Backup report", "Job part succeeded", None, now());
        assert_eq!(sig.severity, Severity::Critical);
    }

    #[test]
    fn test_backup_succeeded_is_info() {
        let sig = extract("HQ_NAS1_Backup report", "Job succeeded", None, now());
        assert_eq!(sig.severity, Severity::Info);
    }

    #[test]
    fn test_backup_failure_is_critical() {
        let sig = extract("HQ_NAS1_Backup report", "Job failed with code 7", None, now());
        assert_eq!(sig.severity, Severity::Critical);
    }

    #[test]
    fn test_backup_finished_time_fallback() {
        let sig = extract(
            "HQ_NAS1_Backup report",
            "Job succeeded\nFinished time: 2026-02-11 00:33:12",
            None,
            now(),
        );
        assert_eq!(sig.timestamp, ts("2026-02-11 00:33:12"));
    }

    #[test]
    fn test_finished_time_ignored_for_non_backup() {
        let header = ts("2026-02-11 09:00:00");
        let sig = extract(
            "Alarm: SW01(x) [Critical] unreachable",
            "Finished time: 2026-02-11 00:33:12",
            Some(header),
            now(),
        );
        assert_eq!(sig.timestamp, header);
    }

    #[test]
    fn test_timestamp_falls_back_to_now() {
        let sig = extract("Alarm: SW01(x) [Critical] unreachable", "", None, now());
        assert_eq!(sig.timestamp, now());
    }

    #[test]
    fn test_extraction_is_total_on_garbage() {
        let sig = extract("", "", None, now());
        assert_eq!(sig.alert_type, AlertType::Unknown);
        assert_eq!(sig.host, "UNKNOWN");
        assert_eq!(sig.severity, Severity::Info);
        assert_eq!(sig.usage, 0.0);
        assert_eq!(sig.timestamp, now());
        assert_eq!(sig.incident_key, "UNKNOWN_UNKNOWN");
    }

    #[test]
    fn test_embedded_trap_time() {
        assert_eq!(
            embedded_trap_time("Trap Time: 2026-02-11 10:15:00"),
            Some(ts("2026-02-11 10:15:00"))
        );
        assert_eq!(embedded_trap_time("no time here"), None);
    }

    #[test]
    fn test_type_and_severity_roundtrip_storage_forms() {
        assert_eq!(AlertType::parse("REACHABILITY"), AlertType::Reachability);
        assert_eq!(AlertType::parse("weird"), AlertType::Unknown);
        assert_eq!(Severity::parse("Critical"), Severity::Critical);
        assert_eq!(Severity::parse("info"), Severity::Info);
    }

    #[test]
    fn test_severity_markers() {
        let critical = extract("Alarm: SW01(x) [Critical] unreachable", "", None, now());
        assert_eq!(critical.severity, Severity::Critical);

        let info = extract("Notice: SW01(x) [Info] restored ping", "", None, now());
        assert_eq!(info.severity, Severity::Info);

        // No marker at all defaults to Info.
        let unmarked = extract("Alarm: SW01(x) unreachable", "", None, now());
        assert_eq!(unmarked.severity, Severity::Info);
    }
}
