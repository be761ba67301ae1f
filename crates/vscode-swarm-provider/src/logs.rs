//! Parsing of backend log output into [`LogEntry`] values.
//!
//! Both Docker (`docker logs --timestamps`) and Kubernetes (`timestamps=true`)
//! prefix each line with an RFC 3339 timestamp followed by a space.

use chrono::{DateTime, Utc};

use crate::types::{LogEntry, LogLevel, LogOptions};

/// Parse a block of log output, skipping blank lines.
#[must_use]
pub fn parse_logs(raw: &str) -> Vec<LogEntry> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_log_line)
        .collect()
}

/// Parse a single log line.
#[must_use]
pub fn parse_log_line(line: &str) -> LogEntry {
    let line = line.trim_end();
    let (timestamp, rest) = match line.split_once(' ') {
        Some((head, tail)) => match DateTime::parse_from_rfc3339(head) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), tail),
            Err(_) => (None, line),
        },
        None => (None, line),
    };

    LogEntry {
        timestamp,
        level: infer_level(rest),
        message: rest.trim().to_string(),
    }
}

/// Apply time bounds and the line limit, keeping the newest lines.
#[must_use]
pub fn apply_options(entries: Vec<LogEntry>, options: &LogOptions) -> Vec<LogEntry> {
    let mut filtered: Vec<LogEntry> = entries
        .into_iter()
        .filter(|entry| match entry.timestamp {
            Some(ts) => {
                options.since.map_or(true, |since| ts >= since)
                    && options.until.map_or(true, |until| ts <= until)
            }
            None => true,
        })
        .collect();

    let limit = options.lines as usize;
    if filtered.len() > limit {
        filtered.drain(..filtered.len() - limit);
    }
    filtered
}

fn infer_level(message: &str) -> LogLevel {
    let head: String = message
        .chars()
        .take(32)
        .collect::<String>()
        .to_ascii_lowercase();

    if head.contains("error") || head.contains("[err]") || head.contains("fatal") {
        LogLevel::Error
    } else if head.contains("warn") {
        LogLevel::Warn
    } else if head.contains("info") {
        LogLevel::Info
    } else if head.contains("debug") || head.contains("trace") {
        LogLevel::Debug
    } else {
        LogLevel::Unknown
    }
}
