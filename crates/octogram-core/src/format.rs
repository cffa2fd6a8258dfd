//! Human readable sizes, durations and ids used in chat replies.

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use md5::{Digest, Md5};
use octogram_config::NotificationsConfig;
use octogram_octoprint::FilamentUse;
use std::fmt::Write;

/// First `len` hex characters of the MD5 digest of `text`.
pub fn hash_id(text: &str, len: usize) -> String {
    let digest = hex::encode(Md5::digest(text.as_bytes()));
    digest.chars().take(len).collect()
}

pub fn format_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes.filter(|b| *b > 0) else {
        return "-".to_string();
    };
    let mut value = bytes as f64;
    for unit in ["bytes", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:3.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}TB", value)
}

pub fn format_filament(filament: &FilamentUse) -> String {
    let Some(length) = filament.length else {
        return "-".to_string();
    };
    let mut out = format!("{:.2} m", length / 1000.0);
    if let Some(volume) = filament.volume.filter(|v| *v != 0.0) {
        out.push_str(&format!(" / {:.2} cm^3", volume));
    }
    out
}

/// `HH:MM:SS`, with `-` for an unknown duration.
pub fn format_duration(seconds: Option<f64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 1.0 => "00:00:00".to_string(),
        Some(s) => format_timedelta(s),
    }
}

/// Hours keep counting past a day, like the host's own timedelta formatting.
pub fn format_timedelta(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Print time estimate that gets coarser the longer it is.
pub fn format_fuzzy_print_time(total_seconds: Option<f64>) -> String {
    let Some(total) = total_seconds.filter(|s| *s >= 1.0) else {
        return "-".to_string();
    };
    let total = total as u64;
    let days = total / 86400;
    let hours = (total % 86400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let plural = |n: u64, unit: &str| {
        if n == 1 {
            format!("{} {}", n, unit)
        } else {
            format!("{} {}s", n, unit)
        }
    };

    if days >= 1 {
        if hours >= 16 {
            plural(days + 1, "day")
        } else if hours >= 8 {
            format!("{}.5 days", days)
        } else {
            plural(days, "day")
        }
    } else if hours >= 1 {
        if hours < 12 {
            if minutes < 15 {
                plural(hours, "hour")
            } else if minutes < 45 {
                format!("{}.5 hours", hours)
            } else {
                plural(hours + 1, "hour")
            }
        } else if hours == 23 && minutes > 30 {
            "1 day".to_string()
        } else if minutes > 30 {
            format!("{} hours", hours + 1)
        } else {
            format!("{} hours", hours)
        }
    } else if minutes >= 1 {
        if minutes < 2 {
            if seconds < 30 {
                "a minute".to_string()
            } else {
                "2 minutes".to_string()
            }
        } else if minutes < 30 {
            let minutes = if seconds > 30 { minutes + 1 } else { minutes };
            format!("{} minutes", minutes)
        } else if minutes <= 40 {
            "40 minutes".to_string()
        } else if minutes <= 50 {
            "50 minutes".to_string()
        } else {
            "1 hour".to_string()
        }
    } else if seconds < 30 {
        "a few seconds".to_string()
    } else {
        "less than a minute".to_string()
    }
}

/// Finish time of a job with `seconds_left` remaining, in the configured format
/// for today, the coming week or later.
pub fn format_eta(now: NaiveDateTime, seconds_left: f64, config: &NotificationsConfig) -> Result<String> {
    let finish = now + Duration::seconds(seconds_left.max(0.0) as i64);
    let later_day = finish.date() > now.date();
    let pattern = if later_day && finish > now + Duration::days(7) {
        &config.week_time_format
    } else if later_day {
        &config.day_time_format
    } else {
        &config.time_format
    };

    let mut out = String::new();
    write!(out, "{}", finish.format(pattern))
        .map_err(|_| anyhow!("invalid time format '{}'", pattern))?;
    Ok(out)
}

pub fn calculate_eta(seconds_left: f64, config: &NotificationsConfig) -> Result<String> {
    format_eta(chrono::Local::now().naive_local(), seconds_left, config)
}
