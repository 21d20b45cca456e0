/// Helper utilities shared by the manager, the drivers and the CLI

use chrono::{DateTime, Local};
use rand::Rng;

use crate::core::volume::DATE_FORMAT;

const AGENT_NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random agent workload name, `bivac-agent-` followed by 10 characters
pub fn agent_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10)
        .map(|_| AGENT_NAME_CHARSET[rng.gen_range(0..AGENT_NAME_CHARSET.len())] as char)
        .collect();
    format!("bivac-agent-{}", suffix)
}

/// Hostname of the machine (or pod) running Bivac
pub fn local_hostname() -> String {
    sysinfo::System::host_name()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Backup date as shown to users, with its age
pub fn format_backup_date(date: Option<DateTime<Local>>, now: DateTime<Local>) -> String {
    match date {
        Some(d) => {
            let age = (now - d).num_seconds().max(0) as u64;
            format!("{} ({} ago)", d.format(DATE_FORMAT), format_duration(age))
        }
        None => "never".to_string(),
    }
}

/// Truncate string with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
