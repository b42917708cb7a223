/// `mm:ss` countdown label. Minutes are not wrapped into hours.
pub fn format_countdown(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Compact focus-time label used for stats: `45m`, `3h 05m`.
pub fn format_focus_time(seconds: u64) -> String {
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours == 0 {
        format!("{minutes}m")
    } else {
        format!("{hours}h {:02}m", minutes % 60)
    }
}
