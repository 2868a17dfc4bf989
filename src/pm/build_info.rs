use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("PIPEMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("PIPEMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Short commit the daemon was built from, or `unknown` outside a git checkout.
pub fn git_rev() -> &'static str {
    option_env!("PIPEMASTER_GIT_REV").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:")
        && let Ok(secs) = epoch.trim().parse::<i64>()
    {
        // Render in UTC, stable across environments.
        return chrono::Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| format!("epoch {secs}"));
    }

    // Common case: RFC3339 "YYYY-MM-DDTHH:MM:SSZ" -> "YYYY-MM-DD HH:MM:SS" (UTC)
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt
            .with_timezone(&chrono::Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
    }

    // Best-effort fallback.
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "pipemaster {} rev {} (built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        git_rev(),
        build_host(),
        build_time_pretty()
    )
}
