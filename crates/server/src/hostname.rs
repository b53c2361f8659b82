/// Convert a system name to an RFC 1123/952 hostname.
///
/// Spaces become dashes, anything other than letters, digits, dots and
/// dashes is dropped, leading digits/dashes and one trailing dash are
/// stripped, and the result is lowercased.
pub fn to_hostname(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect();

    let trimmed = cleaned.trim_start_matches(|c: char| c.is_ascii_digit() || c == '-');
    let trimmed = trimmed.strip_suffix('-').unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

/// Hostname for a system, `system-{id}` when nothing of the name survives.
pub fn system_hostname(name: &str, id: i64) -> String {
    match to_hostname(name) {
        hostname if hostname.is_empty() => format!("system-{}", id),
        hostname => hostname,
    }
}
