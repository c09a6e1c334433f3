//! Human-readable byte size parsing and formatting.

const UNITS: &[(&str, u64)] = &[
    ("B", 1),
    ("KB", 1024),
    ("MB", 1024 * 1024),
    ("GB", 1024 * 1024 * 1024),
    ("TB", 1024 * 1024 * 1024 * 1024),
];

/// Parse a size token like `1024`, `5MB`, `12.5MiB` or `1.2G` into bytes.
/// Returns `None` for anything that is not a size.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: f64 = num_str.parse().ok()?;
    if !num.is_finite() || num < 0.0 {
        return None;
    }

    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024u64.pow(4),
        _ => return None,
    };

    Some((num * multiplier as f64) as u64)
}

/// Format a byte count the short way: `1KB`, `5.2MB`, `50GB`.
pub fn format_size(bytes: u64) -> String {
    for (i, &(unit, divisor)) in UNITS.iter().enumerate().rev() {
        if bytes >= divisor {
            let value = bytes / divisor;
            let remainder = bytes % divisor;
            if remainder == 0 || i == 0 {
                return format!("{value}{unit}");
            }
            let decimal = remainder * 10 / divisor;
            if decimal > 0 {
                return format!("{value}.{decimal}{unit}");
            }
            return format!("{value}{unit}");
        }
    }
    format!("{bytes}B")
}
