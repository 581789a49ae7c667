//! Parsing and formatting of human-readable byte sizes.
//!
//! Sizes use binary units (1 KB = 1024 bytes) with SI-style labels, which is
//! what the service's configuration surface (`CACHE_SIZE_LIMIT=1GB`) and the
//! debug telemetry both speak.

use lazy_regex::regex_captures;

/// Fallback budget when a size string cannot be interpreted at all.
const FALLBACK_BYTES: u64 = 1024 * 1024 * 1024;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Parse a human-readable size string (`"1GB"`, `"500 MB"`, `"1.5tb"`) into
/// bytes.
///
/// Unknown formats are parsed as a bare decimal byte count; if that also
/// fails, the value falls back to 1 GiB rather than erroring.
pub fn parse_size(input: &str) -> u64 {
    let input = input.trim();
    if let Some((_, number, unit)) =
        regex_captures!(r"(?i)^(\d+(?:\.\d+)?)\s*(B|KB|MB|GB|TB)$", input)
    {
        let Ok(value) = number.parse::<f64>() else {
            return FALLBACK_BYTES;
        };
        let exponent = match unit.to_ascii_uppercase().as_str() {
            "B" => 0,
            "KB" => 1,
            "MB" => 2,
            "GB" => 3,
            _ => 4,
        };
        return (value * 1024f64.powi(exponent)).round() as u64;
    }

    input.parse::<u64>().unwrap_or(FALLBACK_BYTES)
}

/// Format a byte count with the largest unit at which the value is >= 1,
/// printed with two decimals. Values below 1 KB print as integer bytes.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
