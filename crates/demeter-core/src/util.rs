/// Tolerant numeric normalizer for upstream metric fields.
///
/// The platform formats counts inconsistently: thousands separators,
/// trailing annotations ("85,221(avg/chapter)"), and compact CJK notation
/// ("1.5万", "2亿"). Unparseable input yields 0 rather than an error —
/// a bad metric must never abort a crawl.
pub fn parse_count(raw: &str) -> u64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }

    // Cut at the first annotation opener.
    let cut = trimmed
        .find(['(', '（'])
        .map_or(trimmed, |idx| &trimmed[..idx]);
    let cleaned: String = cut.chars().filter(|c| *c != ',' && *c != ' ').collect();

    // Compact notation: a decimal number followed by a scale suffix.
    for (suffix, scale) in [("亿", 100_000_000f64), ("万", 10_000f64)] {
        if let Some(num) = cleaned.strip_suffix(suffix) {
            return num
                .parse::<f64>()
                .map(|n| (n * scale) as u64)
                .unwrap_or(0);
        }
    }

    cleaned.parse::<u64>().unwrap_or(0)
}

/// Normalize an optional JSON field into a count.
///
/// Accepts plain numbers, formatted strings, or nothing at all.
pub fn normalize_count(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => parse_count(s),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(parse_count("85221"), 85221);
        assert_eq!(parse_count("0"), 0);
    }

    #[test]
    fn test_thousands_separators() {
        assert_eq!(parse_count("85,221"), 85221);
        assert_eq!(parse_count("1,234,567"), 1234567);
    }

    #[test]
    fn test_trailing_annotations() {
        assert_eq!(parse_count("85,221(avg/chapter)"), 85221);
        assert_eq!(parse_count("1024（每章）"), 1024);
    }

    #[test]
    fn test_compact_notation() {
        assert_eq!(parse_count("1.5万"), 15000);
        assert_eq!(parse_count("32万"), 320_000);
        assert_eq!(parse_count("2亿"), 200_000_000);
        assert_eq!(parse_count("1.02亿"), 102_000_000);
    }

    #[test]
    fn test_unparseable_yields_zero() {
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("n/a"), 0);
        assert_eq!(parse_count("--"), 0);
        assert_eq!(parse_count("万"), 0);
    }

    #[test]
    fn test_normalize_json_values() {
        assert_eq!(normalize_count(Some(&serde_json::json!(42))), 42);
        assert_eq!(normalize_count(Some(&serde_json::json!("1.5万"))), 15000);
        assert_eq!(normalize_count(Some(&serde_json::json!(null))), 0);
        assert_eq!(normalize_count(None), 0);
    }
}
