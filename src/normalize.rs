use serde_json::Value as JsonValue;

/// Version stamped onto extracts that omit one, so batch identity stays
/// well-defined.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Open-ended expiration sentinel some payers emit instead of a null.
const OPEN_ENDED_EXPIRATION: &str = "9999-12-31";

/// Map a free-form reporting-entity name to a URL/path-safe slug: lowercase,
/// non-alphanumeric runs collapsed to a single `-`, edges trimmed.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Parse a last-updated value into a `YYYY-MM` period string. Tries the
/// common encodings (`YYYY-MM-DD`, `YYYY/MM/DD`, `YYYY-MM`, `YYYY/MM`,
/// `YYYYMMDD`, `YYYYMM`), then falls back to scanning for a `20NN-MM` shaped
/// substring, and finally to `""`. Never errors.
pub fn year_month(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(ym) = parse_leading_year_month(trimmed) {
        return ym;
    }
    scan_year_month(trimmed).unwrap_or_default()
}

fn parse_leading_year_month(s: &str) -> Option<String> {
    let b = s.as_bytes();
    if b.len() >= 7
        && b[..4].iter().all(u8::is_ascii_digit)
        && (b[4] == b'-' || b[4] == b'/')
        && b[5..7].iter().all(u8::is_ascii_digit)
    {
        return checked_year_month(&s[..4], &s[5..7]);
    }
    if b.len() >= 6 && b[..6].iter().all(u8::is_ascii_digit) {
        return checked_year_month(&s[..4], &s[4..6]);
    }
    None
}

fn checked_year_month(year: &str, month: &str) -> Option<String> {
    let m: u32 = month.parse().ok()?;
    if (1..=12).contains(&m) {
        Some(format!("{year}-{month}"))
    } else {
        None
    }
}

fn scan_year_month(s: &str) -> Option<String> {
    let b = s.as_bytes();
    if b.len() < 7 {
        return None;
    }
    for i in 0..=b.len() - 7 {
        let w = &b[i..i + 7];
        if w[0] == b'2'
            && w[1] == b'0'
            && w[2].is_ascii_digit()
            && w[3].is_ascii_digit()
            && (w[4] == b'-' || w[4] == b'/')
            && w[5].is_ascii_digit()
            && w[6].is_ascii_digit()
        {
            if let Some(ym) = checked_year_month(&s[i..i + 4], &s[i + 5..i + 7]) {
                return Some(ym);
            }
        }
    }
    None
}

fn is_placeholder(member: &str) -> bool {
    matches!(
        member.to_ascii_lowercase().as_str(),
        "n" | "u" | "l" | "null" | "none" | "n/a" | "na" | "-"
    )
}

fn clean_members(raw: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = raw
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !is_placeholder(v))
        .collect();
    cleaned.sort();
    cleaned.dedup();
    cleaned
}

/// Normalize a service-code-set field arriving as free text: a JSON-like list
/// (single quotes tolerated) or a `;,| `/whitespace-delimited string. Returns
/// a sorted, deduplicated list of non-empty members with placeholder tokens
/// dropped. Never errors.
pub fn normalize_service_codes(raw: &str) -> Vec<String> {
    let s = raw.trim();
    if s.is_empty() {
        return Vec::new();
    }
    if s.starts_with('[') && s.ends_with(']') {
        if let Some(values) = parse_json_list(s) {
            return clean_members(values);
        }
    }
    clean_members(split_delimited(s))
}

/// Same normalization for a field that already arrived as a native list.
pub fn normalize_service_code_list(values: &[Option<String>]) -> Vec<String> {
    clean_members(values.iter().map(|v| v.clone().unwrap_or_default()).collect())
}

fn parse_json_list(s: &str) -> Option<Vec<String>> {
    let candidate = s.replace('\'', "\"");
    let parsed: JsonValue = serde_json::from_str(&candidate).ok()?;
    let items = parsed.as_array()?;
    Some(
        items
            .iter()
            .map(|v| match v {
                JsonValue::Null => String::new(),
                JsonValue::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}

fn split_delimited(s: &str) -> Vec<String> {
    s.split(|ch: char| matches!(ch, ';' | ',' | '|') || ch.is_whitespace())
        .map(str::to_string)
        .collect()
}

/// Default a missing/blank extract version to the fixed sentinel.
pub fn version_or_default(raw: Option<&str>) -> String {
    match raw {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => DEFAULT_VERSION.to_string(),
    }
}

/// Normalize an expiration date, mapping blanks and the open-ended sentinel
/// to `None`.
pub fn expiration_date(raw: Option<&str>) -> Option<String> {
    match raw {
        Some(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() || trimmed == OPEN_ENDED_EXPIRATION {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        None => None,
    }
}

/// Normalize a ZIP-ish value to five digits (strip non-digits, truncate,
/// left-pad). `None` when no digits are present.
pub fn zip5(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let mut z: String = digits.chars().take(5).collect();
    while z.len() < 5 {
        z.insert(0, '0');
    }
    Some(z)
}

/// Normalize a billing/HCPCS code for reference-table lookups.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_runs_and_trims() {
        assert_eq!(slugify("Acme Health, Inc."), "acme-health-inc");
        assert_eq!(slugify("  --UHC//Gold--  "), "uhc-gold");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn year_month_accepts_common_encodings() {
        assert_eq!(year_month("2025-03-14"), "2025-03");
        assert_eq!(year_month("2025/03/14"), "2025-03");
        assert_eq!(year_month("2025-03"), "2025-03");
        assert_eq!(year_month("20250314"), "2025-03");
        assert_eq!(year_month("202503"), "2025-03");
    }

    #[test]
    fn year_month_falls_back_to_scanning() {
        assert_eq!(year_month("updated 2025-07 final"), "2025-07");
        assert_eq!(year_month("v2 2024/11/30 build"), "2024-11");
    }

    #[test]
    fn year_month_degrades_to_empty() {
        assert_eq!(year_month(""), "");
        assert_eq!(year_month("not a date"), "");
        assert_eq!(year_month("2025-13-01"), "");
    }

    #[test]
    fn service_codes_from_json_like_and_delimited_text_agree() {
        let a = normalize_service_codes("['02','11']");
        let b = normalize_service_codes("[\"11\", \"02\"]");
        let c = normalize_service_codes("11, 02");
        let d = normalize_service_codes("02|11;11");
        assert_eq!(a, vec!["02".to_string(), "11".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
    }

    #[test]
    fn service_codes_drop_placeholders_and_empties() {
        assert!(normalize_service_codes("['n','u','l']").is_empty());
        assert!(normalize_service_codes("[]").is_empty());
        assert!(normalize_service_codes("  ").is_empty());
        assert_eq!(
            normalize_service_code_list(&[
                Some("11".to_string()),
                None,
                Some(" NULL ".to_string()),
                Some("11".to_string()),
            ]),
            vec!["11".to_string()]
        );
    }

    #[test]
    fn version_defaults_when_blank() {
        assert_eq!(version_or_default(None), DEFAULT_VERSION);
        assert_eq!(version_or_default(Some("  ")), DEFAULT_VERSION);
        assert_eq!(version_or_default(Some("2.1")), "2.1");
    }

    #[test]
    fn expiration_sentinel_maps_to_none() {
        assert_eq!(expiration_date(Some("9999-12-31")), None);
        assert_eq!(expiration_date(Some("")), None);
        assert_eq!(
            expiration_date(Some("2026-06-30")),
            Some("2026-06-30".to_string())
        );
    }

    #[test]
    fn zip5_pads_and_truncates() {
        assert_eq!(zip5("30301-1234"), Some("30301".to_string()));
        assert_eq!(zip5("501"), Some("00501".to_string()));
        assert_eq!(zip5("no digits"), None);
    }
}
