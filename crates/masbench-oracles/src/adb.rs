// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! ADB output plumbing shared by the zoo: content-provider query command
//! building and row parsing, plus small dumpsys field extractors. Parsing is
//! structured-first: named fields, never a regex over the whole dump.

use std::collections::BTreeMap;

/// Build a `content query` shell command.
pub fn content_query_cmd(
    uri: &str,
    projection: &str,
    where_clause: Option<&str>,
    sort: Option<&str>,
    limit: Option<u32>,
) -> String {
    let mut cmd = format!("content query --uri {uri} --projection {projection}");
    if let Some(where_clause) = where_clause {
        cmd.push_str(&format!(" --where \"{where_clause}\""));
    }
    if let Some(sort) = sort {
        cmd.push_str(&format!(" --sort \"{sort}\""));
    }
    if let Some(limit) = limit {
        cmd.push_str(&format!(" --limit {limit}"));
    }
    cmd
}

/// Parse `content query` output rows.
///
/// Each row line looks like `Row: 0 _id=5, address=555-0123, body=hi, you`.
/// Values may themselves contain `, `, so the split points are the known
/// projection keys, located left-to-right.
pub fn parse_content_rows(stdout: &str, expected_keys: &[&str]) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("Row:") else {
            continue;
        };
        let rest = rest.trim_start();
        // Skip the row ordinal.
        let rest = match rest.split_once(' ') {
            Some((ordinal, tail)) if ordinal.bytes().all(|b| b.is_ascii_digit()) => tail,
            _ => rest,
        };

        // Locate `key=` markers for every expected key, in order of position.
        let mut markers: Vec<(usize, &str)> = Vec::new();
        for key in expected_keys {
            let needle = format!("{key}=");
            let mut from = 0;
            while let Some(pos) = rest[from..].find(&needle) {
                let at = from + pos;
                let preceded_ok = at == 0 || rest[..at].ends_with(", ") || rest[..at].ends_with(' ');
                if preceded_ok {
                    markers.push((at, key));
                    break;
                }
                from = at + needle.len();
            }
        }
        markers.sort_by_key(|(at, _)| *at);

        let mut row = BTreeMap::new();
        for (i, (at, key)) in markers.iter().enumerate() {
            let value_start = at + key.len() + 1;
            let value_end = markers
                .get(i + 1)
                .map(|(next_at, _)| {
                    // Trim the `, ` separator before the next key.
                    rest[..*next_at].trim_end().trim_end_matches(',').len()
                })
                .unwrap_or(rest.len());
            if value_start <= value_end {
                let value = rest[value_start..value_end].trim().to_string();
                let value = if value == "NULL" { String::new() } else { value };
                row.insert((*key).to_string(), value);
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    rows
}

/// Strip everything but digits; phone comparison works on suffixes of this.
pub fn normalize_phone(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn phone_matches(candidate: &str, expected: &str) -> bool {
    let cand = normalize_phone(candidate);
    let exp = normalize_phone(expected);
    if cand.is_empty() || exp.is_empty() {
        return false;
    }
    cand == exp || cand.ends_with(&exp) || exp.ends_with(&cand)
}

/// Extract `key=value` fields from dumpsys-style output. Returns every value
/// seen for the key, in order.
pub fn dumpsys_fields<'a>(output: &'a str, key: &str) -> Vec<&'a str> {
    let needle = format!("{key}=");
    let mut out = Vec::new();
    for line in output.lines() {
        let mut rest = line.trim();
        while let Some(pos) = rest.find(&needle) {
            let preceded_ok = pos == 0
                || rest[..pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_whitespace() || c == '{' || c == ',');
            let after = &rest[pos + needle.len()..];
            if preceded_ok {
                let end = after
                    .find(|c: char| c == ',' || c == '}' || c == ' ')
                    .unwrap_or(after.len());
                out.push(&after[..end]);
            }
            rest = after;
        }
    }
    out
}

/// `mCurrentFocus=Window{ab3 u0 com.pkg/com.pkg.Activity}` style component
/// extraction: the `pkg/activity` token inside a `Window{...}` or
/// `ActivityRecord{...}` braces group.
pub fn parse_component(line: &str) -> Option<(String, String)> {
    let inner = line.rsplit_once('{').map(|(_, tail)| tail)?;
    let inner = inner.split_once('}').map(|(head, _)| head).unwrap_or(inner);
    for token in inner.split_whitespace() {
        if let Some((pkg, activity)) = token.split_once('/') {
            if pkg.contains('.') && !pkg.is_empty() && !activity.is_empty() {
                return Some((pkg.to_string(), activity.to_string()));
            }
        }
    }
    None
}

/// Civil date+time ("2026-08-02 12:34:56") to epoch seconds, for dumpsys
/// package install timestamps. The value is device-local; callers must note
/// that when windowing.
pub fn parse_dumpsys_datetime(text: &str) -> Option<u64> {
    let text = text.trim();
    let (date, time) = text.split_once(' ')?;
    let mut dmy = date.split('-');
    let year: i64 = dmy.next()?.parse().ok()?;
    let month: i64 = dmy.next()?.parse().ok()?;
    let day: i64 = dmy.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let mut hms = time.split(':');
    let hour: i64 = hms.next()?.parse().ok()?;
    let minute: i64 = hms.next()?.parse().ok()?;
    let second: i64 = hms.next()?.parse().ok()?;

    // days_from_civil
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let secs = days * 86_400 + hour * 3_600 + minute * 60 + second;
    u64::try_from(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_rows_parse_with_commas_in_values() {
        let stdout = "Row: 0 _id=5, address=555-0123, date=1722500000123, body=hello, world\n\
                      Row: 1 _id=6, address=555-9999, date=1722500000500, body=NULL\n";
        let rows = parse_content_rows(stdout, &["_id", "address", "date", "body"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["body"], "hello, world");
        assert_eq!(rows[0]["address"], "555-0123");
        assert_eq!(rows[1]["body"], "");
    }

    #[test]
    fn content_rows_ignore_non_row_lines() {
        let stdout = "No result found.\n";
        assert!(parse_content_rows(stdout, &["_id"]).is_empty());
    }

    #[test]
    fn phone_suffix_matching() {
        assert!(phone_matches("+1-555-0123", "5550123"));
        assert!(phone_matches("5550123", "+1 (555) 0123"));
        assert!(!phone_matches("5550123", "5559999"));
        assert!(!phone_matches("", "5550123"));
    }

    #[test]
    fn dumpsys_field_extraction() {
        let out = "  mCallState=2\n  mCallIncomingNumber=555-0123\n  mCallState=0\n";
        assert_eq!(dumpsys_fields(out, "mCallState"), vec!["2", "0"]);
        assert_eq!(dumpsys_fields(out, "mCallIncomingNumber"), vec!["555-0123"]);
    }

    #[test]
    fn component_parse_from_focus_line() {
        let line = "mCurrentFocus=Window{ab31 u0 com.android.dialer/com.android.dialer.MainActivity}";
        let (pkg, activity) = parse_component(line).expect("component");
        assert_eq!(pkg, "com.android.dialer");
        assert_eq!(activity, "com.android.dialer.MainActivity");
    }

    #[test]
    fn dumpsys_datetime_round_numbers() {
        // 1970-01-01 00:00:00 is epoch zero.
        assert_eq!(parse_dumpsys_datetime("1970-01-01 00:00:00"), Some(0));
        // One day later.
        assert_eq!(parse_dumpsys_datetime("1970-01-02 00:00:00"), Some(86_400));
        assert_eq!(parse_dumpsys_datetime("garbage"), None);
    }

    #[test]
    fn content_query_cmd_shapes() {
        let cmd = content_query_cmd(
            "content://sms/sent",
            "_id:address:date:body",
            Some("date >= 1722500000000"),
            Some("date DESC"),
            Some(50),
        );
        assert!(cmd.starts_with("content query --uri content://sms/sent"));
        assert!(cmd.contains("--where \"date >= 1722500000000\""));
        assert!(cmd.contains("--limit 50"));
    }
}
