/// Longest `err=` value a warning line carries; longer chains are cut.
pub const ERR_MAX_CHARS: usize = 240;

/// Feed URLs often carry API keys in their query, so only the part before
/// `?` is logged.
fn redact_query(value: &str) -> &str {
    match value.split_once('?') {
        Some((base, _)) if value.contains("://") => base,
        _ => value,
    }
}

/// One token per field: whitespace runs become `_`, `=` is escaped so the
/// line stays splittable on `key=value`, and control characters are dropped.
fn field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else if ch == '=' {
            out.push_str("%3D");
        } else if !ch.is_control() {
            out.push(ch);
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

fn capped(value: String, max: usize) -> String {
    let total = value.chars().count();
    if total <= max {
        return value;
    }
    let mut out: String = value.chars().take(max).collect();
    out.push_str(&format!("...(+{})", total - max));
    out
}

#[derive(Debug, Clone, Default)]
pub struct Warning<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub feed: &'a str,
    pub path: &'a str,
    pub retry: &'a str,
    pub err: &'a str,
}

pub fn format_line(w: &Warning<'_>) -> String {
    format!(
        "RTAGG_WARN code={} stage={} feed={} path={} retry={} err={}",
        field(w.code),
        field(w.stage),
        field(w.feed),
        field(redact_query(w.path)),
        field(w.retry),
        capped(field(redact_query(w.err)), ERR_MAX_CHARS),
    )
}

pub fn emit(w: &Warning<'_>) {
    eprintln!("{}", format_line(w));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_render_as_na() {
        let line = format_line(&Warning {
            code: "FETCH_FAILED",
            stage: "download",
            feed: "ACE",
            err: "connection refused",
            ..Default::default()
        });
        assert_eq!(
            line,
            "RTAGG_WARN code=FETCH_FAILED stage=download feed=ACE path=na retry=na err=connection_refused"
        );
    }

    #[test]
    fn feed_url_query_is_not_logged() {
        let line = format_line(&Warning {
            code: "FETCH_FAILED",
            path: "https://api.transit.test/gtfs?key=s3cr3t&feed=ace",
            err: "error sending request for url (https://api.transit.test/gtfs?key=s3cr3t)",
            ..Default::default()
        });
        assert!(!line.contains("s3cr3t"), "{line}");
        assert!(line.contains("path=https://api.transit.test/gtfs "), "{line}");
    }

    #[test]
    fn embedded_equals_and_newlines_keep_one_token_per_field() {
        let line = format_line(&Warning {
            code: "ARCHIVE_FAILED",
            err: "HEAD g/l/A.tar.bz2 failed:\n  status=503  retry later",
            ..Default::default()
        });
        assert!(line.ends_with("err=HEAD_g/l/A.tar.bz2_failed:_status%3D503_retry_later"));
        assert_eq!(line.matches('=').count(), 6);
    }

    #[test]
    fn long_error_chains_are_cut_with_remainder_count() {
        let err = "x".repeat(ERR_MAX_CHARS + 17);
        let line = format_line(&Warning {
            err: &err,
            ..Default::default()
        });
        let value = line.rsplit_once("err=").map(|(_, v)| v).unwrap_or_default();
        assert!(value.ends_with("...(+17)"));
        assert_eq!(value.chars().filter(|c| *c == 'x').count(), ERR_MAX_CHARS);
    }
}
