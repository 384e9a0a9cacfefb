//! Structured metrics embedded in agent output.
//!
//! Agents (usually through a status-line script) print a marker like
//! `[AGENT_STATUS:{"m":"opus","c":0.42,"ctx":37}]` into the terminal. The
//! marker is found by scanning the tail of the output history. Everything
//! here is tolerant: garbage in produces `None`, never an error.

// Token and line counts are small non-negative integers carried as JSON numbers
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker name used when none is configured.
pub const DEFAULT_TAG: &str = "AGENT_STATUS";

/// Number of trailing characters of output that are scanned.
pub const SCAN_WINDOW_CHARS: usize = 4000;

/// Last known metrics of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_added: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    /// Agent-reported sub-state (e.g. "thinking", "compacting").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl Metrics {
    /// Build from an abbreviated-key object. Returns `None` unless at least
    /// one of the essential fields (model, cost) is usable.
    fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let metrics = Self {
            model: obj.get("m").and_then(text),
            cost_usd: obj.get("c").and_then(number),
            lines_added: obj.get("la").and_then(count),
            lines_removed: obj.get("lr").and_then(count),
            context_percent: obj.get("ctx").and_then(number),
            tokens_in: obj.get("ti").and_then(count),
            tokens_out: obj.get("to").and_then(count),
            state: obj.get("st").and_then(text),
        };
        (metrics.model.is_some() || metrics.cost_usd.is_some()).then_some(metrics)
    }
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .trim_end_matches('%')
            .parse()
            .ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn count(v: &Value) -> Option<u64> {
    number(v).filter(|n| *n >= 0.0).map(|n| n as u64)
}

/// Strip escapes and control characters, collapse whitespace runs.
fn normalize(raw: &str) -> String {
    let stripped = strip_ansi_escapes::strip_str(raw);
    let mut out = String::with_capacity(stripped.len());
    let mut last_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() || c.is_control() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

/// The last `max_chars` characters of `s`.
#[must_use]
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) if max_chars > 0 => &s[idx..],
        _ if max_chars == 0 => "",
        _ => s,
    }
}

/// Scanner for one marker name.
#[derive(Debug, Clone)]
pub struct MetricsExtractor {
    pattern: Regex,
}

impl MetricsExtractor {
    #[must_use]
    pub fn new(tag: &str) -> Self {
        let pattern = format!(r"\[{}:\s*(\{{[^\[\]]*?\}})\s*\]", regex::escape(tag));
        Self {
            pattern: Regex::new(&pattern).expect("escaped tag always forms a valid pattern"),
        }
    }

    /// Most recent acceptable marker in the scan window, if any.
    #[must_use]
    pub fn extract(&self, text: &str) -> Option<Metrics> {
        let window = normalize(tail_chars(text, SCAN_WINDOW_CHARS));
        let candidates: Vec<&str> = self
            .pattern
            .captures_iter(&window)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();

        candidates.into_iter().rev().find_map(|json| {
            match serde_json::from_str::<Value>(json) {
                Ok(Value::Object(obj)) => Metrics::from_object(&obj),
                Ok(_) => None,
                Err(e) => {
                    tracing::trace!(%e, "skipping malformed metrics candidate");
                    None
                }
            }
        })
    }

    /// New snapshot if the window holds one, otherwise the previous one.
    #[must_use]
    pub fn refresh(&self, previous: Option<Metrics>, text: &str) -> Option<Metrics> {
        self.extract(text).or(previous)
    }
}

impl Default for MetricsExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_TAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> MetricsExtractor {
        MetricsExtractor::default()
    }

    #[test]
    fn test_extracts_single_marker() {
        let text = r#"some output [AGENT_STATUS:{"m":"opus","c":0.42,"la":10,"lr":2,"ctx":37.5,"ti":1200,"to":300,"st":"thinking"}] more"#;
        let m = extractor().extract(text).unwrap();
        assert_eq!(m.model.as_deref(), Some("opus"));
        assert_eq!(m.cost_usd, Some(0.42));
        assert_eq!(m.lines_added, Some(10));
        assert_eq!(m.lines_removed, Some(2));
        assert_eq!(m.context_percent, Some(37.5));
        assert_eq!(m.tokens_in, Some(1200));
        assert_eq!(m.tokens_out, Some(300));
        assert_eq!(m.state.as_deref(), Some("thinking"));
    }

    #[test]
    fn test_most_recent_valid_candidate_wins() {
        let text = concat!(
            r#"[AGENT_STATUS:{"m":"old","c":0.1}]"#,
            "\n",
            r#"[AGENT_STATUS:{"m":"new","c":0.2}]"#,
            "\n",
            r#"[AGENT_STATUS:{"m":"broken","c":]"#,
        );
        let m = extractor().extract(text).unwrap();
        assert_eq!(m.model.as_deref(), Some("new"));
    }

    #[test]
    fn test_candidate_without_essential_fields_is_skipped() {
        let text = concat!(
            r#"[AGENT_STATUS:{"m":"good"}]"#,
            r#"[AGENT_STATUS:{"la":5,"lr":1}]"#,
        );
        let m = extractor().extract(text).unwrap();
        assert_eq!(m.model.as_deref(), Some("good"));
    }

    #[test]
    fn test_no_candidate_keeps_previous() {
        let previous = Metrics {
            model: Some("opus".into()),
            ..Metrics::default()
        };
        let e = extractor();
        let kept = e.refresh(Some(previous.clone()), "plain output, nothing to see");
        assert_eq!(kept, Some(previous.clone()));

        let kept = e.refresh(Some(previous.clone()), r#"[AGENT_STATUS:{not json}]"#);
        assert_eq!(kept, Some(previous));

        assert_eq!(e.refresh(None, "nothing"), None);
    }

    #[test]
    fn test_ansi_and_control_characters_are_stripped() {
        let text = "\x1b[2m[AGENT_STATUS:{\"m\":\r\n\"sonnet\",\x07\"c\":\"$1.50\"}]\x1b[0m";
        let m = extractor().extract(text).unwrap();
        assert_eq!(m.model.as_deref(), Some("sonnet"));
        assert_eq!(m.cost_usd, Some(1.5));
    }

    #[test]
    fn test_numeric_strings_and_bad_types() {
        let text = r#"[AGENT_STATUS:{"m":"x","ctx":"42%","ti":"abc","to":-3,"la":true}]"#;
        let m = extractor().extract(text).unwrap();
        assert_eq!(m.context_percent, Some(42.0));
        assert_eq!(m.tokens_in, None);
        assert_eq!(m.tokens_out, None);
        assert_eq!(m.lines_added, None);
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        assert_eq!(extractor().extract(r"[AGENT_STATUS:{}]"), None);
        assert_eq!(extractor().extract(r#"[AGENT_STATUS:{"m":""}]"#), None);
    }

    #[test]
    fn test_other_tags_are_ignored() {
        assert_eq!(extractor().extract(r#"[OTHER:{"m":"x"}]"#), None);
        let custom = MetricsExtractor::new("CC.STATUS");
        assert!(custom.extract(r#"[CC.STATUS:{"m":"x"}]"#).is_some());
        // The dot is escaped, not a wildcard
        assert!(custom.extract(r#"[CCXSTATUS:{"m":"x"}]"#).is_none());
    }

    #[test]
    fn test_only_tail_window_is_scanned() {
        let mut text = String::from(r#"[AGENT_STATUS:{"m":"ancient"}]"#);
        text.push_str(&"x".repeat(SCAN_WINDOW_CHARS + 10));
        assert_eq!(extractor().extract(&text), None);
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn test_garbage_never_panics() {
        let e = extractor();
        for input in ["", "[", "[AGENT_STATUS:", "[AGENT_STATUS:{", "[AGENT_STATUS:{]}]", "\u{0}\u{1b}[", "]]]]{{{{"] {
            assert_eq!(e.extract(input), None);
        }
    }

    #[test]
    fn test_serializes_with_full_names() {
        let m = Metrics {
            model: Some("opus".into()),
            cost_usd: Some(1.0),
            ..Metrics::default()
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["model"], "opus");
        assert_eq!(json["costUsd"], 1.0);
        assert!(json.get("tokensIn").is_none());
    }
}
