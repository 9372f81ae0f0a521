use regex::Regex;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

// The value ends at the next double quote; escapes inside are left as-is.
pub fn extract_scalar(fragment: &str, key: &str) -> Option<String> {
    let pattern = format!("\"{key}\":");
    let at = fragment.find(&pattern)?;
    let rest = &fragment[at + pattern.len()..];
    let open = rest.find('"')?;
    let value = &rest[open + 1..];
    let close = value.find('"')?;
    Some(value[..close].to_string())
}

pub fn extract_all_scalars(fragment: &str, key: &str) -> Vec<String> {
    if key.is_empty() {
        return Vec::new();
    }
    let pattern = format!("\"{}\"\\s*:\\s*\"(.*?)\"", regex::escape(key));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(fragment)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_basic(m.as_str()))
        .collect()
}

pub fn extract_array_field(fragment: &str, key: &str) -> Vec<String> {
    let needle = format!("\"{key}\"");
    fragment
        .split('{')
        .filter(|part| part.contains(&needle))
        .filter_map(|part| extract_scalar(part, key))
        .collect()
}

fn unescape_basic(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_replaces_specials_and_drops_carriage_returns() {
        assert_eq!(escape("a\\b\"c\nd\te\rf"), "a\\\\b\\\"c\\nd\\tef");
        assert_eq!(escape(""), "");
    }

    #[test]
    fn escape_round_trips_through_json_parse() {
        let original = "line one\nline\ttwo \"quoted\" back\\slash";
        let literal = format!("\"{}\"", escape(original));
        let parsed: String = serde_json::from_str(&literal).expect("literal parses");
        assert_eq!(parsed, original);
    }

    #[test]
    fn escape_drops_carriage_returns_lossily() {
        let literal = format!("\"{}\"", escape("a\r\nb"));
        let parsed: String = serde_json::from_str(&literal).expect("literal parses");
        assert_eq!(parsed, "a\nb");
    }

    #[test]
    fn extract_scalar_returns_first_quoted_value() {
        let line = r#"{"model":"llama3.1:8b","response":"Hello","done":false}"#;
        assert_eq!(extract_scalar(line, "response").as_deref(), Some("Hello"));
    }

    #[test]
    fn extract_scalar_missing_key_is_none() {
        assert_eq!(extract_scalar(r#"{"done":true}"#, "response"), None);
        assert_eq!(extract_scalar("", "response"), None);
    }

    #[test]
    fn extract_scalar_keeps_value_escapes_raw() {
        let line = r#"{"response":"tab\there"}"#;
        assert_eq!(
            extract_scalar(line, "response").as_deref(),
            Some("tab\\there")
        );
    }

    #[test]
    fn extract_all_scalars_unescapes_each_match() {
        let line = r#"data: {"choices":[{"delta":{"content":"ab\ncd"}}]}"#;
        assert_eq!(extract_all_scalars(line, "content"), vec!["ab\ncd".to_string()]);
    }

    #[test]
    fn extract_all_scalars_handles_concatenated_objects() {
        let line = r#"data: {"delta":{"content":"Hel"}}{"delta":{"content":"lo"}}"#;
        assert_eq!(
            extract_all_scalars(line, "content"),
            vec!["Hel".to_string(), "lo".to_string()]
        );
    }

    #[test]
    fn extract_all_scalars_tolerates_spaced_colon() {
        let line = r#"{"content" : "x"}"#;
        assert_eq!(extract_all_scalars(line, "content"), vec!["x".to_string()]);
    }

    #[test]
    fn extract_all_scalars_empty_key_is_empty() {
        assert!(extract_all_scalars(r#"{"content":"x"}"#, "").is_empty());
    }

    #[test]
    fn extract_array_field_reads_each_object() {
        let body = r#"{"models":[{"name":"llama3.1:8b","size":42},{"name":"qwen2:7b"}]}"#;
        assert_eq!(
            extract_array_field(body, "name"),
            vec!["llama3.1:8b".to_string(), "qwen2:7b".to_string()]
        );
    }
}
