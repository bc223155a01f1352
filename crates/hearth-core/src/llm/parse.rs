//! Tolerant JSON extraction from model output

use serde::de::DeserializeOwned;

/// Result of parsing an external response
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// Valid structured data
    Parsed(T),
    /// Nothing to parse (empty text, `null`, or an explicit empty answer)
    Empty,
    /// Text was present but not the expected shape
    Malformed(String),
}

impl<T> ParseOutcome<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    /// Parsed data, or None for Empty / Malformed
    pub fn into_option(self) -> Option<T> {
        match self {
            ParseOutcome::Parsed(v) => Some(v),
            ParseOutcome::Empty | ParseOutcome::Malformed(_) => None,
        }
    }
}

/// Parse the first JSON value out of model text.
///
/// Handles markdown code fences and prose around the JSON body.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> ParseOutcome<T> {
    let trimmed = strip_fences(text.trim());
    if trimmed.is_empty() || trimmed == "null" {
        return ParseOutcome::Empty;
    }

    let Some(body) = extract_json_body(trimmed) else {
        return ParseOutcome::Malformed(format!(
            "no JSON object or array in response ({} chars)",
            trimmed.len()
        ));
    };

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Null) => ParseOutcome::Empty,
        Ok(serde_json::Value::Array(items)) if items.is_empty() => {
            // Let the caller's type decide if [] is meaningful; otherwise empty
            match serde_json::from_value::<T>(serde_json::Value::Array(items)) {
                Ok(v) => ParseOutcome::Parsed(v),
                Err(_) => ParseOutcome::Empty,
            }
        }
        Ok(value) => match serde_json::from_value::<T>(value) {
            Ok(v) => ParseOutcome::Parsed(v),
            Err(e) => ParseOutcome::Malformed(format!("unexpected shape: {}", e)),
        },
        Err(e) => ParseOutcome::Malformed(format!("invalid JSON: {}", e)),
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Slice from the first '{' or '[' to its matching close, honoring strings
fn extract_json_body(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
