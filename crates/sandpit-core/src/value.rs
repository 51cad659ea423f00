//! Host-side model of sandboxed values
//!
//! Values are introspected out of the interpreter into this tagged model
//! before they cross into host code. The model is plain data, `Send`, and
//! rendered by a single deterministic serializer shared by console capture
//! and challenge comparison.

use crate::config::RenderLimits;
use serde_json::Value as Json;
use std::fmt::Write;

/// A sandboxed value after introspection
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<Value>),
    /// Own enumerable members in key order
    Mapping(Vec<(String, Value)>),
    /// Something with no data form: functions, symbols, cycles, collapsed depth
    Opaque(String),
}

impl Value {
    /// Render as indented, JSON-compatible text
    ///
    /// Top-level strings and opaque markers are printed bare; inside
    /// containers they are quoted so the output stays parseable.
    #[must_use]
    pub fn render(&self, limits: &RenderLimits) -> String {
        let mut out = String::new();
        match self {
            Self::String(s) | Self::Opaque(s) => out.push_str(s),
            other => other.write_pretty(&mut out, 0),
        }
        truncate(out, limits.max_chars)
    }

    /// Convert to a JSON value; opaque markers become strings
    #[must_use]
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) | Self::Opaque(s) => Json::String(s.clone()),
            Self::Sequence(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Mapping(members) => Json::Object(
                members
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    fn write_pretty(&self, out: &mut String, indent: usize) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Number(n) if n.is_finite() => out.push_str(&format_number(*n)),
            Self::Number(_) => out.push_str("null"),
            Self::String(s) | Self::Opaque(s) => write_quoted(out, s),
            Self::Sequence(items) if items.is_empty() => out.push_str("[]"),
            Self::Sequence(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    newline(out, indent + 1);
                    item.write_pretty(out, indent + 1);
                }
                newline(out, indent);
                out.push(']');
            }
            Self::Mapping(members) if members.is_empty() => out.push_str("{}"),
            Self::Mapping(members) => {
                out.push('{');
                for (i, (key, value)) in members.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    newline(out, indent + 1);
                    write_quoted(out, key);
                    out.push_str(": ");
                    value.write_pretty(out, indent + 1);
                }
                newline(out, indent);
                out.push('}');
            }
        }
    }
}

impl From<&Json> for Value {
    fn from(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::Sequence(items.iter().map(Self::from).collect()),
            Json::Object(map) => {
                Self::Mapping(map.iter().map(|(k, v)| (k.clone(), Self::from(v))).collect())
            }
        }
    }
}

/// Format a number the way ECMAScript `Number.prototype.toString` does for
/// the common cases
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }

    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        if n.fract() == 0.0 {
            format!("{n:.0}")
        } else {
            format!("{n}")
        }
    } else {
        // Rust writes `1e21`, ECMAScript writes `1e+21`
        let s = format!("{n:e}");
        match s.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => s,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> Json {
    // integral values within the exactly representable range stay integers
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

fn newline(out: &mut String, indent: usize) {
    out.push('\n');
    for _ in 0..indent {
        out.push_str("  ");
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if u32::from(c) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Cut a rendered string to at most `max_chars` characters
#[must_use]
pub fn truncate(mut s: String, max_chars: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
        s.push_str("…");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> RenderLimits {
        RenderLimits::default()
    }

    #[test]
    fn mapping_renders_with_two_space_indent() {
        let v = Value::Mapping(vec![("a".into(), Value::Number(1.0))]);
        assert_eq!(v.render(&limits()), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn nested_containers_indent_per_level() {
        let v = Value::from(&json!({"xs": [1, "two", null], "empty": {}, "none": []}));
        let expected = "{\n  \"xs\": [\n    1,\n    \"two\",\n    null\n  ],\n  \"empty\": {},\n  \"none\": []\n}";
        assert_eq!(v.render(&limits()), expected);
    }

    #[test]
    fn top_level_strings_are_bare_nested_are_quoted() {
        assert_eq!(Value::String("hi".into()).render(&limits()), "hi");
        let v = Value::Sequence(vec![Value::Opaque("[Function: f]".into())]);
        assert_eq!(v.render(&limits()), "[\n  \"[Function: f]\"\n]");
    }

    #[test]
    fn numbers_follow_ecmascript_formatting() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn non_finite_numbers_inside_structures_become_null() {
        let v = Value::Sequence(vec![Value::Number(f64::INFINITY)]);
        assert_eq!(v.render(&limits()), "[\n  null\n]");
        assert_eq!(v.to_json(), json!([null]));
    }

    #[test]
    fn integral_numbers_convert_to_json_integers() {
        assert_eq!(serde_json::to_string(&Value::Number(3.0).to_json()).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Value::Number(0.5).to_json()).unwrap(), "0.5");
    }

    #[test]
    fn json_round_trip_keeps_key_order() {
        let src = json!({"zeta": 1, "alpha": 2});
        let back = Value::from(&src).to_json();
        assert_eq!(serde_json::to_string(&back).unwrap(), r#"{"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn control_characters_are_escaped() {
        let v = Value::Sequence(vec![Value::String("a\"b\n\u{1}".into())]);
        assert_eq!(v.render(&limits()), "[\n  \"a\\\"b\\n\\u0001\"\n]");
    }

    #[test]
    fn long_output_is_truncated() {
        let l = RenderLimits { max_chars: 5, ..RenderLimits::default() };
        assert_eq!(Value::String("abcdefgh".into()).render(&l), "abcde…");
        assert_eq!(Value::String("abc".into()).render(&l), "abc");
    }
}
