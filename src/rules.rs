//! Dispatch rules
//!
//! A rule block selects messages by topic prefix and by condition sets.
//! Sets are OR'ed; the conditions inside a set are AND'ed. A condition is
//! an exact value, a list of accepted values, or a comparison such as
//! `">= 30"` applied to the numeric value of the field. The `except` key
//! of a set holds conditions that, when they all hold, reject the set.
//!
//! ```json
//! "conditions": [
//!   {"sensor": "viirs", "product": ["green_snow", "true_color"]},
//!   {"sensor": "avhrr", "product": ["green_snow", "overview"],
//!    "except": {"platform_name": "NOAA-15", "product": "green_snow"}}
//! ]
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::config::{ConnectionParams, Section};
use crate::logging::debug;
use crate::message::Metadata;

/// One entry of a target's `dispatch_configs`
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRule {
    pub topics: Vec<String>,
    pub conditions: Option<Vec<Section>>,
    /// Overrides of the target settings for messages matching this rule
    pub host: Option<String>,
    pub directory: Option<String>,
    pub filepattern: Option<String>,
    pub connection_parameters: Option<ConnectionParams>,
}

impl DispatchRule {
    pub fn matches_topic(&self, subject: &str) -> bool {
        self.topics.iter().any(|t| subject.starts_with(t.as_str()))
    }

    pub fn matches(&self, subject: &str, data: &Metadata) -> bool {
        self.matches_topic(subject) && check_conditions(self.conditions.as_deref(), data)
    }
}

/// True when any condition set holds; no conditions at all always match
pub fn check_conditions(conditions: Option<&[Section]>, data: &Metadata) -> bool {
    match conditions {
        None => true,
        Some(sets) => sets.iter().any(|set| check_set(data, set, false)),
    }
}

/// With `negate`, returns false only when every condition holds. A field
/// missing from the metadata makes the set fail in both modes.
fn check_set(data: &Metadata, set: &Section, negate: bool) -> bool {
    for (key, expected) in set {
        if key == "except" {
            let Some(except) = expected.as_object() else {
                continue;
            };
            if !check_set(data, except, true) {
                return negate;
            }
            continue;
        }
        match check_condition(data, key, expected) {
            None => {
                debug(&format!("Missing metadata '{}' to check condition", key), None);
                return false;
            }
            Some(false) => return negate,
            Some(true) => {}
        }
    }
    !negate
}

fn check_condition(data: &Metadata, key: &str, expected: &Value) -> Option<bool> {
    let actual = data.get(key)?;
    let result = match expected {
        Value::Array(accepted) => accepted.contains(actual),
        Value::String(s) if s.starts_with(['<', '>', '=', '!']) => match Comparison::parse(s) {
            Some(cmp) => as_f64(actual).map(|v| cmp.holds(v)).unwrap_or(false),
            None => false,
        },
        _ => actual == expected,
    };
    Some(result)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Comparison {
    Lt(f64),
    Le(f64),
    Gt(f64),
    Ge(f64),
    Eq(f64),
    Ne(f64),
}

impl Comparison {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (op, rest) = ["<=", ">=", "==", "!=", "<", ">", "="]
            .iter()
            .find_map(|op| text.strip_prefix(op).map(|rest| (*op, rest)))?;
        let threshold: f64 = rest.trim().parse().ok()?;
        Some(match op {
            "<=" => Comparison::Le(threshold),
            ">=" => Comparison::Ge(threshold),
            "==" | "=" => Comparison::Eq(threshold),
            "!=" => Comparison::Ne(threshold),
            "<" => Comparison::Lt(threshold),
            _ => Comparison::Gt(threshold),
        })
    }

    fn holds(&self, value: f64) -> bool {
        match *self {
            Comparison::Lt(t) => value < t,
            Comparison::Le(t) => value <= t,
            Comparison::Gt(t) => value > t,
            Comparison::Ge(t) => value >= t,
            Comparison::Eq(t) => value == t,
            Comparison::Ne(t) => value != t,
        }
    }
}

/// Rewrites metadata values through the alias tables
///
/// Each alias table maps an original value to a replacement. With an
/// `_alias_name` entry the replacement goes to that key and the original
/// field is kept; otherwise the field itself is rewritten.
pub fn apply_aliases(data: &Metadata, aliases: &Section) -> Metadata {
    let mut out = data.clone();
    for (key, tables) in aliases {
        let Some(original) = data.get(key) else {
            continue;
        };
        let tables: Vec<&Section> = match tables {
            Value::Object(table) => vec![table],
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            _ => continue,
        };
        for table in tables {
            let new_key = table
                .get("_alias_name")
                .and_then(Value::as_str)
                .unwrap_or(key.as_str())
                .to_string();
            let replacement = original
                .as_str()
                .filter(|s| *s != "_alias_name")
                .and_then(|s| table.get(s))
                .cloned()
                .unwrap_or_else(|| original.clone());
            out.insert(new_key, replacement);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().unwrap().clone()
    }

    fn rule(value: Value) -> DispatchRule {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_viirs_green_snow_selected() {
        let r = rule(json!({
            "topics": ["/level2/viirs"],
            "conditions": [{"sensor": "viirs", "product": ["green_snow", "true_color"]}]
        }));
        let data = meta(json!({"sensor": "viirs", "product": "green_snow", "platform_name": "NOAA-20"}));
        assert!(r.matches("/level2/viirs", &data));
        assert!(!r.matches("/level2/avhrr", &data));

        let other = meta(json!({"sensor": "viirs", "product": "overview"}));
        assert!(!r.matches("/level2/viirs", &other));
    }

    #[test]
    fn test_except_suppresses_match() {
        let r = rule(json!({
            "topics": ["/level2"],
            "conditions": [{
                "sensor": "viirs",
                "product": ["green_snow", "true_color"],
                "except": {"platform_name": "NOAA-15"}
            }]
        }));
        let noaa15 = meta(json!({"sensor": "viirs", "product": "green_snow", "platform_name": "NOAA-15"}));
        let noaa20 = meta(json!({"sensor": "viirs", "product": "green_snow", "platform_name": "NOAA-20"}));
        assert!(!r.matches("/level2/viirs", &noaa15));
        assert!(r.matches("/level2/viirs", &noaa20));
    }

    #[test]
    fn test_except_with_missing_field_rejects() {
        let sets = vec![meta(json!({"sensor": "viirs", "except": {"platform_name": "NOAA-15"}}))];
        let data = meta(json!({"sensor": "viirs"}));
        assert!(!check_conditions(Some(&sets), &data));
    }

    #[test]
    fn test_condition_sets_are_ored() {
        let sets = vec![
            meta(json!({"product": ["green_snow", "true_color"], "sensor": "viirs"})),
            meta(json!({
                "product": ["green_snow", "overview"],
                "sensor": "avhrr",
                "except": {"platform_name": "NOAA-15", "product": "green_snow"}
            })),
        ];
        let check = |v: Value| check_conditions(Some(&sets), &meta(v));
        assert!(check(json!({"product": "overview", "sensor": "avhrr", "platform_name": "NOAA-15"})));
        assert!(!check(json!({"product": "green_snow", "sensor": "avhrr", "platform_name": "NOAA-15"})));
        assert!(check(json!({"product": "green_snow", "sensor": "avhrr", "platform_name": "NOAA-19"})));
        assert!(!check(json!({"product": "true_color", "sensor": "modis", "platform_name": "EOS-Terra"})));
    }

    #[test]
    fn test_numeric_comparisons() {
        let sets = vec![meta(json!({"sun_zenith_angle": "<90", "orbit_number": ">= 1000"}))];
        assert!(check_conditions(Some(&sets), &meta(json!({"sun_zenith_angle": 45.5, "orbit_number": 1000}))));
        assert!(!check_conditions(Some(&sets), &meta(json!({"sun_zenith_angle": 95, "orbit_number": 2000}))));
        assert!(check_conditions(Some(&sets), &meta(json!({"sun_zenith_angle": "10", "orbit_number": "1001"}))));
        assert!(!check_conditions(Some(&sets), &meta(json!({"sun_zenith_angle": "n/a", "orbit_number": 1001}))));
        assert_eq!(Comparison::parse("!=3"), Some(Comparison::Ne(3.0)));
        assert_eq!(Comparison::parse("<abc"), None);
    }

    #[test]
    fn test_no_conditions_matches() {
        assert!(check_conditions(None, &Metadata::new()));
        let r = rule(json!({"topics": ["/a", "/b"]}));
        assert!(r.matches("/b/c", &Metadata::new()));
    }

    #[test]
    fn test_aliases() {
        let aliases = meta(json!({
            "platform_name": {"Suomi-NPP": "npp", "NOAA-20": "j01"},
            "product": [{"_alias_name": "product_short", "green_snow": "gs"}]
        }));
        let data = meta(json!({"platform_name": "Suomi-NPP", "product": "green_snow", "sensor": "viirs"}));
        let out = apply_aliases(&data, &aliases);
        assert_eq!(out["platform_name"], "npp");
        assert_eq!(out["product"], "green_snow");
        assert_eq!(out["product_short"], "gs");
        assert_eq!(out["sensor"], "viirs");

        let unknown = meta(json!({"platform_name": "Metop-B"}));
        assert_eq!(apply_aliases(&unknown, &aliases)["platform_name"], "Metop-B");
    }
}
