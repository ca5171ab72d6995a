//! Filename templates with typed, named fields
//!
//! A template such as
//! `/data/{platform_name}_{start_time:%Y%m%d_%H%M}_{orbit:05d}.l1b`
//! is used in two directions: `parse` matches a path and extracts the
//! field values as metadata, `compose` fills the fields from metadata.
//!
//! Supported field formats: plain string (`{name}`), fixed-width string
//! (`{name:4s}`), integer (`{n:d}`, `{n:5d}`, `{n:05d}`), float
//! (`{x:f}`, `{x:.2f}`) and strftime timestamps (`{t:%Y%m%d}`).
//! Timestamps are carried in metadata as `YYYY-mm-ddTHH:MM:SS` strings.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;

use crate::error::{MoveError, Result};
use crate::message::Metadata;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
enum FieldSpec {
    Str {
        width: Option<usize>,
        fill: Option<(char, char)>,
    },
    Int { width: Option<usize>, zero_pad: bool },
    Float { precision: Option<usize> },
    Time(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field { name: String, spec: FieldSpec },
}

/// A compiled template
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    segments: Vec<Segment>,
    regex: Regex,
    basename: Regex,
}

impl Pattern {
    pub fn new(template: &str) -> Result<Self> {
        let segments = tokenize(template)?;
        let regex = build_regex(&segments)?;
        let base_template = template.rsplit('/').next().unwrap_or(template);
        let basename = build_regex(&tokenize(base_template)?)?;
        Ok(Pattern {
            source: template.to_string(),
            segments,
            regex,
            basename,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Static directory part of the template (what a watcher observes)
    pub fn directory(&self) -> Result<String> {
        let static_prefix = match self.source.find('{') {
            Some(idx) => &self.source[..idx],
            None => &self.source,
        };
        match static_prefix.rfind('/') {
            Some(0) if !self.source[1..].contains('/') => Ok("/".to_string()),
            Some(idx) if !self.source[idx + 1..].contains('/') => {
                Ok(static_prefix[..idx].to_string())
            }
            Some(_) => Err(MoveError::Config(format!(
                "pattern {} has fields in its directory part",
                self.source
            ))),
            None => Ok(".".to_string()),
        }
    }

    /// Names of all fields, in template order
    pub fn fields(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Matches `path` and returns the typed field values
    pub fn parse(&self, path: &str) -> Result<Metadata> {
        let caps = self
            .regex
            .captures(path)
            .ok_or_else(|| MoveError::PatternMismatch(path.to_string()))?;

        let mut out = Metadata::new();
        let mut group = 1;
        for segment in &self.segments {
            if let Segment::Field { name, spec } = segment {
                let raw = caps.get(group).map(|m| m.as_str()).unwrap_or("");
                group += 1;
                let value = convert(raw, spec)
                    .ok_or_else(|| MoveError::PatternMismatch(path.to_string()))?;
                if let Some(previous) = out.get(name) {
                    if previous != &value {
                        return Err(MoveError::PatternMismatch(path.to_string()));
                    }
                }
                out.insert(name.clone(), value);
            }
        }
        Ok(out)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.parse(path).is_ok()
    }

    /// Checks only the file name part of `path` against the file name
    /// part of the template
    pub fn matches_file_name(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.basename.is_match(name)
    }

    /// Fills the template from `metadata`
    pub fn compose(&self, metadata: &Metadata) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name, spec } => {
                    let value = metadata.get(name).ok_or_else(|| {
                        MoveError::Template(format!(
                            "'{}' is missing from the metadata for {}",
                            name, self.source
                        ))
                    })?;
                    out.push_str(&format_value(name, value, spec)?);
                }
            }
        }
        Ok(out)
    }
}

/// One-shot compose, used for destination and topic templates
pub fn compose(template: &str, metadata: &Metadata) -> Result<String> {
    Pattern::new(template)?.compose(metadata)
}

fn tokenize(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '{' {
            literal.push(c);
            continue;
        }
        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }
        if !closed {
            return Err(MoveError::Config(format!("unclosed field in {}", template)));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        let (name, fmt) = match body.split_once(':') {
            Some((n, f)) => (n, Some(f)),
            None => (body.as_str(), None),
        };
        if name.is_empty() {
            return Err(MoveError::Config(format!("unnamed field in {}", template)));
        }
        segments.push(Segment::Field {
            name: name.to_string(),
            spec: parse_spec(fmt, template)?,
        });
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_spec(fmt: Option<&str>, template: &str) -> Result<FieldSpec> {
    let fmt = match fmt {
        None | Some("") => {
            return Ok(FieldSpec::Str {
                width: None,
                fill: None,
            })
        }
        Some(f) => f,
    };
    if fmt.contains('%') {
        return Ok(FieldSpec::Time(fmt.to_string()));
    }
    let bad = || MoveError::Config(format!("unsupported field format '{}' in {}", fmt, template));
    let (body, kind) = match fmt.char_indices().last() {
        Some((at, _)) => fmt.split_at(at),
        None => return Err(bad()),
    };
    match kind {
        "s" => {
            let (fill, body) = split_fill(body);
            Ok(FieldSpec::Str {
                width: parse_width(body).map_err(|_| bad())?,
                fill,
            })
        }
        "d" => Ok(FieldSpec::Int {
            width: parse_width(body.trim_start_matches('0')).map_err(|_| bad())?,
            zero_pad: body.starts_with('0'),
        }),
        "f" => Ok(FieldSpec::Float {
            precision: parse_width(body.trim_start_matches('.')).map_err(|_| bad())?,
        }),
        _ => Err(bad()),
    }
}

/// Splits `_<6` into (fill '_', align '<') and `6`
fn split_fill(body: &str) -> (Option<(char, char)>, &str) {
    let mut chars = body.chars();
    match (chars.next(), chars.next()) {
        (Some(fill), Some(align @ ('<' | '>' | '^'))) => {
            (Some((fill, align)), &body[fill.len_utf8() + 1..])
        }
        (Some(align @ ('<' | '>' | '^')), _) => (Some((' ', align)), &body[1..]),
        _ => (None, body),
    }
}

fn parse_width(s: &str) -> std::result::Result<Option<usize>, std::num::ParseIntError> {
    if s.is_empty() {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

fn build_regex(segments: &[Segment]) -> Result<Regex> {
    let mut re = String::from("^");
    for segment in segments {
        match segment {
            Segment::Literal(text) => re.push_str(&regex::escape(text)),
            Segment::Field { spec, .. } => {
                re.push('(');
                re.push_str(&field_regex(spec));
                re.push(')');
            }
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| MoveError::Config(format!("invalid pattern: {}", e)))
}

fn field_regex(spec: &FieldSpec) -> String {
    match spec {
        FieldSpec::Str { width: Some(w), .. } => format!("[^/]{{{}}}", w),
        FieldSpec::Str { width: None, .. } => "[^/]+?".to_string(),
        FieldSpec::Int {
            width: Some(w),
            zero_pad: true,
        } => format!(r"\d{{{}}}", w),
        FieldSpec::Int { width: Some(w), .. } => format!(r"[ +-]*\d{{1,{}}}", w),
        FieldSpec::Int { width: None, .. } => r"[+-]?\d+".to_string(),
        FieldSpec::Float { .. } => r"[+-]?\d+(?:\.\d+)?".to_string(),
        FieldSpec::Time(fmt) => strftime_regex(fmt),
    }
}

fn strftime_regex(fmt: &str) -> String {
    let mut out = String::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(r"\d{4}"),
            Some('y' | 'm' | 'd' | 'H' | 'M' | 'S') => out.push_str(r"\d{2}"),
            Some('j') => out.push_str(r"\d{3}"),
            Some('f') => out.push_str(r"\d{6}"),
            Some('b') => out.push_str("[A-Za-z]{3}"),
            Some('%') => out.push('%'),
            _ => out.push_str(".+?"),
        }
    }
    out
}

fn convert(raw: &str, spec: &FieldSpec) -> Option<Value> {
    match spec {
        FieldSpec::Str {
            fill: Some((fill, align)),
            ..
        } => {
            let trimmed = match align {
                '<' => raw.trim_end_matches(*fill),
                '>' => raw.trim_start_matches(*fill),
                _ => raw.trim_matches(*fill),
            };
            Some(Value::String(trimmed.to_string()))
        }
        FieldSpec::Str { .. } => Some(Value::String(raw.to_string())),
        FieldSpec::Int { .. } => raw
            .trim()
            .trim_start_matches('+')
            .parse::<i64>()
            .ok()
            .map(Value::from),
        FieldSpec::Float { .. } => raw.parse::<f64>().ok().map(Value::from),
        FieldSpec::Time(fmt) => parse_time(raw, fmt).map(|t| Value::String(t.format(ISO_FORMAT).to_string())),
    }
}

fn parse_time(raw: &str, fmt: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, fmt)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, fmt)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Reads a timestamp stored in metadata
pub fn metadata_time(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?;
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
}

fn format_value(name: &str, value: &Value, spec: &FieldSpec) -> Result<String> {
    let mismatch = || {
        MoveError::Template(format!(
            "value {} of '{}' does not fit its format",
            value, name
        ))
    };
    match spec {
        FieldSpec::Str { width, fill } => {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(match (width, fill) {
                (Some(w), Some((fill, align))) => pad(&text, *w, *fill, *align),
                (Some(w), None) => pad(&text, *w, ' ', '<'),
                _ => text,
            })
        }
        FieldSpec::Int { width, zero_pad } => {
            let n = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(mismatch)?;
            Ok(match (width, zero_pad) {
                (Some(w), true) => format!("{:0width$}", n, width = *w),
                (Some(w), false) => format!("{:width$}", n, width = *w),
                (None, _) => n.to_string(),
            })
        }
        FieldSpec::Float { precision } => {
            let x = value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(mismatch)?;
            Ok(match precision {
                Some(p) => format!("{:.prec$}", x, prec = *p),
                None => x.to_string(),
            })
        }
        FieldSpec::Time(fmt) => {
            let t = metadata_time(value).ok_or_else(mismatch)?;
            Ok(t.format(fmt).to_string())
        }
    }
}

fn pad(text: &str, width: usize, fill: char, align: char) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let missing = width - len;
    let (left, right) = match align {
        '>' => (missing, 0),
        '^' => (missing / 2, missing - missing / 2),
        _ => (0, missing),
    };
    let mut out = String::new();
    out.extend(std::iter::repeat(fill).take(left));
    out.push_str(text);
    out.extend(std::iter::repeat(fill).take(right));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_typed_fields() {
        let pattern =
            Pattern::new("/data/{platform_name}_{start_time:%Y%m%d_%H%M}_{orbit:05d}.l1b").unwrap();
        let md = pattern.parse("/data/NOAA-19_20240115_1230_00042.l1b").unwrap();
        assert_eq!(md["platform_name"], json!("NOAA-19"));
        assert_eq!(md["start_time"], json!("2024-01-15T12:30:00"));
        assert_eq!(md["orbit"], json!(42));
    }

    #[test]
    fn test_non_matching_path_is_a_mismatch() {
        let pattern = Pattern::new("/data/{name}_{orbit:05d}.l1b").unwrap();
        assert!(matches!(
            pattern.parse("/data/foo_12.l1b"),
            Err(MoveError::PatternMismatch(_))
        ));
        assert!(!pattern.is_match("/other/foo_00012.l1b"));
        assert!(pattern.is_match("/data/foo_00012.l1b"));
    }

    #[test]
    fn test_date_only_timestamp() {
        let pattern = Pattern::new("/in/{date:%Y%m%d}.txt").unwrap();
        let md = pattern.parse("/in/20231231.txt").unwrap();
        assert_eq!(md["date"], json!("2023-12-31T00:00:00"));
    }

    #[test]
    fn test_compose_formats_values() {
        let pattern = Pattern::new("{platform_name}_{start_time:%Y%m%d%H%M}_{orbit:05d}.{format}").unwrap();
        let md = match json!({
            "platform_name": "Suomi-NPP",
            "start_time": "2024-02-03T04:05:06",
            "orbit": 77,
            "format": "nc"
        }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        assert_eq!(pattern.compose(&md).unwrap(), "Suomi-NPP_202402030405_00077.nc");
    }

    #[test]
    fn test_compose_missing_key() {
        let md = Metadata::new();
        assert!(matches!(
            compose("/out/{sensor}/", &md),
            Err(MoveError::Template(_))
        ));
    }

    #[test]
    fn test_directory_and_file_name() {
        let pattern = Pattern::new("/var/data/in/{name}_{orbit:05d}.hrpt").unwrap();
        assert_eq!(pattern.directory().unwrap(), "/var/data/in");
        assert!(pattern.matches_file_name("/somewhere/else/x_00001.hrpt"));
        assert!(!pattern.matches_file_name("/var/data/in/x_1.hrpt"));

        let nested = Pattern::new("/var/{sensor}/in/{name}").unwrap();
        assert!(nested.directory().is_err());
    }

    #[test]
    fn test_repeated_field_must_agree() {
        let pattern = Pattern::new("/d/{name}/{name}.txt").unwrap();
        assert!(pattern.is_match("/d/a/a.txt"));
        assert!(!pattern.is_match("/d/a/b.txt"));
    }

    #[test]
    fn test_filled_string_field() {
        let pattern =
            Pattern::new("/tmp/H-000-{series:_<6s}-{time:%Y%m%d%H%M}-__").unwrap();
        let md = pattern.parse("/tmp/H-000-MSG4__-202401151200-__").unwrap();
        assert_eq!(md["series"], json!("MSG4"));
        assert_eq!(md["time"], json!("2024-01-15T12:00:00"));
        assert_eq!(
            pattern.compose(&md).unwrap(),
            "/tmp/H-000-MSG4__-202401151200-__"
        );
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Pattern::new("/d/{name").is_err());
        assert!(Pattern::new("/d/{:d}").is_err());
        assert!(Pattern::new("/d/{x:q}").is_err());
        // multibyte conversion character
        assert!(Pattern::new("/d/{x:5é}").is_err());
        assert!(Pattern::new("/d/{x:ü}.txt").is_err());
    }
}
