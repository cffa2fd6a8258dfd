//! Notification templates: `{field}` placeholders with optional `[key]`/`.key`
//! navigation and a small format spec, `{emo:name}` glyphs and `{{`/`}}` escapes.
//!
//! Only fields the caller provides are substituted. Any other placeholder is
//! echoed back with its braces so a misconfigured template stays readable.

use octogram_ipc::Markup;
use octogram_telegram::{markup, Emoji};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TemplateError {
    #[error("single '{0}' encountered in template")]
    UnbalancedBrace(char),
    #[error("invalid format spec '{0}'")]
    BadSpec(String),
    #[error("field '{field}' has no key '{key}'")]
    MissingKey { field: String, key: String },
    #[error("cannot apply format spec '{spec}' to '{value}'")]
    SpecMismatch { spec: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Accessor {
    Key(String),
    Attr(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct FormatSpec {
    raw: String,
    width: Option<usize>,
    precision: Option<usize>,
    kind: Option<char>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Emoji(String),
    Field {
        raw: String,
        name: String,
        path: Vec<Accessor>,
        spec: Option<FormatSpec>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnbalancedBrace('}')),
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        match inner {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(TemplateError::UnbalancedBrace('{')),
                            other => body.push(other),
                        }
                    }
                    if !closed {
                        return Err(TemplateError::UnbalancedBrace('{'));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&body)?);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Top-level field names referenced by the template.
    pub fn fields(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Field { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Renders with `values`; fields missing from the map stay literal.
    /// Escaping for `markup` is applied to each substituted leaf value.
    pub fn render(
        &self,
        values: &HashMap<String, Value>,
        markup: Markup,
        emoji: Emoji,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Emoji(name) => out.push_str(emoji.get(name)),
                Segment::Field {
                    raw,
                    name,
                    path,
                    spec,
                } => {
                    let Some(value) = values.get(name) else {
                        out.push('{');
                        out.push_str(raw);
                        out.push('}');
                        continue;
                    };
                    let leaf = navigate(name, value, path)?;
                    let text = format_value(leaf, spec.as_ref())?;
                    out.push_str(&markup::escape(markup, &text));
                }
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(body: &str) -> Result<Segment, TemplateError> {
    let (field, spec) = match body.split_once(':') {
        Some((field, spec)) => (field, Some(spec)),
        None => (body, None),
    };
    if field == "emo" || field == "0" {
        return Ok(Segment::Emoji(spec.unwrap_or_default().to_string()));
    }

    let name_end = field.find(['[', '.']).unwrap_or(field.len());
    let name = &field[..name_end];
    if name.is_empty() {
        return Err(TemplateError::BadSpec(body.to_string()));
    }
    let path = parse_path(&field[name_end..]).ok_or_else(|| TemplateError::BadSpec(body.to_string()))?;
    let spec = spec.map(parse_spec).transpose()?;

    Ok(Segment::Field {
        raw: body.to_string(),
        name: name.to_string(),
        path,
        spec,
    })
}

fn parse_path(mut rest: &str) -> Option<Vec<Accessor>> {
    let mut path = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let key = &after[..end];
            if key.is_empty() {
                return None;
            }
            path.push(Accessor::Key(key.to_string()));
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['[', '.']).unwrap_or(after.len());
            let key = &after[..end];
            if key.is_empty() {
                return None;
            }
            path.push(Accessor::Attr(key.to_string()));
            rest = &after[end..];
        } else {
            return None;
        }
    }
    Some(path)
}

fn parse_spec(raw: &str) -> Result<FormatSpec, TemplateError> {
    let bad = || TemplateError::BadSpec(raw.to_string());
    let mut spec = FormatSpec {
        raw: raw.to_string(),
        ..FormatSpec::default()
    };
    let mut rest = raw;

    if let Some(kind) = rest.chars().last().filter(|c| matches!(c, 'f' | 'd' | 's')) {
        spec.kind = Some(kind);
        rest = &rest[..rest.len() - 1];
    }
    let (width, precision) = match rest.split_once('.') {
        Some((width, precision)) => (width, Some(precision)),
        None => (rest, None),
    };
    if !width.is_empty() {
        spec.width = Some(width.parse().map_err(|_| bad())?);
    }
    if let Some(precision) = precision {
        spec.precision = Some(precision.parse().map_err(|_| bad())?);
    }
    Ok(spec)
}

fn navigate<'a>(field: &str, value: &'a Value, path: &[Accessor]) -> Result<&'a Value, TemplateError> {
    let mut current = value;
    for accessor in path {
        let key = match accessor {
            Accessor::Key(key) | Accessor::Attr(key) => key,
        };
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| TemplateError::MissingKey {
            field: field.to_string(),
            key: key.clone(),
        })?;
    }
    Ok(current)
}

/// Plain text of a value, close to how the host language would print it.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn format_value(value: &Value, spec: Option<&FormatSpec>) -> Result<String, TemplateError> {
    let Some(spec) = spec.filter(|s| !s.raw.is_empty()) else {
        return Ok(plain(value));
    };
    let mismatch = || TemplateError::SpecMismatch {
        spec: spec.raw.clone(),
        value: plain(value),
    };
    let width = spec.width.unwrap_or(0);

    match (value, spec.kind) {
        (Value::Number(n), Some('d')) => {
            let int = n.as_i64().ok_or_else(mismatch)?;
            Ok(format!("{:>width$}", int, width = width))
        }
        (Value::Number(n), Some('f')) | (Value::Number(n), None) => {
            let float = n.as_f64().ok_or_else(mismatch)?;
            match spec.precision {
                Some(precision) => Ok(format!("{:>width$.precision$}", float, width = width, precision = precision)),
                None if spec.kind == Some('f') => Ok(format!("{:>width$.6}", float, width = width)),
                None => Ok(format!("{:>width$}", plain(value), width = width)),
            }
        }
        (Value::String(s), None) | (Value::String(s), Some('s')) => {
            let text: String = match spec.precision {
                Some(precision) => s.chars().take(precision).collect(),
                None => s.clone(),
            };
            Ok(format!("{:<width$}", text, width = width))
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn render(text: &str, vals: &HashMap<String, Value>, markup: Markup) -> Result<String, TemplateError> {
        Template::parse(text)?.render(vals, markup, Emoji::new(true))
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let vals = values(&[("file", json!("benchy.gcode"))]);
        let out = render("{file} at {secret_token} {other[0]}", &vals, Markup::Off).expect("render");
        assert_eq!(out, "benchy.gcode at {secret_token} {other[0]}");
    }

    #[test]
    fn emoji_and_escaped_braces() {
        let out = render("{emo:check} {{literal}} {0:warning}", &HashMap::new(), Markup::Off).expect("render");
        assert_eq!(out, "\u{2705} {literal} \u{26a0}\u{fe0f}");
        let silent = Template::parse("{emo:check}done")
            .expect("parse")
            .render(&HashMap::new(), Markup::Off, Emoji::new(false))
            .expect("render");
        assert_eq!(silent, "done");
    }

    #[test]
    fn navigation_escapes_only_the_leaf() {
        let vals = values(&[(
            "enclosure",
            json!({"current_temps": {"1": {"label": "<box>", "temp": 31.5}}}),
        )]);
        let out = render(
            "{enclosure[current_temps][1][label]}: {enclosure.current_temps.1.temp}",
            &vals,
            Markup::Html,
        )
        .expect("render");
        assert_eq!(out, "&lt;box&gt;: 31.5");
    }

    #[test]
    fn markdown_escaping_applies_to_values_not_template() {
        let vals = values(&[("file", json!("my_part*v2.gcode"))]);
        let out = render("*Done* {file}", &vals, Markup::Markdown).expect("render");
        assert_eq!(out, "*Done* my\\_part\\*v2.gcode");
    }

    #[test]
    fn format_specs_on_numbers() {
        let vals = values(&[("bed_temp", json!(59.87)), ("percent", json!(42))]);
        assert_eq!(render("{bed_temp:.1f}", &vals, Markup::Off).expect("render"), "59.9");
        assert_eq!(render("{percent:3d}%", &vals, Markup::Off).expect("render"), " 42%");
        assert_eq!(render("{bed_temp}", &vals, Markup::Off).expect("render"), "59.87");
    }

    #[test]
    fn malformed_templates_fail() {
        let vals = values(&[("temps", json!({"bed": {}})), ("file", json!("x"))]);
        assert_eq!(
            render("oops {file", &vals, Markup::Off),
            Err(TemplateError::UnbalancedBrace('{'))
        );
        assert_eq!(render("oops }", &vals, Markup::Off), Err(TemplateError::UnbalancedBrace('}')));
        assert!(matches!(
            render("{temps[tool9]}", &vals, Markup::Off),
            Err(TemplateError::MissingKey { .. })
        ));
        assert!(matches!(render("{file:.2f}", &vals, Markup::Off), Err(TemplateError::SpecMismatch { .. })));
        assert!(matches!(render("{file:zz}", &vals, Markup::Off), Err(TemplateError::BadSpec(_))));
    }

    #[test]
    fn fields_lists_top_level_names() {
        let template = Template::parse("{emo:rocket} {file} {temps[bed][actual]} {file}").expect("parse");
        assert_eq!(template.fields().into_iter().collect::<Vec<_>>(), vec!["file", "temps"]);
    }
}
