//! `{{path}}` placeholder templates.
//!
//! A placeholder names a scope variable, optionally followed by dotted
//! segments that index into objects (`item.name`) or arrays (`tags.0`).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Result, SppError, TemplateError};

/// Variable environment for one evaluation lane.
pub type Scope = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(Vec<String>),
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> std::result::Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut consumed = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let offset = consumed + open;
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(TemplateError::UnclosedPlaceholder { offset })?;
            let path = after[..close].trim();
            if path.is_empty() {
                return Err(TemplateError::EmptyPlaceholder { offset });
            }
            segments.push(Segment::Var(
                path.split('.').map(|s| s.trim().to_string()).collect(),
            ));
            let advance = open + 2 + close + 2;
            consumed += advance;
            rest = &rest[advance..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Root variable names referenced by the template, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Var(path) => path.first().map(String::as_str),
                Segment::Text(_) => None,
            })
            .collect()
    }

    pub fn render(&self, scope: &Scope) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(path) => {
                    let value = lookup(scope, path).ok_or_else(|| SppError::MissingVariable {
                        name: path.join("."),
                    })?;
                    out.push_str(&value_to_text(value));
                }
            }
        }
        Ok(out)
    }
}

fn lookup<'a>(scope: &'a Scope, path: &[String]) -> Option<&'a Value> {
    let (root, rest) = path.split_first()?;
    let mut current = scope.get(root)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a value: strings verbatim, `null` empty, anything else as
/// compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> Scope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_simple_placeholders() {
        let t = Template::parse("Translate {{ text }} into {{lang}}.").unwrap();
        let out = t
            .render(&scope(&[("text", json!("hello")), ("lang", json!("French"))]))
            .unwrap();
        assert_eq!(out, "Translate hello into French.");
        assert_eq!(t.placeholders(), vec!["text", "lang"]);
    }

    #[test]
    fn renders_dotted_and_indexed_paths() {
        let t = Template::parse("{{item.name}} / {{item.tags.1}} / {{n}}").unwrap();
        let out = t
            .render(&scope(&[
                ("item", json!({"name": "widget", "tags": ["a", "b"]})),
                ("n", json!(3)),
            ]))
            .unwrap();
        assert_eq!(out, "widget / b / 3");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let t = Template::parse("{{xs}}|{{nothing}}").unwrap();
        let out = t
            .render(&scope(&[("xs", json!([1, 2])), ("nothing", Value::Null)]))
            .unwrap();
        assert_eq!(out, "[1,2]|");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let t = Template::parse("Hi {{user.name}}").unwrap();
        match t.render(&scope(&[("user", json!({}))])) {
            Err(SppError::MissingVariable { name }) => assert_eq!(name, "user.name"),
            other => panic!("expected MissingVariable, got {other:?}"),
        }
    }

    #[test]
    fn unclosed_and_empty_placeholders_fail_to_parse() {
        assert_eq!(
            Template::parse("ok {{oops").unwrap_err(),
            TemplateError::UnclosedPlaceholder { offset: 3 }
        );
        assert_eq!(
            Template::parse("a{{  }}b").unwrap_err(),
            TemplateError::EmptyPlaceholder { offset: 1 }
        );
    }

    #[test]
    fn plain_text_round_trips() {
        let t = Template::parse("no placeholders here").unwrap();
        assert!(t.placeholders().is_empty());
        assert_eq!(t.render(&Scope::new()).unwrap(), "no placeholders here");
    }
}
