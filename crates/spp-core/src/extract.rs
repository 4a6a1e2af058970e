//! Extractors turn a raw completion into a structured value.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SppError};

/// How a completion's text becomes a cell value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extractor {
    /// The completion text, untouched.
    #[default]
    Raw,
    /// The completion text with surrounding whitespace removed.
    Trim,
    /// First match of `pattern`; `group` defaults to 1, or 0 when the pattern
    /// has no capture groups.
    Regex {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<usize>,
    },
    /// Every match of `pattern`, as a list.
    RegexAll {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<usize>,
    },
    /// One item per non-empty line, bullets and numbering stripped.
    List,
    /// First JSON object or array in the text.
    Json,
    /// User function registered under `name` in a [`LambdaRegistry`].
    Lambda { name: String },
}

impl fmt::Display for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extractor::Raw => write!(f, "raw"),
            Extractor::Trim => write!(f, "trim"),
            Extractor::Regex { pattern, .. } => write!(f, "regex({pattern})"),
            Extractor::RegexAll { pattern, .. } => write!(f, "regex_all({pattern})"),
            Extractor::List => write!(f, "list"),
            Extractor::Json => write!(f, "json"),
            Extractor::Lambda { name } => write!(f, "lambda({name})"),
        }
    }
}

impl Extractor {
    pub fn regex(pattern: impl Into<String>) -> Self {
        Extractor::Regex {
            pattern: pattern.into(),
            group: None,
        }
    }

    pub fn regex_all(pattern: impl Into<String>) -> Self {
        Extractor::RegexAll {
            pattern: pattern.into(),
            group: None,
        }
    }

    pub fn lambda(name: impl Into<String>) -> Self {
        Extractor::Lambda { name: name.into() }
    }

    /// Check the extractor can run at all (regexes compile).
    pub fn validate(&self) -> Result<()> {
        self.prepare().map(|_| ())
    }

    /// Compile any pattern once, for applying to many texts.
    pub fn prepare(&self) -> Result<PreparedExtractor<'_>> {
        let regex = match self {
            Extractor::Regex { pattern, .. } | Extractor::RegexAll { pattern, .. } => {
                Some(compile(self, pattern)?)
            }
            _ => None,
        };
        Ok(PreparedExtractor {
            extractor: self,
            regex,
        })
    }

    pub fn apply(&self, text: &str, lambdas: &LambdaRegistry) -> Result<Value> {
        self.prepare()?.apply(text, lambdas)
    }

    /// Registry name a `lambda` extractor looks up.
    pub fn lambda_name(&self) -> Option<&str> {
        match self {
            Extractor::Lambda { name } => Some(name),
            _ => None,
        }
    }

    fn fail(&self, reason: impl Into<String>) -> SppError {
        SppError::Extraction {
            extractor: self.to_string(),
            reason: reason.into(),
        }
    }
}

/// An [`Extractor`] with its pattern compiled.
#[derive(Debug)]
pub struct PreparedExtractor<'a> {
    extractor: &'a Extractor,
    regex: Option<Regex>,
}

impl PreparedExtractor<'_> {
    pub fn apply(&self, text: &str, lambdas: &LambdaRegistry) -> Result<Value> {
        let extractor = self.extractor;
        match extractor {
            Extractor::Raw => Ok(Value::String(text.to_string())),
            Extractor::Trim => Ok(Value::String(text.trim().to_string())),
            Extractor::Regex { group, .. } => {
                let re = self.regex()?;
                let group = resolve_group(re, *group);
                let caps = re.captures(text).ok_or_else(|| extractor.fail("no match"))?;
                let m = caps
                    .get(group)
                    .ok_or_else(|| extractor.fail(format!("group {group} did not participate")))?;
                Ok(Value::String(m.as_str().to_string()))
            }
            Extractor::RegexAll { group, .. } => {
                let re = self.regex()?;
                let group = resolve_group(re, *group);
                let items = re
                    .captures_iter(text)
                    .filter_map(|caps| caps.get(group))
                    .map(|m| Value::String(m.as_str().to_string()))
                    .collect();
                Ok(Value::Array(items))
            }
            Extractor::List => Ok(Value::Array(
                parse_list(text).into_iter().map(Value::String).collect(),
            )),
            Extractor::Json => {
                parse_first_json(text).ok_or_else(|| extractor.fail("no JSON value found"))
            }
            Extractor::Lambda { name } => {
                let f = lambdas
                    .get(name)
                    .ok_or_else(|| SppError::UnknownLambda(name.clone()))?;
                (**f)(text).map_err(|reason| extractor.fail(reason))
            }
        }
    }

    fn regex(&self) -> Result<&Regex> {
        self.regex
            .as_ref()
            .ok_or_else(|| self.extractor.fail("pattern was not compiled"))
    }
}

fn compile(extractor: &Extractor, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| extractor.fail(e.to_string()))
}

fn resolve_group(re: &Regex, group: Option<usize>) -> usize {
    group.unwrap_or(if re.captures_len() > 1 { 1 } else { 0 })
}

fn list_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| Regex::new(r"^(?:[-*•]\s+|\d+[.)]\s*)").expect("static regex"))
}

fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| list_prefix().replace(line, "").trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// First `{` or `[` offset that starts a complete JSON value.
fn parse_first_json(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|(_, c)| matches!(c, '{' | '['))
        .find_map(|(start, _)| {
            serde_json::Deserializer::from_str(&text[start..])
                .into_iter::<Value>()
                .next()?
                .ok()
        })
}

/// Signature of a user-supplied extractor.
pub type LambdaFn = Arc<dyn Fn(&str) -> std::result::Result<Value, String> + Send + Sync>;

/// Named custom extractors, referenced from programs by `lambda { name }`.
#[derive(Clone, Default)]
pub struct LambdaRegistry {
    lambdas: HashMap<String, LambdaFn>,
}

impl LambdaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&str) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.lambdas.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&LambdaFn> {
        self.lambdas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lambdas.contains_key(name)
    }
}

impl fmt::Debug for LambdaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.lambdas.keys().collect();
        names.sort();
        f.debug_struct("LambdaRegistry").field("lambdas", &names).finish()
    }
}
