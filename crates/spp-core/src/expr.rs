//! The SPP expression tree.
//!
//! Programs are plain data: building an [`Expr`] never calls a model. The
//! tree is serializable, so programs can be stored as JSON and loaded by the
//! CLI. Evaluation lives in [`crate::eval`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::CachePolicy;
use crate::chat::{ChatHistory, ChatTurn};
use crate::error::{Result, SppError};
use crate::extract::Extractor;
use crate::template::Template;

/// What a failing node does to the row it failed on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the whole run.
    #[default]
    Raise,
    /// Store `null` and record the error against the row.
    Null,
    /// Substitute a value; the row counts as succeeded.
    Default(Value),
}

impl OnError {
    pub fn is_raise(&self) -> bool {
        matches!(self, OnError::Raise)
    }
}

/// Sampling and caching settings of a generation node. Unset fields fall back
/// to the evaluator's configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub cache: CachePolicy,
}

fn default_minibatch() -> usize {
    1
}

fn is_one(n: &usize) -> bool {
    *n == 1
}

/// A text-generation node: one completion per lane, optionally minibatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenNode {
    /// Prompt template, rendered per lane.
    pub prompt: String,
    /// Named sub-expressions made available to the prompt template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Expr>,
    /// Chat turns sent before the prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub settings: GenSettings,
    #[serde(default)]
    pub extractor: Extractor,
    /// Lanes per request.
    #[serde(default = "default_minibatch", skip_serializing_if = "is_one")]
    pub minibatch: usize,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl GenNode {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            bindings: BTreeMap::new(),
            history: Vec::new(),
            settings: GenSettings::default(),
            extractor: Extractor::Raw,
            minibatch: 1,
            on_error: OnError::Raise,
            name: None,
        }
    }

    pub fn bind(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.bindings.insert(name.into(), expr.into());
        self
    }

    pub fn history(mut self, history: ChatHistory) -> Self {
        self.history = history.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.settings.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.settings.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.settings.max_tokens = Some(max_tokens);
        self
    }

    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.settings.stop.push(stop.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.settings.seed = Some(seed);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.settings.cache = policy;
        self
    }

    pub fn extract(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn minibatch(mut self, size: usize) -> Self {
        self.minibatch = size;
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in logs and error messages.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("gen")
    }
}

fn default_separator() -> String {
    "\n".to_string()
}

/// A node of a symbolic prompt program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Value of an input column (or any scope variable).
    Input { column: String },
    /// Literal value.
    Constant { value: Value },
    /// Template rendered against the scope plus `bindings`.
    Template {
        template: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        bindings: BTreeMap<String, Expr>,
        #[serde(default, skip_serializing_if = "OnError::is_raise")]
        on_error: OnError,
    },
    /// Text generation.
    Gen(Box<GenNode>),
    /// Evaluate `body` once per element of the list `source` yields, with the
    /// element bound to `item` and its position to `{item}_index`.
    ForEach {
        source: Box<Expr>,
        item: String,
        body: Box<Expr>,
    },
    /// Apply an extractor to the text of `source`.
    Extract {
        source: Box<Expr>,
        extractor: Extractor,
        #[serde(default)]
        on_error: OnError,
    },
    /// Join the list `source` yields into one string.
    Join {
        source: Box<Expr>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Object built from named sub-expressions.
    Record { fields: BTreeMap<String, Expr> },
}

impl From<GenNode> for Expr {
    fn from(node: GenNode) -> Self {
        Expr::Gen(Box::new(node))
    }
}

impl Expr {
    pub fn input(column: impl Into<String>) -> Self {
        Expr::Input {
            column: column.into(),
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant {
            value: value.into(),
        }
    }

    pub fn template(template: impl Into<String>) -> Self {
        Expr::Template {
            template: template.into(),
            bindings: BTreeMap::new(),
            on_error: OnError::Raise,
        }
    }

    pub fn template_with<I, K>(template: impl Into<String>, bindings: I) -> Self
    where
        I: IntoIterator<Item = (K, Expr)>,
        K: Into<String>,
    {
        Expr::Template {
            template: template.into(),
            bindings: bindings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            on_error: OnError::Raise,
        }
    }

    pub fn for_each(source: impl Into<Expr>, item: impl Into<String>, body: impl Into<Expr>) -> Self {
        Expr::ForEach {
            source: Box::new(source.into()),
            item: item.into(),
            body: Box::new(body.into()),
        }
    }

    pub fn extract(source: impl Into<Expr>, extractor: Extractor) -> Self {
        Expr::Extract {
            source: Box::new(source.into()),
            extractor,
            on_error: OnError::Raise,
        }
    }

    pub fn join(source: impl Into<Expr>, separator: impl Into<String>) -> Self {
        Expr::Join {
            source: Box::new(source.into()),
            separator: separator.into(),
        }
    }

    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Expr)>,
        K: Into<String>,
    {
        Expr::Record {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Set the error mode of a node that can fail per row (`template`,
    /// `gen`, `extract`); other nodes are returned unchanged.
    pub fn on_error(mut self, mode: OnError) -> Self {
        match &mut self {
            Expr::Template { on_error, .. } | Expr::Extract { on_error, .. } => *on_error = mode,
            Expr::Gen(node) => node.on_error = mode,
            _ => {}
        }
        self
    }

    /// Short label used in logs and error messages.
    pub fn label(&self) -> String {
        match self {
            Expr::Input { column } => format!("input({column})"),
            Expr::Constant { .. } => "constant".to_string(),
            Expr::Template { .. } => "template".to_string(),
            Expr::Gen(node) => node.label().to_string(),
            Expr::ForEach { item, .. } => format!("for_each({item})"),
            Expr::Extract { extractor, .. } => format!("extract({extractor})"),
            Expr::Join { .. } => "join".to_string(),
            Expr::Record { .. } => "record".to_string(),
        }
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Input { .. } | Expr::Constant { .. } => Vec::new(),
            Expr::Template { bindings, .. } => bindings.values().collect(),
            Expr::Gen(node) => node
                .bindings
                .values()
                .chain(node.history.iter().map(|turn| &turn.content))
                .collect(),
            Expr::ForEach { source, body, .. } => vec![source.as_ref(), body.as_ref()],
            Expr::Extract { source, .. } | Expr::Join { source, .. } => vec![source.as_ref()],
            Expr::Record { fields } => fields.values().collect(),
        }
    }

    /// Every extractor in the tree, in depth-first order.
    pub fn extractors(&self) -> Vec<&Extractor> {
        let mut out = Vec::new();
        match self {
            Expr::Gen(node) => out.push(&node.extractor),
            Expr::Extract { extractor, .. } => out.push(extractor),
            _ => {}
        }
        for child in self.children() {
            out.extend(child.extractors());
        }
        out
    }

    /// Number of generation nodes in the tree.
    pub fn gen_nodes(&self) -> usize {
        let own = usize::from(matches!(self, Expr::Gen(_)));
        own + self.children().into_iter().map(Expr::gen_nodes).sum::<usize>()
    }

    /// Reject malformed programs before any backend call is made.
    pub fn validate(&self) -> Result<()> {
        match self {
            Expr::Template { template, .. } => {
                Template::parse(template)?;
            }
            Expr::Gen(node) => {
                Template::parse(&node.prompt)?;
                node.extractor.validate()?;
                if node.minibatch == 0 {
                    return Err(SppError::InvalidProgram(format!(
                        "{}: minibatch size must be at least 1",
                        node.label()
                    )));
                }
                if node.minibatch > 1 && !node.history.is_empty() {
                    return Err(SppError::InvalidProgram(format!(
                        "{}: chat history cannot be combined with minibatching",
                        node.label()
                    )));
                }
            }
            Expr::ForEach { item, .. } => {
                if item.trim().is_empty() {
                    return Err(SppError::InvalidProgram(
                        "for_each item name must not be empty".to_string(),
                    ));
                }
            }
            Expr::Extract { extractor, .. } => extractor.validate()?,
            Expr::Input { .. } | Expr::Constant { .. } | Expr::Join { .. } | Expr::Record { .. } => {}
        }
        self.children().into_iter().try_for_each(Expr::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Expr {
        let ideas = GenNode::new("List three uses for {{object}}.")
            .extract(Extractor::List)
            .named("ideas");
        let elaborate = GenNode::new("Explain in one sentence: {{idea}}")
            .minibatch(3)
            .named("elaborate");
        Expr::for_each(ideas, "idea", elaborate)
    }

    #[test]
    fn counts_generation_nodes() {
        assert_eq!(sample().gen_nodes(), 2);
        assert_eq!(Expr::input("x").gen_nodes(), 0);
    }

    #[test]
    fn valid_program_passes() {
        sample().validate().unwrap();
    }

    #[test]
    fn zero_minibatch_rejected() {
        let expr: Expr = GenNode::new("x").minibatch(0).into();
        assert!(matches!(expr.validate(), Err(SppError::InvalidProgram(_))));
    }

    #[test]
    fn history_with_minibatch_rejected() {
        let expr: Expr = GenNode::new("x")
            .history(ChatHistory::new().system("be brief"))
            .minibatch(4)
            .into();
        let err = expr.validate().unwrap_err();
        assert!(err.to_string().contains("chat history"));
    }

    #[test]
    fn nested_template_errors_surface() {
        let expr = Expr::for_each(
            Expr::input("items"),
            "item",
            Expr::template("broken {{item"),
        );
        assert!(matches!(expr.validate(), Err(SppError::Template(_))));
    }

    #[test]
    fn empty_item_name_rejected() {
        let expr = Expr::for_each(Expr::input("xs"), " ", Expr::input("x"));
        assert!(expr.validate().is_err());
    }

    #[test]
    fn json_shape_round_trips() {
        let json = json!({
            "kind": "for_each",
            "source": {
                "kind": "gen",
                "prompt": "List three uses for {{object}}.",
                "extractor": {"type": "list"},
                "name": "ideas"
            },
            "item": "idea",
            "body": {
                "kind": "gen",
                "prompt": "Explain in one sentence: {{idea}}",
                "minibatch": 3,
                "on_error": "null",
                "settings": {"seed": 4, "cache": "refresh"}
            }
        });
        let expr: Expr = serde_json::from_value(json).unwrap();
        match &expr {
            Expr::ForEach { body, .. } => match body.as_ref() {
                Expr::Gen(node) => {
                    assert_eq!(node.minibatch, 3);
                    assert_eq!(node.on_error, OnError::Null);
                    assert_eq!(node.settings.seed, Some(4));
                    assert_eq!(node.settings.cache, CachePolicy::Refresh);
                }
                other => panic!("expected gen body, got {other:?}"),
            },
            other => panic!("expected for_each, got {other:?}"),
        }

        let back: Expr = serde_json::from_value(serde_json::to_value(&expr).unwrap()).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn extractors_are_collected_from_nested_nodes() {
        let names: Vec<String> = sample().extractors().iter().map(|e| e.to_string()).collect();
        assert_eq!(names, vec!["list", "raw"]);
    }

    #[test]
    fn on_error_applies_to_template_nodes() {
        let expr = Expr::template("{{x}}").on_error(OnError::Null);
        match &expr {
            Expr::Template { on_error, .. } => assert_eq!(*on_error, OnError::Null),
            other => panic!("expected template, got {other:?}"),
        }
        let json = serde_json::to_value(Expr::template("{{x}}")).unwrap();
        assert!(json.get("on_error").is_none());
    }

    #[test]
    fn on_error_default_form() {
        let v: OnError = serde_json::from_value(json!({"default": "n/a"})).unwrap();
        assert_eq!(v, OnError::Default(json!("n/a")));
    }
}
