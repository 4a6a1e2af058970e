//! Column-wise evaluation of SPP expression trees.
//!
//! An expression is evaluated over a batch of lanes at once (one lane per
//! input row, or per row × element inside `for_each`). Every node first
//! evaluates its children over the same lanes, then does its own work for the
//! lanes that are still alive. Generation nodes collect the prompts of all
//! live lanes, group them into minibatches and dispatch every request
//! concurrently; a semaphore shared by the whole evaluator bounds the number
//! of requests in flight.
//!
//! Results are reconciled by lane index, so output order always equals input
//! order whatever order the backend answers in.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::backend::{CompletionRequest, LlmBackend};
use crate::chat::ChatMessage;
use crate::error::{Result, RowError, SppError};
use crate::expr::{Expr, GenNode, OnError};
use crate::extract::{Extractor, LambdaRegistry};
use crate::metrics::METRICS;
use crate::minibatch::{chunk_ranges, format_minibatch, split_minibatch};
use crate::obs;
use crate::template::{value_to_text, Scope, Template};

/// Outcome of one lane at one node.
pub type Cell = std::result::Result<Value, RowError>;

/// One cell per lane, in lane order.
pub type Column = Vec<Cell>;

type Lane = std::result::Result<Scope, RowError>;

/// Evaluator-wide defaults; generation nodes override them per node.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalConfig {
    /// Model used when a node does not name one
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Maximum backend requests in flight at once
    pub max_concurrency: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            max_concurrency: 8,
        }
    }
}

/// Evaluates expressions against a backend.
pub struct Evaluator {
    backend: Arc<dyn LlmBackend>,
    lambdas: Arc<LambdaRegistry>,
    config: EvalConfig,
    permits: Arc<Semaphore>,
}

impl Evaluator {
    pub fn new(backend: Arc<dyn LlmBackend>, config: EvalConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            backend,
            lambdas: Arc::new(LambdaRegistry::new()),
            config,
            permits,
        }
    }

    /// Make custom extractors available to `lambda` extractors.
    pub fn with_lambdas(mut self, lambdas: LambdaRegistry) -> Self {
        self.lambdas = Arc::new(lambdas);
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Validate `expr`, then evaluate it once per scope.
    ///
    /// `Err` means the run aborted (an `on_error = raise` failure or a
    /// program error); per-row failures under `on_error = null` come back as
    /// `Err` cells inside an `Ok` column.
    #[instrument(skip_all, fields(node = %expr.label(), lanes = scopes.len()))]
    pub async fn eval(&self, expr: &Expr, scopes: &[Scope]) -> Result<Column> {
        expr.validate()?;
        self.check_lambdas(expr)?;
        self.eval_lanes(expr, scopes).await
    }

    /// Every `lambda` extractor in `expr` must be registered.
    fn check_lambdas(&self, expr: &Expr) -> Result<()> {
        match expr
            .extractors()
            .into_iter()
            .filter_map(Extractor::lambda_name)
            .find(|name| !self.lambdas.contains(name))
        {
            Some(name) => Err(SppError::UnknownLambda(name.to_string())),
            None => Ok(()),
        }
    }

    fn eval_lanes<'a>(&'a self, expr: &'a Expr, scopes: &'a [Scope]) -> BoxFuture<'a, Result<Column>> {
        async move {
            match expr {
                Expr::Input { column } => scopes
                    .iter()
                    .map(|scope| -> Result<Cell> {
                        match scope.get(column) {
                            Some(value) => Ok(Ok(value.clone())),
                            None => Err(SppError::MissingVariable {
                                name: column.clone(),
                            }),
                        }
                    })
                    .collect::<Result<Column>>(),
                Expr::Constant { value } => {
                    let cell: Cell = Ok(value.clone());
                    Ok(vec![cell; scopes.len()])
                }
                Expr::Template {
                    template,
                    bindings,
                    on_error,
                } => self.eval_template(template, bindings, on_error, scopes).await,
                Expr::Gen(node) => self.eval_gen(node, scopes).await,
                Expr::ForEach { source, item, body } => {
                    self.eval_for_each(source, item, body, scopes).await
                }
                Expr::Extract {
                    source,
                    extractor,
                    on_error,
                } => self.eval_extract(expr, source, extractor, on_error, scopes).await,
                Expr::Join { source, separator } => {
                    let column = self.eval_lanes(source, scopes).await?;
                    column
                        .into_iter()
                        .map(|cell| -> Result<Cell> {
                            match cell {
                                Ok(value) => {
                                    let items = as_list(source, value)?;
                                    let texts: Vec<String> = items.iter().map(value_to_text).collect();
                                    Ok(Ok(Value::String(texts.join(separator.as_str()))))
                                }
                                Err(e) => Ok(Err(e)),
                            }
                        })
                        .collect::<Result<Column>>()
                }
                Expr::Record { fields } => {
                    let names: Vec<&String> = fields.keys().collect();
                    let columns =
                        try_join_all(fields.values().map(|e| self.eval_lanes(e, scopes))).await?;
                    Ok((0..scopes.len())
                        .map(|lane| -> Cell {
                            let mut object = Map::new();
                            for (name, column) in names.iter().zip(&columns) {
                                object.insert((*name).clone(), column[lane].clone()?);
                            }
                            Ok(Value::Object(object))
                        })
                        .collect::<Column>())
                }
            }
        }
        .boxed()
    }

    /// Evaluate `bindings` and overlay them on each scope.
    async fn bind_lanes(&self, bindings: &BTreeMap<String, Expr>, scopes: &[Scope]) -> Result<Vec<Lane>> {
        let columns = try_join_all(bindings.values().map(|e| self.eval_lanes(e, scopes))).await?;
        Ok(scopes
            .iter()
            .enumerate()
            .map(|(lane, scope)| -> Lane {
                let mut scope = scope.clone();
                for (name, column) in bindings.keys().zip(&columns) {
                    scope.insert(name.clone(), column[lane].clone()?);
                }
                Ok(scope)
            })
            .collect())
    }

    async fn eval_template(
        &self,
        template: &str,
        bindings: &BTreeMap<String, Expr>,
        on_error: &OnError,
        scopes: &[Scope],
    ) -> Result<Column> {
        let template = Template::parse(template)?;
        let lanes = self.bind_lanes(bindings, scopes).await?;
        let mut cells: Vec<Option<Cell>> = vec![None; lanes.len()];
        for (lane, bound) in lanes.into_iter().enumerate() {
            match bound {
                Ok(scope) => match template.render(&scope) {
                    Ok(text) => cells[lane] = Some(Ok(Value::String(text))),
                    Err(e) => settle(on_error, "template", e, &[lane], &mut cells)?,
                },
                Err(e) => cells[lane] = Some(Err(e)),
            }
        }
        Ok(finish(cells))
    }

    async fn eval_extract(
        &self,
        expr: &Expr,
        source: &Expr,
        extractor: &Extractor,
        on_error: &OnError,
        scopes: &[Scope],
    ) -> Result<Column> {
        let column = self.eval_lanes(source, scopes).await?;
        let extractor = extractor.prepare()?;
        let mut cells: Vec<Option<Cell>> = vec![None; column.len()];
        for (lane, cell) in column.into_iter().enumerate() {
            match cell {
                Ok(value) => match extractor.apply(&value_to_text(&value), &self.lambdas) {
                    Ok(extracted) => cells[lane] = Some(Ok(extracted)),
                    Err(e) => settle(on_error, &expr.label(), e, &[lane], &mut cells)?,
                },
                Err(e) => cells[lane] = Some(Err(e)),
            }
        }
        Ok(finish(cells))
    }

    async fn eval_for_each(
        &self,
        source: &Expr,
        item: &str,
        body: &Expr,
        scopes: &[Scope],
    ) -> Result<Column> {
        let column = self.eval_lanes(source, scopes).await?;
        let index_name = format!("{item}_index");

        // Flatten every (lane, element) pair into one batch for the body.
        let mut inner_scopes = Vec::new();
        let mut spans: Vec<std::result::Result<usize, RowError>> = Vec::with_capacity(column.len());
        for (scope, cell) in scopes.iter().zip(column) {
            match cell {
                Ok(value) => {
                    let items = as_list(source, value)?;
                    spans.push(Ok(items.len()));
                    for (index, element) in items.into_iter().enumerate() {
                        let mut inner = scope.clone();
                        inner.insert(item.to_string(), element);
                        inner.insert(index_name.clone(), Value::from(index));
                        inner_scopes.push(inner);
                    }
                }
                Err(e) => spans.push(Err(e)),
            }
        }

        debug!(item = %item, lanes = scopes.len(), elements = inner_scopes.len(), "for_each flattened");
        let mut results = self.eval_lanes(body, &inner_scopes).await?.into_iter();

        Ok(spans
            .into_iter()
            .map(|span| -> Cell {
                let count = span?;
                let cells: Vec<Cell> = results.by_ref().take(count).collect();
                cells.into_iter().collect::<std::result::Result<Vec<_>, _>>().map(Value::Array)
            })
            .collect::<Column>())
    }

    async fn eval_gen(&self, node: &GenNode, scopes: &[Scope]) -> Result<Column> {
        let template = Template::parse(&node.prompt)?;
        let extractor = node.extractor.prepare()?;
        let mut cells: Vec<Option<Cell>> = vec![None; scopes.len()];

        // History turns see the node's bindings, so evaluate them over the
        // bound scopes of the lanes still alive.
        let mut bound_lanes = Vec::new();
        let mut bound_scopes = Vec::new();
        for (lane, bound) in self.bind_lanes(&node.bindings, scopes).await?.into_iter().enumerate() {
            match bound {
                Ok(scope) => {
                    bound_lanes.push(lane);
                    bound_scopes.push(scope);
                }
                Err(e) => cells[lane] = Some(Err(e)),
            }
        }
        let history = try_join_all(
            node.history
                .iter()
                .map(|turn| self.eval_lanes(&turn.content, &bound_scopes)),
        )
        .await?;

        let mut live: Vec<(usize, Vec<ChatMessage>)> = Vec::new();
        'lanes: for (i, (&lane, scope)) in bound_lanes.iter().zip(&bound_scopes).enumerate() {
            let mut messages = Vec::with_capacity(node.history.len() + 1);
            for (turn, column) in node.history.iter().zip(&history) {
                match &column[i] {
                    Ok(value) => messages.push(ChatMessage::new(turn.role, value_to_text(value))),
                    Err(e) => {
                        cells[lane] = Some(Err(e.clone()));
                        continue 'lanes;
                    }
                }
            }
            match template.render(scope) {
                Ok(prompt) => messages.push(ChatMessage::user(prompt)),
                Err(e) => {
                    settle(&node.on_error, node.label(), e, &[lane], &mut cells)?;
                    continue;
                }
            }
            live.push((lane, messages));
        }

        let chunks = chunk_ranges(live.len(), node.minibatch);
        debug!(
            node = %node.label(),
            lanes = live.len(),
            requests = chunks.len(),
            minibatch = node.minibatch,
            "dispatching generation"
        );

        let outcomes = join_all(chunks.iter().map(|range| self.dispatch(node, &live[range.clone()]))).await;

        for (range, outcome) in chunks.into_iter().zip(outcomes) {
            let group: Vec<usize> = live[range].iter().map(|(lane, _)| *lane).collect();
            match outcome {
                Ok(texts) => {
                    for (lane, text) in group.into_iter().zip(texts) {
                        match extractor.apply(&text, &self.lambdas) {
                            Ok(value) => cells[lane] = Some(Ok(value)),
                            Err(e) => settle(&node.on_error, node.label(), e, &[lane], &mut cells)?,
                        }
                    }
                }
                Err(e) => settle(&node.on_error, node.label(), e, &group, &mut cells)?,
            }
        }

        Ok(finish(cells))
    }

    /// Send one request for `group` and split the answer per lane.
    async fn dispatch(&self, node: &GenNode, group: &[(usize, Vec<ChatMessage>)]) -> Result<Vec<String>> {
        let messages = match group {
            [(_, messages)] => messages.clone(),
            _ => {
                let prompts: Vec<String> = group
                    .iter()
                    .map(|(_, messages)| {
                        messages
                            .last()
                            .map(|m| m.content.clone())
                            .unwrap_or_default()
                    })
                    .collect();
                vec![ChatMessage::user(format_minibatch(&prompts))]
            }
        };
        let request = self.request_for(node, messages);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SppError::Backend(e.to_string()))?;

        METRICS.inc_requests();
        if group.len() > 1 {
            METRICS.inc_minibatches();
        }
        obs::emit_request_dispatched(node.label(), group.len(), &request.model);

        let response = self.backend.complete(&request).await?;
        split_minibatch(&response.text, group.len())
    }

    fn request_for(&self, node: &GenNode, messages: Vec<ChatMessage>) -> CompletionRequest {
        let settings = &node.settings;
        CompletionRequest {
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages,
            temperature: settings.temperature.or(self.config.temperature),
            max_tokens: settings.max_tokens.or(self.config.max_tokens),
            stop: settings.stop.clone(),
            seed: settings.seed,
            cache: settings.cache,
        }
    }
}

/// A list-valued cell's elements; `null` counts as an empty list.
fn as_list(source: &Expr, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(SppError::NotAList {
            node: source.label(),
            found: type_name(&other).to_string(),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Apply a node's error mode to `lanes` failing with `err`.
fn settle(
    on_error: &OnError,
    node: &str,
    err: SppError,
    lanes: &[usize],
    cells: &mut [Option<Cell>],
) -> Result<()> {
    obs::emit_lanes_failed(node, lanes.len(), &err);
    match on_error {
        OnError::Raise => Err(err),
        OnError::Null => {
            let row = RowError::from(&err);
            for &lane in lanes {
                cells[lane] = Some(Err(row.clone()));
            }
            Ok(())
        }
        OnError::Default(value) => {
            for &lane in lanes {
                cells[lane] = Some(Ok(value.clone()));
            }
            Ok(())
        }
    }
}

fn finish(cells: Vec<Option<Cell>>) -> Column {
    cells
        .into_iter()
        .map(|cell| cell.unwrap_or_else(|| Err(RowError::new("lane was not evaluated"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EchoBackend, ScriptedBackend};
    use serde_json::json;

    fn scopes(rows: &[Value]) -> Vec<Scope> {
        rows.iter()
            .map(|row| {
                row.as_object()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    fn echo() -> Evaluator {
        Evaluator::new(Arc::new(EchoBackend), EvalConfig::default())
    }

    #[tokio::test]
    async fn pure_nodes_need_no_backend() {
        let expr = Expr::record([
            ("greeting", Expr::template("Hi {{name}}")),
            ("fixed", Expr::constant(1)),
            ("joined", Expr::join(Expr::input("tags"), ", ")),
        ]);
        let column = echo()
            .eval(&expr, &scopes(&[json!({"name": "Ada", "tags": ["a", "b"]})]))
            .await
            .unwrap();
        assert_eq!(
            column[0].clone().unwrap(),
            json!({"greeting": "Hi Ada", "fixed": 1, "joined": "a, b"})
        );
    }

    #[tokio::test]
    async fn missing_input_aborts() {
        let err = echo()
            .eval(&Expr::input("absent"), &scopes(&[json!({})]))
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::MissingVariable { .. }));
    }

    #[tokio::test]
    async fn gen_with_echo_returns_rendered_prompt() {
        let expr: Expr = GenNode::new("Say {{word}}").into();
        let column = echo()
            .eval(&expr, &scopes(&[json!({"word": "a"}), json!({"word": "b"})]))
            .await
            .unwrap();
        assert_eq!(column[0].clone().unwrap(), json!("Say a"));
        assert_eq!(column[1].clone().unwrap(), json!("Say b"));
    }

    #[tokio::test]
    async fn node_settings_override_config() {
        let backend = Arc::new(ScriptedBackend::new(|_| Ok("ok".to_string())));
        let config = EvalConfig {
            model: "default-model".to_string(),
            temperature: Some(0.0),
            max_tokens: Some(64),
            max_concurrency: 2,
        };
        let evaluator = Evaluator::new(backend.clone(), config);
        let expr: Expr = GenNode::new("x").model("special").seed(9).stop("\n").into();
        evaluator.eval(&expr, &scopes(&[json!({})])).await.unwrap();

        let request = &backend.requests()[0];
        assert_eq!(request.model, "special");
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(64));
        assert_eq!(request.seed, Some(9));
        assert_eq!(request.stop, vec!["\n".to_string()]);
    }

    #[tokio::test]
    async fn join_rejects_scalars() {
        let expr = Expr::join(Expr::constant("not a list"), ",");
        let err = echo().eval(&expr, &scopes(&[json!({})])).await.unwrap_err();
        assert!(matches!(err, SppError::NotAList { .. }));
    }
}
