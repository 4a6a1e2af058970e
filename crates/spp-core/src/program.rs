//! Programs: an output expression plus constants, run over input rows.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::error::Result;
use crate::eval::Evaluator;
use crate::expr::Expr;
use crate::metrics::METRICS;
use crate::obs;
use crate::table::{Row, Table};
use crate::template::Scope;

fn default_name() -> String {
    "program".to_string()
}

/// A symbolic prompt program.
///
/// `output` is evaluated once per input row; `constants` are visible to every
/// row (row inputs shadow constants of the same name) and are carried into the
/// resulting [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_name")]
    pub name: String,
    pub output: Expr,
    #[serde(default, skip_serializing_if = "Row::is_empty")]
    pub constants: Row,
}

impl Program {
    pub fn new(output: impl Into<Expr>) -> Self {
        Self {
            name: default_name(),
            output: output.into(),
            constants: Row::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.output.validate()
    }

    /// Evaluate the program over `rows` and materialize the result table.
    pub async fn run(&self, evaluator: &Evaluator, rows: Vec<Row>) -> Result<Table> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, &self.name);

        async move {
            let started = Instant::now();
            obs::emit_run_started(&run_id, &self.name, rows.len());

            let scopes: Vec<Scope> = rows
                .iter()
                .map(|row| {
                    let mut scope = self.constants.clone();
                    scope.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
                    scope
                })
                .collect();

            let column = match evaluator.eval(&self.output, &scopes).await {
                Ok(column) => column,
                Err(e) => {
                    obs::emit_run_failed(&run_id, &e);
                    return Err(e);
                }
            };

            let table = Table::from_column(rows, column, self.constants.clone());
            let failed = table.failed_rows().len();
            METRICS.add_rows_failed(failed as u64);
            obs::emit_run_finished(
                &run_id,
                started.elapsed().as_millis() as u64,
                table.len(),
                failed,
            );
            Ok(table)
        }
        .instrument(span)
        .await
    }
}
