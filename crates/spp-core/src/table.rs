//! Tabular results: one row per input, an output column and the constants
//! the program ran with.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::eval::Column;
use crate::template::value_to_text;

/// One input record: column name → value.
pub type Row = BTreeMap<String, Value>;

/// Default cell width used by `Display`.
pub const DEFAULT_CELL_WIDTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub inputs: Row,
    /// Program output; `null` when the row failed.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableRow {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Materialized input/output table of a program run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    /// Union of input column names, in first-seen order
    pub input_columns: Vec<String>,
    pub rows: Vec<TableRow>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constants: Row,
}

impl Table {
    /// Pair each input row with its evaluated cell.
    pub fn from_column(inputs: Vec<Row>, column: Column, constants: Row) -> Self {
        let mut input_columns: Vec<String> = Vec::new();
        for row in &inputs {
            for key in row.keys() {
                if !input_columns.contains(key) {
                    input_columns.push(key.clone());
                }
            }
        }

        let rows = inputs
            .into_iter()
            .zip(column)
            .map(|(inputs, cell)| match cell {
                Ok(output) => TableRow {
                    inputs,
                    output,
                    error: None,
                },
                Err(e) => TableRow {
                    inputs,
                    output: Value::Null,
                    error: Some(e.message),
                },
            })
            .collect();

        Self {
            input_columns,
            rows,
            constants,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn outputs(&self) -> Vec<&Value> {
        self.rows.iter().map(|r| &r.output).collect()
    }

    /// Values of an input column, or of `output`. Rows lacking the column
    /// yield `null`.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        if name == "output" {
            return Some(self.outputs());
        }
        if !self.input_columns.iter().any(|c| c == name) {
            return None;
        }
        Some(
            self.rows
                .iter()
                .map(|r| r.inputs.get(name).unwrap_or(&Value::Null))
                .collect(),
        )
    }

    /// Indices of rows whose evaluation failed.
    pub fn failed_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_failed())
            .map(|(i, _)| i)
            .collect()
    }

    /// Pipe-delimited text grid, cells cut to `max_cell_width` characters.
    pub fn render_text(&self, max_cell_width: usize) -> String {
        let show_errors = self.rows.iter().any(TableRow::is_failed);

        let mut header: Vec<String> = vec!["#".to_string()];
        header.extend(self.input_columns.iter().cloned());
        header.push("output".to_string());
        if show_errors {
            header.push("error".to_string());
        }

        let body: Vec<Vec<String>> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut cells = vec![i.to_string()];
                for name in &self.input_columns {
                    let text = row.inputs.get(name).map(value_to_text).unwrap_or_default();
                    cells.push(clip(&text, max_cell_width));
                }
                cells.push(clip(&value_to_text(&row.output), max_cell_width));
                if show_errors {
                    cells.push(clip(row.error.as_deref().unwrap_or_default(), max_cell_width));
                }
                cells
            })
            .collect();

        let widths: Vec<usize> = (0..header.len())
            .map(|c| {
                body.iter()
                    .map(|cells| cells[c].chars().count())
                    .chain(std::iter::once(header[c].chars().count()))
                    .max()
                    .unwrap_or(1)
            })
            .collect();

        let mut out = String::new();
        push_line(&mut out, &header, &widths);
        out.push('|');
        for w in &widths {
            out.push_str(&"-".repeat(w + 2));
            out.push('|');
        }
        out.push('\n');
        for cells in &body {
            push_line(&mut out, cells, &widths);
        }

        if !self.constants.is_empty() {
            let pairs: Vec<String> = self
                .constants
                .iter()
                .map(|(k, v)| format!("{k}={}", clip(&value_to_text(v), max_cell_width)))
                .collect();
            out.push_str(&format!("constants: {}\n", pairs.join(", ")));
        }
        out
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_text(DEFAULT_CELL_WIDTH))
    }
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    out.push('|');
    for (cell, &width) in cells.iter().zip(widths) {
        out.push_str(&format!(" {cell:<width$} |"));
    }
    out.push('\n');
}

fn clip(text: &str, max: usize) -> String {
    let flat = text.replace("\r\n", "\n").replace('\n', "⏎");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut clipped: String = flat.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}
