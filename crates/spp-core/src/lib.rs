//! SPP Core Library
//!
//! Symbolic prompt programs: composable expression trees of text generation,
//! templating, extraction and per-item iteration, evaluated lazily against a
//! language-model backend and materialized into input/output tables.
//!
//! ```ignore
//! let ideas = GenNode::new("List three uses for {{object}}.").extract(Extractor::List);
//! let pitch = GenNode::new("Write a one-line pitch for: {{idea}}").minibatch(5);
//! let program = Program::new(Expr::for_each(ideas, "idea", pitch));
//!
//! let table = program.run(&evaluator, rows).await?;
//! println!("{table}");
//! ```

pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod eval;
pub mod expr;
pub mod extract;
pub mod metrics;
pub mod minibatch;
pub mod obs;
pub mod program;
pub mod table;
pub mod telemetry;
pub mod template;

pub use backend::{
    CachePolicy, CachedBackend, CompletionRequest, CompletionResponse, EchoBackend, LlmBackend,
    OfflineBackend, ScriptedBackend,
};
pub use chat::{ChatHistory, ChatMessage, ChatTurn, Role};
pub use config::SppConfig;
pub use error::{Result, RowError, SppError, TemplateError};
pub use eval::{Cell, Column, EvalConfig, Evaluator};
pub use expr::{Expr, GenNode, GenSettings, OnError};
pub use extract::{Extractor, LambdaFn, LambdaRegistry};
pub use metrics::METRICS;
pub use program::Program;
pub use table::{Row, Table, TableRow};
pub use telemetry::{init_from_config, init_tracing};
pub use template::{value_to_text, Scope, Template};

pub use spp_cache::{CacheKey, CachedResponse, FileCache, MemoryCache, ResponseCache};

/// SPP version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
