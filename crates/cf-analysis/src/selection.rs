//! Ordered selection steps: cuts and weights.
//!
//! A cut is a boolean predicate over one event; events failing it stop
//! contributing to every later step. A weight is a multiplicative factor
//! identified by name so systematic variants can swap it out. Step order is
//! significant for cuts only.

use cf_core::Result;
use serde::{Deserialize, Serialize};

use crate::expr::CompiledExpr;

/// Column name holding the per-event value of a named weight.
///
/// Weight steps are resolved against event-store columns `w_<name>`, with
/// the name lowercased (`PUUp` → `w_puup`).
pub fn weight_leaf(name: &str) -> String {
    format!("w_{}", name.to_lowercase())
}

/// One step in a selection sequence.
#[derive(Debug, Clone)]
pub enum SelectionStep {
    /// Event-excluding predicate, compiled once at load time.
    Cut {
        /// Step name shown in cutflow reports.
        name: String,
        /// Predicate; events pass when it evaluates positive.
        expr: CompiledExpr,
    },
    /// Multiplicative factor read from the event store.
    Weight {
        /// Weight name; resolved via [`weight_leaf`].
        name: String,
    },
}

impl SelectionStep {
    /// Compile a cut from its configured `(name, expression)` pair.
    pub fn cut(name: &str, expression: &str) -> Result<Self> {
        Ok(SelectionStep::Cut { name: name.to_string(), expr: CompiledExpr::compile(expression)? })
    }

    /// A weight step.
    pub fn weight(name: &str) -> Self {
        SelectionStep::Weight { name: name.to_string() }
    }

    /// Step name as shown in reports.
    pub fn name(&self) -> &str {
        match self {
            SelectionStep::Cut { name, .. } => name,
            SelectionStep::Weight { name } => name,
        }
    }
}

/// Configured shared selection for one cutflow key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutflowSpec {
    /// Ordered `(name, expression)` cut definitions.
    pub cuts: Vec<(String, String)>,
    /// Weight names applied to surviving events.
    pub weights: Vec<String>,
}

impl CutflowSpec {
    /// Compile the shared cut sequence, prefixed with the synthetic
    /// "analyzed" step that counts every event seen.
    pub fn compile_cuts(&self) -> Result<Vec<SelectionStep>> {
        let mut steps = vec![SelectionStep::cut("analyzed", "true")?];
        for (name, expression) in &self.cuts {
            steps.push(SelectionStep::cut(name, expression)?);
        }
        Ok(steps)
    }

    /// The weight steps for a given effective weight list.
    pub fn compile_weights(weights: &[String]) -> Vec<SelectionStep> {
        weights.iter().map(|w| SelectionStep::weight(w)).collect()
    }
}
