//! Event-store collaborator contract.
//!
//! The engine never reads event files itself; it asks an [`EventStore`] for
//! named per-event columns ("leaves") and evaluates compiled expressions over
//! them. Derived columns from a trained model are served through the same
//! lookup. Shape-systematic variants are selected by tag: the store decides
//! how a varied column is materialized (for [`MemoryStore`], a column named
//! `<leaf>_<tag>` shadows `<leaf>`).

use std::collections::HashMap;
use std::path::Path;

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::expr::CompiledExpr;
use crate::systematics::NEUTRAL;

/// Per-event values keyed by leaf name. All vectors have equal length.
pub type Columns = HashMap<String, Vec<f64>>;

/// Synchronous source of per-event columns.
pub trait EventStore {
    /// Fetch the requested leaves for all events in the given source paths,
    /// concatenated in path order, under the given variant tag.
    ///
    /// A missing source yields [`Error::NotFound`]; callers treat that as
    /// "skip this process", not as a fatal condition.
    fn columns(&self, paths: &[String], leaves: &[String], variant: &str) -> Result<Columns>;

    /// Total number of events across the given source paths.
    ///
    /// Independent of any leaf request: leaf-free selections and weightless
    /// data still account for every stored event.
    fn n_events(&self, paths: &[String]) -> Result<u64>;

    /// Count and weighted sum of events passing `selection`; a convenience
    /// built on `columns` and `n_events`.
    ///
    /// The weight expression, when given, is evaluated for every passing
    /// event; without one each event counts with weight 1.
    fn count_and_sum(
        &self,
        paths: &[String],
        selection: &CompiledExpr,
        weight: Option<&CompiledExpr>,
        variant: &str,
    ) -> Result<(u64, f64)> {
        let mut leaves = selection.required_leaves.clone();
        if let Some(w) = weight {
            for leaf in &w.required_leaves {
                if !leaves.contains(leaf) {
                    leaves.push(leaf.clone());
                }
            }
        }
        let n = self.n_events(paths)? as usize;
        let columns = self.columns(paths, &leaves, variant)?;
        let mut passing = evaluate(selection, &columns)?;
        passing.resize(n, passing.last().copied().unwrap_or(0.0));
        let weights = match weight {
            Some(w) => {
                let mut values = evaluate(w, &columns)?;
                values.resize(n, values.last().copied().unwrap_or(0.0));
                Some(values)
            }
            None => None,
        };

        let mut count = 0u64;
        let mut sum = 0.0;
        for (i, &pass) in passing.iter().enumerate() {
            if pass > 0.0 {
                count += 1;
                sum += weights.as_ref().map_or(1.0, |w| w[i]);
            }
        }
        Ok((count, sum))
    }
}

/// Evaluate a compiled expression against fetched columns.
///
/// Constant expressions are broadcast to the event count of the columns (or
/// to a single value when no columns were fetched at all).
pub fn evaluate(expr: &CompiledExpr, columns: &Columns) -> Result<Vec<f64>> {
    let cols: Vec<&[f64]> = expr
        .required_leaves
        .iter()
        .map(|name| {
            columns
                .get(name)
                .map(Vec::as_slice)
                .ok_or_else(|| Error::Expression(format!("missing leaf '{}'", name)))
        })
        .collect::<Result<_>>()?;
    if cols.is_empty() {
        let n = columns.values().next().map_or(1, Vec::len);
        return Ok(vec![expr.eval_row(&[]); n]);
    }
    Ok(expr.eval_bulk(&cols))
}

/// In-memory event store, loadable from a JSON file.
///
/// Used by tests and by the CLI's simple columnar backend. The JSON shape is
/// a map from source name to a map from leaf name to the per-event values.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryStore {
    sources: HashMap<String, Columns>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source, validating that all columns have equal length.
    pub fn add_source(&mut self, name: &str, columns: Columns) -> Result<()> {
        let mut lengths = columns.values().map(Vec::len);
        if let Some(first) = lengths.next() {
            if lengths.any(|l| l != first) {
                return Err(Error::Config(format!(
                    "source '{}' has columns of unequal length",
                    name
                )));
            }
        }
        self.sources.insert(name.to_string(), columns);
        Ok(())
    }

    /// Load a store from a JSON columns file.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let store: MemoryStore = serde_json::from_slice(&bytes)?;
        for (name, columns) in &store.sources {
            let mut lengths = columns.values().map(Vec::len);
            if let Some(first) = lengths.next() {
                if lengths.any(|l| l != first) {
                    return Err(Error::Config(format!(
                        "source '{}' has columns of unequal length",
                        name
                    )));
                }
            }
        }
        Ok(store)
    }

    fn resolve<'a>(
        source: &'a Columns,
        leaf: &str,
        variant: &str,
    ) -> Option<&'a Vec<f64>> {
        if variant != NEUTRAL {
            if let Some(varied) = source.get(&format!("{}_{}", leaf, variant)) {
                return Some(varied);
            }
        }
        source.get(leaf)
    }
}

impl EventStore for MemoryStore {
    fn n_events(&self, paths: &[String]) -> Result<u64> {
        let mut n = 0u64;
        for path in paths {
            let source = self
                .sources
                .get(path)
                .ok_or_else(|| Error::NotFound(format!("source '{}'", path)))?;
            n += source.values().next().map_or(0, Vec::len) as u64;
        }
        Ok(n)
    }

    fn columns(&self, paths: &[String], leaves: &[String], variant: &str) -> Result<Columns> {
        let mut out: Columns = leaves.iter().map(|l| (l.clone(), Vec::new())).collect();
        for path in paths {
            let source = self
                .sources
                .get(path)
                .ok_or_else(|| Error::NotFound(format!("source '{}'", path)))?;
            let n = source.values().next().map_or(0, Vec::len);
            for leaf in leaves {
                let column = Self::resolve(source, leaf, variant).ok_or_else(|| {
                    Error::NotFound(format!("leaf '{}' in source '{}'", leaf, path))
                })?;
                if column.len() != n {
                    return Err(Error::Config(format!(
                        "leaf '{}' in source '{}' has inconsistent length",
                        leaf, path
                    )));
                }
                out.get_mut(leaf).unwrap().extend_from_slice(column);
            }
        }
        Ok(out)
    }
}
