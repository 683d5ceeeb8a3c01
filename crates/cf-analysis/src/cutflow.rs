//! Cut-flow accounting: per-step, per-process event counts and weighted sums.
//!
//! One [`Cutflow`] exists per `(cutflow key, systematic variant)`. Processes
//! are accumulated one at a time; a process already present in the synthetic
//! "analyzed" counter is skipped, which makes re-running after a partial
//! failure idempotent. Normalization appends two synthetic trailing counters:
//! the generated-event denominator and the luminosity-scaled yield.

use std::collections::BTreeMap;
use std::path::Path;

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::process::{AtomicProcess, ProcessRegistry};
use crate::selection::{weight_leaf, CutflowSpec, SelectionStep};
use crate::store::{evaluate, EventStore};
use crate::systematics::Variant;

/// Name of the synthetic first counter recording every analyzed event.
pub const ANALYZED: &str = "analyzed";
/// Name of the synthetic generated-event denominator counter.
pub const GENERATED: &str = "generated";
/// Name of the synthetic normalized-yield counter.
pub const YIELD: &str = "yield";

/// Entry count and weighted sum for one process at one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Count {
    /// Raw entries.
    pub events: u64,
    /// Weighted sum.
    pub sum: f64,
}

/// Per-process counts at one selection step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCounter {
    /// Step name.
    pub name: String,
    /// Counts keyed by process name; ordered so serialization is stable.
    pub counts: BTreeMap<String, Count>,
}

impl StepCounter {
    fn new(name: &str) -> Self {
        StepCounter { name: name.to_string(), counts: BTreeMap::new() }
    }

    fn tally(&mut self, process: &str, weight: f64) {
        let c = self.counts.entry(process.to_string()).or_default();
        c.events += 1;
        c.sum += weight;
    }

    /// Count for a process, if it was accounted here.
    pub fn get(&self, process: &str) -> Option<Count> {
        self.counts.get(process).copied()
    }

    /// Process names present at this step.
    pub fn processes(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

/// Accumulator for one cutflow key under one systematic variant.
#[derive(Debug)]
pub struct Cutflow {
    /// `cutflow key` plus the variant suffix.
    pub key: String,
    variant: Variant,
    shared_cuts: Vec<SelectionStep>,
    counters: Vec<StepCounter>,
    normalized: bool,
}

impl Cutflow {
    /// Allocate a fresh cutflow: synthetic "analyzed" step plus the
    /// configured cuts, and the variant's weight list.
    pub fn new(key: &str, spec: &CutflowSpec, variant: Variant) -> Result<Self> {
        let shared_cuts = spec.compile_cuts()?;
        Ok(Cutflow {
            key: format!("{}{}", key, variant.suffix()),
            variant,
            shared_cuts,
            counters: Vec::new(),
            normalized: false,
        })
    }

    /// Rebuild a cutflow from persisted counters, discarding the synthetic
    /// trailing entries so accumulation can continue.
    pub fn resume(
        key: &str,
        spec: &CutflowSpec,
        variant: Variant,
        mut counters: Vec<StepCounter>,
    ) -> Result<Self> {
        while counters.last().map(|c| c.name == GENERATED || c.name == YIELD).unwrap_or(false) {
            counters.pop();
        }
        let mut flow = Self::new(key, spec, variant)?;
        flow.counters = counters;
        Ok(flow)
    }

    /// The effective weight names under this cutflow's variant.
    pub fn weights(&self) -> &[String] {
        &self.variant.weights
    }

    /// Counters in step order, including any synthetic trailing entries.
    pub fn counters(&self) -> &[StepCounter] {
        &self.counters
    }

    /// Whether the process was already accounted for (resume contract).
    pub fn is_processed(&self, process: &str) -> bool {
        self.counters
            .iter()
            .find(|c| c.name == ANALYZED)
            .map(|c| c.counts.contains_key(process))
            .unwrap_or(false)
    }

    /// Find or create the counter for a step, inserting at `pos` so that
    /// process-specific extra cuts keep their position in the table.
    fn counter_slot(&mut self, name: &str, pos: usize) -> usize {
        match self.counters.iter().position(|c| c.name == name) {
            Some(i) => i,
            None => {
                let i = pos.min(self.counters.len());
                self.counters.insert(i, StepCounter::new(name));
                i
            }
        }
    }

    /// Accumulate one atomic process.
    ///
    /// Returns `false` without touching anything when the process is already
    /// present. A missing backing source surfaces as [`Error::NotFound`];
    /// callers skip the process and continue.
    pub fn accumulate(&mut self, process: &AtomicProcess, store: &dyn EventStore) -> Result<bool> {
        if self.is_processed(&process.name) {
            debug!(process = %process.name, cutflow = %self.key, "already accounted, skipping");
            return Ok(false);
        }

        // Extra cuts go in front of the shared sequence, closest-first.
        let mut cuts: Vec<SelectionStep> = Vec::new();
        for (name, expression) in process.additional_cuts.iter().rev() {
            cuts.push(SelectionStep::cut(name, expression)?);
        }
        cuts.extend(self.shared_cuts.iter().cloned());

        let data_like = ProcessRegistry::is_data(&process.name);
        let weight_names: Vec<String> = if data_like {
            Vec::new()
        } else {
            self.variant.weights.clone()
        };

        let mut leaves: Vec<String> = Vec::new();
        for step in &cuts {
            if let SelectionStep::Cut { expr, .. } = step {
                for leaf in &expr.required_leaves {
                    if !leaves.contains(leaf) {
                        leaves.push(leaf.clone());
                    }
                }
            }
        }
        for w in &weight_names {
            let leaf = weight_leaf(w);
            if !leaves.contains(&leaf) {
                leaves.push(leaf);
            }
        }

        let columns = store.columns(&process.paths, &leaves, &self.variant.tag)?;
        let n_events = store.n_events(&process.paths)? as usize;

        let mut passes: Vec<Vec<f64>> = Vec::with_capacity(cuts.len());
        for step in &cuts {
            if let SelectionStep::Cut { expr, .. } = step {
                let mut p = evaluate(expr, &columns)?;
                p.resize(n_events, p.last().copied().unwrap_or(0.0));
                passes.push(p);
            }
        }
        let weight_columns: Vec<&Vec<f64>> = weight_names
            .iter()
            .map(|w| {
                let leaf = weight_leaf(w);
                columns
                    .get(&leaf)
                    .ok_or_else(|| Error::NotFound(format!("weight leaf '{}'", leaf)))
            })
            .collect::<Result<_>>()?;

        // Reserve counter slots before the event loop; the layout is the
        // same for every event of this process.
        let mut cut_slots = Vec::with_capacity(cuts.len());
        for (i, step) in cuts.iter().enumerate() {
            cut_slots.push(self.counter_slot(step.name(), i));
        }
        let weight_steps = CutflowSpec::compile_weights(&self.variant.weights);
        let mut weight_slots = Vec::with_capacity(weight_steps.len());
        for (i, step) in weight_steps.iter().enumerate() {
            weight_slots.push(self.counter_slot(step.name(), cuts.len() + i));
        }

        for event in 0..n_events {
            let mut survived = true;
            for (j, slot) in cut_slots.iter().enumerate() {
                if passes[j][event] <= 0.0 {
                    survived = false;
                    break;
                }
                self.counters[*slot].tally(&process.name, 1.0);
            }
            if !survived {
                continue;
            }
            let mut product = 1.0;
            for (k, slot) in weight_slots.iter().enumerate() {
                if !data_like {
                    product *= weight_columns[k][event];
                }
                self.counters[*slot].tally(&process.name, product);
            }
        }

        debug!(
            process = %process.name,
            cutflow = %self.key,
            events = n_events,
            "accumulated"
        );
        Ok(true)
    }

    /// Append the generated-event denominator and the normalized yield.
    ///
    /// The yield is `last weighted sum × lumi × cross_section / generated`,
    /// with a zero generated count yielding 0. Data-like processes keep
    /// their raw sum. Idempotent.
    pub fn normalize(
        &mut self,
        registry: &ProcessRegistry,
        lumi: f64,
        event_limit: Option<u64>,
    ) -> Result<()> {
        if self.normalized {
            return Ok(());
        }
        let last = match self.counters.last() {
            Some(c) => c.clone(),
            None => return Ok(()),
        };

        let mut generated = StepCounter::new(GENERATED);
        let mut yields = StepCounter::new(YIELD);
        for (name, count) in &last.counts {
            let factor;
            let denominator;
            if ProcessRegistry::is_data(name) {
                denominator = count.events;
                factor = 1.0;
            } else {
                // a resumed table can carry processes that have since been
                // dropped from the configuration; their counts stay, only
                // the synthetic entries are skipped
                let process = match registry.get(name) {
                    Ok(crate::process::Process::Atomic(p)) => p,
                    Ok(crate::process::Process::Combined(_)) => {
                        return Err(Error::Config(format!(
                            "combined process '{}' in cutflow counters",
                            name
                        )))
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(process = %name, cutflow = %self.key, "skipping normalization: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                denominator = match event_limit {
                    Some(limit) => process.event_count.min(limit),
                    None => process.event_count,
                };
                factor = if denominator == 0 {
                    0.0
                } else {
                    lumi * process.cross_section / denominator as f64
                };
            }
            generated
                .counts
                .insert(name.clone(), Count { events: denominator, sum: denominator as f64 });
            yields
                .counts
                .insert(name.clone(), Count { events: count.events, sum: count.sum * factor });
        }
        self.counters.push(generated);
        self.counters.push(yields);
        self.normalized = true;
        Ok(())
    }
}

/// Persisted collection of cutflow counters keyed by `key + variant suffix`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CutflowTable {
    /// Version of the writing toolkit.
    #[serde(default)]
    pub version: String,
    /// Counter lists including the two synthetic trailing entries.
    pub tables: BTreeMap<String, Vec<StepCounter>>,
}

impl Default for CutflowTable {
    fn default() -> Self {
        CutflowTable { version: cf_core::VERSION.to_string(), tables: BTreeMap::new() }
    }
}

impl CutflowTable {
    /// Store a finished cutflow.
    pub fn insert(&mut self, flow: &Cutflow) {
        self.tables.insert(flow.key.clone(), flow.counters.clone());
    }

    /// Serialize to pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a persisted table; failure here means a resume cannot proceed.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::StaleResume(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::StaleResume(format!("{}: {}", path.display(), e)))
    }

    /// Histogram normalization factor for a process: `yield / denominator`,
    /// where the denominator is the last accumulated weighted sum.
    ///
    /// Zero denominator yields factor 0.
    pub fn normalization_factor(&self, key: &str, process: &str) -> Result<f64> {
        let counters = self
            .tables
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("cutflow '{}'", key)))?;
        let n = counters.len();
        if n < 3 || counters[n - 1].name != YIELD {
            return Err(Error::StaleResume(format!(
                "cutflow '{}' is missing its normalization entries",
                key
            )));
        }
        let missing = || Error::NotFound(format!("process '{}' in cutflow '{}'", process, key));
        let denominator = counters[n - 3].get(process).ok_or_else(missing)?.sum;
        let yielded = counters[n - 1].get(process).ok_or_else(missing)?.sum;
        if denominator == 0.0 {
            return Ok(0.0);
        }
        Ok(yielded / denominator)
    }
}
