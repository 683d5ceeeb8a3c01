//! Process registry: atomic and combined process descriptors.
//!
//! A process identifies a source of events. Atomic processes map to actual
//! datasets in the event store; combined processes are factor-weighted unions
//! of other processes and only exist at aggregation time. The registry is
//! populated during configuration load and read-only afterwards.

use std::collections::{HashMap, HashSet};

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// An atomic process backed by datasets in the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicProcess {
    /// Unique registry key.
    pub name: String,
    /// Human-readable name used in reports and legends.
    #[serde(default)]
    pub display_name: String,
    /// Name under which histograms are recorded for statistical inference.
    /// Defaults to `name`.
    #[serde(default)]
    pub limit_name: Option<String>,
    /// Physical rate in pb. Defaults to 1 for non-simulation samples.
    #[serde(default = "default_cross_section")]
    pub cross_section: f64,
    /// Number of generated events, the per-event weight denominator.
    #[serde(default)]
    pub event_count: u64,
    /// Source keys resolved by the event store.
    pub paths: Vec<String>,
    /// Which shared selection-step sequence applies.
    pub cutflow: String,
    /// Process-specific cuts, prepended to the shared sequence.
    /// Each entry is `(name, expression)`.
    #[serde(default)]
    pub additional_cuts: Vec<(String, String)>,
}

fn default_cross_section() -> f64 {
    1.0
}

impl AtomicProcess {
    /// The name used for statistical output.
    pub fn limit_name(&self) -> &str {
        self.limit_name.as_deref().unwrap_or(&self.name)
    }
}

/// A factor-weighted union of other processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedProcess {
    /// Unique registry key.
    pub name: String,
    /// Human-readable name used in reports and legends.
    #[serde(default)]
    pub display_name: String,
    /// Name used for statistical output, if this process is written out.
    #[serde(default)]
    pub limit_name: Option<String>,
    /// Member process names; may reference other combined processes.
    pub subprocesses: Vec<String>,
    /// Scale applied to each subprocess histogram when summing.
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

/// Either kind of process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Process {
    /// Dataset-backed process.
    Atomic(AtomicProcess),
    /// Union of other processes.
    Combined(CombinedProcess),
}

impl Process {
    /// Registry key.
    pub fn name(&self) -> &str {
        match self {
            Process::Atomic(p) => &p.name,
            Process::Combined(p) => &p.name,
        }
    }

    /// Display name, falling back to the registry key.
    pub fn display_name(&self) -> &str {
        let display = match self {
            Process::Atomic(p) => &p.display_name,
            Process::Combined(p) => &p.display_name,
        };
        if display.is_empty() {
            self.name()
        } else {
            display
        }
    }

    /// The name used for statistical output.
    pub fn limit_name(&self) -> &str {
        match self {
            Process::Atomic(p) => p.limit_name(),
            Process::Combined(p) => p.limit_name.as_deref().unwrap_or(&p.name),
        }
    }
}

/// Lookup table for process definitions.
///
/// Append-only while the configuration loads; afterwards only `get` and
/// `expand` are used.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, Process>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process definition.
    pub fn register(&mut self, process: Process) -> Result<()> {
        let name = process.name().to_string();
        if self.processes.contains_key(&name) {
            return Err(Error::DuplicateName { kind: "process", name });
        }
        self.processes.insert(name, process);
        Ok(())
    }

    /// Look up a process by name.
    pub fn get(&self, name: &str) -> Result<&Process> {
        self.processes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("process '{}'", name)))
    }

    /// Flatten a process into its atomic leaves, left to right.
    ///
    /// An atomic process expands to itself. A combined process expands to the
    /// concatenation of its subprocess expansions; the subprocess graph must
    /// be a DAG.
    pub fn expand(&self, name: &str) -> Result<Vec<&AtomicProcess>> {
        let mut out = Vec::new();
        let mut in_progress = HashSet::new();
        self.expand_into(name, &mut in_progress, &mut out)?;
        Ok(out)
    }

    fn expand_into<'a>(
        &'a self,
        name: &str,
        in_progress: &mut HashSet<String>,
        out: &mut Vec<&'a AtomicProcess>,
    ) -> Result<()> {
        match self.get(name)? {
            Process::Atomic(p) => out.push(p),
            Process::Combined(p) => {
                if !in_progress.insert(name.to_string()) {
                    return Err(Error::CyclicDefinition(name.to_string()));
                }
                for sub in &p.subprocesses {
                    self.expand_into(sub, in_progress, out)?;
                }
                in_progress.remove(name);
            }
        }
        Ok(())
    }

    /// Expand several processes and deduplicate the atomic leaves by name,
    /// keeping first-appearance order.
    pub fn expand_all(&self, names: &[String]) -> Result<Vec<&AtomicProcess>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in names {
            for p in self.expand(name)? {
                if seen.insert(p.name.clone()) {
                    out.push(p);
                }
            }
        }
        Ok(out)
    }

    /// Limit names used by more than one of the given processes.
    ///
    /// Collisions corrupt statistical output but are not fatal; callers log
    /// them and continue.
    pub fn check_limit_names(&self, names: &[String]) -> Result<Vec<String>> {
        let mut seen: HashMap<&str, u32> = HashMap::new();
        for name in names {
            *seen.entry(self.get(name)?.limit_name()).or_insert(0) += 1;
        }
        let mut collisions: Vec<String> = seen
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .map(|(l, _)| l.to_string())
            .collect();
        collisions.sort();
        Ok(collisions)
    }

    /// Whether a process is data-like: real or estimated collision data,
    /// carrying no simulation weights.
    pub fn is_data(name: &str) -> bool {
        name.starts_with("collisions") || name.starts_with("fakes")
    }
}
