//! Analysis configuration, loaded from a single YAML file.
//!
//! The file carries everything a run needs: luminosity, process
//! definitions, cutflow selections, categories, distributions, and the
//! systematic sources to expand. Expressions are compiled while the
//! configuration is turned into runtime objects, so a typo fails the run
//! before any event is read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plot::Distribution;
use crate::process::{Process, ProcessRegistry};
use crate::selection::CutflowSpec;
use crate::systematics::ShapeSystematics;

/// Binning of one distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binning {
    /// Uniform bins on a closed-open range.
    Uniform {
        /// Number of bins.
        n_bins: usize,
        /// Lower edge.
        lo: f64,
        /// Upper edge.
        hi: f64,
    },
    /// Explicit, increasing bin edges.
    Edges(Vec<f64>),
}

/// Declarative form of a [`Distribution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSpec {
    /// Full distribution name, possibly with a path-like prefix.
    pub name: String,
    /// Histogrammed expression.
    pub expression: String,
    /// Binning.
    pub binning: Binning,
    /// Override for the persisted name.
    #[serde(default)]
    pub limit_name: Option<String>,
    /// Override for the variant's weight list.
    #[serde(default)]
    pub weights: Option<Vec<String>>,
    /// Load every systematic variant on read.
    #[serde(default)]
    pub essential: bool,
    /// Hide the data overlay downstream.
    #[serde(default)]
    pub blind: bool,
}

impl DistributionSpec {
    /// Compile into a runtime distribution.
    pub fn build(&self) -> Result<Distribution> {
        let mut dist = match &self.binning {
            Binning::Uniform { n_bins, lo, hi } => {
                Distribution::uniform(&self.name, &self.expression, *n_bins, *lo, *hi)?
            }
            Binning::Edges(edges) => {
                Distribution::new(&self.name, &self.expression, edges.clone())?
            }
        };
        if let Some(limit_name) = &self.limit_name {
            dist = dist.limit_name(limit_name);
        }
        if let Some(weights) = &self.weights {
            let names: Vec<&str> = weights.iter().map(String::as_str).collect();
            dist = dist.weights(&names);
        }
        if self.essential {
            dist = dist.essential();
        }
        if self.blind {
            dist = dist.blind();
        }
        Ok(dist)
    }
}

/// Everything one analysis run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Integrated luminosity in inverse picobarns.
    pub lumi: f64,
    /// Output directory for tables, histograms, and reports.
    pub outdir: PathBuf,
    /// Input directory of the event store; defaults to `outdir`.
    #[serde(default)]
    pub indir: Option<PathBuf>,
    /// Cap on generated events per process, for quick partial runs.
    #[serde(default)]
    pub event_limit: Option<u64>,
    /// Shared selections keyed by cutflow name.
    pub cutflows: BTreeMap<String, CutflowSpec>,
    /// Every process definition, atomic and combined.
    pub processes: Vec<Process>,
    /// Processes filled and shown in reports.
    pub plot: Vec<String>,
    /// Processes written out for statistical inference.
    #[serde(default)]
    pub limits: Vec<String>,
    /// Uncertainty sources to expand into Up/Down variants.
    #[serde(default)]
    pub systematics: Vec<String>,
    /// Which sources vary the selection instead of the weights.
    #[serde(default)]
    pub shape_systematics: Option<ShapeSystematics>,
    /// `(name, expression)` category predicates.
    #[serde(default)]
    pub categories: Vec<(String, String)>,
    /// Distributions to histogram.
    pub distributions: Vec<DistributionSpec>,
}

impl AnalysisConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_yaml_ng::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references without touching the event store.
    ///
    /// Unresolvable processes and unknown cutflow keys are fatal. Limit
    /// processes missing from the plot list and limit-name collisions only
    /// degrade the output, so they are logged and tolerated.
    pub fn validate(&self) -> Result<()> {
        let registry = self.registry()?;
        for name in self.plot.iter().chain(&self.limits) {
            for process in registry.expand(name)? {
                if !self.cutflows.contains_key(&process.cutflow) {
                    return Err(Error::Config(format!(
                        "process '{}' references unknown cutflow '{}'",
                        process.name, process.cutflow
                    )));
                }
            }
        }
        for name in &self.limits {
            if !self.plot.contains(name) {
                warn!(process = %name, "limit process is not plotted");
            }
        }
        for collision in registry.check_limit_names(&self.limits)? {
            warn!(limit_name = %collision, "limit name used by more than one process");
        }
        for spec in &self.distributions {
            spec.build()?;
        }
        for (name, expression) in &self.categories {
            crate::expr::CompiledExpr::compile(expression)
                .map_err(|e| Error::Config(format!("category '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Build the process registry.
    pub fn registry(&self) -> Result<ProcessRegistry> {
        let mut registry = ProcessRegistry::new();
        for process in &self.processes {
            registry.register(process.clone())?;
        }
        Ok(registry)
    }

    /// Shape-systematic classification, defaulting to the jet-energy pair.
    pub fn shape_systematics(&self) -> ShapeSystematics {
        self.shape_systematics.clone().unwrap_or_default()
    }

    /// Compile all configured distributions.
    pub fn distributions(&self) -> Result<Vec<Distribution>> {
        self.distributions.iter().map(DistributionSpec::build).collect()
    }

    /// Event-store input directory.
    pub fn indir(&self) -> &Path {
        self.indir.as_deref().unwrap_or(&self.outdir)
    }
}
