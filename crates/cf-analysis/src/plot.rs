//! Histogram aggregation: filling distributions per process, category, and
//! systematic variant, normalizing them against the cutflow table, combining
//! sub-process histograms, and staging collections for limit setting.
//!
//! Histograms are filled for one category at a time; the book is cleared
//! between categories. Persisted keys are
//! `{process limit name}_{category}_{distribution limit name}{variant suffix}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cutflow::CutflowTable;
use crate::expr::CompiledExpr;
use crate::histogram::Histogram;
use crate::process::{AtomicProcess, Process, ProcessRegistry};
use crate::selection::weight_leaf;
use crate::store::{evaluate, EventStore};
use crate::systematics::{Variant, NEUTRAL};

/// One named distribution to histogram.
#[derive(Debug, Clone)]
pub struct Distribution {
    /// Full name, possibly with a subdirectory-like prefix (`"taus/pt_1"`).
    pub name: String,
    /// Name used in persisted keys; defaults to the last path component.
    pub limit_name: String,
    /// Compiled expression for the histogrammed value.
    pub expr: CompiledExpr,
    /// Bin edges.
    pub bin_edges: Vec<f64>,
    /// Weight names overriding the variant's weight list, when set.
    pub weight_override: Option<Vec<String>>,
    /// Essential distributions load every requested systematic variant on
    /// read; others load only the neutral one to bound storage cost.
    pub essential: bool,
    /// Whether the data overlay is hidden downstream.
    pub blind: bool,
}

impl Distribution {
    /// Define a distribution over `expression` with explicit bin edges.
    pub fn new(name: &str, expression: &str, bin_edges: Vec<f64>) -> Result<Self> {
        let limit_name = name.rsplit('/').next().unwrap_or(name).to_string();
        Ok(Distribution {
            name: name.to_string(),
            limit_name,
            expr: CompiledExpr::compile(expression)?,
            bin_edges,
            weight_override: None,
            essential: false,
            blind: false,
        })
    }

    /// Define a distribution with `n_bins` uniform bins on `[lo, hi)`.
    pub fn uniform(name: &str, expression: &str, n_bins: usize, lo: f64, hi: f64) -> Result<Self> {
        let edges = Histogram::uniform(n_bins, lo, hi)?.bin_edges;
        Self::new(name, expression, edges)
    }

    /// Override the persisted name.
    pub fn limit_name(mut self, name: &str) -> Self {
        self.limit_name = name.to_string();
        self
    }

    /// Override the weights used when filling.
    pub fn weights(mut self, weights: &[&str]) -> Self {
        self.weight_override = Some(weights.iter().map(|w| w.to_string()).collect());
        self
    }

    /// Mark as essential.
    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    /// Mark as blinded.
    pub fn blind(mut self) -> Self {
        self.blind = true;
        self
    }
}

/// Suffix under which a filled histogram is stored.
///
/// Simulation histograms carry the first Up/Down-suffixed identifier found
/// in the variant tag or weight list; data-like processes never carry one.
fn fill_suffix(data_like: bool, variant: &Variant, weights: &[String]) -> String {
    if data_like {
        return String::new();
    }
    std::iter::once(variant.tag.as_str())
        .chain(weights.iter().map(String::as_str))
        .find(|s| s.ends_with("Up") || s.ends_with("Down"))
        .map(|s| format!("_{}", s))
        .unwrap_or_default()
}

/// Registered distributions plus their filled histograms for one category.
#[derive(Debug, Default)]
pub struct PlotBook {
    distributions: BTreeMap<String, Distribution>,
    /// distribution limit name → (process name + suffix → histogram)
    hists: BTreeMap<String, BTreeMap<String, Histogram>>,
    normalized: bool,
}

impl PlotBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a distribution; the limit name must be unique.
    pub fn register(&mut self, dist: Distribution) -> Result<()> {
        if self.distributions.contains_key(&dist.limit_name) {
            return Err(Error::DuplicateName { kind: "distribution", name: dist.limit_name });
        }
        self.distributions.insert(dist.limit_name.clone(), dist);
        Ok(())
    }

    /// Registered distribution limit names.
    pub fn distribution_names(&self) -> Vec<String> {
        self.distributions.keys().cloned().collect()
    }

    /// Drop all filled histograms, keeping the registered distributions.
    /// Called between categories.
    pub fn clear(&mut self) {
        self.hists.clear();
        self.normalized = false;
    }

    /// Fill one distribution for one process under one variant.
    ///
    /// The selection is the category predicate only; the cutflow's cuts are
    /// not re-applied here. Each event passing the category contributes the
    /// product of the variant's weights (or the distribution's override).
    /// Data-like processes ignore weights entirely. Refilling the same key
    /// replaces the previous content.
    pub fn fill(
        &mut self,
        dist_name: &str,
        process: &AtomicProcess,
        variant: &Variant,
        category: Option<&CompiledExpr>,
        store: &dyn EventStore,
    ) -> Result<()> {
        let dist = self
            .distributions
            .get(dist_name)
            .ok_or_else(|| Error::NotFound(format!("distribution '{}'", dist_name)))?;

        let data_like = ProcessRegistry::is_data(&process.name);
        let weights: &[String] = if data_like {
            &[]
        } else {
            dist.weight_override.as_deref().unwrap_or(&variant.weights)
        };
        let tag = if data_like { NEUTRAL } else { variant.tag.as_str() };
        let suffix = fill_suffix(data_like, variant, weights);

        let mut leaves = dist.expr.required_leaves.clone();
        for w in weights {
            let leaf = weight_leaf(w);
            if !leaves.contains(&leaf) {
                leaves.push(leaf);
            }
        }
        if let Some(cat) = category {
            for leaf in &cat.required_leaves {
                if !leaves.contains(leaf) {
                    leaves.push(leaf.clone());
                }
            }
        }

        let columns = store.columns(&process.paths, &leaves, tag)?;
        let n_events = store.n_events(&process.paths)? as usize;
        let mut values = evaluate(&dist.expr, &columns)?;
        values.resize(n_events, values.last().copied().unwrap_or(0.0));
        let selected = match category {
            Some(cat) => {
                let mut passing = evaluate(cat, &columns)?;
                passing.resize(n_events, passing.last().copied().unwrap_or(0.0));
                Some(passing)
            }
            None => None,
        };
        let weight_columns: Vec<&Vec<f64>> = weights
            .iter()
            .map(|w| {
                let leaf = weight_leaf(w);
                columns
                    .get(&leaf)
                    .ok_or_else(|| Error::NotFound(format!("weight leaf '{}'", leaf)))
            })
            .collect::<Result<_>>()?;

        let mut hist = Histogram::with_edges(dist.bin_edges.clone())?;
        for event in 0..n_events {
            if let Some(sel) = &selected {
                if sel[event] <= 0.0 {
                    continue;
                }
            }
            let weight: f64 = weight_columns.iter().map(|col| col[event]).product();
            hist.fill(values[event], weight);
        }

        let key = format!("{}{}", process.name, suffix);
        debug!(distribution = %dist_name, key = %key, entries = hist.entries, "filled");
        self.hists.entry(dist_name.to_string()).or_default().insert(key, hist);
        Ok(())
    }

    /// Scale every stored histogram by its process's cutflow factor.
    ///
    /// The factor comes from the neutral cutflow of the histogram's process:
    /// normalized yield over last accumulated weighted sum. Idempotent; a
    /// histogram whose process is missing from the table is left untouched
    /// and logged.
    pub fn normalize(&mut self, table: &CutflowTable, registry: &ProcessRegistry) -> Result<()> {
        if self.normalized {
            return Ok(());
        }
        for (dist_name, hists) in &mut self.hists {
            for (key, hist) in hists.iter_mut() {
                let process_name = strip_variant_suffix(key);
                let process = match registry.get(process_name) {
                    Ok(Process::Atomic(p)) => p,
                    Ok(Process::Combined(_)) => continue,
                    Err(e) => {
                        warn!(
                            distribution = %dist_name,
                            key = %key,
                            "histogram left unnormalized: {}", e
                        );
                        continue;
                    }
                };
                match table.normalization_factor(&process.cutflow, process_name) {
                    Ok(factor) => hist.scale(factor),
                    Err(e) if e.is_recoverable() => {
                        warn!(
                            distribution = %dist_name,
                            key = %key,
                            "no cutflow entry, histogram left unnormalized: {}", e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.normalized = true;
        Ok(())
    }

    /// Histogram for a process under a variant suffix, combining
    /// subprocesses recursively with their factors.
    ///
    /// The overflow is folded into the last bin, so statistical outputs keep
    /// events beyond the last edge. Fails with `NotFound` when an atomic
    /// histogram is absent, or when no subprocess of a combined process has
    /// one at all.
    pub fn combined(
        &self,
        dist_name: &str,
        process: &str,
        suffix: &str,
        registry: &ProcessRegistry,
    ) -> Result<Histogram> {
        let hists = self
            .hists
            .get(dist_name)
            .ok_or_else(|| Error::NotFound(format!("distribution '{}'", dist_name)))?;
        match registry.get(process)? {
            Process::Atomic(_) => {
                let key = format!("{}{}", process, suffix);
                let mut hist = hists
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("histogram '{}'", key)))?;
                hist.fold_overflow();
                Ok(hist)
            }
            Process::Combined(p) => {
                let mut sum: Option<Histogram> = None;
                for sub in &p.subprocesses {
                    match self.combined(dist_name, sub, suffix, registry) {
                        Ok(h) => match &mut sum {
                            Some(s) => s.add_scaled(&h, p.factor)?,
                            None => {
                                let mut h = h;
                                h.scale(p.factor);
                                sum = Some(h);
                            }
                        },
                        Err(e) if e.is_recoverable() => {
                            debug!(process = %sub, suffix = %suffix, "no histogram, skipping");
                        }
                        Err(e) => return Err(e),
                    }
                }
                sum.ok_or_else(|| {
                    Error::NotFound(format!("histogram for combined process '{}'", process))
                })
            }
        }
    }

    /// Sum of the central histograms of several processes, skipping those
    /// without any histogram. `NotFound` only when none contribute.
    pub fn background_sum(
        &self,
        dist_name: &str,
        processes: &[String],
        registry: &ProcessRegistry,
    ) -> Result<Histogram> {
        self.summed(dist_name, processes, "", registry)
    }

    fn summed(
        &self,
        dist_name: &str,
        processes: &[String],
        suffix: &str,
        registry: &ProcessRegistry,
    ) -> Result<Histogram> {
        let mut sum: Option<Histogram> = None;
        for process in processes {
            match self.combined(dist_name, process, suffix, registry) {
                Ok(h) => match &mut sum {
                    Some(s) => s.add_scaled(&h, 1.0)?,
                    None => sum = Some(h),
                },
                Err(e) if e.is_recoverable() => {}
                Err(e) => return Err(e),
            }
        }
        sum.ok_or_else(|| Error::NotFound(format!("no histograms for {:?}", processes)))
    }

    /// Per-bin squared systematic deviation of the summed processes in one
    /// shift direction (`"Up"` or `"Down"`).
    ///
    /// For each source the shifted sum is compared to the central sum and
    /// the squared difference accumulated: `Σ_sources (central − shifted)²`.
    /// The square root is up to the caller. A process without a shifted
    /// histogram for some source contributes its central one (zero
    /// deviation), as does an all-zero shifted histogram when the central
    /// one is filled.
    pub fn squared_deviations(
        &self,
        dist_name: &str,
        processes: &[String],
        systematics: &[String],
        direction: &str,
        registry: &ProcessRegistry,
    ) -> Result<Vec<f64>> {
        let central = self.summed(dist_name, processes, "", registry)?;
        let mut result = vec![0.0; central.n_bins()];
        for source in systematics {
            if source == NEUTRAL {
                continue;
            }
            let suffix = format!("_{}{}", source, direction);
            let mut shifted: Option<Histogram> = None;
            for process in processes {
                let h = match self.combined(dist_name, process, "", registry) {
                    Ok(h) => h,
                    Err(e) if e.is_recoverable() => continue,
                    Err(e) => return Err(e),
                };
                let mut e = match self.combined(dist_name, process, &suffix, registry) {
                    Ok(e) => e,
                    Err(err) if err.is_recoverable() => h.clone(),
                    Err(err) => return Err(err),
                };
                if e.integral() == 0.0 && h.integral() != 0.0 {
                    e = h.clone();
                }
                match &mut shifted {
                    Some(s) => s.add_scaled(&e, 1.0)?,
                    None => shifted = Some(e),
                }
            }
            if let Some(shifted) = shifted {
                for (bin, total) in result.iter_mut().enumerate() {
                    let dev = central.bin_content[bin] - shifted.bin_content[bin];
                    *total += dev * dev;
                }
            }
        }
        Ok(result)
    }

    /// Weighted event count of a process in the `Events` distribution
    /// (bin 1 content), or its raw entry count when `unweighed`.
    pub fn event_count(
        &self,
        process: &str,
        registry: &ProcessRegistry,
        unweighed: bool,
    ) -> Result<f64> {
        let hist = self.combined("Events", process, "", registry)?;
        if unweighed {
            Ok(hist.entries as f64)
        } else {
            Ok(hist.bin_content.first().copied().unwrap_or(0.0))
        }
    }

    /// Write the book's histograms into `file` for one category.
    ///
    /// For every distribution and every process in `processes`, the central
    /// histogram and one per requested systematic Up/Down variant are
    /// materialized (combining subprocesses) and stored under the persisted
    /// key. Missing variants are skipped.
    pub fn write(
        &self,
        file: &mut HistogramFile,
        category: &str,
        processes: &[String],
        systematics: &[String],
        registry: &ProcessRegistry,
    ) -> Result<()> {
        let mut suffixes = vec![String::new()];
        for source in systematics {
            if source == NEUTRAL {
                continue;
            }
            suffixes.push(format!("_{}Up", source));
            suffixes.push(format!("_{}Down", source));
        }

        for (dist_name, dist) in &self.distributions {
            for process in processes {
                let limit_name = registry.get(process)?.limit_name().to_string();
                for suffix in &suffixes {
                    match self.combined(dist_name, process, suffix, registry) {
                        Ok(hist) => {
                            let key = persisted_key(&limit_name, category, &dist.limit_name, suffix);
                            file.write_object(&key, hist);
                        }
                        Err(e) if e.is_recoverable() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Load histograms for one category from `file`.
    ///
    /// Non-essential distributions ignore the requested systematics and load
    /// only the neutral variant. A missing neutral histogram is logged.
    pub fn read(
        &mut self,
        file: &HistogramFile,
        category: &str,
        processes: &[&AtomicProcess],
        systematics: &[String],
    ) -> Result<()> {
        for (dist_name, dist) in &self.distributions {
            let mut suffixes = vec![String::new()];
            if dist.essential {
                for source in systematics {
                    if source == NEUTRAL {
                        continue;
                    }
                    suffixes.push(format!("_{}Up", source));
                    suffixes.push(format!("_{}Down", source));
                }
            }
            for process in processes {
                for suffix in &suffixes {
                    let key =
                        persisted_key(process.limit_name(), category, &dist.limit_name, suffix);
                    match file.get(&key) {
                        Some(hist) => {
                            self.hists
                                .entry(dist_name.clone())
                                .or_default()
                                .insert(format!("{}{}", process.name, suffix), hist.clone());
                        }
                        None if suffix.is_empty() => {
                            warn!(key = %key, "histogram not found in {}", file.path().display());
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }
}

/// Persisted histogram key.
fn persisted_key(process_limit: &str, category: &str, dist_limit: &str, suffix: &str) -> String {
    format!("{}_{}_{}{}", process_limit, category, dist_limit, suffix)
}

/// Histogram key without its trailing `_<tag>Up`/`_<tag>Down` variant part.
fn strip_variant_suffix(key: &str) -> &str {
    if key.ends_with("Up") || key.ends_with("Down") {
        if let Some(idx) = key.rfind('_') {
            return &key[..idx];
        }
    }
    key
}

/// JSON-backed histogram collection, keyed by persisted key.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistogramFile {
    #[serde(skip)]
    path: PathBuf,
    /// Version of the writing toolkit.
    #[serde(default)]
    version: String,
    entries: BTreeMap<String, Histogram>,
}

impl Default for HistogramFile {
    fn default() -> Self {
        HistogramFile {
            path: PathBuf::new(),
            version: cf_core::VERSION.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

impl HistogramFile {
    /// Open a collection, loading existing content when present.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = if path.exists() {
            let bytes = std::fs::read(path)?;
            serde_json::from_slice::<HistogramFile>(&bytes)?
        } else {
            HistogramFile::default()
        };
        file.path = path.to_path_buf();
        Ok(file)
    }

    /// Backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a histogram.
    pub fn write_object(&mut self, key: &str, hist: Histogram) {
        self.entries.insert(key.to_string(), hist);
    }

    /// Look up a histogram.
    pub fn get(&self, key: &str) -> Option<&Histogram> {
        self.entries.get(key)
    }

    /// Number of stored histograms.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the collection to its backing path.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutflow::{Cutflow, CutflowTable};
    use crate::process::CombinedProcess;
    use crate::selection::CutflowSpec;
    use crate::store::{Columns, MemoryStore};

    fn registry() -> ProcessRegistry {
        let mut reg = ProcessRegistry::new();
        for (name, xs, events) in [("ww", 54.8, 10u64), ("wz", 32.3, 10)] {
            reg.register(Process::Atomic(AtomicProcess {
                name: name.into(),
                display_name: name.into(),
                limit_name: None,
                cross_section: xs,
                event_count: events,
                paths: vec![name.into()],
                cutflow: "signal".into(),
                additional_cuts: vec![],
            }))
            .unwrap();
        }
        reg.register(Process::Combined(CombinedProcess {
            name: "diboson".into(),
            display_name: "VV".into(),
            limit_name: Some("diboson".into()),
            subprocesses: vec!["ww".into(), "wz".into()],
            factor: 1.0,
        }))
        .unwrap();
        reg
    }

    fn store() -> MemoryStore {
        let mut s = MemoryStore::new();
        for (name, pts) in [("ww", vec![15.0, 25.0, 35.0]), ("wz", vec![45.0, 5.0, 25.0])] {
            let n = pts.len();
            let mut cols = Columns::new();
            cols.insert("pt".into(), pts);
            cols.insert("njets".into(), vec![2.0; n]);
            cols.insert("w_pu".into(), vec![2.0; n]);
            s.add_source(name, cols).unwrap();
        }
        s
    }

    fn neutral() -> Variant {
        Variant { tag: NEUTRAL.into(), weights: vec!["PU".into()] }
    }

    fn book() -> PlotBook {
        let mut b = PlotBook::new();
        b.register(Distribution::uniform("taus/pt", "pt", 5, 0.0, 50.0).unwrap().essential())
            .unwrap();
        b
    }

    #[test]
    fn duplicate_distribution_rejected() {
        let mut b = book();
        let err =
            b.register(Distribution::uniform("other/pt", "pt", 5, 0.0, 50.0).unwrap()).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
    }

    #[test]
    fn limit_name_is_last_path_component() {
        let d = Distribution::uniform("taus/pt", "pt", 5, 0.0, 50.0).unwrap();
        assert_eq!(d.limit_name, "pt");
    }

    #[test]
    fn fill_applies_category_and_weights() {
        let reg = registry();
        let mut b = book();
        let cat = CompiledExpr::compile("njets >= 2").unwrap();
        let ww = match reg.get("ww").unwrap() {
            Process::Atomic(p) => p.clone(),
            _ => unreachable!(),
        };
        b.fill("pt", &ww, &neutral(), Some(&cat), &store()).unwrap();

        let h = b.combined("pt", "ww", "", &reg).unwrap();
        // all three events pass the category, each with weight 2
        assert_eq!(h.entries, 3);
        assert_eq!(h.integral(), 6.0);
    }

    #[test]
    fn combined_sums_subprocesses() {
        let reg = registry();
        let mut b = book();
        for name in ["ww", "wz"] {
            let p = match reg.get(name).unwrap() {
                Process::Atomic(p) => p.clone(),
                _ => unreachable!(),
            };
            b.fill("pt", &p, &neutral(), None, &store()).unwrap();
        }
        let h = b.combined("pt", "diboson", "", &reg).unwrap();
        assert_eq!(h.entries, 6);
        assert_eq!(h.integral(), 12.0);
    }

    #[test]
    fn combined_skips_missing_subprocess_but_fails_when_empty() {
        let reg = registry();
        let mut b = book();
        let ww = match reg.get("ww").unwrap() {
            Process::Atomic(p) => p.clone(),
            _ => unreachable!(),
        };
        b.fill("pt", &ww, &neutral(), None, &store()).unwrap();

        // wz missing: still a result
        assert!(b.combined("pt", "diboson", "", &reg).is_ok());
        // nothing filled at all for the Up variant
        assert!(matches!(
            b.combined("pt", "diboson", "_JESUp", &reg),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn fill_suffix_rules() {
        let rate = Variant {
            tag: NEUTRAL.into(),
            weights: vec!["PU".into(), "BTAGUp".into()],
        };
        assert_eq!(fill_suffix(false, &rate, &rate.weights), "_BTAGUp");
        let shape = Variant { tag: "JESDown".into(), weights: vec!["PU".into()] };
        assert_eq!(fill_suffix(false, &shape, &shape.weights), "_JESDown");
        assert_eq!(fill_suffix(true, &shape, &[]), "");
        assert_eq!(fill_suffix(false, &neutral(), &neutral().weights), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        let reg = registry();
        let spec = CutflowSpec { cuts: vec![], weights: vec!["PU".into()] };
        let s = store();
        let mut flow = Cutflow::new("signal", &spec, neutral()).unwrap();
        for name in ["ww", "wz"] {
            let p = match reg.get(name).unwrap() {
                Process::Atomic(p) => p.clone(),
                _ => unreachable!(),
            };
            flow.accumulate(&p, &s).unwrap();
        }
        flow.normalize(&reg, 10.0, None).unwrap();
        let mut table = CutflowTable::default();
        table.insert(&flow);

        let mut b = book();
        for name in ["ww", "wz"] {
            let p = match reg.get(name).unwrap() {
                Process::Atomic(p) => p.clone(),
                _ => unreachable!(),
            };
            b.fill("pt", &p, &neutral(), None, &store()).unwrap();
        }
        b.normalize(&table, &reg).unwrap();
        let once = b.combined("pt", "ww", "", &reg).unwrap();
        b.normalize(&table, &reg).unwrap();
        let twice = b.combined("pt", "ww", "", &reg).unwrap();
        assert_eq!(once, twice);

        // factor = yield / last sum = lumi * xs / events
        let expected = 6.0 * 10.0 * 54.8 / 10.0;
        assert!((once.integral() - expected).abs() < 1e-9);
    }

    #[test]
    fn quadrature_deviations() {
        let reg = registry();
        let mut b = PlotBook::new();
        b.register(Distribution::uniform("m", "pt", 1, 0.0, 100.0).unwrap()).unwrap();

        let mut hists = BTreeMap::new();
        let mut central = Histogram::uniform(1, 0.0, 100.0).unwrap();
        central.fill(50.0, 10.0);
        let mut a_up = Histogram::uniform(1, 0.0, 100.0).unwrap();
        a_up.fill(50.0, 7.0); // deviation 3
        let mut b_up = Histogram::uniform(1, 0.0, 100.0).unwrap();
        b_up.fill(50.0, 6.0); // deviation 4
        hists.insert("ww".to_string(), central);
        hists.insert("ww_AUp".to_string(), a_up);
        hists.insert("ww_BUp".to_string(), b_up);
        b.hists.insert("m".into(), hists);

        let devs = b
            .squared_deviations(
                "m",
                &["ww".into()],
                &["A".into(), "B".into()],
                "Up",
                &reg,
            )
            .unwrap();
        // quadrature: 3^2 + 4^2, not (3 + 4)^2
        assert_eq!(devs, vec![25.0]);
    }

    #[test]
    fn missing_shift_contributes_zero_deviation() {
        let reg = registry();
        let mut b = PlotBook::new();
        b.register(Distribution::uniform("m", "pt", 1, 0.0, 100.0).unwrap()).unwrap();
        let mut hists = BTreeMap::new();
        let mut central = Histogram::uniform(1, 0.0, 100.0).unwrap();
        central.fill(50.0, 10.0);
        hists.insert("ww".to_string(), central);
        b.hists.insert("m".into(), hists);

        let devs = b
            .squared_deviations("m", &["ww".into()], &["A".into()], "Up", &reg)
            .unwrap();
        assert_eq!(devs, vec![0.0]);
    }

    #[test]
    fn write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plots.json");
        let reg = registry();
        let mut b = book();
        let jes_up = Variant { tag: "JESUp".into(), weights: vec!["PU".into()] };
        for name in ["ww", "wz"] {
            let p = match reg.get(name).unwrap() {
                Process::Atomic(p) => p.clone(),
                _ => unreachable!(),
            };
            b.fill("pt", &p, &neutral(), None, &store()).unwrap();
            b.fill("pt", &p, &jes_up, None, &store()).unwrap();
        }

        let mut file = HistogramFile::open(&path).unwrap();
        b.write(
            &mut file,
            "inclusive",
            &["diboson".into()],
            &["JES".into()],
            &reg,
        )
        .unwrap();
        file.save().unwrap();
        // central + JESUp are present; JESDown was never filled
        assert!(!file.is_empty());
        assert_eq!(file.len(), 2);
        assert!(file.get("diboson_inclusive_pt").is_some());
        assert!(file.get("diboson_inclusive_pt_JESUp").is_some());
        assert!(file.get("diboson_inclusive_pt_JESDown").is_none());

        let file = HistogramFile::open(&path).unwrap();
        let mut fresh = book();
        let diboson = AtomicProcess {
            name: "diboson".into(),
            display_name: String::new(),
            limit_name: None,
            cross_section: 1.0,
            event_count: 0,
            paths: vec![],
            cutflow: "signal".into(),
            additional_cuts: vec![],
        };
        fresh.read(&file, "inclusive", &[&diboson], &["JES".into()]).unwrap();
        let mut reg2 = ProcessRegistry::new();
        reg2.register(Process::Atomic(diboson.clone())).unwrap();
        let h = fresh.combined("pt", "diboson", "", &reg2).unwrap();
        assert_eq!(h.entries, 6);
        // essential distribution loaded the Up variant too
        assert!(fresh.combined("pt", "diboson", "_JESUp", &reg2).is_ok());
    }

    #[test]
    fn non_essential_read_ignores_systematics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plots.json");
        let mut file = HistogramFile::open(&path).unwrap();
        let mut h = Histogram::uniform(1, 0.0, 1.0).unwrap();
        h.fill(0.5, 1.0);
        file.write_object("ww_inclusive_pt", h.clone());
        file.write_object("ww_inclusive_pt_JESUp", h);

        let mut b = PlotBook::new();
        b.register(Distribution::uniform("pt", "pt", 1, 0.0, 1.0).unwrap()).unwrap();
        let ww = AtomicProcess {
            name: "ww".into(),
            display_name: String::new(),
            limit_name: None,
            cross_section: 1.0,
            event_count: 0,
            paths: vec![],
            cutflow: "signal".into(),
            additional_cuts: vec![],
        };
        b.read(&file, "inclusive", &[&ww], &["JES".into()]).unwrap();
        let mut reg = ProcessRegistry::new();
        reg.register(Process::Atomic(ww)).unwrap();
        assert!(b.combined("pt", "ww", "", &reg).is_ok());
        assert!(b.combined("pt", "ww", "_JESUp", &reg).is_err());
    }

    #[test]
    fn event_counter_sees_weightless_data() {
        let mut reg = ProcessRegistry::new();
        let data = AtomicProcess {
            name: "collisions".into(),
            display_name: String::new(),
            limit_name: None,
            cross_section: 1.0,
            event_count: 0,
            paths: vec!["collisions".into()],
            cutflow: "signal".into(),
            additional_cuts: vec![],
        };
        reg.register(Process::Atomic(data.clone())).unwrap();

        let mut s = MemoryStore::new();
        let mut cols = Columns::new();
        cols.insert("pt".into(), vec![30.0, 60.0]);
        s.add_source("collisions", cols).unwrap();

        let mut b = PlotBook::new();
        b.register(Distribution::uniform("Events", "1", 1, 0.0, 2.0).unwrap()).unwrap();
        // no weights, constant expression, leaf-free category: the fetched
        // column set is empty, the event count must not be
        let cat = CompiledExpr::compile("true").unwrap();
        b.fill("Events", &data, &neutral(), Some(&cat), &s).unwrap();

        assert_eq!(b.event_count("collisions", &reg, false).unwrap(), 2.0);
        assert_eq!(b.event_count("collisions", &reg, true).unwrap(), 2.0);
    }

    #[test]
    fn event_count_reads_the_events_distribution() {
        let reg = registry();
        let mut b = PlotBook::new();
        b.register(Distribution::uniform("Events", "1", 1, 0.0, 2.0).unwrap()).unwrap();
        let ww = match reg.get("ww").unwrap() {
            Process::Atomic(p) => p.clone(),
            _ => unreachable!(),
        };
        b.fill("Events", &ww, &neutral(), None, &store()).unwrap();
        // three events, weight 2 each
        assert_eq!(b.event_count("ww", &reg, false).unwrap(), 6.0);
        assert_eq!(b.event_count("ww", &reg, true).unwrap(), 3.0);
    }

    #[test]
    fn strip_suffix_rules() {
        assert_eq!(strip_variant_suffix("ttbar"), "ttbar");
        assert_eq!(strip_variant_suffix("ttbar_JESUp"), "ttbar");
        assert_eq!(strip_variant_suffix("ttbar_BTAGDown"), "ttbar");
        // trailing Up in the process name itself is only stripped past '_'
        assert_eq!(strip_variant_suffix("pileup"), "pileup");
    }
}
