//! Binned distribution storage.

use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A 1D histogram: weighted bin contents plus sum-of-weights-squared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Bin edges, sorted, length `n_bins + 1`.
    pub bin_edges: Vec<f64>,
    /// Sum of weights per bin.
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per bin.
    pub sumw2: Vec<f64>,
    /// Entries passing into any bin (unweighted).
    pub entries: u64,
    /// Sum of weights below the first bin edge.
    pub underflow: f64,
    /// Sum of weights at or above the last bin edge.
    pub overflow: f64,
}

impl Histogram {
    /// Create an empty histogram with explicit bin edges.
    pub fn with_edges(bin_edges: Vec<f64>) -> Result<Self> {
        if bin_edges.len() < 2 {
            return Err(Error::Config("histogram needs at least one bin".into()));
        }
        if bin_edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config("histogram bin edges must be increasing".into()));
        }
        let n = bin_edges.len() - 1;
        Ok(Histogram {
            bin_edges,
            bin_content: vec![0.0; n],
            sumw2: vec![0.0; n],
            entries: 0,
            underflow: 0.0,
            overflow: 0.0,
        })
    }

    /// Create an empty histogram with `n_bins` uniform bins on `[lo, hi)`.
    pub fn uniform(n_bins: usize, lo: f64, hi: f64) -> Result<Self> {
        if n_bins == 0 || !(lo < hi) {
            return Err(Error::Config(format!(
                "invalid uniform binning: {} bins on [{}, {})",
                n_bins, lo, hi
            )));
        }
        let width = (hi - lo) / n_bins as f64;
        let edges = (0..=n_bins).map(|i| lo + width * i as f64).collect();
        Self::with_edges(edges)
    }

    /// Number of visible bins.
    pub fn n_bins(&self) -> usize {
        self.bin_content.len()
    }

    /// Add one entry. Out-of-range values land in under/overflow.
    pub fn fill(&mut self, value: f64, weight: f64) {
        match self.find_bin(value) {
            Some(bin) => {
                self.bin_content[bin] += weight;
                self.sumw2[bin] += weight * weight;
                self.entries += 1;
            }
            None if value < self.bin_edges[0] => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    fn find_bin(&self, value: f64) -> Option<usize> {
        let edges = &self.bin_edges;
        if value < edges[0] || value >= edges[edges.len() - 1] || value.is_nan() {
            return None;
        }
        let i = edges.partition_point(|&e| e <= value);
        Some(i - 1)
    }

    /// Multiply all contents (and under/overflow) by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.bin_content {
            *v *= factor;
        }
        for v in &mut self.sumw2 {
            *v *= factor * factor;
        }
        self.underflow *= factor;
        self.overflow *= factor;
    }

    /// Add `factor * other` bin-wise. Binnings must match.
    pub fn add_scaled(&mut self, other: &Histogram, factor: f64) -> Result<()> {
        if self.bin_edges != other.bin_edges {
            return Err(Error::Config("cannot add histograms with different binning".into()));
        }
        for (a, b) in self.bin_content.iter_mut().zip(&other.bin_content) {
            *a += factor * b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += factor * factor * b;
        }
        self.underflow += factor * other.underflow;
        self.overflow += factor * other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    /// Sum of visible bin contents.
    pub fn integral(&self) -> f64 {
        self.bin_content.iter().sum()
    }

    /// Merge the overflow into the last visible bin.
    ///
    /// Statistical outputs count events beyond the last edge in the final
    /// bin rather than dropping them.
    pub fn fold_overflow(&mut self) {
        if let Some(last) = self.bin_content.last_mut() {
            *last += self.overflow;
        }
        self.overflow = 0.0;
    }

    /// Per-bin statistical error, `sqrt(sumw2)`.
    pub fn bin_errors(&self) -> Vec<f64> {
        self.sumw2.iter().map(|&s| s.sqrt()).collect()
    }
}
