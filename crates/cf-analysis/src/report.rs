//! Plain-text cutflow and category reports.
//!
//! Tables put selection steps in rows and processes in columns, in the
//! order the counters recorded them. Three views exist: raw event counts,
//! counts relative to the previous step, and weighted sums.

use std::io::Write;

use cf_core::Result;

use crate::cutflow::StepCounter;

/// How a cutflow table is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Raw event counts per step.
    Absolute,
    /// Ratio of each step's count to the previous step's.
    Relative,
    /// Weighted sums per step.
    Weighed,
}

/// Render one cutflow's counters as an aligned text table.
pub fn print_cutflow(
    out: &mut dyn Write,
    key: &str,
    counters: &[StepCounter],
    mode: ReportMode,
) -> Result<()> {
    let mut processes: Vec<&str> = Vec::new();
    for counter in counters {
        for name in counter.processes() {
            if !processes.contains(&name) {
                processes.push(name);
            }
        }
    }

    let cells: Vec<Vec<String>> = counters
        .iter()
        .enumerate()
        .map(|(row, counter)| {
            processes
                .iter()
                .map(|process| match counter.get(process) {
                    Some(count) => match mode {
                        ReportMode::Absolute => format!("{}", count.events),
                        ReportMode::Weighed => format!("{:.2}", count.sum),
                        ReportMode::Relative => {
                            let previous = counters[..row]
                                .iter()
                                .rev()
                                .find_map(|c| c.get(process));
                            match previous {
                                Some(p) if p.events > 0 => {
                                    format!("{:.3}", count.events as f64 / p.events as f64)
                                }
                                Some(_) => "0.000".to_string(),
                                None => "1.000".to_string(),
                            }
                        }
                    },
                    None => "-".to_string(),
                })
                .collect()
        })
        .collect();

    let label_width = counters
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(0)
        .max(key.len());
    let widths: Vec<usize> = processes
        .iter()
        .enumerate()
        .map(|(col, process)| {
            cells.iter().map(|row| row[col].len()).max().unwrap_or(0).max(process.len())
        })
        .collect();

    write!(out, "{:<label_width$}", key)?;
    for (process, width) in processes.iter().zip(widths.iter().copied()) {
        write!(out, "  {:>width$}", process)?;
    }
    writeln!(out)?;

    for (counter, row) in counters.iter().zip(&cells) {
        write!(out, "{:<label_width$}", counter.name)?;
        for (cell, width) in row.iter().zip(widths.iter().copied()) {
            write!(out, "  {:>width$}", cell)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// List categories with their event counts, when known, and their
/// selection expressions.
pub fn print_categories(
    out: &mut dyn Write,
    rows: &[(String, String, Option<f64>)],
) -> Result<()> {
    let width = rows.iter().map(|(name, _, _)| name.len()).max().unwrap_or(0);
    for (name, expression, events) in rows {
        let count = match events {
            Some(n) => format!("{:.1}", n),
            None => "-".to_string(),
        };
        writeln!(out, "{:<width$}  {:>12}  {}", name, count, expression)?;
    }
    Ok(())
}
