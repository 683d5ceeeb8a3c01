//! Command-line driver: analyze cutflows, fill histograms, render reports.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cf_analysis::config::AnalysisConfig;
use cf_analysis::cutflow::{Cutflow, CutflowTable};
use cf_analysis::expr::CompiledExpr;
use cf_analysis::plot::{HistogramFile, PlotBook};
use cf_analysis::process::ProcessRegistry;
use cf_analysis::report::{print_categories, print_cutflow, ReportMode};
use cf_analysis::store::MemoryStore;
use cf_analysis::systematics::{expand_systematics, Variant};

#[derive(Parser)]
#[command(name = "cutflow", version, about = "Cut-flow accounting and histogram aggregation")]
struct Cli {
    /// Analysis configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log verbosity.
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the selection over every process and write the cutflow table.
    Analyze {
        /// Continue from a previously written cutflow table.
        #[arg(long)]
        resume: bool,
        /// Expand systematic variants in addition to the nominal selection.
        #[arg(long)]
        systematics: bool,
    },
    /// Fill, normalize, and persist the configured distributions.
    Fill {
        /// Fill systematic variants in addition to the nominal selection.
        #[arg(long)]
        systematics: bool,
    },
    /// Write the cutflow tables as text reports.
    Cuts,
    /// Write the category definitions as a text report.
    Categories,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = AnalysisConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    fs::create_dir_all(&config.outdir)
        .with_context(|| format!("creating {}", config.outdir.display()))?;

    match cli.command {
        Command::Analyze { resume, systematics } => analyze(&config, resume, systematics),
        Command::Fill { systematics } => fill(&config, systematics),
        Command::Cuts => cuts(&config),
        Command::Categories => categories(&config),
    }
}

/// Every process to run: the plotted ones plus the limit-only ones.
fn run_processes(config: &AnalysisConfig) -> Vec<String> {
    let mut names = config.plot.clone();
    for name in &config.limits {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

fn open_store(config: &AnalysisConfig) -> Result<MemoryStore> {
    let path = config.indir().join("events.json");
    MemoryStore::open(&path).with_context(|| format!("opening event store {}", path.display()))
}

fn variants_for(config: &AnalysisConfig, weights: &[String], systematics: bool) -> Vec<Variant> {
    let sources: &[String] = if systematics { &config.systematics } else { &[] };
    expand_systematics(sources, weights, &config.shape_systematics())
}

fn analyze(config: &AnalysisConfig, resume: bool, systematics: bool) -> Result<()> {
    let registry = config.registry()?;
    let store = open_store(config)?;
    let table_path = config.outdir.join("cutflow.json");
    // keys not revisited by this run stay in the table as persisted
    let mut table = if resume {
        CutflowTable::load(&table_path).context("resuming from cutflow table")?
    } else {
        CutflowTable::default()
    };

    let processes = registry.expand_all(&run_processes(config))?;

    for (key, spec) in &config.cutflows {
        for (i, variant) in variants_for(config, &spec.weights, systematics).into_iter().enumerate()
        {
            // rate variants only reshuffle the weight product; the cut
            // decisions and therefore the table are those of the nominal
            if i > 0 && variant.is_neutral() {
                continue;
            }
            let full_key = format!("{}{}", key, variant.suffix());
            let mut flow = match table.tables.get(&full_key) {
                Some(counters) => Cutflow::resume(key, spec, variant.clone(), counters.clone())?,
                None => Cutflow::new(key, spec, variant.clone())?,
            };
            for process in &processes {
                if process.cutflow != *key {
                    continue;
                }
                if !variant.is_neutral() && ProcessRegistry::is_data(&process.name) {
                    continue;
                }
                match flow.accumulate(process, &store) {
                    Ok(true) => info!(process = %process.name, cutflow = %full_key, "accumulated"),
                    Ok(false) => {}
                    Err(e) if e.is_recoverable() => {
                        warn!(process = %process.name, "skipping: {}", e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            flow.normalize(&registry, config.lumi, config.event_limit)?;
            table.insert(&flow);
        }
    }

    table.save(&table_path)?;
    info!(path = %table_path.display(), "wrote cutflow table");
    Ok(())
}

fn fill(config: &AnalysisConfig, systematics: bool) -> Result<()> {
    let registry = config.registry()?;
    let store = open_store(config)?;
    let table = CutflowTable::load(&config.outdir.join("cutflow.json"))
        .context("loading cutflow table; run `analyze` first")?;

    let mut book = PlotBook::new();
    for dist in config.distributions()? {
        book.register(dist)?;
    }
    let dist_names = book.distribution_names();
    let processes = registry.expand_all(&run_processes(config))?;
    let sources: &[String] = if systematics { &config.systematics } else { &[] };

    let mut plots = HistogramFile::open(&config.outdir.join("plots.json"))?;
    let mut limits = HistogramFile::open(&config.outdir.join("limits.json"))?;

    let categories = if config.categories.is_empty() {
        vec![("inclusive".to_string(), "true".to_string())]
    } else {
        config.categories.clone()
    };

    for (category, expression) in &categories {
        book.clear();
        let predicate = CompiledExpr::compile(expression)?;
        for process in &processes {
            let spec = config
                .cutflows
                .get(&process.cutflow)
                .with_context(|| format!("unknown cutflow '{}'", process.cutflow))?;
            let data_like = ProcessRegistry::is_data(&process.name);
            for (i, variant) in
                variants_for(config, &spec.weights, systematics).iter().enumerate()
            {
                // data has no varied selection or weights; one fill suffices
                if data_like && i > 0 {
                    continue;
                }
                for dist in &dist_names {
                    match book.fill(dist, process, variant, Some(&predicate), &store) {
                        Ok(()) => {}
                        Err(e) if e.is_recoverable() => {
                            warn!(process = %process.name, distribution = %dist, "skipping: {}", e);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        book.normalize(&table, &registry)?;
        book.write(&mut plots, category, &config.plot, sources, &registry)?;
        if !config.limits.is_empty() {
            book.write(&mut limits, category, &config.limits, sources, &registry)?;
        }
        info!(category = %category, "filled");
    }

    plots.save()?;
    info!(path = %plots.path().display(), "wrote histograms");
    if !config.limits.is_empty() {
        limits.save()?;
        info!(path = %limits.path().display(), "wrote limit histograms");
    }
    Ok(())
}

fn cuts(config: &AnalysisConfig) -> Result<()> {
    let table = CutflowTable::load(&config.outdir.join("cutflow.json"))
        .context("loading cutflow table; run `analyze` first")?;
    for (key, counters) in &table.tables {
        for (mode, suffix) in [
            (ReportMode::Absolute, ""),
            (ReportMode::Relative, "_relative"),
            (ReportMode::Weighed, "_weighed"),
        ] {
            let path = config.outdir.join(format!("cuts_{}{}.txt", key, suffix));
            let mut out = fs::File::create(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            print_cutflow(&mut out, key, counters, mode)?;
        }
        info!(cutflow = %key, "wrote reports");
    }
    Ok(())
}

fn categories(config: &AnalysisConfig) -> Result<()> {
    let registry = config.registry()?;
    let plots = HistogramFile::open(&config.outdir.join("plots.json"))?;

    let mut rows = Vec::new();
    for (name, expression) in &config.categories {
        // summed weighted event count over all plotted processes, when the
        // Events distribution was filled for this category
        let mut events = None;
        for process in &config.plot {
            let limit_name = registry.get(process)?.limit_name();
            let key = format!("{}_{}_Events", limit_name, name);
            if let Some(hist) = plots.get(&key) {
                *events.get_or_insert(0.0) += hist.bin_content.first().copied().unwrap_or(0.0);
            }
        }
        rows.push((name.clone(), expression.clone(), events));
    }

    let path = config.outdir.join("categories.txt");
    let mut out =
        fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    print_categories(&mut out, &rows)?;
    info!(path = %path.display(), "wrote categories");
    Ok(())
}
