//! Full pipeline: accumulate cutflows over an event store, persist and
//! resume them, fill and normalize histograms, and round-trip the
//! histogram file.

use cf_analysis::cutflow::{Cutflow, CutflowTable};
use cf_analysis::plot::{Distribution, HistogramFile, PlotBook};
use cf_analysis::process::{AtomicProcess, CombinedProcess, Process, ProcessRegistry};
use cf_analysis::selection::CutflowSpec;
use cf_analysis::store::{Columns, MemoryStore};
use cf_analysis::systematics::{expand_systematics, ShapeSystematics, Variant};

const LUMI: f64 = 1000.0;

fn store() -> MemoryStore {
    let mut s = MemoryStore::new();

    let mut ttbar = Columns::new();
    ttbar.insert("pt".into(), vec![10.0, 30.0, 50.0]);
    ttbar.insert("pt_JESUp".into(), vec![25.0, 55.0, 55.0]);
    ttbar.insert("pt_JESDown".into(), vec![5.0, 25.0, 45.0]);
    ttbar.insert("w_pu".into(), vec![0.5, 0.5, 0.5]);
    ttbar.insert("w_puup".into(), vec![0.6, 0.6, 0.6]);
    ttbar.insert("w_pudown".into(), vec![0.4, 0.4, 0.4]);
    s.add_source("ttbar", ttbar).unwrap();

    let mut wjets = Columns::new();
    wjets.insert("pt".into(), vec![30.0]);
    wjets.insert("pt_JESUp".into(), vec![60.0]);
    wjets.insert("pt_JESDown".into(), vec![10.0]);
    wjets.insert("w_pu".into(), vec![1.0]);
    wjets.insert("w_puup".into(), vec![1.2]);
    wjets.insert("w_pudown".into(), vec![0.8]);
    s.add_source("wjets", wjets).unwrap();

    let mut data = Columns::new();
    data.insert("pt".into(), vec![30.0, 60.0]);
    s.add_source("collisions", data).unwrap();

    s
}

fn atomic(name: &str, cross_section: f64, event_count: u64) -> AtomicProcess {
    AtomicProcess {
        name: name.into(),
        display_name: name.into(),
        limit_name: None,
        cross_section,
        event_count,
        paths: vec![name.into()],
        cutflow: "signal".into(),
        additional_cuts: Vec::new(),
    }
}

fn registry() -> ProcessRegistry {
    let mut reg = ProcessRegistry::new();
    reg.register(Process::Atomic(atomic("ttbar", 2.0, 4))).unwrap();
    reg.register(Process::Atomic(atomic("wjets", 10.0, 10))).unwrap();
    reg.register(Process::Atomic(atomic("collisions", 1.0, 0))).unwrap();
    reg.register(Process::Combined(CombinedProcess {
        name: "sim".into(),
        display_name: "simulation".into(),
        limit_name: Some("sim".into()),
        subprocesses: vec!["ttbar".into(), "wjets".into()],
        factor: 1.0,
    }))
    .unwrap();
    reg
}

fn spec() -> CutflowSpec {
    CutflowSpec { cuts: vec![("pt".into(), "pt > 20".into())], weights: vec!["PU".into()] }
}

fn variants() -> Vec<Variant> {
    expand_systematics(
        &["JES".to_string(), "PU".to_string()],
        &["PU".to_string()],
        &ShapeSystematics::default(),
    )
}

/// Accumulate every process under the nominal and shape variants.
fn analyze(store: &MemoryStore, registry: &ProcessRegistry) -> CutflowTable {
    let mut table = CutflowTable::default();
    for (i, variant) in variants().into_iter().enumerate() {
        if i > 0 && variant.is_neutral() {
            continue; // rate variants share the nominal cut decisions
        }
        let mut flow = Cutflow::new("signal", &spec(), variant.clone()).unwrap();
        for name in ["ttbar", "wjets", "collisions"] {
            if !variant.is_neutral() && ProcessRegistry::is_data(name) {
                continue;
            }
            let process = match registry.get(name).unwrap() {
                Process::Atomic(p) => p.clone(),
                _ => unreachable!(),
            };
            flow.accumulate(&process, store).unwrap();
        }
        flow.normalize(registry, LUMI, None).unwrap();
        table.insert(&flow);
    }
    table
}

fn filled_book(store: &MemoryStore, registry: &ProcessRegistry) -> PlotBook {
    let mut book = PlotBook::new();
    book.register(Distribution::uniform("taus/pt", "pt", 2, 0.0, 100.0).unwrap().essential())
        .unwrap();
    for name in ["ttbar", "wjets", "collisions"] {
        let process = match registry.get(name).unwrap() {
            Process::Atomic(p) => p.clone(),
            _ => unreachable!(),
        };
        for (i, variant) in variants().iter().enumerate() {
            if ProcessRegistry::is_data(name) && i > 0 {
                continue;
            }
            book.fill("pt", &process, variant, None, store).unwrap();
        }
    }
    book
}

#[test]
fn cutflow_accounting_and_resume() {
    let store = store();
    let registry = registry();
    let table = analyze(&store, &registry);

    // nominal, JESUp, JESDown
    assert_eq!(table.tables.len(), 3);
    let nominal = &table.tables["signal"];
    let names: Vec<&str> = nominal.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["analyzed", "pt", "PU", "generated", "yield"]);

    assert_eq!(nominal[0].get("ttbar").unwrap().events, 3);
    assert_eq!(nominal[1].get("ttbar").unwrap().events, 2);
    assert!((nominal[2].get("ttbar").unwrap().sum - 1.0).abs() < 1e-12);
    // yield = 1.0 * lumi * xs / generated
    assert!((nominal[4].get("ttbar").unwrap().sum - 500.0).abs() < 1e-9);
    // data keeps its raw count
    assert_eq!(nominal[4].get("collisions").unwrap().sum, 2.0);

    // shifted selection changes the cut survivors
    let jes_up = &table.tables["signal_JESUp"];
    assert_eq!(jes_up[1].get("ttbar").unwrap().events, 3);
    assert!(jes_up[1].get("collisions").is_none());

    // persist, reload, resume: accumulation is a no-op and the table is stable
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cutflow.json");
    table.save(&path).unwrap();
    let reloaded = CutflowTable::load(&path).unwrap();

    let mut resumed = Cutflow::resume(
        "signal",
        &spec(),
        variants().remove(0),
        reloaded.tables["signal"].clone(),
    )
    .unwrap();
    let ttbar = match registry.get("ttbar").unwrap() {
        Process::Atomic(p) => p.clone(),
        _ => unreachable!(),
    };
    assert!(!resumed.accumulate(&ttbar, &store).unwrap());
    resumed.normalize(&registry, LUMI, None).unwrap();
    let mut table2 = CutflowTable::default();
    table2.insert(&resumed);
    assert_eq!(
        serde_json::to_string(&table.tables["signal"]).unwrap(),
        serde_json::to_string(&table2.tables["signal"]).unwrap()
    );
}

#[test]
fn histograms_normalize_combine_and_round_trip() {
    let store = store();
    let registry = registry();
    let table = analyze(&store, &registry);
    let mut book = filled_book(&store, &registry);

    book.normalize(&table, &registry).unwrap();
    // normalizing twice changes nothing
    book.normalize(&table, &registry).unwrap();

    // ttbar: bins [10, 30 | 50] * 0.5, factor 500; wjets: [30 | -] * 1.0, factor 1000
    let sim = book.combined("pt", "sim", "", &registry).unwrap();
    assert!((sim.bin_content[0] - 1500.0).abs() < 1e-9);
    assert!((sim.bin_content[1] - 250.0).abs() < 1e-9);

    // data is left at its raw content
    let data = book.combined("pt", "collisions", "", &registry).unwrap();
    assert_eq!(data.bin_content, vec![1.0, 1.0]);

    // JES moves events between bins, PU only rescales
    let devs = book
        .squared_deviations(
            "pt",
            &["sim".into()],
            &["JES".into(), "PU".into()],
            "Up",
            &registry,
        )
        .unwrap();
    // JESUp sim = [250, 1500], PUUp sim = [1800, 300]
    assert!((devs[0] - (1250.0_f64.powi(2) + 300.0_f64.powi(2))).abs() < 1e-6);
    assert!((devs[1] - (1250.0_f64.powi(2) + 50.0_f64.powi(2))).abs() < 1e-6);

    // write, reopen, read back
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plots.json");
    let mut file = HistogramFile::open(&path).unwrap();
    book.write(
        &mut file,
        "inclusive",
        &["sim".into(), "collisions".into()],
        &["JES".to_string(), "PU".to_string()],
        &registry,
    )
    .unwrap();
    file.save().unwrap();

    let file = HistogramFile::open(&path).unwrap();
    assert!(file.get("sim_inclusive_pt").is_some());
    assert!(file.get("sim_inclusive_pt_JESUp").is_some());
    assert!(file.get("sim_inclusive_pt_PUDown").is_some());
    assert!(file.get("collisions_inclusive_pt").is_some());
    // data has no varied selection
    assert!(file.get("collisions_inclusive_pt_JESUp").is_none());

    let mut fresh = PlotBook::new();
    fresh
        .register(Distribution::uniform("taus/pt", "pt", 2, 0.0, 100.0).unwrap().essential())
        .unwrap();
    let sim_proc = atomic("sim", 1.0, 0);
    fresh
        .read(&file, "inclusive", &[&sim_proc], &["JES".to_string(), "PU".to_string()])
        .unwrap();
    let mut flat = ProcessRegistry::new();
    flat.register(Process::Atomic(sim_proc)).unwrap();
    let reread = fresh.combined("pt", "sim", "", &flat).unwrap();
    assert!((reread.bin_content[0] - sim.bin_content[0]).abs() < 1e-9);
    assert!((reread.bin_content[1] - sim.bin_content[1]).abs() < 1e-9);
    assert!(fresh.combined("pt", "sim", "_JESDown", &flat).is_ok());
}
