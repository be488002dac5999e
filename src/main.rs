use anyhow::{Context, Result};
use clap::Parser;
use nanown::classifier::{ClassifierKind, ClassifierParams};
use nanown::cli::{Cli, Command};
use nanown::config::NanownConfig;
use nanown::store::{MeasurementStore, Probe, ProbeType};
use nanown::{associate, tcpts, trainer, trim, unusual};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber (info by default, everything with --debug)
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn open_feed(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open feed {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn load_probes(store: &mut MeasurementStore, path: &Path) -> Result<usize> {
    let mut probes = Vec::new();
    for (i, line) in open_feed(path)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let probe: Probe = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid probe record", path.display(), i + 1))?;
        probes.push(probe);
    }
    Ok(store.add_probes(&probes)?.len())
}

fn parse_kinds(names: &[String], config: &NanownConfig) -> Result<Vec<ClassifierKind>> {
    if names.is_empty() {
        return Ok(config.training.classifiers.clone());
    }
    names
        .iter()
        .map(|n| n.parse::<ClassifierKind>().map_err(anyhow::Error::from))
        .collect()
}

fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => NanownConfig::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => NanownConfig::default(),
    };
    let mut store = MeasurementStore::open(&args.db, config.training.seed)
        .with_context(|| format!("cannot open database {}", args.db.display()))?;

    match args.command {
        Command::LoadProbes { file } => {
            let n = load_probes(&mut store, &file)?;
            println!("loaded {} probes", n);
        }
        Command::Precision { feed, ports } => {
            let precision = tcpts::compute_timestamp_precision(open_feed(&feed)?, &ports)?;
            store.set_timestamp_precision(precision.as_ref())?;
            match precision {
                Some(p) => println!(
                    "tcpts_mean: {:.3} tcpts_stddev: {} slopes: {:?}",
                    p.mean,
                    p.stddev.map_or("n/a".to_string(), |s| format!("{:.3}", s)),
                    p.slopes
                ),
                None => println!("no usable timestamp data; tsval RTTs disabled"),
            }
        }
        Command::Associate { feed } => {
            let report = associate::associate_packets(&mut store, open_feed(&feed)?, &config.association)?;
            println!(
                "window_size: {:.0} inserted: {} unassociated: {} malformed: {}",
                report.window_size, report.inserted, report.unassociated, report.malformed
            );
        }
        Command::Analyze => {
            let selection = trim::optimize_trim(&mut store, &config.trim)?;
            println!(
                "num_sent: {} num_rcvd: {} selected trim: ({}, {}) committed: {} skipped: {}",
                selection.num_sent,
                selection.num_rcvd,
                selection.sent_trimmed,
                selection.rcvd_trimmed,
                selection.committed,
                selection.skipped
            );
            let unusual = unusual::record_unusual_case(&mut store, &config.trim.estimator)?;
            println!(
                "unusual case: {} delta: {:.0} greater: {}",
                unusual.test_case, unusual.delta, unusual.greater
            );
        }
        Command::Train {
            observations,
            classifiers,
            quick,
        } => {
            let kinds = parse_kinds(&classifiers, &config)?;
            let mut training = config.training.clone();
            if quick {
                let preset = NanownConfig::quick().training;
                training.coarse_trials = preset.coarse_trials;
                training.fine_trials = preset.fine_trials;
            }
            training.classifiers = kinds;
            let mut trainer = trainer::BootstrapTrainer::new(&mut store, training);
            for result in trainer.train_all(&observations)? {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
        Command::Best {
            classifier,
            observations,
            trial_type,
        } => {
            let trial_type: ProbeType = trial_type.parse()?;
            match store.best_classifier_result(&classifier, trial_type, observations, None)? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => anyhow::bail!(
                    "no {} result for {} with {} observations",
                    trial_type,
                    classifier,
                    observations
                ),
            }
        }
        Command::Evaluate {
            classifier,
            observations,
            trials,
        } => {
            let kind: ClassifierKind = classifier.parse()?;
            let best = store
                .best_classifier_result(kind.name(), ProbeType::Train, observations, None)?
                .with_context(|| format!("{} has not been trained for {} observations", kind, observations))?;
            let params = ClassifierParams::from_json(&best.params)?;
            let mut trainer = trainer::BootstrapTrainer::new(&mut store, config.training.clone());
            let tally = trainer.evaluate(kind.classifier().as_ref(), &params, observations, trials)?;
            println!(
                "{} {} present: {} absent: {} reversed: {}",
                kind, params, tally.present, tally.absent, tally.reversed
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);
    run(args)
}
