/**************************************************************************/
/*  This file is part of PGM2SSAT.                                        */
/*                                                                        */
/*  Copyright (C) 2025                                                    */
/*    CEA (Commissariat à l'énergie atomique et aux énergies              */
/*         alternatives)                                                  */
/*                                                                        */
/*  you can redistribute it and/or modify it under the terms of the GNU   */
/*  Lesser General Public License as published by the Free Software       */
/*  Foundation, version 2.1.                                              */
/*                                                                        */
/*  It is distributed in the hope that it will be useful,                 */
/*  but WITHOUT ANY WARRANTY; without even the implied warranty of        */
/*  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the         */
/*  GNU Lesser General Public License for more details.                   */
/*                                                                        */
/*  See the GNU Lesser General Public License version 2.1                 */
/*  for more details (enclosed in the file licenses/LGPLv2.1).            */
/*                                                                        */
/**************************************************************************/

#![warn(missing_docs)]

//! Compiles Bayesian networks and influence diagrams, together with a probabilistic query, to
//! stochastic SAT, weighted CNF or projected CNF.

pub mod aig;
pub mod bits;
pub mod cpt;
pub mod cube;
pub mod encoder;
pub mod graph;
pub mod minimize;
pub mod network;
pub mod stats;
pub mod utility;
pub mod utils;
pub mod wmc;
pub mod writer;

#[cfg(test)]
mod testing;

use anyhow::Context;
use chrono::Duration;
use encoder::{Encoder, EncoderOptions, StateEncoding, StateOrder, Strategy, SynthesizerKind};
use graph::TopoSortMethod;
use minimize::MinimizerKind;
use network::{Network, NetworkDescription, QueryKind, StateRef};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Instant;
use structopt::StructOpt;
use writer::OutputFormat;

/// Largest number of variables for which `--count` is attempted
pub const MAX_COUNT_VARS: usize = 40;

fn parse_duration(txt: &str) -> anyhow::Result<Duration> {
    let n = txt.parse()?;
    Ok(Duration::milliseconds(n))
}

/// Configuration options
#[derive(Debug, StructOpt)]
#[structopt(
    name = "pgm2ssat",
    about = "Compiles a Bayesian network or influence diagram query to stochastic SAT"
)]
pub struct Opt {
    /// Network description in JSON
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output file, its extension selects the format. Standard output when absent.
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Output format, overrides the extension of the output file
    #[structopt(short, long, possible_values = OutputFormat::VARIANTS)]
    format: Option<OutputFormat>,

    /// Query, overrides the one of the description
    #[structopt(short, long, possible_values = QueryKind::VARIANTS, case_insensitive = true)]
    query: Option<QueryKind>,

    /// Evidence side file: a JSON list of {"node", "state"}. Ignored when missing.
    #[structopt(short, long, parse(from_os_str))]
    evidence: Option<PathBuf>,

    /// Treat evidence as interventions
    #[structopt(long)]
    causal: bool,

    /// How conditional probability tables are encoded
    #[structopt(short = "m", long, default_value = "direct")]
    strategy: Strategy,

    /// How states are encoded
    #[structopt(long, possible_values = StateEncoding::VARIANTS, default_value = "log")]
    state_encoding: StateEncoding,

    /// Which patterns log encoded states take first
    #[structopt(long, possible_values = StateOrder::VARIANTS, default_value = "descending")]
    state_order: StateOrder,

    /// Minimizer of pattern sets
    #[structopt(long, possible_values = MinimizerKind::VARIANTS, default_value = "none")]
    minimizer: MinimizerKind,

    /// Circuit synthesis of the bit-aig strategy
    #[structopt(long, possible_values = SynthesizerKind::VARIANTS, default_value = "two-level")]
    synthesizer: SynthesizerKind,

    /// Maximum number of bits of the expansion of a probability
    #[structopt(long, default_value = "32")]
    bit_budget: usize,

    /// Probabilities closer than this are identified
    #[structopt(long, default_value = "1e-16")]
    tolerance: f64,

    /// Tables with at most this many entries are never decomposed into bits
    #[structopt(long, default_value = "255")]
    bit_table_threshold: usize,

    /// Remove nodes irrelevant to the query
    #[structopt(long)]
    prune: bool,

    /// For SDP, only encode the connected component of the decision
    #[structopt(long)]
    isolate_component: bool,

    /// Share weight variables with parent tables when their conditions are exclusive
    #[structopt(long)]
    share_across_tables: bool,

    /// Merge all utilities into one table
    #[structopt(long)]
    super_utility: bool,

    /// Topological sort
    #[structopt(long, possible_values = TopoSortMethod::VARIANTS, default_value = "dfs")]
    topo_method: TopoSortMethod,

    /// Allocate state variables in min-fill order
    #[structopt(long)]
    minfill: bool,

    /// espresso executable
    #[structopt(long, default_value = "espresso", parse(from_os_str))]
    espresso: PathBuf,

    /// abc executable
    #[structopt(long, default_value = "abc", parse(from_os_str))]
    abc: PathBuf,

    /// aigtoaig executable
    #[structopt(long, default_value = "aigtoaig", parse(from_os_str))]
    aigtoaig: PathBuf,

    /// Print the weighted model count of small PE encodings
    #[structopt(long)]
    count: bool,

    /// Write a JSON summary of the encoding to this file
    #[structopt(long, parse(from_os_str))]
    summary: Option<PathBuf>,

    /// Timeout, in milliseconds. Return code is 42 on timeout.
    #[structopt(short = "T", long, parse(try_from_str = parse_duration))]
    timeout: Option<Duration>,

    /// Enable debug output and persist temporary files for inspection.
    #[structopt(short, long)]
    debug: bool,

    /// Output some stats to this file
    #[structopt(long, parse(from_os_str))]
    stats: Option<PathBuf>,
}

impl Opt {
    fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            strategy: self.strategy,
            state_encoding: self.state_encoding,
            state_order: self.state_order,
            minimizer: self.minimizer,
            synthesizer: self.synthesizer,
            bit_budget: self.bit_budget,
            tolerance: self.tolerance,
            bit_table_threshold: self.bit_table_threshold,
            prune: self.prune,
            isolate_component: self.isolate_component,
            share_across_tables: self.share_across_tables,
            super_utility: self.super_utility,
            topo_method: self.topo_method,
            minfill: self.minfill,
            espresso: self.espresso.clone(),
            abc: self.abc.clone(),
            aigtoaig: self.aigtoaig.clone(),
        }
    }

    fn format(&self) -> anyhow::Result<OutputFormat> {
        match (self.format, &self.output) {
            (Some(f), _) => Ok(f),
            (None, Some(path)) => OutputFormat::from_path(path),
            (None, None) => Ok(OutputFormat::Ssat),
        }
    }
}

/// Reads the network of `opt` and applies the command line overrides
fn read_network(opt: &Opt) -> anyhow::Result<Network> {
    let file = File::open(&opt.input)
        .with_context(|| format!("opening network {}", opt.input.display()))?;
    let description: NetworkDescription = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing network {}", opt.input.display()))?;
    let mut network = Network::from_description(&description)
        .with_context(|| format!("building network {}", opt.input.display()))?;
    if let Some(query) = opt.query {
        network.query = query;
    }
    network.causal |= opt.causal;
    if let Some(path) = &opt.evidence {
        match File::open(path) {
            Ok(file) => {
                let evidence: Vec<StateRef> = serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("parsing evidence {}", path.display()))?;
                for e in evidence {
                    network
                        .add_evidence_by_name(&e.node, &e.state)
                        .with_context(|| format!("evidence from {}", path.display()))?;
                }
            }
            Err(e) => tracing::warn!("no evidence read from {}: {}", path.display(), e),
        }
    }
    Ok(network)
}

fn setup_tracing(opt: &Opt) -> anyhow::Result<Option<stats::StatsLayer>> {
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::prelude::*;
    let min_level = if opt.debug { Level::TRACE } else { Level::INFO };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::filter_fn(move |metadata| {
            *metadata.level() <= min_level
        }));
    let subscriber = tracing_subscriber::Registry::default().with(fmt_layer);
    #[cfg(feature = "tracy")]
    let subscriber = subscriber.with(tracing_tracy::TracyLayer::new());
    let subscriber_with_stats: Box<dyn tracing::Subscriber + 'static + Send + Sync>;
    let stats_layer = match opt.stats.as_ref() {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot open {} for writing stats", path.display()))?;
            let stats_layer = stats::StatsLayer::new(file);
            subscriber_with_stats = Box::new(subscriber.with(stats_layer.clone()));
            Some(stats_layer)
        }
        None => {
            subscriber_with_stats = Box::new(subscriber);
            None
        }
    };
    tracing::subscriber::set_global_default(subscriber_with_stats)
        .context("setting default tracing collector")?;
    Ok(stats_layer)
}

/// entrypoint of the binary
pub fn run() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let start_time = Instant::now();
    let stats = setup_tracing(&opt)?;
    let timer_stats = stats.clone();
    let global_stats = move || {
        let mut usage = nc::rusage_t::default();
        nc::getrusage(nc::RUSAGE_SELF, &mut usage).unwrap_or_else(|e| {
            tracing::warn!("failed to get own memory usage: {}", e);
        });
        let max_rss_self_kb = usage.ru_maxrss;
        usage = nc::rusage_t::default();
        // max rss of the largest child, so presumably the minimizer
        nc::getrusage(nc::RUSAGE_CHILDREN, &mut usage).unwrap_or_else(|e| {
            tracing::warn!("failed to get children memory usage: {}", e);
        });
        let max_rss_tools_kb = usage.ru_maxrss;
        tracing::trace!(
            wall_time_ms = start_time.elapsed().as_millis() as u64,
            max_rss_self_kb,
            max_rss_tools_kb,
            stats = true
        );
    };
    let timer = opt.timeout.map(|duration| {
        let timer = timer::Timer::new();
        let giveup = move || {
            global_stats();
            tracing::warn!(timeout = true, stats = true);
            if let Some(s) = timer_stats.clone() {
                s.dump()
            }
            std::process::exit(42)
        };
        // the guard returned by schedule_with_delay must be ignored otherwise it is cancelled on
        // drop
        timer.schedule_with_delay(duration, giveup).ignore();
        // the timer must not be dropped, otherwise everything is cancelled
        timer
    });

    let format = opt.format()?;
    let network = read_network(&opt)?;
    let encoder = Encoder::new(opt.encoder_options());
    let encoding = encoder
        .compile(network)
        .with_context(|| format!("encoding {}", opt.input.display()))?;
    match &opt.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            writer::write(&encoding, format, BufWriter::new(file))
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => {
            let stdout = std::io::stdout();
            writer::write(&encoding, format, BufWriter::new(stdout.lock()))?;
        }
    }

    let summary = encoding.summary()?;
    tracing::info!(
        vars = summary.vars,
        clauses = summary.clauses,
        random_vars = summary.random_vars,
        scale_log2 = summary.scale_log2,
        "encoded {} query",
        summary.query
    );
    if let Some(path) = &opt.summary {
        let file = File::create(path)
            .with_context(|| format!("creating summary file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .with_context(|| format!("writing summary to {}", path.display()))?;
    }
    if opt.count {
        anyhow::ensure!(
            encoding.network.query == QueryKind::Pe,
            "--count only applies to PE queries"
        );
        anyhow::ensure!(
            encoding.var_count() <= MAX_COUNT_VARS,
            "--count is exhaustive, {} variables is too many (at most {})",
            encoding.var_count(),
            MAX_COUNT_VARS
        );
        let count = wmc::weighted_count(&encoding.formula, &encoding.literal_weights());
        eprintln!("Weighted model count: {}", count);
    }
    drop(timer);
    global_stats();
    if let Some(s) = stats {
        s.dump()
    }
    Ok(())
}
