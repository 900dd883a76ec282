use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use schelling_core::{CitySnapshot, SchellingConfig, Simulation, equal_proportions};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "schelling",
    version,
    about = "Run the Schelling segregation model headlessly"
)]
struct Cli {
    /// JSON file holding a serialized configuration; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of houses in the city.
    #[arg(long)]
    population: Option<usize>,

    /// Fraction of houses left empty, in [0, 1).
    #[arg(long)]
    empty_ratio: Option<f64>,

    /// Minimum share of similar neighbors an agent tolerates, in [0, 1].
    #[arg(long)]
    threshold: Option<f64>,

    /// Rounds to run after the initial layout.
    #[arg(long)]
    iterations: Option<u32>,

    /// Split agents equally across this many groups.
    #[arg(long, conflicts_with = "proportions")]
    groups: Option<usize>,

    /// Comma-separated group proportions (e.g. 0.6,0.4).
    #[arg(long, value_delimiter = ',')]
    proportions: Option<Vec<f64>>,

    /// Neighborhood radius; 1 is the 8-cell neighborhood.
    #[arg(long)]
    radius: Option<u32>,

    /// RNG seed for reproducible runs.
    #[arg(long, env = "SCHELLING_SEED")]
    seed: Option<u64>,

    /// Stop once a round passes with no relocations.
    #[arg(long)]
    stop_at_equilibrium: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Summary)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One line per round with relocation counts and mean similarity.
    Summary,
    /// One JSON snapshot per line.
    Json,
    /// ASCII rendering of the initial and final grid.
    Ascii,
}

impl Cli {
    fn build_config(&self) -> Result<SchellingConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => SchellingConfig::default(),
        };

        if let Some(population) = self.population {
            config.population_size = population;
        }
        if let Some(ratio) = self.empty_ratio {
            config.empty_ratio = ratio;
        }
        if let Some(threshold) = self.threshold {
            config.similarity_threshold = threshold;
        }
        if let Some(iterations) = self.iterations {
            config.num_iterations = iterations;
        }
        if let Some(groups) = self.groups {
            config.group_proportions = equal_proportions(groups);
        }
        if let Some(proportions) = &self.proportions {
            config.group_proportions = proportions.clone();
        }
        if let Some(radius) = self.radius {
            config.neighborhood_radius = radius;
        }
        if self.seed.is_some() {
            config.rng_seed = self.seed;
        }
        if self.stop_at_equilibrium {
            config.stop_at_equilibrium = true;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let simulation =
        Simulation::new(cli.build_config()?).context("invalid simulation configuration")?;
    info!(
        seed = simulation.seed(),
        houses = simulation.config().population_size,
        iterations = simulation.config().num_iterations,
        "Starting Schelling simulation"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(&simulation, cli.format, &mut out)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();
}

fn run(simulation: &Simulation, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    let mut rounds = simulation.rounds()?;
    let mut first: Option<CitySnapshot> = None;
    let mut last: Option<CitySnapshot> = None;

    while let Some(snapshot) = rounds.next() {
        let snapshot = snapshot.context("simulation aborted")?;
        match format {
            OutputFormat::Summary => {
                let (relocated, deferred) = rounds
                    .last_summary()
                    .filter(|summary| summary.round == snapshot.round)
                    .map_or((0, 0), |summary| (summary.relocated, summary.deferred));
                writeln!(
                    out,
                    "round {:>4}  relocated {:>6}  deferred {:>6}  mean similarity {}",
                    snapshot.round.0,
                    relocated,
                    deferred,
                    format_ratio(snapshot.mean_similarity),
                )?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &snapshot)?;
                writeln!(out)?;
            }
            OutputFormat::Ascii => {
                if first.is_none() {
                    first = Some(snapshot.clone());
                }
            }
        }
        last = Some(snapshot);
    }

    let Some(last) = last else {
        bail!("simulation produced no snapshots");
    };
    if format == OutputFormat::Ascii {
        if let Some(first) = first.filter(|first| first.round != last.round) {
            write_grid(out, &first)?;
            writeln!(out)?;
        }
        write_grid(out, &last)?;
    }
    if rounds.last_summary().is_some_and(|summary| summary.deferred > 0) {
        warn!("final round deferred relocations; consider a higher empty ratio");
    }
    Ok(())
}

fn write_grid(out: &mut impl Write, snapshot: &CitySnapshot) -> Result<()> {
    writeln!(
        out,
        "round {} (mean similarity {})",
        snapshot.round,
        format_ratio(snapshot.mean_similarity)
    )?;
    writeln!(out, "{snapshot}")?;
    Ok(())
}

fn format_ratio(ratio: Option<f64>) -> String {
    ratio.map_or_else(|| "n/a".to_string(), |value| format!("{value:.4}"))
}
