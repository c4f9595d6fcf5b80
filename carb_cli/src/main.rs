use carb_core::*;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "carbs")]
#[command(about = "Dynamic carbs-on-board estimation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the carbs-on-board series for a request file
    Cob {
        /// Request file (JSON), or "-" for stdin
        #[arg(long)]
        input: PathBuf,

        /// Output format (json, csv)
        #[arg(long)]
        format: Option<OutputFormat>,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Absorption model (linear, piecewise-linear, parabolic)
        #[arg(long)]
        model: Option<AbsorptionModel>,

        /// Multiplier on the declared absorption time bounding attribution
        #[arg(long)]
        overrun: Option<f64>,

        /// Emit a fixed grid with this spacing
        #[arg(long)]
        step_minutes: Option<u32>,

        /// Start of the query range (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// End of the query range (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Show fitted absorption per carb entry
    Status {
        /// Request file (JSON), or "-" for stdin
        #[arg(long)]
        input: PathBuf,
    },

    /// Evaluate an absorption curve at one normalized time
    Curve {
        /// Absorption model (linear, piecewise-linear, parabolic)
        #[arg(long, default_value = "piecewise-linear")]
        model: AbsorptionModel,

        /// Normalized time (fraction of the absorption time)
        #[arg(long)]
        at: f64,
    },

    /// Print the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean for the series; diagnostics go to stderr
    carb_core::logging::init_with_level(if cli.verbose { "debug" } else { "warn" });

    let config_path = cli.config;

    match cli.command {
        Commands::Cob {
            input,
            format,
            output,
            model,
            overrun,
            step_minutes,
            from,
            to,
        } => {
            let mut request = read_request(&input)?;
            let mut config = load_config(config_path.as_deref())?;
            if model.is_some() {
                request.absorption_model = model;
            }
            if overrun.is_some() {
                request.initial_absorption_time_overrun = overrun;
            }
            if from.is_some() {
                request.query_from = from;
            }
            if to.is_some() {
                request.query_to = to;
            }
            if let Some(format) = format {
                config.output.format = format;
            }
            if step_minutes.is_some() {
                config.output.step_minutes = step_minutes;
            }
            cmd_cob(&request, &config, output.as_deref())
        }
        Commands::Status { input } => {
            let config = load_config(config_path.as_deref())?;
            cmd_status(&read_request(&input)?, &config)
        }
        Commands::Curve { model, at } => cmd_curve(model, at),
        Commands::Config { init } => cmd_config(config_path, init),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn read_request(input: &Path) -> Result<CobRequest> {
    let request = if input == Path::new("-") {
        let contents = io::read_to_string(io::stdin())?;
        parse_request(&contents)?
    } else {
        load_request(input)?
    };
    tracing::debug!(
        "Read request with {} carb entries and {} counteraction samples",
        request.carb_entries.len(),
        request.counteraction_effects.len()
    );
    Ok(request)
}

fn cmd_cob(request: &CobRequest, config: &Config, output: Option<&Path>) -> Result<()> {
    let report = run(request, config)?;
    let format = config.output.format;

    match output {
        Some(path) => {
            let file = BufWriter::new(File::create(path)?);
            sink_for(format, file).write_series(&report.series)?;
            eprintln!("✓ Wrote {} points to {}", report.series.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            sink_for(format, stdout.lock()).write_series(&report.series)?;
        }
    }
    Ok(())
}

fn cmd_status(request: &CobRequest, config: &Config) -> Result<()> {
    let report = run(request, config)?;

    println!("Model: {}", report.model);
    for status in &report.statuses {
        let state = match status.completed_at() {
            Some(at) => format!("complete at {}", at.to_rfc3339()),
            None => "incomplete".to_string(),
        };
        println!(
            "{}  {:.1} g  observed {:.1} g  {}  modeled rate {:.3} g/min",
            status.entry.start_time.to_rfc3339(),
            status.entry.grams,
            status.observed_grams(),
            state,
            status.modeled_rate_at(report.to, &report.model)
        );
    }
    Ok(())
}

fn cmd_curve(model: AbsorptionModel, at: f64) -> Result<()> {
    if !at.is_finite() {
        return Err(Error::InvalidParameter(format!(
            "time fraction must be finite, got {}",
            at
        )));
    }

    println!("model: {}", model);
    println!("fraction_absorbed: {:.6}", model.fraction_absorbed(at));
    println!("fraction_rate: {:.6}", model.fraction_rate(at));
    println!("inverse_fraction_absorbed: {:.6}", model.inverse_fraction_absorbed(at));
    Ok(())
}

fn cmd_config(path: Option<PathBuf>, init: bool) -> Result<()> {
    if init {
        let path = path.unwrap_or_else(Config::default_config_path);
        if path.exists() {
            return Err(Error::Config(format!(
                "config file already exists at {}",
                path.display()
            )));
        }
        Config::default().save_to(&path)?;
        println!("✓ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = load_config(path.as_deref())?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(config.to_toml()?.as_bytes())?;
    Ok(())
}
