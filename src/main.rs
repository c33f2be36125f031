//! FFWS discharge CLI
//!
//! Runs the discharge pipeline against the PostgreSQL store: process an
//! observed reading, classify or map a value, tabulate a rating curve, pull
//! forecasts, and audit the reference data. Results are printed as JSON on stdout.

use std::error::Error;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use ffws_discharge::config::{Config, DEFAULT_CONFIG_PATH};
use ffws_discharge::ingest::forecast::ForecastClient;
use ffws_discharge::logging::{self, Component, LogLevel};
use ffws_discharge::predictions::{run_basin_forecast, run_sensor_forecast};
use ffws_discharge::store::PgStore;
use ffws_discharge::store::pg::REQUIRED_SCHEMAS;
use ffws_discharge::{DischargePipeline, RatingCurveEvaluator, verify};

/// Flood forecasting discharge pipeline
#[derive(Parser)]
#[command(name = "ffws")]
#[command(
    author,
    version,
    about = "Discharge, threshold and inundation-map pipeline",
    long_about = None
)]
pub struct Cli {
    /// Configuration file
    #[arg(long, short, env = "FFWS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level regardless of configuration
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert an observed water level, classify it and store the record
    Process {
        sensor_code: String,
        /// Water level in metres
        water_level: f64,
        /// Observation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Classify a discharge value against the sensor's thresholds
    Classify {
        sensor_code: String,
        value: f64,
    },

    /// Tabulate the sensor's active rating curve over a water-level range
    Sample {
        sensor_code: String,
        /// Lowest water level in metres
        min: f64,
        /// Highest water level in metres
        max: f64,
        /// Number of evenly spaced levels, 5 to 100
        #[arg(long, default_value_t = 10)]
        steps: usize,
        /// Resolve the curve in force at this time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Select the inundation map for a device or sensor
    SelectMap {
        /// Device code, or a sensor code resolved to its device
        code: String,
        /// Discharge value; omit to use the latest stored record
        value: Option<f64>,
        /// With no value, use the latest prediction instead of the latest observation
        #[arg(long)]
        predicted: bool,
        /// List the device's mappings instead of selecting one
        #[arg(long, conflicts_with_all = ["value", "predicted"])]
        list: bool,
    },

    /// Run a forecast for one sensor and replace its future predictions
    Forecast {
        sensor_code: String,
        /// Fail when any prediction in the batch was rejected
        #[arg(long)]
        strict: bool,
    },

    /// Run a basin-wide forecast and replace predictions sensor by sensor
    ForecastBasin {
        river_basin_code: String,
    },

    /// Audit curves, thresholds and map mappings
    Audit {
        /// Print a readable summary instead of JSON
        #[arg(long)]
        summary: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn forecast_client(config: &Config) -> Result<ForecastClient, Box<dyn Error>> {
    let fc = &config.forecast;
    let mut client =
        ForecastClient::new(&fc.base_url, fc.timeout(), fc.prediction_hours, fc.step_hours)?;
    if let Some(model) = &fc.model_code {
        client = client.with_model(model);
    }
    if !fc.only_active {
        client = client.include_inactive();
    }
    Ok(client)
}

fn run(cli: Cli, config: Config) -> Result<(), Box<dyn Error>> {
    let store = PgStore::connect_and_verify(config.database_url()?, REQUIRED_SCHEMAS)?;
    let pipeline = DischargePipeline::new(&store);

    match cli.command {
        Commands::Process { sensor_code, water_level, at } => {
            let at = at.unwrap_or_else(Utc::now);
            let record = pipeline.process(&sensor_code, water_level, at)?;
            print_json(&record)
        }
        Commands::Classify { sensor_code, value } => {
            let status = pipeline.classify(&sensor_code, value)?;
            print_json(&serde_json::json!({
                "sensor_code": sensor_code,
                "value": value,
                "status": status,
            }))
        }
        Commands::Sample { sensor_code, min, max, steps, at } => {
            let at = at.unwrap_or_else(Utc::now);
            let evaluator = RatingCurveEvaluator::new(&store);
            print_json(&evaluator.sample(&sensor_code, at, min, max, steps)?)
        }
        Commands::SelectMap { code, list: true, .. } => {
            print_json(&pipeline.mappings_for_sensor(&code)?)
        }
        Commands::SelectMap { code, value: Some(value), .. } => {
            print_json(&pipeline.select_map(&code, value)?)
        }
        Commands::SelectMap { code, predicted: true, .. } => {
            print_json(&pipeline.select_map_for_latest_prediction(&code)?)
        }
        Commands::SelectMap { code, .. } => {
            print_json(&pipeline.select_map_for_latest_discharge(&code)?)
        }
        Commands::Forecast { sensor_code, strict } => {
            let client = forecast_client(&config)?;
            let manager = pipeline.predictions();
            let report = run_sensor_forecast(&client, &manager, &sensor_code, Utc::now())?;
            print_json(&report)?;
            if strict {
                report.ensure_complete()?;
            }
            Ok(())
        }
        Commands::ForecastBasin { river_basin_code } => {
            let client = forecast_client(&config)?;
            let manager = pipeline.predictions();
            let summary = run_basin_forecast(&client, &manager, &river_basin_code, Utc::now())?;
            print_json(&summary)
        }
        Commands::Audit { summary } => {
            let report = verify::run_full_verification(&store, Utc::now())?;
            if summary {
                verify::print_summary(&report);
                Ok(())
            } else {
                print_json(&report)
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ffws: {}", e);
            std::process::exit(2);
        }
    };

    let level = if cli.verbose { LogLevel::Debug } else { config.logging.level() };
    let log_file = config.logging.file.as_deref();
    if let Err(e) = logging::init_logger(level, log_file, config.logging.timestamps) {
        eprintln!("ffws: cannot open log file: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = run(cli, config) {
        logging::error(Component::System, None, &e.to_string());
        eprintln!("ffws: {}", e);
        std::process::exit(1);
    }
}
