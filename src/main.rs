mod analyzer;
mod compress;
mod config;
mod db;
mod decode;
mod engine;
mod ingest;
mod logging;
mod matcher;
mod progress;
mod router;
mod worker;

use std::path::PathBuf;

use analyzer::OnnxFaceAnalyzer;
use config::Config;
use db::Database;
use worker::Worker;

// Exit codes: 0 normal completion, 1 unrecoverable engine error,
// 2 missing or invalid configuration at startup.
const EXIT_ENGINE_ERROR: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facesort {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(EXIT_CONFIG_ERROR);
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        }
        i += 1;
    }

    config_path
}

fn print_help() {
    println!(
        r#"facesort - offline face-recognition photo sorter (worker process)

USAGE:
    facesort [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACESORT_CONFIG     Path to config file (overrides default location)
    FACESORT_LOG        Log level (trace, debug, info, warn, error)

The worker polls the job configuration and control flag in the shared
store; start, stop, and terminate are issued by the control plane."#
    );
}

fn main() {
    let config_path = parse_args();

    let config = match config_path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = config.ensure_directories() {
        eprintln!("Cannot create hot storage under {:?}: {e}", config.hot_root);
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    let _ = logging::init(config.logs_dir());

    let db = match Database::open(&config.db_path()) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "cannot open store");
            eprintln!("Cannot open store: {e}");
            std::process::exit(EXIT_ENGINE_ERROR);
        }
    };
    if let Err(e) = db.initialize() {
        tracing::error!(error = %e, "cannot initialize store");
        eprintln!("Cannot initialize store: {e}");
        std::process::exit(EXIT_ENGINE_ERROR);
    }

    // Models are provisioned by external bootstrap; absence is a
    // startup configuration problem, not an engine failure.
    let mut face_analyzer =
        match OnnxFaceAnalyzer::load(&config.models_dir(), config.matching.min_detection_score) {
            Ok(analyzer) => analyzer,
            Err(e) => {
                tracing::error!(error = %e, "face models unavailable");
                eprintln!("Face models unavailable: {e}");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        };

    let worker = Worker::new(config, db);
    if let Err(e) = worker.run(&mut face_analyzer) {
        tracing::error!(error = %e, "worker failed");
        eprintln!("Worker failed: {e:#}");
        std::process::exit(EXIT_ENGINE_ERROR);
    }
}
