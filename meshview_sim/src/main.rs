//! MeshView Drill CLI
//!
//! Run seeded drills against the core on virtual time, or drive the engine
//! in real time and watch the bus.

use std::path::PathBuf;

use clap::Parser;
use meshview_core::EngineConfig;
use meshview_env::TokioPacer;
use meshview_sim::{run_realtime, DrillId, DrillResult, DrillRunner, SimConfig, SimError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// MeshView drill harness CLI
#[derive(Parser, Debug)]
#[command(name = "meshview-sim")]
#[command(about = "Run deterministic drills against the MeshView core", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Data node count at start-up
    #[arg(short, long, default_value = "3")]
    replicas: u32,

    /// Drill to run (faucet_storm, batch_run, scale_cycle, build_deploy, telemetry_soak, churn, all)
    #[arg(short = 'D', long, default_value = "all")]
    drill: String,

    /// Number of consecutive seeds to run (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Workload length in seconds of engine time
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Engine configuration file (JSON, missing fields take defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Drive one engine on the wall clock and print bus traffic
    #[arg(long)]
    realtime: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let engine = match &args.config {
        Some(path) => EngineConfig::from_json_file(path).unwrap_or_else(|e| {
            error!("{}", e);
            std::process::exit(2);
        }),
        None => EngineConfig::default(),
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if args.realtime {
        let config = SimConfig {
            seed: base_seed,
            replicas: args.replicas,
            max_duration_secs: args.duration,
            engine,
            ..Default::default()
        };
        if let Err(e) = realtime(&config, args.json) {
            error!("real-time session failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let drills: Vec<DrillId> = if args.drill == "all" {
        DrillId::all()
    } else {
        vec![args.drill.parse().unwrap_or_else(|e| {
            error!("{}", e);
            error!("Available drills: faucet_storm, batch_run, scale_cycle, build_deploy, telemetry_soak, churn, all");
            std::process::exit(2);
        })]
    };

    if !args.json {
        info!("MeshView drill harness v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let mut all_results: Vec<DrillResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = DrillRunner::new(seed, args.replicas)
            .with_duration(args.duration)
            .with_config(engine.clone());

        for drill in &drills {
            let result = runner.run(*drill);
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", drill.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        drill.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("failed to encode summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("All {} drill runs passed", total);
        } else {
            error!("{}/{} drill runs failed", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.drill.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}

fn realtime(config: &SimConfig, json: bool) -> Result<(), SimError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;
    let summary = runtime.block_on(async {
        let pacer = TokioPacer::new();
        run_realtime(config, &pacer, json).await
    })?;
    info!(
        "session over: {} timers, {} messages, {} results in {:.1}s",
        summary.dispatched, summary.messages, summary.results, summary.final_time_secs
    );
    Ok(())
}
