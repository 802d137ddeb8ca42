use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use fusion_sim::FusionRuntime;
use fusion_sim::api::scenario_dto::ScenarioDto;
use fusion_sim::domain::continuous::ContinuousConfig;
use fusion_sim::domain::optimizer::OptimizerConfig;
use fusion_sim::loader::parser::parse_json_file;
use fusion_sim::logger;

/// Replays a scenario file against the fusion simulator and reports what
/// the optimizer made of the observed call patterns.
#[derive(Parser, Debug)]
#[command(name = "fusion_sim", version, about = "Serverless function fusion simulator")]
struct Args {
    /// Path to the scenario JSON (units, fusions, workload).
    scenario: String,

    /// Run the background control loop while replaying the workload.
    #[arg(long)]
    continuous: bool,

    /// Skip the forced optimization pass after the replay.
    #[arg(long)]
    no_final_optimization: bool,
}

#[tokio::main]
async fn main() {
    logger::init();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> fusion_sim::error::Result<()> {
    let scenario: ScenarioDto = parse_json_file(&args.scenario)?;
    log::info!(
        "Scenario '{}' loaded: {} unit(s), {} fusion(s), {} workload batch(es)",
        args.scenario,
        scenario.units.len(),
        scenario.fusions.len(),
        scenario.workload.len()
    );

    let runtime = Arc::new(FusionRuntime::new(OptimizerConfig::default(), ContinuousConfig::default()));
    let workload = scenario.workload.clone();
    runtime.load_scenario(scenario)?;

    let control_loop = args.continuous.then(|| runtime.start_continuous());

    for batch in &workload {
        let input = batch.input.clone().unwrap_or_else(|| json!({}));
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut total_duration_ms = 0i64;

        let handles: Vec<_> = (0..batch.invocations).map(|_| runtime.invoke_detached(&*batch.fusion_id, input.clone())).collect();
        for joined in futures::future::join_all(handles).await {
            let response = joined.map_err(|e| fusion_sim::error::Error::ExecutionError {
                unit_id: batch.fusion_id.clone(),
                cause: e.to_string(),
            })??;
            total_duration_ms += response.duration_ms;
            if response.failed_unit.is_some() {
                failed += 1;
            } else {
                completed += 1;
            }
        }

        let mean = total_duration_ms as f64 / batch.invocations.max(1) as f64;
        log::info!(
            "Fusion '{}': {} completed, {} failed, mean duration {:.1} ms",
            batch.fusion_id,
            completed,
            failed,
            mean
        );
    }

    if let Some(handle) = control_loop {
        handle.abort();
    }

    if !args.no_final_optimization {
        for fusion_id in runtime.fusions().ids() {
            if let Some(record) = runtime.optimize_now(&fusion_id) {
                log::info!(
                    "Fusion '{}' optimized: setup [{}], changed: {}, estimated savings {:.1} ms",
                    fusion_id,
                    record.setup_key,
                    record.changed,
                    record.estimated_savings_ms
                );
            }
        }
    }

    for record in runtime.optimization_history() {
        log::info!(
            "Run @{} for '{}' ({:?}): setup [{}], changed: {}",
            record.at_ms,
            record.fusion_id,
            record.reason,
            record.setup_key,
            record.changed
        );
    }

    Ok(())
}
