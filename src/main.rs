use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::info;

mod cli;

use cli::{Command, get_args};
use conflate_rs::Settings;
use conflate_rs::conflate::conflate_model;
use conflate_rs::geometry::GeometryAdapter;
use conflate_rs::increment::increment;
use conflate_rs::io::conflation::{read_conflation_file, write_conflation_file};
use conflate_rs::io::csv::{
    create_rating_curve_writer, read_flow_depth, write_flow_depth, write_rating_curve_rows,
};
use conflate_rs::io::rating_db::RatingCurveStore;
use conflate_rs::network::ReferenceNetwork;
use conflate_rs::pipeline::Pipeline;
use conflate_rs::run_order;
use conflate_rs::solver::CommandSolver;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("conflate_rs=info".parse()?),
        )
        .init();

    let args = get_args();
    let settings = Settings::load(args.config.as_deref())
        .with_context(|| format!("Failed to load settings: {:?}", args.config))?;

    let threads = args.threads.unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("Failed to build thread pool")?;

    match args.command {
        Command::Conflate {
            network,
            model,
            output,
        } => conflate(&settings, &network, &model, &output),
        Command::RunOrder { conflation } => {
            let file = read_conflation_file(&conflation)
                .with_context(|| format!("Failed to read conflation file: {:?}", conflation))?;
            for id in run_order::order(&file.reaches)? {
                println!("{id}");
            }
            Ok(())
        }
        Command::Increment {
            input,
            output,
            step,
        } => {
            let (flows, depths) = read_flow_depth(&input)
                .with_context(|| format!("Failed to read curve: {:?}", input))?;
            let step = step.unwrap_or(settings.flows.depth_increment);
            let (new_flows, new_depths) =
                increment(&flows, &depths, step, settings.flows.degenerate_policy)?;
            write_flow_depth(&output, &new_flows, &new_depths)?;
            println!(
                "{} samples resampled to {} depths at {} step, saved to {:?}",
                flows.len(),
                new_depths.len(),
                step,
                output
            );
            Ok(())
        }
        Command::Run {
            conflation,
            solver,
            solver_args,
            work_dir,
            db,
            export,
        } => {
            let file = read_conflation_file(&conflation)
                .with_context(|| format!("Failed to read conflation file: {:?}", conflation))?;
            let mut store = RatingCurveStore::open(&db)
                .with_context(|| format!("Failed to open database: {:?}", db))?;
            let mut solver = CommandSolver::new(solver, work_dir);
            solver.args = solver_args;

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} reach stages ({eta})")?
                    .progress_chars("#>-"),
            );

            println!("\nRunning {} conflated reaches...", file.reaches.len());
            let mut pipeline = Pipeline::new(&file, &settings.flows)?;
            let report = pipeline.run(&solver, &mut store, &pb)?;
            pb.finish_and_clear();

            println!("\nPipeline complete:");
            println!("  Completed: {}", report.completed.len());
            println!("  Skipped (eclipsed): {}", report.skipped.len());
            println!("  Failed: {}", report.failures.len());
            for failure in &report.failures {
                println!(
                    "    reach {} at {:?}: {}",
                    failure.reach_id, failure.stage, failure.reason
                );
            }

            if let Some(path) = export {
                let mut wtr = create_rating_curve_writer(&path)?;
                for id in file.reaches.keys() {
                    write_rating_curve_rows(&mut wtr, &store.rows(*id)?)?;
                }
                wtr.flush().context("Failed to flush CSV writer")?;
                println!("Rating curves saved to {:?}", path);
            }
            Ok(())
        }
    }
}

fn conflate(settings: &Settings, network: &Path, model: &Path, output: &Path) -> Result<()> {
    println!("Loading layers...");
    let adapter = GeometryAdapter::load(network, model, &settings.columns)
        .with_context(|| format!("Failed to load {:?} and {:?}", network, model))?;

    println!("Building network topology...");
    let topology = ReferenceNetwork::from_reaches(&adapter.reference)
        .context("Reference network is not a valid downstream tree")?;
    info!(reaches = topology.len(), "reference network built");

    let file = conflate_model(
        &adapter,
        &topology,
        settings,
        &network.display().to_string(),
    );
    write_conflation_file(output, &file)?;

    println!("\nConflation Summary:");
    println!("  Source model: {}", adapter.model.name);
    println!("  Source reaches: {}", adapter.model.reaches.len());
    println!("  Reference reaches conflated: {}", file.reaches.len());
    println!("  Eclipsed: {}", file.eclipsed().count());
    println!("  Failed source reaches: {}", file.failures.len());
    println!("Output saved to {:?}", output);
    Ok(())
}
