use anyhow::{bail, Context, Result};
use mimir::cli::commands::{HistoryCommand, PlanCommand, SimulateCommand, ValidateCommand};
use mimir::cli::output::*;
use mimir::cli::{Cli, Command};
use mimir::collaborators::{
    Collaborators, InMemoryComputeService, InMemoryObjectStore, InMemoryRegistry, ObjectStore,
    SimulatedBuildEnvironment,
};
use mimir::core::{BuildSpec, ConfigError, FleetConfig, ObjectCreatedEvent, RunPhase};
use mimir::execution::{FleetEngine, RunPolicy};
use mimir::persistence::{InMemoryPersistence, PersistenceBackend, RunSummary};
use mimir::topology::{FleetTopology, FleetTopologyBuilder};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Validate(cmd) => validate_fleet(cmd)?,
        Command::Plan(cmd) => plan_fleet(cmd)?,
        Command::Simulate(cmd) => simulate_upload(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

/// Load the config, its build specification and the derived topology
fn load_fleet(file: &str, build_spec_override: Option<&str>) -> Result<(FleetConfig, FleetTopology)> {
    let config = FleetConfig::from_file(file).context("Failed to load fleet config")?;
    let build_spec_path = match build_spec_override {
        Some(path) => Path::new(path).to_path_buf(),
        None => config.build_spec_location(Path::new(file)),
    };
    let build_spec = load_build_spec(&build_spec_path)?;

    let topology = FleetTopologyBuilder::new(&config)
        .with_build_spec(build_spec)
        .build()
        .context("Failed to derive fleet topology")?;
    Ok((config, topology))
}

/// A missing build specification leaves builds with empty instructions
fn load_build_spec(path: &Path) -> Result<BuildSpec> {
    match BuildSpec::from_file(path) {
        Ok(spec) => Ok(spec),
        Err(ConfigError::MissingBuildSpec(path)) => {
            warn!("No build specification at {}, builds get empty instructions", path);
            Ok(BuildSpec::default())
        }
        Err(e) => Err(e).context("Failed to load build specification"),
    }
}

fn validate_fleet(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating fleet config...", INFO);

    let result = FleetConfig::from_file(&cmd.file)
        .map_err(anyhow::Error::from)
        .and_then(|config| {
            FleetTopologyBuilder::new(&config).build()?;
            Ok(config)
        });

    match result {
        Ok(config) => {
            println!("{} Fleet configuration is valid!", CHECK);
            println!("  Fleet: {}", style(&config.fleet_name).bold());
            println!("  Services: {}", style(config.services.len()).cyan());
            for service in &config.services {
                println!(
                    "    {} port {} x{}",
                    style(&service.name).bold(),
                    style(service.port).cyan(),
                    service.desired_count
                );
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

fn plan_fleet(cmd: &PlanCommand) -> Result<()> {
    let (_, topology) = load_fleet(&cmd.file, None)?;
    let plan = topology.plan();

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "{} Fleet {} ({} service(s)) on {}",
        INFO,
        style(&plan.fleet_name).bold(),
        plan.services.len(),
        style(&plan.cluster).cyan()
    );
    for service in &plan.services {
        let names = &service.names;
        println!("\n  {}", style(&names.service).bold());
        println!("    Pipeline:   {}", names.pipeline);
        println!("    Trigger:    s3://{}/{}*", service.trigger.bucket, service.trigger.key_prefix);
        println!("    Build:      {} -> {}", names.build_project, names.repository);
        println!("    Deploy:     {}/{}", names.cluster, names.compute_service);
        if let Some(entry) = &service.target.public_entry {
            println!("    Public:     {} -> :{}", entry.host, entry.target_port);
        }
        for identity in service.identities.iter() {
            println!("    {} ({})", style(&identity.name).cyan(), identity.stage);
            for grant in identity.grants() {
                let actions: Vec<&str> = grant.actions.iter().map(|a| a.as_str()).collect();
                println!("      {} on {}", actions.join(", "), style(&grant.resource).dim());
            }
        }
    }

    Ok(())
}

async fn simulate_upload(cmd: &SimulateCommand) -> Result<()> {
    let (config, topology) = load_fleet(&cmd.file, cmd.build_spec.as_deref())?;

    let key = match (&cmd.target.service, &cmd.target.key) {
        (Some(service), _) => match topology.pipeline(service) {
            Some(pipeline) => pipeline.names.source_key.clone(),
            None => bail!("Service '{}' is not in the fleet", service),
        },
        (None, Some(key)) => key.clone(),
        (None, None) => bail!("Either --service or --key is required"),
    };
    let bundle = std::fs::read(&cmd.bundle).with_context(|| format!("Failed to read bundle {}", cmd.bundle))?;

    // In-memory collaborators
    let store = Arc::new(InMemoryObjectStore::new(&config.artifact_bucket));
    let registry = Arc::new(InMemoryRegistry::new(format!("registry.{}.local", config.region)));
    let builds = Arc::new(SimulatedBuildEnvironment::new(registry.clone()));
    let compute = Arc::new(InMemoryComputeService::new());
    for target in &topology.targets {
        compute.provision(target).await;
    }
    store.put(&key, bundle).await?;

    let history: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    let collaborators = Collaborators::new(store, registry, builds, compute);
    let mut engine = FleetEngine::new(topology, collaborators, RunPolicy::from_settings(&config.pipeline))
        .with_history(history);

    let spinner = create_spinner("Running pipelines...");
    let printer = spinner.clone();
    engine.add_event_handler(move |event| printer.println(format_execution_event(&event)));

    let handle = engine.start();
    let dispatch = handle
        .dispatch(ObjectCreatedEvent::new(&config.artifact_bucket, &key))
        .await;
    let runs = handle.shutdown().await;
    spinner.finish_and_clear();

    if dispatch.service().is_none() {
        println!("{}", format_dispatch(&dispatch));
        return Ok(());
    }

    let mut failed = false;
    for record in runs.values().flatten() {
        let duration = record
            .completed_at
            .and_then(|done| done.signed_duration_since(record.started_at).to_std().ok())
            .map(format_duration)
            .unwrap_or_default();

        match record.phase {
            RunPhase::Succeeded => println!(
                "\n{} {} deployed {} {}",
                CHECK,
                style(&record.pipeline).bold(),
                style(record.image_ref.as_deref().unwrap_or("-")).cyan(),
                style(duration).dim()
            ),
            _ => {
                failed = true;
                println!("\n{} {} {}", CROSS, style(&record.pipeline).bold(), style("failed").red());
                if let Some(failure) = &record.failure {
                    error!("{}", failure);
                }
            }
        }
        if !cmd.no_history {
            println!(
                "{} Run saved to history (ID: {})",
                INFO,
                style(&record.run_id.to_string()[..8]).dim()
            );
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    let store = mimir::persistence::SqliteRunStore::with_default_path()
        .await
        .context("Failed to open run history")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    bail!("Run history requires the 'sqlite' feature")
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    // If a specific run is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let mut runs = match &cmd.service {
        Some(service) => store.list_runs(service).await?,
        None => {
            let mut all = Vec::new();
            for service in store.list_services().await? {
                all.extend(store.list_runs(&service).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    runs.truncate(cmd.limit);

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary) -> Result<()> {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Service: {}", style(&summary.service).bold());
    println!("  Pipeline: {}", summary.pipeline);
    println!("  Trigger: {}", style(&summary.trigger_key).dim());
    println!("  Status: {}", format_phase(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    if let Some(image) = &summary.image_ref {
        println!("  Image: {}", style(image).cyan());
    }
    if let (Some(stage), Some(kind)) = (summary.failed_stage, summary.failure_kind) {
        println!("  Failed in: {} ({})", style(stage).red(), kind);
        if let Some(cause) = &summary.cause {
            println!("  Cause: {}", cause);
        }
        if let Some(log_ref) = &summary.log_ref {
            println!("  Log: {}", style(log_ref).dim());
        }
    }
    Ok(())
}
