use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use kiln_checkpoint::SafetensorsStore;
use kiln_core::{
    ConfigResolver, RawRunConfig, ResolvedRunConfig, WorkerIdentity, WorkerLaunchPlan,
};
use kiln_launcher::{
    DeviceBinder, ExecSpawner, LaunchOutcome, NvmlRuntime, ProcessLauncher, TcpRendezvous,
    detect_host,
};
use kiln_logging::{LogOutput, logging};
use kiln_trainer::{
    Collaborators, DummyCollaborators, DummyTrainingLoop, FileTracker, RunSupervisor,
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, info_span, warn};

/// 128 + SIGINT, what a shell reports for a process killed by Ctrl-C.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "kiln-train", version, subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run_args: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // Prints the help, optionally as markdown. Used for docs generation.
    #[clap(hide = true)]
    PrintAllHelp {
        #[arg(long, required = true)]
        markdown: bool,
    },
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Run configuration, as TOML.
    #[arg(long, required_unless_present = "worker_plan")]
    config: Option<PathBuf>,

    #[arg(long, env, default_value = "console")]
    logs: LogOutput,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Also append logs to this file.
    #[arg(long, env)]
    write_log_file: Option<PathBuf>,

    /// Set by the launcher on every spawned worker.
    #[arg(long, env = "KILN_WORKER_PLAN", hide = true)]
    worker_plan: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    if let Some(Commands::PrintAllHelp { markdown }) = cli.command {
        assert!(markdown);
        clap_markdown::print_help_markdown::<Cli>();
        return Ok(ExitCode::SUCCESS);
    }
    let args = cli.run_args;

    let logger = logging()
        .with_output(args.logs)
        .with_level(args.log_level)
        .with_log_file(args.write_log_file.clone())
        .init()?;

    let cancellation = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancellation.clone()));

    let result = match &args.worker_plan {
        Some(plan) => run_worker(plan, cancellation.clone()).await,
        None => {
            let config = args
                .config
                .as_ref()
                .context("--config is required when not running as a worker")?;
            run_launcher(config, cancellation.clone()).await
        }
    };

    let exit = if cancellation.is_cancelled() {
        if let Err(err) = &result {
            debug!("stopped with: {err:#}");
        }
        warn!("Training interrupted");
        Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
    } else {
        result.map(|()| ExitCode::SUCCESS)
    };
    logger.shutdown()?;
    exit
}

/// First Ctrl-C asks training to stop between steps, a second one exits on the spot.
async fn cancel_on_interrupt(cancellation: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Couldn't listen for Ctrl-C: {err}");
        return;
    }
    warn!("Interrupted, stopping training. Press Ctrl-C again to exit immediately");
    cancellation.cancel();
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(INTERRUPTED_EXIT_CODE.into());
    }
}

async fn run_launcher(config_path: &Path, cancellation: CancellationToken) -> Result<()> {
    let runtime = NvmlRuntime::init();
    let host = detect_host(&runtime);

    let raw = RawRunConfig::from_toml_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = ConfigResolver::resolve(&raw, &host).context("invalid run configuration")?;
    info!(
        mode = %config.mode,
        exp_dir = %config.exp_dir.display(),
        "Resolved run configuration"
    );
    debug!("{config:#?}");

    // workers re-run this binary with the same flags, their plan arrives via the environment
    let spawner = ExecSpawner::current_exe()
        .context("couldn't locate the current executable")?
        .with_args(std::env::args_os().skip(1));
    let launcher = ProcessLauncher::new(spawner);
    let outcome = tokio::select! {
        outcome = launcher.launch(&config) => outcome?,
        // spawned workers still running are killed when the runtime drops their tasks
        _ = cancellation.cancelled() => bail!("interrupted, stopping workers"),
    };
    match outcome {
        LaunchOutcome::RunInProcess(identity) => supervise(identity, config, cancellation).await,
        LaunchOutcome::WorkersFinished { workers } => {
            info!(workers, "All workers finished");
            Ok(())
        }
    }
}

async fn run_worker(plan: &str, cancellation: CancellationToken) -> Result<()> {
    let plan = WorkerLaunchPlan::from_json(plan).context("malformed worker plan")?;
    let span = info_span!("worker", rank = plan.expected_rank());
    async move {
        let group = TcpRendezvous::new(plan.master_addr.clone(), plan.master_port);
        let binder = DeviceBinder::new(Arc::new(NvmlRuntime::init()));
        let identity = tokio::select! {
            identity = binder.bind(&plan, &group) => identity?,
            _ = cancellation.cancelled() => bail!("interrupted before the group assembled"),
        };
        supervise(identity, plan.config, cancellation).await
    }
    .instrument(span)
    .await
}

async fn supervise(
    identity: WorkerIdentity,
    config: ResolvedRunConfig,
    cancellation: CancellationToken,
) -> Result<()> {
    let collaborators = collaborators(&config);
    let span = tracing::Span::current();
    // the blocking task is awaited even on interrupt, the loop notices the token between steps
    let finished = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        RunSupervisor::new(identity, config, collaborators)
            .with_cancellation(cancellation)
            .run()
    })
    .await;
    match finished {
        Ok(result) => Ok(result?),
        Err(err) if err.is_panic() => bail!("training panicked: {err}"),
        Err(err) => bail!("training task was cancelled: {err}"),
    }
}

fn collaborators(config: &ResolvedRunConfig) -> Collaborators {
    let dummy = DummyCollaborators::default();
    Collaborators {
        models: Box::new(dummy.clone()),
        components: Box::new(dummy.clone()),
        data: Box::new(dummy),
        tracker: Some(Box::new(FileTracker::new(config.exp_dir.join("tracker")))),
        checkpoints: Arc::new(SafetensorsStore),
        training_loop: Box::new(DummyTrainingLoop),
    }
}
