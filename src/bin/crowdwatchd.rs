//! crowdwatchd - edge crowd-density daemon
//!
//! Reads frames from one source, counts people on a sampled subset of frames, and
//! streams density snapshots to the collection server. Exits when the source ends,
//! on Ctrl-C, or on a fatal failure (exit code names the failing component).

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::thread;

use crowdwatch_edge::schedule::{apply_core_budget, CoreBudget};
use crowdwatch_edge::ui::{self, Ui, UiMode};
use crowdwatch_edge::uplink::HttpTransport;
use crowdwatch_edge::{
    exit_code_for, open_source, EdgeConfig, FailureKind, FatalError, InferenceEngine, Pipeline,
    ShutdownSignal, UplinkClient,
};

#[derive(Parser, Debug)]
#[command(name = "crowdwatchd", about = "Edge crowd-density monitor", version)]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise)
    #[arg(long, env = "CROWDWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Frame source, overriding the config (camera:N, rtsp://, http://, stub://, or a file path)
    #[arg(long, value_name = "SPEC")]
    source: Option<String>,

    /// Log every snapshot as it is produced
    #[arg(long)]
    print_snapshots: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        let code = exit_code_for(&err);
        log::error!("crowdwatchd: {:#}", err);
        std::process::exit(code);
    }
}

fn run(args: Args) -> Result<()> {
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::new(UiMode::parse(Some(&args.ui)), is_tty, !stdout_is_tty);

    let config = {
        let _stage = ui.stage("Load configuration");
        let mut config = EdgeConfig::load_from(args.config.as_deref())?;
        if let Some(source) = args.source {
            config.source.spec = source;
        }
        config
    };
    log::info!(
        "crowdwatchd {} device={} edge_mode={} frame_skip={} core_budget={}",
        env!("CARGO_PKG_VERSION"),
        config.device_id,
        config.edge_mode,
        config.schedule.frame_skip_interval,
        config.schedule.cpu_core_budget
    );

    // Before any thread starts, so workers inherit the affinity mask.
    match apply_core_budget(config.schedule.cpu_core_budget) {
        Ok(CoreBudget::Pinned(cores)) => log::info!("pinned to cores {:?}", cores),
        Ok(CoreBudget::Unrestricted) => {}
        Ok(CoreBudget::Unsupported) => {
            log::warn!("core budget not enforced on this platform")
        }
        Err(err) => log::warn!("could not apply core budget: {:#}", err),
    }

    let engine = {
        let _stage = ui.stage("Load model");
        InferenceEngine::load(&config.model)?
    };

    let shutdown = ShutdownSignal::new();
    let source = {
        let _stage = ui.stage("Open frame source");
        open_source(&config.source, shutdown.clone())?
    };

    if let Some(health_url) = &config.uplink.health_url {
        let _stage = ui.stage("Probe server");
        let probe = HttpTransport::new(health_url.clone(), config.uplink.request_timeout);
        match probe.probe(health_url) {
            Ok(status) if (200..300).contains(&status) => log::info!("server healthy"),
            Ok(status) => log::warn!("server health check returned HTTP {}", status),
            Err(err) => log::warn!("{:#}", err),
        }
    }

    let uplink = UplinkClient::from_config(&config)
        .map_err(|e| FatalError::wrap(FailureKind::Config, e))?;

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, draining...");
            shutdown.trigger();
        })
        .expect("error setting Ctrl-C handler");
    }

    let mut pipeline = Pipeline::new(&config, source, engine, uplink, shutdown);
    let printer = if args.print_snapshots {
        let snapshots = pipeline.subscribe();
        Some(thread::spawn(move || {
            for snapshot in snapshots {
                log::info!("snapshot {}", ui::snapshot_line(&snapshot));
            }
        }))
    } else {
        None
    };

    let report = pipeline.run()?;
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    ui.report(&report);
    Ok(())
}
