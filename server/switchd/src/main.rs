mod cli;
mod config;
mod dialplan;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use xb_core::{CdrManagerBackend, ChannelTech, Core, CoreOptions};
use xb_loader::{BootConfig, Loader};
use xb_pbx::{DialplanEngine, EngineOptions};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();

    let core = Core::start(CoreOptions {
        system_name: cfg.system_name.clone(),
        default_context: cfg.default_context.clone(),
        end_cdr_before_h: cfg.end_cdr_before_h,
        max_calls: cfg.max_calls,
    });
    if cfg.no_cdr {
        core.cdr.set_enabled(false);
    }
    core.cdr
        .register_backend(Arc::new(CdrManagerBackend::new(core.events.clone())));

    // Loopback driver for local and test calls.
    let null_tech = xb_core::tech_null::NullTech::new();
    core.techs
        .add("Null", Arc::clone(&null_tech) as Arc<dyn ChannelTech>);

    let engine = DialplanEngine::new(
        &core,
        EngineOptions {
            autofallthrough: cfg.autofallthrough,
            ..EngineOptions::default()
        },
    );

    if let Some(path) = &cfg.dialplan {
        dialplan::load_into(&engine, path).await?;
    }

    // Modules: builtin conference app first, then the configured set.
    let loader = Loader::new(&core, &engine, &core.cdr);
    if let Err(e) = loader.load_builtin("app_nconference", xb_mixer::modinfo()) {
        tracing::warn!(error = %e, "conference module failed to register");
    }
    loader.boot(&BootConfig {
        module_dir: cfg.module_dir.clone(),
        preload: cfg.preload.clone(),
        load: cfg.load.clone(),
        noload: cfg.noload.clone(),
        autoload: !cfg.no_autoload,
    });

    // Mirror manager events into the debug log.
    let mut events = core.events.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            debug!(event = %ev.name, fields = ?ev.fields, "manager event");
        }
    });

    if cfg.console {
        let console = cli::Cli {
            core: Arc::clone(&core),
            engine: Arc::clone(&engine),
            cdr: Arc::clone(&core.cdr),
            loader: Arc::clone(&loader),
            dialplan_path: cfg.dialplan.clone(),
        };
        tokio::spawn(run_console(console));
    }

    info!(
        system = %cfg.system_name,
        modules = loader.module_count(),
        "switch is fully booted"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    core.sched.shutdown();
    Ok(())
}

/// Minimal stdin front-end for the CLI verbs.
async fn run_console(console: cli::Cli) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut out = xb_strings::DynStr::new();
        if console.dispatch(line, &mut out).await {
            print!("{out}");
        } else {
            println!("No such command: {line}");
        }
    }
}
