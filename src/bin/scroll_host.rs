use anyhow::Result;
use scroll_rhai::cli::CliOverrides;
use scroll_rhai::config::HostConfig;
use scroll_rhai::facade::TracingFacade;
use scroll_rhai::loader::ScriptLoader;
use std::io::{self, BufRead};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/scroll_host.json";

fn main() {
    let filter = EnvFilter::try_from_env("SCROLL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            print_usage();
            process::exit(2);
        }
    };
    if let Err(err) = run(cli) {
        eprintln!("error: {err:?}");
        process::exit(1);
    }
}

fn run(cli: CliOverrides) -> Result<()> {
    let mut config = match cli.config_path() {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::load_or_default(DEFAULT_CONFIG),
    };
    let overrides = cli.into_config_overrides();
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applying command-line overrides");
    }
    config.apply_overrides(&overrides);

    let facade = Arc::new(TracingFacade::new(config.addon_name.clone()));
    let loader = ScriptLoader::new(config, facade);
    let report = loader.register();
    if !report.failures.is_empty() {
        eprintln!("{} script(s) failed to load", report.failures.len());
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "" => {}
            "reload" => {
                let summary = loader.reload_all();
                println!(
                    "reloaded {} / disarmed {} / queued {} / failed {}",
                    summary.reloaded,
                    summary.disarmed,
                    summary.queued,
                    summary.failed.len()
                );
            }
            "status" => {
                for unit in loader.units() {
                    println!(
                        "{:<12} {:<9} auto_reload={:<5} {}",
                        unit.category().label(),
                        unit.state().label(),
                        unit.is_auto_reload(),
                        unit.path().display()
                    );
                }
            }
            "quit" | "exit" => break,
            other => eprintln!("unknown command '{other}' (reload, status, quit)"),
        }
    }
    loader.shutdown();
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Scroll Host

Usage:
  scroll_host [--config <path>] [--scripts <dir>] [--library <dir>] [--classes <dir>]
              [--watch on|off] [--auto-reload on|off]

Commands read from stdin:
  reload   reload every registered script
  status   list loaded scripts
  quit     unload everything and exit"
    );
}
