//! `edgeprep` – prepares an edge device for its production workload.
//!
//! `edgeprep run` applies the provisioning plan from the configuration file
//! (boot config, compressed swap, CPU governor, tmpfs overlays, kernel
//! tunables), then brings the device's services up in ranked order. The JSON
//! run summary goes to stdout, logs and the human-readable summary to
//! stderr, and the exit code reflects the most severe failure.
//!
//! The remaining subcommands operate on one component. `edgeprep quiesce` is
//! what rendered service units call from `ExecStopPost=`.

mod config;
mod output;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, warn};

use config::{Config, DEFAULT_CONFIG_PATH};
use edgeprep_orchestrator::{ServiceLifecycleOrchestrator, SystemdManager};
use edgeprep_provision::{CommandRunner, SystemRunner};
use edgeprep_runtime::telemetry;
use edgeprep_types::{GovernorMode, ProvisionError, exit_code};

/// Exit status after SIGINT/SIGTERM.
const INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "edgeprep", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(
        long,
        global = true,
        env = "EDGEPREP_CONFIG",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision the host and bring up services.
    Run {
        /// Also write the JSON summary to this file.
        #[arg(long, value_name = "PATH")]
        summary: Option<PathBuf>,
    },
    /// Drive actuators to their safe values. Always exits 0.
    Quiesce(QuiesceArgs),
    /// Compressed swap device.
    #[command(subcommand)]
    Swap(SwapCommand),
    /// CPU frequency governor.
    #[command(subcommand)]
    Governor(GovernorCommand),
    /// Kernel tunables.
    #[command(subcommand)]
    Sysctl(SysctlCommand),
    /// RAM-backed overlays.
    #[command(subcommand)]
    Overlay(OverlayCommand),
}

#[derive(Args, Debug)]
struct QuiesceArgs {
    /// Unit whose cleanup actions to run.
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    unit: Option<String>,
    /// Every actuator named in the manifest.
    #[arg(long)]
    all: bool,
}

#[derive(Subcommand, Debug)]
enum SwapCommand {
    /// Disable and remove the swap device.
    Deprovision,
    /// Print the swap device state as JSON.
    Status,
}

#[derive(Subcommand, Debug)]
enum GovernorCommand {
    /// Print each core's governor.
    Show,
    /// Set every core's governor and persist it across reboots.
    Set { mode: GovernorMode },
}

#[derive(Subcommand, Debug)]
enum SysctlCommand {
    /// Remove the edgeprep sysctl file.
    Revert,
}

#[derive(Subcommand, Debug)]
enum OverlayCommand {
    /// Unmount an overlay and release its reservation.
    Unmount { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = telemetry::init_tracing("edgeprep");

    let code = match cli.command {
        Command::Quiesce(args) => quiesce(&cli.config, &args),
        command => match config::load_from(&cli.config) {
            Ok(cfg) => dispatch(cfg, command),
            Err(e) => {
                eprintln!("{}: {e}", "Config error".red());
                exit_code::CONFIG_FILE
            }
        },
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn dispatch(cfg: Config, command: Command) -> i32 {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let ctx = cfg.host_context(runner);
    match command {
        Command::Run { summary } => run(&cfg, summary.as_deref()),
        Command::Quiesce(_) => exit_code::SUCCESS,
        Command::Swap(SwapCommand::Deprovision) => finish(ctx.swap_manager().deprovision(), |removed| {
            if removed {
                eprintln!("  {} swap device removed", "✓".green());
            } else {
                eprintln!("  no swap device provisioned");
            }
        }),
        Command::Swap(SwapCommand::Status) => print_json(&ctx.swap_manager().status()),
        Command::Governor(GovernorCommand::Show) => finish(ctx.governor().current_governor(), |cores| {
            for (core, governor) in cores {
                println!("cpu{core}: {}", governor.as_deref().unwrap_or("unknown"));
            }
        }),
        Command::Governor(GovernorCommand::Set { mode }) => finish(ctx.governor().set_governor(mode), |cores| {
            eprintln!("  {} {mode} on {} core(s)", "✓".green(), cores.len());
        }),
        Command::Sysctl(SysctlCommand::Revert) => finish(ctx.sysctl().revert(), |removed| {
            if removed {
                eprintln!("  {} {} removed; live values stay until reboot", "✓".green(), ctx.sysctl().file_path().display());
            } else {
                eprintln!("  nothing to revert");
            }
        }),
        Command::Overlay(OverlayCommand::Unmount { path }) => finish(ctx.tmpfs().unmount_overlay(&path), |removed| {
            if removed {
                eprintln!("  {} {} unmounted", "✓".green(), path.display());
            } else {
                eprintln!("  {} is not a managed overlay", path.display());
            }
        }),
    }
}

/// Print the outcome of a single-component command and map it to an exit code.
fn finish<T>(result: Result<T, ProvisionError>, on_ok: impl FnOnce(T)) -> i32 {
    match result {
        Ok(value) => {
            on_ok(value);
            exit_code::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {e}", "Error".red().bold());
            e.exit_code()
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            exit_code::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "cannot serialise output");
            exit_code::HOST
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: &Config, summary_path: Option<&Path>) -> i32 {
    install_interrupt_handler(cfg);

    let ctx = cfg.host_context(Arc::new(SystemRunner));
    let manager = Arc::new(SystemdManager::new(ctx.root.clone(), cfg.host.unit_dir.clone()));
    let mut orchestrator =
        ServiceLifecycleOrchestrator::new(manager, Arc::new(cfg.guard()), cfg.host.quiesce_bin.clone());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return exit_code::HOST;
        }
    };
    let summary = runtime.block_on(edgeprep_runtime::run(
        &cfg.provision,
        &cfg.services,
        &ctx,
        &mut orchestrator,
    ));

    output::print_summary(&summary);
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => {
            println!("{json}");
            if let Some(path) = summary_path
                && let Err(e) = fs::write(path, format!("{json}\n"))
            {
                warn!(path = %path.display(), error = %e, "cannot write summary file");
            }
        }
        Err(e) => error!(error = %e, "cannot serialise run summary"),
    }
    summary.exit_code
}

/// On SIGINT/SIGTERM, quiesce every configured actuator and exit.
fn install_interrupt_handler(cfg: &Config) {
    let guard = cfg.guard();
    let actions = cfg.all_cleanup();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Interrupted – quiescing actuators …".yellow().bold());
        let report = guard.quiesce(&actions);
        output::print_quiesce(&report);
        std::process::exit(INTERRUPTED);
    }) {
        warn!(error = %e, "failed to install signal handler; actuators will not be quiesced on interrupt");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// quiesce
// ─────────────────────────────────────────────────────────────────────────────

fn quiesce(config_path: &Path, args: &QuiesceArgs) -> i32 {
    let cfg = match config::load_from(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "cannot load config; nothing quiesced");
            return exit_code::SUCCESS;
        }
    };
    let actions = match (&args.unit, args.all) {
        (_, true) => cfg.all_cleanup(),
        (Some(unit), false) => cfg.cleanup_for(unit).unwrap_or_else(|| {
            warn!(unit = %unit, "unit not in manifest; nothing to quiesce");
            Vec::new()
        }),
        (None, false) => Vec::new(),
    };
    let report = cfg.guard().quiesce(&actions);
    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        timed_out = report.timed_out,
        "quiesce finished"
    );
    output::print_quiesce(&report);
    exit_code::SUCCESS
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_config_and_summary() {
        let cli = Cli::try_parse_from(["edgeprep", "run", "--config", "/tmp/e.toml", "--summary", "/tmp/s.json"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/e.toml"));
        assert!(matches!(cli.command, Command::Run { summary: Some(_) }));
    }

    #[test]
    fn quiesce_needs_unit_or_all() {
        assert!(Cli::try_parse_from(["edgeprep", "quiesce"]).is_err());
        assert!(Cli::try_parse_from(["edgeprep", "quiesce", "--unit", "a", "--all"]).is_err());
        let cli = Cli::try_parse_from(["edgeprep", "quiesce", "--unit", "facial"]).unwrap();
        assert!(matches!(cli.command, Command::Quiesce(QuiesceArgs { unit: Some(_), all: false })));
    }

    #[test]
    fn governor_mode_is_parsed() {
        let cli = Cli::try_parse_from(["edgeprep", "governor", "set", "performance"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Governor(GovernorCommand::Set { mode: GovernorMode::Performance })
        ));
        assert!(Cli::try_parse_from(["edgeprep", "governor", "set", "turbo"]).is_err());
    }

    #[test]
    fn quiesce_with_unreadable_config_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let args = QuiesceArgs {
            unit: Some("facial".into()),
            all: false,
        };
        assert_eq!(quiesce(&dir.path().join("absent.toml"), &args), exit_code::SUCCESS);
    }

    #[test]
    fn quiesce_unit_writes_quiescent_values() {
        let dir = tempfile::tempdir().unwrap();
        let gpio = dir.path().join("sys/class/gpio/gpio12");
        fs::create_dir_all(&gpio).unwrap();
        fs::write(gpio.join("value"), "1\n").unwrap();
        let config_path = dir.path().join("edgeprep.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[host]
root = "{}"

[[services.units]]
name = "facial"
executable_path = "/opt/firmware/facial"
start_rank = 1
cleanup = [{{ target_resource_id = "gpio12" }}, {{ target_resource_id = "gpio13" }}]
"#,
                dir.path().display()
            ),
        )
        .unwrap();

        let args = QuiesceArgs {
            unit: Some("facial.service".into()),
            all: false,
        };
        assert_eq!(quiesce(&config_path, &args), exit_code::SUCCESS);
        assert_eq!(fs::read_to_string(gpio.join("value")).unwrap().trim(), "0");
    }
}
