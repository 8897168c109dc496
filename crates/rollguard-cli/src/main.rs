//! rollguard command line

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollguard_core::{NeverConfirm, OperatorPrompt, Orchestrator, RunConfig, RunId, RunMode, TargetSpec};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn cli() -> Command {
    Command::new("rollguard")
        .version(rollguard_core::VERSION)
        .about("Unattended GitOps remediation with automatic rollback")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .short('t')
                .global(true)
                .action(ArgAction::Append)
                .help("Target as NAMESPACE/NAME; replaces configured targets"),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .global(true)
                .help("kubectl context for every cluster call"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug output on the console"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print the report as JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Apply, sync, monitor and roll back on failure")
                .arg(
                    Arg::new("interactive")
                        .long("interactive")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("unattended")
                        .help("Ask before switching branches or continuing after failures"),
                )
                .arg(
                    Arg::new("unattended")
                        .long("unattended")
                        .action(ArgAction::SetTrue)
                        .help("Never prompt (default)"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Run the transform, report changes, restore and stop"),
                )
                .arg(
                    Arg::new("skip-deploy")
                        .long("skip-deploy")
                        .action(ArgAction::SetTrue)
                        .help("Do not trigger a sync"),
                )
                .arg(
                    Arg::new("skip-secondary")
                        .long("skip-secondary")
                        .action(ArgAction::SetTrue)
                        .help("Skip secondary health checks"),
                )
                .arg(
                    Arg::new("push")
                        .long("push")
                        .action(ArgAction::SetTrue)
                        .help("Push the remediation commit"),
                ),
        )
        .subcommand(Command::new("check").about("Read-only prerequisite and health status"))
        .subcommand(Command::new("verify").about("Scan workload logs for TLS errors"))
}

fn parse_target(raw: &str) -> Result<TargetSpec> {
    match raw.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok(TargetSpec::new(name, namespace))
        }
        _ => bail!("invalid target {raw:?}, expected NAMESPACE/NAME"),
    }
}

/// Defaults, then `--config`, then `ROLLGUARD_*`, then flags
fn load_config(matches: &ArgMatches, sub: &ArgMatches) -> Result<RunConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RunConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RunConfig::default(),
    };
    config = config.apply_process_env().context("reading ROLLGUARD_* environment")?;

    if let Some(raw) = matches.get_many::<String>("target") {
        let targets = raw.map(|t| parse_target(t)).collect::<Result<Vec<_>>>()?;
        config = config.with_targets(targets);
    }
    if let Some(context) = matches.get_one::<String>("context") {
        config = config.with_kube_context(Some(context.clone()));
    }
    if matches.get_flag("verbose") {
        config = config.with_verbose(true);
    }

    let flag = |name: &str| sub.try_get_one::<bool>(name).ok().flatten().copied().unwrap_or(false);
    if flag("interactive") {
        config = config.with_mode(RunMode::Interactive);
    } else if flag("unattended") {
        config = config.with_mode(RunMode::Unattended);
    }
    let dry_run = config.dry_run || flag("dry-run");
    let skip_deploy = config.skip_deploy || flag("skip-deploy");
    let skip_secondary = config.skip_secondary || flag("skip-secondary");
    config = config
        .with_dry_run(dry_run)
        .with_skip_deploy(skip_deploy)
        .with_skip_secondary(skip_secondary);

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Console layer at `--verbose`/`RUST_LOG` level, file layer at debug
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let console = fmt::layer().with_writer(std::io::stderr).with_filter(filter);

    let file = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
            let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("installing tracing subscriber")
}

/// Reads a y/N answer from the terminal
struct StdinPrompt;

#[async_trait::async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, question: &str) -> bool {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{question} [y/N] ");
            let _ = stderr.flush();
            let mut answer = String::new();
            match std::io::stdin().lock().read_line(&mut answer) {
                Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
                Err(_) => false,
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => warn!("Interrupted"),
        () = terminate => warn!("Terminated"),
    }
}

fn emit<T: serde::Serialize>(json: bool, report: &T, text: String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("serializing report")?);
    } else {
        print!("{text}");
    }
    Ok(())
}

async fn execute(matches: ArgMatches) -> Result<i32> {
    let (name, sub) = matches
        .subcommand()
        .context("a subcommand is required")?;
    let config = load_config(&matches, sub)?;
    let json = matches.get_flag("json");

    match name {
        "run" => {
            let run_id = RunId::new();
            let log_file = config.backup_dir.join(format!("rollguard-{run_id}.log"));
            let log_file = match init_tracing(config.verbose, Some(&log_file)) {
                Ok(()) => Some(log_file),
                Err(e) => {
                    init_tracing(config.verbose, None)?;
                    warn!("Execution log disabled: {e:#}");
                    None
                }
            };
            info!("Starting run {} with {} target(s)", run_id, config.targets.len());

            let prompt: Arc<dyn OperatorPrompt> = match config.mode {
                RunMode::Interactive => Arc::new(StdinPrompt),
                RunMode::Unattended => Arc::new(NeverConfirm),
            };
            let push = sub.get_flag("push");
            let ports = rollguard_adapters::system_ports(&config, prompt, push);
            let report = Orchestrator::new(config, ports)
                .with_run_id(run_id)
                .with_log_file(log_file)
                .run(shutdown_signal())
                .await;
            emit(json, &report, report.render_text())?;
            Ok(report.exit_code())
        }
        "check" => {
            init_tracing(config.verbose, None)?;
            let ports = rollguard_adapters::system_ports(&config, Arc::new(NeverConfirm), false);
            let report = Orchestrator::new(config, ports).check().await;
            emit(json, &report, report.render_text())?;
            Ok(report.exit_code())
        }
        "verify" => {
            init_tracing(config.verbose, None)?;
            let ports = rollguard_adapters::system_ports(&config, Arc::new(NeverConfirm), false);
            let report = Orchestrator::new(config, ports).verify().await;
            emit(json, &report, report.render_text())?;
            Ok(report.exit_code())
        }
        other => bail!("unknown subcommand {other}"),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let code = match execute(matches).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rollguard: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (ArgMatches, ArgMatches) {
        let matches = cli().try_get_matches_from(args).unwrap();
        let sub = matches.subcommand().unwrap().1.clone();
        (matches, sub)
    }

    #[test]
    fn command_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let (matches, sub) = parse(&[
            "rollguard",
            "run",
            "--interactive",
            "--dry-run",
            "--skip-secondary",
            "--target",
            "monitoring/grafana",
            "--context",
            "staging",
        ]);
        let config = load_config(&matches, &sub).unwrap();

        assert_eq!(config.mode, RunMode::Interactive);
        assert!(config.dry_run);
        assert!(config.skip_secondary);
        assert!(!config.skip_deploy);
        assert_eq!(config.kube_context.as_deref(), Some("staging"));
        assert_eq!(config.targets, vec![TargetSpec::new("grafana", "monitoring")]);
    }

    #[test]
    fn interactive_conflicts_with_unattended() {
        assert!(cli()
            .try_get_matches_from(["rollguard", "run", "--interactive", "--unattended"])
            .is_err());
    }

    #[test]
    fn check_has_no_run_flags() {
        assert!(cli().try_get_matches_from(["rollguard", "check", "--dry-run"]).is_err());
    }

    #[test]
    fn no_targets_is_rejected() {
        let (matches, sub) = parse(&["rollguard", "check"]);
        assert!(load_config(&matches, &sub).is_err());
    }

    #[test]
    fn config_file_targets_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollguard.toml");
        std::fs::write(
            &path,
            "expected_branch = \"release\"\n\n[[targets]]\nname = \"loki\"\nnamespace = \"logging\"\n",
        )
        .unwrap();

        let (matches, sub) = parse(&["rollguard", "verify", "--config", path.to_str().unwrap()]);
        let config = load_config(&matches, &sub).unwrap();

        assert_eq!(config.targets[0].name, "loki");
    }

    #[test]
    fn target_needs_namespace() {
        assert!(parse_target("grafana").is_err());
        assert!(parse_target("/grafana").is_err());
        assert_eq!(parse_target("monitoring/grafana").unwrap().namespace, "monitoring");
    }
}
