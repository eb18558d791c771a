use clap::{Parser, Subcommand};
use db_backup::backup::config::AppConfig;
use db_backup::backup::orchestrator::cancel::CancelToken;
use db_backup::backup::result_error::class::ErrorClass;
use db_backup::backup::result_error::result::Result;
use db_backup::backup::scheduler::Runner;
use itertools::Itertools;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, Level};

/// Scheduled MySQL/MariaDB backups with retention
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: Level,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up every target, or only the given ones, once
    Run {
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },
    /// Back up every target on its schedule until interrupted
    Daemon,
    /// Print the stored artifacts of a target
    List {
        #[arg(short, long)]
        target: String,
    },
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
fn cancel_on_signal(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(wait_for_signal());
            info!("Signal received, cancelling running backups");
            cancel.cancel();
        })?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run(config: &AppConfig, command: Command) -> Result<i32> {
    let runner = Runner::from_config(config)?;
    match command {
        Command::Run { targets } => {
            let cancel = CancelToken::new();
            cancel_on_signal(cancel.clone())?;
            let ids = targets.iter().map(String::as_str).collect_vec();
            let report = runner.run_once(&ids, &cancel)?;
            println!("{report}");
            Ok(report.exit_code())
        }
        Command::Daemon => {
            let cancel = CancelToken::new();
            cancel_on_signal(cancel.clone())?;
            let worst = runner.daemon(&cancel)?;
            Ok(worst.map(ErrorClass::exit_code).unwrap_or(0))
        }
        Command::List { target } => {
            for artifact in runner.list(&target)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    artifact.key,
                    artifact.created_at.to_rfc3339(),
                    artifact.size,
                    artifact
                        .uncompressed_size
                        .map(|size| size.to_string())
                        .unwrap_or_else(|| "-".into()),
                    artifact
                        .checksum
                        .as_ref()
                        .map(|digest| digest.to_string())
                        .unwrap_or_else(|| "-".into()),
                    artifact.status
                );
            }
            Ok(0)
        }
    }
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(ErrorClass::PermanentConfig.exit_code());
        }
    };

    let code = match run(&config, args.command) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            e.class().exit_code()
        }
    };
    exit(code);
}
