use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use visor_assistant::bus::{ActionFilter, ActionMessage};
use visor_assistant::detector::{Integrity, ProcessDetector};
use visor_assistant::{Config, Daemon};

/// Visor - voice assistant module supervisor and command dispatcher
#[derive(Parser)]
#[command(name = "visor", version, about)]
struct Cli {
    /// Config file (default: <config dir>/visor/config.toml)
    #[arg(short, long, env = "VISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one utterance through the command dispatcher
    Process {
        /// The utterance
        text: String,
        /// Treat the text as a partial recognition result
        #[arg(long)]
        partial: bool,
        /// Only report whether anything would be executed
        #[arg(long)]
        dry_run: bool,
    },
    /// List registered modules
    Modules {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Verify the command detector executable
    CheckDetector,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,visor_assistant=info",
        1 => "info,visor_assistant=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::Process {
            text,
            partial,
            dry_run,
        }) => cmd_process(config, &text, partial, dry_run),
        Some(Command::Modules { json }) => cmd_modules(config, json),
        Some(Command::CheckDetector) => cmd_check_detector(&config),
        None => {
            let daemon = Daemon::new(config)?;
            tracing::info!("visor ready - type an utterance per line, Ctrl-C to quit");
            daemon.run().await?;
            Ok(())
        }
    }
}

fn cmd_process(config: Config, text: &str, partial: bool, dry_run: bool) -> anyhow::Result<()> {
    let daemon = Daemon::new(config)?;
    let (_, mut rx) = daemon.bus().subscribe_channel(ActionFilter::All);

    let outcome = daemon.engine().process_utterance(text, partial, dry_run);

    while let Ok(message) = rx.try_recv() {
        match message {
            ActionMessage::Speak { text, .. } => println!("visor: {text}"),
            other => println!("action: {other}"),
        }
    }
    println!("{outcome}");
    Ok(())
}

fn cmd_modules(config: Config, json: bool) -> anyhow::Result<()> {
    let daemon = Daemon::new(config)?;
    let registry = daemon.registry();

    let mut modules = registry.list();
    for module in &mut modules {
        module.status.supported = registry.is_supported(&module.id)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
        return Ok(());
    }

    println!("{:<20} {:<10} SUPPORTED", "MODULE", "KIND");
    for module in &modules {
        println!(
            "{:<20} {:<10} {}",
            module.id,
            module.kind.to_string(),
            if module.status.supported { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn cmd_check_detector(config: &Config) -> anyhow::Result<()> {
    let detector = ProcessDetector::new(&config.detector);
    let Some(command) = detector.command() else {
        anyhow::bail!("no detector configured (set VISOR_DETECTOR or detector.command)");
    };

    match detector.verify()? {
        Integrity::Missing => anyhow::bail!("detector not found: {}", command.display()),
        Integrity::Unpinned { digest } => {
            println!("{}: usable (no allow-list)", command.display());
            println!("sha512: {digest}");
        }
        Integrity::Verified { digest } => {
            println!("{}: verified", command.display());
            println!("sha512: {digest}");
        }
        Integrity::Mismatch { digest } => {
            anyhow::bail!(
                "{}: digest {digest} is not on the allow-list",
                command.display()
            );
        }
    }
    Ok(())
}
