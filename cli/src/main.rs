// blepd — BLE peripheral workbench
//
// Validates GATT service definitions and runs scripted peripheral sessions
// against the simulated radio stack.

mod config;
mod demo;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "blepd")]
#[command(about = "BLE peripheral workbench", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a service definition file
    Validate { file: PathBuf },
    /// Run a scripted session against the simulated radio
    Simulate {
        file: PathBuf,
        #[command(flatten)]
        options: SimulateArgs,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Local name placed in the advertisement
    #[arg(short, long)]
    name: Option<String>,
    /// Stop advertising after this many milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Raise requests over an encrypted link
    #[arg(short, long)]
    encrypted: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load()?;
    ble_peripheral_core::init_tracing(&settings.log_filter);

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => cmd_validate(file).await,
        Commands::Simulate { file, options } => cmd_simulate(file, options).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

async fn cmd_validate(file: PathBuf) -> Result<()> {
    let services = demo::load_services(&file)?;
    println!("{} Parsed {} service(s)", "✓".green(), services.len());

    let registered = demo::validate(&services).await?;
    println!("{} Registered on simulated radio", "✓".green());
    println!();

    println!("{}", "Service Tree".bold());
    demo::print_tree(&registered);

    Ok(())
}

async fn cmd_simulate(file: PathBuf, args: SimulateArgs) -> Result<()> {
    let settings = config::load()?;
    let services = demo::load_services(&file)?;

    println!("{}", "Simulated peripheral session".bold());
    println!();

    let summary = demo::simulate(
        &services,
        settings,
        demo::SimulateOptions {
            local_name: args.name,
            advertise_ms: args.timeout,
            encrypted: args.encrypted,
        },
    )
    .await?;

    println!();
    println!("{}", "Summary".bold());
    println!("  Services:      {}", summary.services);
    println!("  Reads:         {}", summary.reads);
    println!("  Writes:        {}", summary.writes);
    println!("  Notifications: {}", summary.notifications);
    if summary.rejected > 0 {
        println!("  Rejected:      {}", summary.rejected.to_string().bright_red());
    } else {
        println!("  Rejected:      {}", "0".dimmed());
    }

    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = config::load()?;
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config::list(&settings) {
                println!("  {:<32} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            let settings = config::load()?;
            if let Some(value) = config::get(&settings, &key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config::set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", config::settings_file()?.display());
        }
    }

    Ok(())
}
