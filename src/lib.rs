//! devicetrust CLI library

pub mod commands;
pub mod context;
pub mod error;

pub use context::{App, GlobalArgs};
pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// devicetrust - device certificates and broker registration for mTLS fleets
#[derive(Parser, Debug)]
#[command(name = "devicetrust")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Issue a certificate for a new device and register it on the broker
    Register(commands::register::RegisterArgs),
    /// Show whether a device is registered
    Status(commands::status::StatusArgs),
    /// List registered device ids
    List,
    /// Remove a device's broker registration
    Unregister(commands::unregister::UnregisterArgs),
    /// Remove every device registration
    UnregisterAll(commands::unregister::UnregisterAllArgs),
    /// Print the CA certificate devices and the broker should trust
    CaCert(commands::ca::CaCertArgs),
    /// Summarize a PEM certificate and optionally check its issuer
    Inspect(commands::inspect::InspectArgs),
}

impl Cli {
    /// Run the CLI command and print its output
    pub async fn run(self) -> Result<()> {
        let output = match self.command {
            Commands::Inspect(args) => commands::inspect::run(args)?,
            command => {
                let app = App::from_args(&self.global)?;
                dispatch(&app, command).await?
            }
        };
        println!("{}", output);
        Ok(())
    }
}

/// Run a command that needs the coordinator, returning its rendered output
pub async fn dispatch(app: &App, command: Commands) -> Result<String> {
    match command {
        Commands::Register(args) => commands::register::run(app, args).await,
        Commands::Status(args) => commands::status::run(app, args).await,
        Commands::List => commands::status::list(app).await,
        Commands::Unregister(args) => commands::unregister::run(app, args).await,
        Commands::UnregisterAll(args) => commands::unregister::run_all(app, args).await,
        Commands::CaCert(args) => commands::ca::run(app, args),
        Commands::Inspect(args) => commands::inspect::run(args),
    }
}
