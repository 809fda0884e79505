use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ommi::config::{Backend, DatabaseConfig};
use ommi::Database;
use std::path::PathBuf;

/// Inspect and check the databases ommi knows about
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Saved databases file (defaults to the user config directory)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List saved databases
    List,
    /// Connect to a saved database and run a trivial query
    Ping {
        /// Name of the saved database
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(DatabaseConfig::get_config_path);
    let saved = DatabaseConfig::load_saved(&path)?;

    match cli.command {
        Command::List => {
            if saved.is_empty() {
                println!("No saved databases in {}", path.display());
            }
            for config in &saved {
                println!("{:<20} {}", config.name, config.display_string());
            }
        }
        Command::Ping { name } => {
            let Some(mut config) = DatabaseConfig::find(saved, &name) else {
                bail!("no saved database named {:?} in {}", name, path.display());
            };

            // Resolve password: PGPASSWORD env var, then interactive prompt
            if let Backend::Postgres(pg) = &mut config.backend {
                if pg.password.is_empty() {
                    if let Ok(pw) = std::env::var("PGPASSWORD") {
                        pg.password = pw;
                    } else {
                        let prompt = format!("Password for {}: ", pg.display_string());
                        pg.password = rpassword::read_password_from_tty(Some(&prompt))?;
                    }
                }
            }

            let db = Database::connect(&config)
                .await
                .with_context(|| format!("Failed to connect to {}", config.name))?;
            db.ping()
                .await
                .value()
                .with_context(|| format!("Ping to {} failed", config.name))?;
            println!("{}: ok ({})", config.name, db.driver().name());
        }
    }

    Ok(())
}
