use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use videogen_gateway::db::{self, credential_queries};
use videogen_gateway::models::credential::Credential;
use videogen_gateway::services::auth::{generate_api_key, hash_api_key};

/// Manage API credentials for the video generation gateway
#[derive(Parser, Debug)]
#[command(name = "keyadmin", version)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a credential and print its key once
    Create {
        /// Human-readable owner of the key
        #[arg(long)]
        label: String,

        /// Requests allowed per rolling minute
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(i32).range(1..))]
        rate_limit: i32,
    },

    /// Deactivate a credential. Its jobs are kept.
    Revoke {
        #[arg(long)]
        id: Uuid,
    },

    /// List credentials without secrets
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), sqlx::Error> {
    let pool = db::init_pool(&cli.database_url, 2).await?;
    db::run_migrations(&pool).await?;

    match cli.command {
        Command::Create { label, rate_limit } => {
            let key = generate_api_key();
            let credential = Credential::new(hash_api_key(&key), &label, rate_limit);
            credential_queries::insert(&pool, &credential).await?;
            tracing::info!(credential_id = %credential.id, label = %label, "Created credential");

            println!("id:         {}", credential.id);
            println!("label:      {}", credential.label);
            println!("rate limit: {}/min", credential.rate_limit_per_minute);
            println!("api key:    {key}");
            println!();
            println!("Store the key now; it cannot be shown again.");
        }
        Command::Revoke { id } => {
            if credential_queries::deactivate(&pool, id).await? {
                tracing::info!(credential_id = %id, "Revoked credential");
                println!("revoked {id}");
            } else {
                eprintln!("no credential with id {id}");
                std::process::exit(2);
            }
        }
        Command::List => {
            let credentials = credential_queries::list(&pool).await?;
            println!(
                "{:<36}  {:<24}  {:<8}  {:>6}  {:>10}  LAST USED",
                "ID", "LABEL", "ACTIVE", "LIMIT", "REQUESTS"
            );
            for c in credentials {
                println!(
                    "{:<36}  {:<24}  {:<8}  {:>6}  {:>10}  {}",
                    c.id,
                    c.label,
                    c.is_active,
                    c.rate_limit_per_minute,
                    c.total_requests,
                    c.last_used_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
    }
    Ok(())
}
