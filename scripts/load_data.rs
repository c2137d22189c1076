//! Seed script for the carbon usage store
//!
//! Adds the default usage type catalog (skipping names already present) and,
//! with `--demo-user`, a demo account holding a few usages.
//! Run: cargo run --bin load_data [-- --demo-user alice --password zerocarbon]

use chrono::{Duration, Utc};
use clap::Parser;
use std::path::PathBuf;

use carbon_usage::auth::{hash_password, provision_credential};
use carbon_usage::config::Settings;
use carbon_usage::models::User;
use carbon_usage::storage::Storage;
use carbon_usage::telemetry;

const DEFAULT_USAGE_TYPES: [(&str, &str); 4] = [
    ("driving", "kilometers"),
    ("flying", "kilometers"),
    ("sailing", "nautical miles"),
    ("electricity", "kilowatts"),
];

#[derive(Parser)]
#[command(name = "load_data", about = "Seed the carbon usage store")]
struct Args {
    /// Sled database directory (overrides CARBON_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Also create this user with sample usages
    #[arg(long)]
    demo_user: Option<String>,
    #[arg(long, default_value = "zerocarbon")]
    password: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::from_env()?;
    let _log_guard = telemetry::init(&settings.log);

    let data_dir = args.data_dir.unwrap_or(settings.data_dir);
    let storage = Storage::open(&data_dir)?;

    let existing = storage.list_usage_types()?;
    let mut catalog = Vec::new();
    for (name, unit) in DEFAULT_USAGE_TYPES {
        let usage_type = match existing.iter().find(|usage_type| usage_type.name == name) {
            Some(found) => found.clone(),
            None => {
                let created = storage.create_usage_type(name, unit)?;
                tracing::info!(id = created.id, name, unit, "seeded usage type");
                created
            }
        };
        catalog.push(usage_type);
    }

    if let Some(username) = args.demo_user {
        if storage.get_user(&username)?.is_none() {
            storage.create_user(&User {
                username: username.clone(),
                password_hash: hash_password(&args.password, settings.bcrypt_cost)?,
                date_joined: Utc::now(),
            })?;
            let now = Utc::now().fixed_offset();
            for (days_ago, usage_type) in catalog.iter().enumerate() {
                storage.create_usage(&username, usage_type.id, now - Duration::days(days_ago as i64))?;
            }
            tracing::info!(%username, usages = catalog.len(), "created demo user");
        }
        let token = provision_credential(&storage, &username)?;
        println!("Demo user {} token: {}", username, token);
    }

    storage.flush().await?;
    println!("✅ Catalog ready: {} usage types in {}", catalog.len(), data_dir.display());
    Ok(())
}
