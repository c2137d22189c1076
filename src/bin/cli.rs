use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;

const TOKEN_FILE: &str = ".carbon_token";

#[derive(Parser)]
#[command(name = "carbon-cli")]
#[command(about = "CLI for the carbon usage API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:8000")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Signup {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// List usage types
    Types {
        #[arg(short, long)]
        page: Option<String>,
        #[arg(short, long)]
        ordering: Option<String>,
    },
    AddType {
        #[arg(short, long)]
        name: String,
        #[arg(short = 'U', long)]
        unit: String,
    },
    UpdateType {
        #[arg(short, long)]
        id: u64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short = 'U', long)]
        unit: Option<String>,
    },
    DeleteType {
        #[arg(short, long)]
        id: u64,
    },
    /// List your usages
    Usages {
        #[arg(short, long)]
        page: Option<String>,
        #[arg(short, long)]
        ordering: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Record a usage; `--at` defaults to now
    Log {
        #[arg(short = 't', long = "type")]
        usage_type: u64,
        #[arg(short, long)]
        at: Option<String>,
    },
    UpdateUsage {
        #[arg(short, long)]
        id: u64,
        #[arg(short = 't', long = "type")]
        usage_type: Option<u64>,
        #[arg(short, long)]
        at: Option<String>,
    },
    DeleteUsage {
        #[arg(short, long)]
        id: u64,
    },
    Logout,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

fn authorized(builder: RequestBuilder) -> RequestBuilder {
    let token = fs::read_to_string(TOKEN_FILE).unwrap_or_default();
    builder.header("Authorization", format!("Token {}", token.trim()))
}

/// Body with only the fields that were given, for PATCH.
fn changes(fields: &[(&str, Option<Value>)]) -> Value {
    let map: Map<String, Value> = fields
        .iter()
        .filter_map(|(key, value)| value.clone().map(|value| (key.to_string(), value)))
        .collect();
    Value::Object(map)
}

fn query(pairs: &[(&str, &Option<String>)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|value| (key.to_string(), value.clone())))
        .collect()
}

async fn print_response(res: Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => println!("{}\n{}", status, serde_json::to_string_pretty(&body)?),
        Err(_) => println!("{}\n{}", status, text),
    }
    Ok(())
}

async fn save_token(res: Response) -> Result<(), Box<dyn std::error::Error>> {
    if res.status().is_success() {
        let body: TokenResponse = res.json().await?;
        fs::write(TOKEN_FILE, body.token)?;
        println!("Token saved to {}", TOKEN_FILE);
        Ok(())
    } else {
        print_response(res).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let types_url = format!("{}/carbon_usage/usage_type/", cli.url);
    let usages_url = format!("{}/carbon_usage/usage/", cli.url);

    match cli.command {
        Commands::Signup { username, password } => {
            let res = client
                .post(format!("{}/signup/", cli.url))
                .json(&json!({ "username": username, "password1": password, "password2": password }))
                .send()
                .await?;
            save_token(res).await?;
        }
        Commands::Login { username, password } => {
            let res = client
                .post(format!("{}/api-token-auth/", cli.url))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?;
            save_token(res).await?;
        }
        Commands::Types { page, ordering } => {
            let res = authorized(client.get(&types_url))
                .query(&query(&[("page", &page), ("ordering", &ordering)]))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::AddType { name, unit } => {
            let res = authorized(client.post(&types_url))
                .json(&json!({ "name": name, "unit": unit }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::UpdateType { id, name, unit } => {
            let body = changes(&[("name", name.map(Value::from)), ("unit", unit.map(Value::from))]);
            let res = authorized(client.patch(format!("{}{}/", types_url, id)))
                .json(&body)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::DeleteType { id } => {
            let res = authorized(client.delete(format!("{}{}/", types_url, id)))
                .send()
                .await?;
            println!("Response: {}", res.status());
        }
        Commands::Usages {
            page,
            ordering,
            start,
            end,
        } => {
            let res = authorized(client.get(&usages_url))
                .query(&query(&[
                    ("page", &page),
                    ("ordering", &ordering),
                    ("timerange_start", &start),
                    ("timerange_end", &end),
                ]))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Log { usage_type, at } => {
            let at = at.unwrap_or_else(|| chrono::Local::now().fixed_offset().to_rfc3339());
            let res = authorized(client.post(&usages_url))
                .json(&json!({ "usage_type": usage_type, "usage_at": at }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::UpdateUsage { id, usage_type, at } => {
            let body = changes(&[
                ("usage_type", usage_type.map(Value::from)),
                ("usage_at", at.map(Value::from)),
            ]);
            let res = authorized(client.patch(format!("{}{}/", usages_url, id)))
                .json(&body)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::DeleteUsage { id } => {
            let res = authorized(client.delete(format!("{}{}/", usages_url, id)))
                .send()
                .await?;
            println!("Response: {}", res.status());
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out");
        }
    }

    Ok(())
}
