//! Parklane CLI — operator client for the Parklane control plane.
//!
//! A standalone HTTP client. No internal crate dependencies — talks
//! exclusively via the REST API.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";

/// Parklane — smart parking, observable from the curb up.
#[derive(Parser)]
#[command(
    name = "parklane",
    version,
    about = "Parklane CLI — orphan devices, spaces, actuation, and health",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         PARKLANE_ADDR    Server address (default: http://127.0.0.1:8080)\n  \
         PARKLANE_TOKEN   Bearer credential (access token or plk_ service key)\n\n\
         {DIM}Examples:{RESET}\n  \
         parklane login --email ops@acme.example\n  \
         parklane orphans list\n  \
         parklane orphans assign 70B3D57ED0001234 --role sensor --device-type motion-sensor\n  \
         parklane actuate 7b0c…e1 --force-state MAINTENANCE"
    ),
)]
struct Cli {
    /// Parklane server address.
    #[arg(long, env = "PARKLANE_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Bearer credential.
    #[arg(long, env = "PARKLANE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in with email + password and print a token pair.
    Login {
        #[arg(long)]
        email: String,
        /// Prompted for if not given.
        #[arg(long)]
        password: Option<String>,
        /// Tenant slug, required when you belong to several tenants.
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Orphan device operations.
    Orphans {
        #[command(subcommand)]
        command: OrphansCommand,
    },
    /// List the tenant's spaces.
    Spaces,
    /// Push the current (or a forced) display target for a space.
    Actuate {
        /// Space id.
        space_id: String,
        /// FREE, OCCUPIED, RESERVED, or MAINTENANCE.
        #[arg(long)]
        force_state: Option<String>,
    },
    /// Liveness and readiness of the server.
    Health,
}

#[derive(Subcommand)]
enum OrphansCommand {
    /// List EUIs heard on the wire but not registered.
    List,
    /// Register an orphan under your tenant.
    Assign {
        eui: String,
        #[arg(long, value_parser = ["sensor", "display"])]
        role: String,
        #[arg(long)]
        device_type: String,
        /// Bind the device to this space immediately.
        #[arg(long)]
        space: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new(&cli.addr, cli.token.clone());
    match cli.command {
        Command::Login {
            email,
            password,
            tenant,
        } => login(&client, &email, password, tenant).await,
        Command::Orphans { command } => match command {
            OrphansCommand::List => orphans_list(&client).await,
            OrphansCommand::Assign {
                eui,
                role,
                device_type,
                space,
            } => orphans_assign(&client, &eui, &role, &device_type, space).await,
        },
        Command::Spaces => spaces_list(&client).await,
        Command::Actuate {
            space_id,
            force_state,
        } => actuate(&client, &space_id, force_state).await,
        Command::Health => health(&client).await,
    }
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Client {
    fn new(addr: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn expect_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::String("<no body>".to_owned()));
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }
}

// ── Commands ─────────────────────────────────────────────────────────

async fn login(
    client: &Client,
    email: &str,
    password: Option<String>,
    tenant: Option<String>,
) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => rpassword_prompt("password: ")?,
    };
    let response = client
        .request(reqwest::Method::POST, "/auth/login")
        .json(&serde_json::json!({
            "email": email,
            "password": password,
            "tenant_slug": tenant,
        }))
        .send()
        .await
        .context("login request failed")?;
    let body = Client::expect_json(response).await?;

    println!("{GREEN}{BOLD}✓{RESET} logged in");
    println!("  {DIM}tenant{RESET}        {}", body["tenant_id"]);
    println!("  {DIM}role{RESET}          {}", body["role"]);
    println!("  {DIM}access token{RESET}  {}", body["access_token"]);
    println!("  {DIM}refresh token{RESET} {}", body["refresh_token"]);
    println!();
    println!("{DIM}export PARKLANE_TOKEN={}{RESET}", trimmed(&body["access_token"]));
    Ok(())
}

async fn orphans_list(client: &Client) -> Result<()> {
    let response = client
        .request(reqwest::Method::GET, "/orphan-devices")
        .send()
        .await
        .context("request failed")?;
    let body = Client::expect_json(response).await?;

    let Some(orphans) = body.as_array() else {
        bail!("unexpected response shape");
    };
    if orphans.is_empty() {
        println!("no orphan devices");
        return Ok(());
    }
    println!(
        "{BOLD}{:<18} {:>8} {:>8}  {:<20}{RESET}",
        "EUI", "FCNT", "UPLINKS", "LAST SEEN"
    );
    for orphan in orphans {
        println!(
            "{:<18} {:>8} {:>8}  {:<20}",
            trimmed(&orphan["eui"]),
            orphan["last_fcnt"],
            orphan["uplink_count"],
            trimmed(&orphan["last_seen_at"]),
        );
    }
    Ok(())
}

async fn orphans_assign(
    client: &Client,
    eui: &str,
    role: &str,
    device_type: &str,
    space: Option<String>,
) -> Result<()> {
    let response = client
        .request(
            reqwest::Method::POST,
            &format!("/orphan-devices/{eui}/assign"),
        )
        .json(&serde_json::json!({
            "role": role,
            "device_type": device_type,
            "space_id": space,
        }))
        .send()
        .await
        .context("request failed")?;
    let body = Client::expect_json(response).await?;
    println!(
        "{GREEN}{BOLD}✓{RESET} registered {} as {} ({})",
        trimmed(&body["eui"]),
        trimmed(&body["role"]),
        trimmed(&body["device_type"]),
    );
    Ok(())
}

async fn spaces_list(client: &Client) -> Result<()> {
    let response = client
        .request(reqwest::Method::GET, "/spaces")
        .send()
        .await
        .context("request failed")?;
    let body = Client::expect_json(response).await?;

    let Some(spaces) = body.as_array() else {
        bail!("unexpected response shape");
    };
    println!("{BOLD}{:<10} {:<14} {:<38}{RESET}", "CODE", "STATE", "ID");
    for space in spaces {
        println!(
            "{:<10} {:<14} {:<38}",
            trimmed(&space["code"]),
            trimmed(&space["state"]),
            trimmed(&space["id"]),
        );
    }
    Ok(())
}

async fn actuate(client: &Client, space_id: &str, force_state: Option<String>) -> Result<()> {
    let response = client
        .request(
            reqwest::Method::POST,
            &format!("/spaces/{space_id}/actuate"),
        )
        .json(&serde_json::json!({ "force_state": force_state }))
        .send()
        .await
        .context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        let _ = Client::expect_json(response).await?;
        bail!("{status}");
    }
    println!("{GREEN}{BOLD}✓{RESET} downlink enqueued");
    Ok(())
}

async fn health(client: &Client) -> Result<()> {
    let response = client
        .request(reqwest::Method::GET, "/health/ready")
        .send()
        .await
        .context("server unreachable")?;
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    let marker = if status.is_success() {
        format!("{GREEN}{BOLD}✓{RESET}")
    } else {
        format!("{RED}{BOLD}✗{RESET}")
    };
    println!("{marker} {status}");
    println!("  {DIM}database{RESET}      {}", body["database"]);
    println!("  {DIM}coordination{RESET}  {}", body["coordination"]);
    println!("  {DIM}spool pending{RESET} {}", body["spool_pending"]);
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

/// JSON string without the surrounding quotes.
fn trimmed(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Minimal hidden-input prompt (no extra dependency): reads a line with
/// echo left on — fine for operator tooling over SSH, documented as such.
fn rpassword_prompt(prompt: &str) -> Result<String> {
    use std::io::Write as _;
    print!("{prompt}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}
