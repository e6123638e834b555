//! whatsflow-cli: operator CLI for the Whatsflow control plane
//!
//! Talks to the server's HTTP API.
//!
//! # Subcommands
//! - `sessions`: list sessions
//! - `create <name> [-d <description>]`: create a session
//! - `show <id>`: session record plus process view
//! - `restart <id>`, `delete <id>`
//! - `send-text <id> <chat_id> <message>`: send a text message
//! - `status`: show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "whatsflow-cli",
    version,
    about = "Manage Whatsflow connector sessions"
)]
struct Cli {
    /// Whatsflow HTTP server URL (overrides WHATSFLOW_HTTP_URL env var)
    #[arg(long, env = "WHATSFLOW_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List sessions
    Sessions,

    /// Create a session and launch its connector
    Create {
        name: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Show one session and its connector process
    Show { id: i64 },

    /// Reset a session to disconnected and relaunch its connector
    Restart { id: i64 },

    /// Delete a session, its webhooks and its connector
    Delete { id: i64 },

    /// Send a text message through a connected session
    SendText {
        id: i64,
        chat_id: String,
        message: String,
    },

    /// Show Whatsflow server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub qr_code: Option<String>,
    pub updated_at: Option<String>,
}

/// One line per session: id, name, status and a pairing hint.
pub fn format_session_line(s: &SessionSummary) -> String {
    let mut line = format!("{:>4}  {:<24} {}", s.id, s.name, s.status);
    if s.status == "awaiting_qr" && s.qr_code.is_some() {
        line.push_str("  (scan QR: whatsflow-cli show ");
        line.push_str(&s.id.to_string());
        line.push(')');
    }
    line
}

/// Server error bodies look like `{"error": "...", "status": "error"}`.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    server: String,
    client: reqwest::blocking::Client,
    json: bool,
}

impl Api {
    fn new(server: &str, json: bool) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            // media sends can take minutes on the connector side
            .timeout(std::time::Duration::from_secs(200))
            .build()?;
        Ok(Self {
            server: server.to_string(),
            client,
            json,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.server, path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = match req.send() {
            Ok(r) => r,
            Err(e) => {
                eprintln!("whatsflow-cli: connection failed to {}: {}", url, e);
                std::process::exit(1);
            }
        };

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            eprintln!("whatsflow-cli: server returned {}: {}", status, error_message(&text));
            std::process::exit(1);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    fn print_raw(&self, value: &Value) -> anyhow::Result<bool> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(self.json)
    }
}

fn do_sessions(api: &Api) -> anyhow::Result<()> {
    let body = api.request(reqwest::Method::GET, "/sessions", None)?;
    if api.print_raw(&body)? {
        return Ok(());
    }
    let sessions: Vec<SessionSummary> = serde_json::from_value(body)?;
    if sessions.is_empty() {
        eprintln!("No sessions");
        return Ok(());
    }
    for s in &sessions {
        println!("{}", format_session_line(s));
    }
    Ok(())
}

fn do_create(api: &Api, name: &str, description: Option<String>) -> anyhow::Result<()> {
    let body = api.request(
        reqwest::Method::POST,
        "/sessions",
        Some(json!({ "name": name, "description": description })),
    )?;
    if api.print_raw(&body)? {
        return Ok(());
    }
    let session: SessionSummary = serde_json::from_value(body)?;
    println!("Created session {} ({})", session.id, session.name);
    Ok(())
}

fn do_show(api: &Api, id: i64) -> anyhow::Result<()> {
    let session = api.request(reqwest::Method::GET, &format!("/sessions/{}", id), None)?;
    let process = api.request(reqwest::Method::GET, &format!("/sessions/{}/process", id), None)?;
    if api.print_raw(&json!({ "session": session, "process": process }))? {
        return Ok(());
    }

    let s: SessionSummary = serde_json::from_value(session)?;
    println!("Session:     {} ({})", s.id, s.name);
    if let Some(d) = &s.description {
        println!("Description: {}", d);
    }
    println!("Status:      {}", s.status);
    println!("Updated:     {}", s.updated_at.as_deref().unwrap_or("?"));
    println!(
        "Connector:   {} (pid {}, restarts {})",
        if process["running"].as_bool().unwrap_or(false) { "running" } else { "stopped" },
        process["pid"].as_u64().map_or("-".to_string(), |p| p.to_string()),
        process["restarts"].as_u64().unwrap_or(0),
    );
    if let Some(qr) = &s.qr_code {
        println!("\nQR code:\n{}", qr);
    }
    Ok(())
}

fn do_simple(api: &Api, method: reqwest::Method, path: &str, body: Option<Value>) -> anyhow::Result<()> {
    let resp = api.request(method, path, body)?;
    if api.print_raw(&resp)? {
        return Ok(());
    }
    println!("{}", resp["message"].as_str().unwrap_or("ok"));
    Ok(())
}

fn do_send_text(api: &Api, id: i64, chat_id: &str, message: &str) -> anyhow::Result<()> {
    let resp = api.request(
        reqwest::Method::POST,
        &format!("/sessions/{}/send-text", id),
        Some(json!({ "chatId": chat_id, "message": message })),
    )?;
    if api.print_raw(&resp)? {
        return Ok(());
    }
    match resp["messageId"].as_str() {
        Some(mid) => println!("Sent ({})", mid),
        None => println!("Sent"),
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(api: &Api) -> anyhow::Result<()> {
    let url = format!("{}/health", api.server);
    match api.client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: Value = r.json().unwrap_or_default();
            if api.print_raw(&body)? {
                return Ok(());
            }
            println!("Whatsflow server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:          {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:            {}", body["store"].as_str().unwrap_or("?"));
            println!("Backend:          {}", body["backend"].as_str().unwrap_or("?"));
            println!("Connectors up:    {}", body["connectors_running"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            eprintln!("whatsflow-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("whatsflow-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = Api::new(&server, cli.json).and_then(|api| match cli.command {
        Commands::Sessions => do_sessions(&api),
        Commands::Create { name, description } => do_create(&api, &name, description),
        Commands::Show { id } => do_show(&api, id),
        Commands::Restart { id } => {
            do_simple(&api, reqwest::Method::POST, &format!("/sessions/{}/restart", id), None)
        }
        Commands::Delete { id } => {
            do_simple(&api, reqwest::Method::DELETE, &format!("/sessions/{}", id), None)
        }
        Commands::SendText { id, chat_id, message } => do_send_text(&api, id, &chat_id, &message),
        Commands::Status => do_status(&api),
    });

    if let Err(e) = result {
        eprintln!("whatsflow-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
