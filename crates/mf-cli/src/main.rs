//! # mf — MONGOFRAME CLI
//!
//! - `mf query --file request.json` — Send a query request to a hub and
//!   print the frames.
//! - `mf translate LAYOUT` — Show the MongoDB format for a date layout.
//! - `mf pipeline --model model.json` — Print the compiled pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;

use mf_core::datefmt::layout_to_mongo;
use mf_core::QueryModel;

/// MONGOFRAME: MongoDB aggregations as data frames.
#[derive(Parser)]
#[command(name = "mf", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Post a query request to a hub and print every frame.
    Query {
        /// Hub base URL.
        #[arg(long, env = "MF_HUB_URL", default_value = "http://127.0.0.1:3100")]
        hub: String,

        /// Request body (JSON `QueryDataRequest`).
        #[arg(long)]
        file: PathBuf,

        /// Print the raw JSON response instead of tables.
        #[arg(long)]
        json: bool,
    },

    /// Translate a reference-time layout to MongoDB format specifiers.
    Translate { layout: String },

    /// Compile a query model into its aggregation pipeline.
    Pipeline {
        /// Query model JSON file.
        #[arg(long)]
        model: PathBuf,

        /// Range start (RFC 3339). Defaults to one hour before `--to`.
        #[arg(long)]
        from: Option<String>,

        /// Range end (RFC 3339). Defaults to now.
        #[arg(long)]
        to: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Translate { layout } => layout_to_mongo(&layout)
            .map(|format| println!("{}", format))
            .map_err(|e| e.to_string()),
        Commands::Pipeline { model, from, to } => {
            pipeline(&model, from.as_deref(), to.as_deref()).map(|out| println!("{}", out))
        }
        Commands::Query { hub, file, json } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to build tokio runtime: {}", e))
            .and_then(|rt| rt.block_on(query(&hub, &file, json))),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Offline Commands
// =============================================================================

fn parse_time(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("Invalid time {:?}: {}", text, e))
}

fn pipeline(model: &Path, from: Option<&str>, to: Option<&str>) -> Result<String, String> {
    let content = std::fs::read_to_string(model)
        .map_err(|e| format!("Failed to read {}: {}", model.display(), e))?;
    let model: QueryModel =
        serde_json::from_str(&content).map_err(|e| format!("Invalid query JSON: {}", e))?;
    model.validate().map_err(|e| e.to_string())?;

    let to = to.map(parse_time).transpose()?.unwrap_or_else(Utc::now);
    let from = from
        .map(parse_time)
        .transpose()?
        .unwrap_or(to - chrono::Duration::hours(1));

    let stages = model.pipeline(&from, &to).map_err(|e| e.to_string())?;
    render_pipeline(stages)
}

fn render_pipeline(stages: Vec<Document>) -> Result<String, String> {
    let array = Bson::Array(stages.into_iter().map(Bson::Document).collect());
    serde_json::to_string_pretty(&array.into_relaxed_extjson()).map_err(|e| e.to_string())
}

// =============================================================================
// Hub Commands
// =============================================================================

async fn query(hub: &str, file: &Path, raw: bool) -> Result<(), String> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let payload: Value =
        serde_json::from_str(&content).map_err(|e| format!("Invalid request JSON: {}", e))?;

    let url = format!("{}/api/ds/query", hub.trim_end_matches('/'));
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| format!("Request to {} failed: {}", url, e))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("Hub answered {}: {}", status, body));
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| format!("Invalid response: {}", e))?;

    if raw {
        let pretty = serde_json::to_string_pretty(&body).map_err(|e| e.to_string())?;
        println!("{}", pretty);
    } else {
        print!("{}", render_response(&body));
    }
    Ok(())
}

fn render_response(body: &Value) -> String {
    let mut out = String::new();
    let Some(results) = body.get("results").and_then(Value::as_object) else {
        return out;
    };
    for (ref_id, result) in results {
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            out.push_str(&format!("[{}] error: {}\n", ref_id, error));
            continue;
        }
        let frames = result
            .get("frames")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        out.push_str(&format!("[{}] {} frame(s)\n", ref_id, frames.len()));
        for frame in frames {
            out.push_str(&render_frame(frame));
            out.push('\n');
        }
    }
    out
}

fn render_frame(frame: &Value) -> String {
    let name = frame.get("name").and_then(Value::as_str).unwrap_or_default();
    let fields = frame
        .get("fields")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let header: Vec<String> = fields
        .iter()
        .map(|f| {
            let field = f.get("name").and_then(Value::as_str).unwrap_or_default();
            match f.get("type").and_then(Value::as_str) {
                Some(t) => format!("{} ({})", field, t),
                None => field.to_string(),
            }
        })
        .collect();
    let columns: Vec<(&str, &[Value])> = fields
        .iter()
        .map(|f| {
            let kind = f.get("type").and_then(Value::as_str).unwrap_or_default();
            let values = f
                .get("values")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            (kind, values)
        })
        .collect();
    let rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);

    let mut builder = Builder::default();
    builder.push_record(header);
    for row in 0..rows {
        builder.push_record(
            columns
                .iter()
                .map(|(kind, values)| values.get(row).map(|v| cell(kind, v)).unwrap_or_default()),
        );
    }
    let mut table = builder.build();
    table.with(Style::rounded());

    let title = if name.is_empty() { "(no labels)" } else { name };
    format!("{}\n{}\n", title, table)
}

fn cell(kind: &str, value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) if kind.trim_start_matches('*') == "time" => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}
