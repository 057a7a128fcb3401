use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use execflow_control_plane::compiler::{analyze_document, lower, WorkflowDocument};
use execflow_control_plane::events::wire::SseParser;
use execflow_control_plane::events::{EventType, WorkflowStreamEventEnvelope};
use execflow_control_plane::execir::ExecProgram;

const DEFAULT_SERVER_URL: &str = "http://localhost:8090";
const MAX_RECONNECTS: u32 = 5;

#[derive(Parser)]
#[command(name = "execflowctl")]
#[command(version, about = "execflow command line tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control plane URL (default: $EXECFLOW_SERVER_URL or http://localhost:8090)
    #[arg(long, global = true)]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower a workflow document to ExecIR locally and print it
    Compile {
        /// Workflow document (JSON)
        file: PathBuf,

        /// Write the program here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Analyze a workflow document locally: order, cycles, unreachable nodes
    Check {
        /// Workflow document (JSON)
        file: PathBuf,
    },

    /// Start a run on the server and follow its events
    ///
    /// The file may hold a workflow document or a compiled ExecIR program.
    ///
    /// Examples:
    ///     execflowctl run ./flows/summarize.json --input topic=rust
    ///     execflowctl run ./program.json --ctx user.id=42 --detach
    #[command(verbatim_doc_comment)]
    Run {
        file: PathBuf,

        /// Run input (format: path=value, value parsed as JSON when possible), can be repeated
        #[arg(long = "input", value_name = "PATH=VALUE")]
        input: Vec<String>,

        /// Run context (format: path=value), can be repeated
        #[arg(long = "ctx", value_name = "PATH=VALUE")]
        ctx: Vec<String>,

        /// Print the run id and exit without following events
        #[arg(short, long)]
        detach: bool,
    },

    /// Answer a waiting run and follow it
    Resume {
        run_id: String,

        /// Input for the resumed run (format: path=value), can be repeated
        #[arg(long = "input", value_name = "PATH=VALUE")]
        input: Vec<String>,

        #[arg(long = "ctx", value_name = "PATH=VALUE")]
        ctx: Vec<String>,
    },

    /// Follow a run's event stream until it finishes
    Watch {
        run_id: String,

        /// Only show events after this seq
        #[arg(long, default_value_t = 0)]
        last_seq: u64,
    },

    /// Cancel a running or waiting run
    Cancel { run_id: String },
}

/// What to do when the stream reports `run.waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnWaiting {
    Exit,
    Follow,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let base_url = cli
        .server_url
        .or_else(|| std::env::var("EXECFLOW_SERVER_URL").ok())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let base_url = base_url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Compile { file, output } => {
            let program = lower(&read_document(&file)?)
                .with_context(|| format!("Failed to compile {}", file.display()))?;
            let rendered = serde_json::to_string_pretty(&program)?;
            match output {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {} nodes to {}", program.nodes.len(), path.display());
                }
                None => println!("{}", rendered),
            }
        }
        Commands::Check { file } => {
            let document = read_document(&file)?;
            let analysis = analyze_document(&document);
            println!("Execution order: {}", analysis.execution_order.join(" -> "));
            for cycle in &analysis.cycles {
                println!("Cycle: {}", cycle.join(", "));
            }
            if !analysis.unreachable.is_empty() {
                println!("Unreachable: {}", analysis.unreachable.join(", "));
            }
            match lower(&document) {
                Ok(program) => println!("OK: {} nodes, {} edges", program.nodes.len(), program.edges.len()),
                Err(e) => bail!("Workflow is invalid: {}", e),
            }
        }
        Commands::Run {
            file,
            input,
            ctx,
            detach,
        } => {
            let client = Client::new();
            let mut body = json!({
                "input": parse_assignments(&input)?,
                "ctx": parse_assignments(&ctx)?,
            });
            let source = read_json(&file)?;
            if is_program(&source) {
                let program: ExecProgram = serde_json::from_value(source)
                    .with_context(|| format!("{} is not a valid ExecIR program", file.display()))?;
                body["program"] = serde_json::to_value(program)?;
            } else {
                body["document"] = source;
            }

            let run = send(client.post(format!("{}/api/runs", base_url)).json(&body)).await?;
            let run_id = run["runId"].as_str().context("Server response has no runId")?;
            println!("Run {} started", run_id);
            if !detach {
                follow(&client, &base_url, run_id, 0, OnWaiting::Exit).await?;
            }
        }
        Commands::Resume { run_id, input, ctx } => {
            let client = Client::new();
            let before = send(client.get(format!("{}/api/runs/{}", base_url, run_id))).await?;
            let last_seq = before["lastSeq"].as_u64().unwrap_or(0);

            let body = json!({
                "input": parse_assignments(&input)?,
                "ctx": parse_assignments(&ctx)?,
            });
            send(
                client
                    .post(format!("{}/api/runs/{}/resume", base_url, run_id))
                    .json(&body),
            )
            .await?;
            println!("Run {} resumed", run_id);
            follow(&client, &base_url, &run_id, last_seq, OnWaiting::Exit).await?;
        }
        Commands::Watch { run_id, last_seq } => {
            let client = Client::new();
            follow(&client, &base_url, &run_id, last_seq, OnWaiting::Follow).await?;
        }
        Commands::Cancel { run_id } => {
            let client = Client::new();
            let run = send(client.post(format!("{}/api/runs/{}/cancel", base_url, run_id))).await?;
            println!(
                "Run {}: {}",
                run_id,
                run["status"].as_str().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn read_document(path: &Path) -> Result<WorkflowDocument> {
    serde_json::from_value(read_json(path)?)
        .with_context(|| format!("{} is not a workflow document", path.display()))
}

/// Compiled programs carry an entry node; editor documents never do.
fn is_program(value: &Value) -> bool {
    value.get("entry_node").is_some()
}

/// Build an object from `a.b=value` assignments. Values that parse as JSON
/// keep their type; anything else is a string.
fn parse_assignments(pairs: &[String]) -> Result<Value> {
    let mut root = Map::new();
    for pair in pairs {
        let (path, raw) = pair
            .split_once('=')
            .with_context(|| format!("Expected PATH=VALUE, got '{}'", pair))?;
        if path.is_empty() {
            bail!("Empty path in '{}'", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = segments.split_last().context("Empty path")?;
        let mut current = &mut root;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry
                .as_object_mut()
                .context("Assignment path crosses a non-object")?;
        }
        current.insert(last.to_string(), value);
    }
    Ok(Value::Object(root))
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value> {
    let response = request.send().await.context("Failed to reach the control plane")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        bail!("{} ({})", message, status);
    }
    Ok(body)
}

/// Stream events after `last_seq`, reconnecting from the last seen seq when
/// the connection drops.
async fn follow(
    client: &Client,
    base_url: &str,
    run_id: &str,
    mut last_seq: u64,
    on_waiting: OnWaiting,
) -> Result<()> {
    let mut reconnects = 0;
    loop {
        let url = format!("{}/api/runs/{}/events?lastSeq={}", base_url, run_id, last_seq);
        let response = client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to open event stream")?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("Run {} not found", run_id);
        }
        if !response.status().is_success() {
            bail!("Event stream failed with {}", response.status());
        }

        let mut parser = SseParser::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!(error = %e, "event stream interrupted");
                    break;
                }
            };
            pending.extend_from_slice(&chunk);
            let valid = match std::str::from_utf8(&pending) {
                Ok(text) => text.len(),
                Err(e) => e.valid_up_to(),
            };
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);

            for frame in parser.push(&text) {
                let envelope = match frame.envelope() {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed frame");
                        continue;
                    }
                };
                if envelope.seq <= last_seq {
                    continue;
                }
                last_seq = envelope.seq;
                print_event(&envelope);

                if envelope.event_type.is_terminal() {
                    return Ok(());
                }
                if envelope.event_type == EventType::RunWaiting && on_waiting == OnWaiting::Exit {
                    print_resume_hint(run_id, &envelope.payload);
                    return Ok(());
                }
            }
        }

        // The server closes streams only after a terminal event, so an
        // early end means the connection dropped.
        reconnects += 1;
        if reconnects > MAX_RECONNECTS {
            bail!("Lost the event stream for run {} after seq {}", run_id, last_seq);
        }
        eprintln!("Reconnecting from seq {}...", last_seq);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn print_event(envelope: &WorkflowStreamEventEnvelope) {
    let payload = &envelope.payload;
    let detail = match envelope.event_type {
        EventType::StageStarted | EventType::StageCompleted | EventType::StageSkipped => {
            format!(
                "{} {}",
                payload["nodeId"].as_str().unwrap_or("?"),
                payload["op"].as_str().unwrap_or("")
            )
        }
        EventType::RunFailed | EventType::StageFailed => format!(
            "{} [{}]",
            payload["error"].as_str().unwrap_or("unknown error"),
            payload["code"].as_str().unwrap_or("unknown")
        ),
        _ => serde_json::to_string(payload).unwrap_or_default(),
    };
    println!("[{:>4}] {:<20} {}", envelope.seq, envelope.event_type.as_str(), detail);
}

fn print_resume_hint(run_id: &str, payload: &Value) {
    println!();
    println!("Waiting: {}", payload["question"].as_str().unwrap_or(""));
    if let Some(options) = payload["options"].as_array() {
        for option in options {
            println!(
                "  - {} ({})",
                option["label"].as_str().unwrap_or(""),
                option["value"].as_str().unwrap_or("")
            );
        }
    }
    let path = payload["inputPath"]
        .as_str()
        .and_then(|p| p.strip_prefix("$in."))
        .unwrap_or("answer");
    println!("Resume with: execflowctl resume {} --input {}=<value>", run_id, path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignments_nest_and_keep_json_types() {
        let value = parse_assignments(&[
            "topic=rust".to_string(),
            "limits.max=3".to_string(),
            "limits.strict=true".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(
            value,
            json!({
                "topic": "rust",
                "limits": {"max": 3, "strict": true},
                "tags": ["a", "b"]
            })
        );
    }

    #[test]
    fn test_assignment_value_may_contain_equals() {
        let value = parse_assignments(&["query=a=b".to_string()]).unwrap();
        assert_eq!(value["query"], "a=b");
    }

    #[test]
    fn test_assignment_requires_separator() {
        assert!(parse_assignments(&["topic".to_string()]).is_err());
        assert!(parse_assignments(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_program_detection() {
        assert!(is_program(&json!({"entry_node": "start", "nodes": []})));
        assert!(!is_program(&json!({"nodes": [], "edges": []})));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "execflowctl",
            "run",
            "flow.json",
            "--input",
            "topic=rust",
            "--ctx",
            "user=ada",
            "--server-url",
            "http://cp:9000",
        ])
        .unwrap();
        assert_eq!(cli.server_url.as_deref(), Some("http://cp:9000"));
        match cli.command {
            Commands::Run {
                input, ctx, detach, ..
            } => {
                assert_eq!(input, vec!["topic=rust"]);
                assert_eq!(ctx, vec!["user=ada"]);
                assert!(!detach);
            }
            _ => panic!("expected run"),
        }
    }
}
