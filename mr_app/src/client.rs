use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mr::coordinator::RunStatus;
use mr::rpc::RpcClient;
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Submit word-count jobs and query their status")]
struct Args {
    #[arg(long, default_value = "[::1]:50051")]
    server: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a run from inline lines or from a container.
    Start {
        /// Inline input line; repeat for more lines.
        #[arg(long = "line", conflicts_with_all = ["container", "blob"])]
        lines: Vec<String>,

        /// Read inline lines from a local file.
        #[arg(long, conflicts_with_all = ["lines", "container", "blob"])]
        lines_file: Option<PathBuf>,

        #[arg(long)]
        container: Option<String>,

        /// Object to read; repeat for more. All objects when omitted.
        #[arg(long)]
        blob: Vec<String>,

        /// Poll until the run finishes and print its result.
        #[arg(long)]
        wait: bool,
    },
    Status {
        run_id: String,
    },
    Cancel {
        run_id: String,
    },
}

fn payload(
    lines: Vec<String>,
    lines_file: Option<PathBuf>,
    container: Option<String>,
    blob: Vec<String>,
) -> anyhow::Result<serde_json::Value> {
    if let Some(path) = lines_file {
        let text = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = text.lines().collect();
        return Ok(serde_json::json!({ "lines": lines }));
    }
    if !lines.is_empty() {
        return Ok(serde_json::json!({ "lines": lines }));
    }
    let mut payload = serde_json::Map::new();
    if let Some(container) = container {
        payload.insert("container".to_string(), container.into());
    }
    if !blob.is_empty() {
        payload.insert("blobs".to_string(), blob.into());
    }
    Ok(serde_json::Value::Object(payload))
}

async fn wait_for(client: &RpcClient, run_id: &str) -> anyhow::Result<RunStatus> {
    loop {
        match client.status(context::current(), run_id.to_string()).await? {
            Some(status) if status.is_terminal() => return Ok(status),
            Some(RunStatus::Running { progress }) => {
                tracing::debug!("run {} {:?}", run_id, progress);
            }
            Some(_) => {}
            None => anyhow::bail!("unknown run {}", run_id),
        }
        sleep(Duration::from_millis(500)).await;
    }
}

fn print_status(status: &RunStatus) -> anyhow::Result<()> {
    match status {
        RunStatus::Completed { output } => println!("{}", serde_json::to_string_pretty(output)?),
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut transport = tarpc::serde_transport::tcp::connect(args.server, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);
    let client = RpcClient::new(client::Config::default(), transport.await?).spawn();

    match args.command {
        Command::Start {
            lines,
            lines_file,
            container,
            blob,
            wait,
        } => {
            let payload = payload(lines, lines_file, container, blob)?;
            let run_id = client
                .start_job(context::current(), payload.to_string())
                .await?
                .map_err(|report| anyhow::anyhow!("{}", report))?;
            if !wait {
                println!("{}", run_id);
                return Ok(());
            }
            eprintln!("started run {}", run_id);
            let status = wait_for(&client, &run_id).await?;
            print_status(&status)?;
            if !matches!(status, RunStatus::Completed { .. }) {
                std::process::exit(1);
            }
        }
        Command::Status { run_id } => match client.status(context::current(), run_id.clone()).await? {
            Some(status) => print_status(&status)?,
            None => anyhow::bail!("unknown run {}", run_id),
        },
        Command::Cancel { run_id } => {
            if client.cancel(context::current(), run_id.clone()).await? {
                println!("cancellation requested for {}", run_id);
            } else {
                anyhow::bail!("run {} is not running", run_id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_from_lines() {
        let p = payload(vec!["a b".to_string()], None, None, vec![]).unwrap();
        assert_eq!(p, serde_json::json!({"lines": ["a b"]}));
    }

    #[test]
    fn test_payload_from_container() {
        let p = payload(vec![], None, Some("books".to_string()), vec!["x.txt".to_string()]).unwrap();
        assert_eq!(p, serde_json::json!({"container": "books", "blobs": ["x.txt"]}));
        let p = payload(vec![], None, None, vec![]).unwrap();
        assert_eq!(p, serde_json::json!({}));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["client", "start", "--line", "a", "--line", "b", "--wait"]).unwrap();
        match args.command {
            Command::Start { lines, wait, .. } => {
                assert_eq!(lines, vec!["a", "b"]);
                assert!(wait);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Args::try_parse_from(["client", "start", "--line", "a", "--container", "c"]).is_err());
    }
}
