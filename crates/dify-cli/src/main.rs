//! Command-line client for Dify apps.

mod console;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use dify_client::{
    AppKind, ClientConfig, DifyClient, StreamOptions, StreamRequest, StreamResult,
    init_observability,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::console::ConsoleHandler;

#[derive(Debug, Parser)]
#[command(name = "dify")]
#[command(about = "Stream Dify chat, completion and workflow runs")]
struct Cli {
    /// API root; overrides DIFY_API_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// App API key; overrides DIFY_API_KEY.
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// JSON object of app input variables.
    #[arg(long)]
    inputs: Option<String>,
    #[arg(long)]
    user: Option<String>,
    /// Keep consuming after an in-band error event.
    #[arg(long)]
    keep_going: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a chat message.
    Chat {
        #[arg(long)]
        query: String,
        #[arg(long)]
        conversation_id: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a completion app.
    Complete {
        #[arg(long)]
        query: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a workflow app.
    Workflow {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Stop a running task.
    Stop {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Show the app's name and description.
    Info,
    /// Show the app's input form and feature switches.
    Parameters {
        #[arg(long)]
        user: Option<String>,
    },
    /// Upload a file for later runs.
    Upload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Chat,
    Completion,
    Workflow,
}

impl From<Kind> for AppKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Chat => AppKind::Chat,
            Kind::Completion => AppKind::Completion,
            Kind::Workflow => AppKind::Workflow,
        }
    }
}

fn default_user(user: Option<String>) -> String {
    user.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()))
}

fn parse_inputs(raw: Option<&str>) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            other => Err(format!("--inputs must be a JSON object, got {other}").into()),
        },
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig, dify_client::DifyError> {
    ClientConfig::from_lookup(|key| {
        let flag = match key {
            "DIFY_API_KEY" => cli.api_key.clone(),
            "DIFY_API_BASE_URL" => cli.base_url.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })
}

fn run_stream(
    client: &DifyClient,
    request: StreamRequest,
    keep_going: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let options = StreamOptions::default().break_on_error(!keep_going);
    let mut console = ConsoleHandler::stdio();
    let outcome = client.stream(&request, options)?.process(&mut console);
    console.finish();
    let result = outcome?;
    let summary = summarize(&result, console.streamed_text())?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(result.error.is_none())
}

/// Final result as JSON, without the answer when it was already printed.
fn summarize(result: &StreamResult, answer_streamed: bool) -> serde_json::Result<Value> {
    let mut summary = serde_json::to_value(result)?;
    if answer_streamed && let Value::Object(map) = &mut summary {
        map.remove("answer");
    }
    Ok(summary)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();

    let cli = Cli::parse();
    let client = DifyClient::new(load_config(&cli)?)?;
    debug!(base_url = %client.config().base_url, "client ready");

    let succeeded = match cli.command {
        Command::Chat {
            query,
            conversation_id,
            run,
        } => {
            let mut request = StreamRequest::chat(query, default_user(run.user))
                .inputs(parse_inputs(run.inputs.as_deref())?);
            if let Some(conversation_id) = conversation_id {
                request = request.conversation_id(conversation_id);
            }
            run_stream(&client, request, run.keep_going)?
        }
        Command::Complete { query, run } => {
            let request = StreamRequest::completion(query, default_user(run.user))
                .inputs(parse_inputs(run.inputs.as_deref())?);
            run_stream(&client, request, run.keep_going)?
        }
        Command::Workflow { run } => {
            let request = StreamRequest::workflow(default_user(run.user))
                .inputs(parse_inputs(run.inputs.as_deref())?);
            run_stream(&client, request, run.keep_going)?
        }
        Command::Stop {
            kind,
            task_id,
            user,
        } => {
            let reply = client.stop(kind.into(), &task_id, &default_user(user))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            true
        }
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&client.app_info()?)?);
            true
        }
        Command::Parameters { user } => {
            let reply = client.parameters(user.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            true
        }
        Command::Upload { file, user } => {
            let reply = client.upload_file(&file, &default_user(user))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            true
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
