use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures_util::StreamExt;
use log::{error, info, warn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use grounded_chat::config::AppConfig;
use grounded_chat::llm::{AVAILABLE_MODELS, DEFAULT_MODEL};
use grounded_chat::rag::StreamEvent;
use grounded_chat::AppState;

/// Chat with your documents: answers are grounded in ingested text and PDF files
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chunk, embed and index documents (text and PDF)
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Display name to store a single document under
        #[arg(long)]
        name: Option<String>,
    },
    /// List the documents ingested so far
    List,
    /// Answer a single question
    Ask {
        question: String,
        #[arg(long, default_value = DEFAULT_MODEL, value_parser = PossibleValuesParser::new(AVAILABLE_MODELS))]
        model: String,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// Documents to ingest before answering
        #[arg(long = "ingest")]
        documents: Vec<PathBuf>,
    },
    /// Interactive conversation; type 'exit' to quit
    Chat {
        #[arg(long, default_value = DEFAULT_MODEL, value_parser = PossibleValuesParser::new(AVAILABLE_MODELS))]
        model: String,
        #[arg(long)]
        stream: bool,
        #[arg(long = "ingest")]
        documents: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let state = match AppState::initialize(&config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Startup failed: {}", e);
            return Err(e.into());
        }
    };

    match args.command {
        Command::Ingest { files, name } => {
            if name.is_some() && files.len() > 1 {
                anyhow::bail!("--name can only be used with a single file");
            }
            for file in &files {
                ingest_file(&state, file, name.as_deref()).await?;
            }
        }
        Command::List => {
            let documents = state.documents();
            if documents.is_empty() {
                info!("No documents ingested yet");
            }
            for document in documents {
                println!("{}", document);
            }
        }
        Command::Ask {
            question,
            model,
            stream,
            documents,
        } => {
            for file in &documents {
                ingest_file(&state, file, None).await?;
            }
            let thread = state.create_thread();
            answer(&state, &thread, &question, &model, stream).await?;
        }
        Command::Chat {
            model,
            stream,
            documents,
        } => {
            for file in &documents {
                ingest_file(&state, file, None).await?;
            }
            run_chat_loop(&state, &model, stream).await?;
        }
    }

    Ok(())
}

async fn ingest_file(state: &AppState, path: &Path, name: Option<&str>) -> Result<()> {
    if !path.exists() {
        error!("File not found: {}", path.display());
        return Err(anyhow::anyhow!("File not found: {}", path.display()));
    }

    let file_name = match name {
        Some(name) => name.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Path has no file name")?,
    };

    let report = state
        .ingest(path, &file_name)
        .await
        .with_context(|| format!("Failed to process {}", file_name))?;
    info!("Ingested {} ({} chunks)", report.file_name, report.chunks);
    Ok(())
}

async fn answer(
    state: &AppState,
    thread: &str,
    question: &str,
    model: &str,
    stream: bool,
) -> Result<()> {
    let mut stdout = io::stdout();

    if !stream {
        let answer = state.chat(thread, question, model).await?;
        println!("\n{}", answer);
        return Ok(());
    }

    let mut events = state.chat_stream(thread, question, model).await?;
    println!();
    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Token { delta } => {
                print!("{}", delta);
                stdout.flush()?;
            }
            StreamEvent::Done => println!(),
        }
    }
    Ok(())
}

/// Ask questions on one conversation thread until the user types 'exit'
async fn run_chat_loop(state: &AppState, model: &str, stream: bool) -> Result<()> {
    let documents = state.documents();
    if documents.is_empty() {
        warn!("No documents ingested; every answer will say the documents lack the information");
    }
    info!(
        "Ready to answer questions about {} documents with {}. Type 'exit' to quit.",
        documents.len(),
        model
    );

    let thread = state.create_thread();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }

        let question = buffer.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") {
            info!("Goodbye!");
            break;
        }

        if let Err(e) = answer(state, &thread, question, model, stream).await {
            error!("{:#}", e);
        }
    }

    Ok(())
}
