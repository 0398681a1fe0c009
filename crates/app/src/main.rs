use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use docqa_core::{
    discover_files, AnswerEvent, AppConfig, Assistant, AskRequest, GenerationResponse,
    RetrievalNotice,
};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docqa", version, about = "Ask questions about your local documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true, env = "DOCQA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the index collections.
    #[arg(long, global = true, env = "DOCQA_INDEX_DIR")]
    index_dir: Option<PathBuf>,

    /// Key for the Gemini backend.
    #[arg(long, global = true, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Index files; folders are searched recursively for supported formats.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from the indexed documents.
    Ask {
        question: String,
        /// Number of context chunks.
        #[arg(long)]
        top_k: Option<usize>,
        /// Character budget for the retrieved context.
        #[arg(long)]
        max_context_chars: Option<usize>,
        /// Restrict retrieval to these document ids.
        #[arg(long = "document")]
        documents: Vec<String>,
    },
    /// Remove a document and its chunks from the index.
    Delete { document_id: String },
    /// List indexed documents.
    List,
    /// Show index statistics.
    Stats,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(dir) = &cli.index_dir {
        config.index.directory = dir.clone();
    }
    if let Some(key) = &cli.api_key {
        config.backend.api_key = Some(key.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_sources(response: &GenerationResponse) {
    if response.citations.is_empty() {
        println!("\n(no sources)");
        return;
    }
    println!("\nSources:");
    for citation in &response.citations {
        let note = if citation.explicit { "" } else { " (context)" };
        println!("  {}{note}", citation.format_inline());
        println!("      {}", citation.source_path);
    }
}

async fn ask(assistant: &Assistant, request: AskRequest) -> anyhow::Result<()> {
    let mut stream = assistant.ask(request);
    let mut stdout = std::io::stdout();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                stream.cancel();
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };

        match event {
            AnswerEvent::Retrieved { notice: Some(RetrievalNotice::EmptyCorpus), .. } => {
                warn!("the index is empty, answering without documents");
            }
            AnswerEvent::Delta(text) => {
                print!("{text}");
                stdout.flush()?;
            }
            AnswerEvent::ToolInvoked { name, succeeded } => {
                info!(tool = %name, succeeded, "tool used");
            }
            AnswerEvent::Completed(response) => {
                println!();
                print_sources(&response);
                info!(
                    query_id = %response.query_id,
                    total_ms = response.metrics.total_ms,
                    prompt_tokens = response.metrics.estimated_prompt_tokens,
                    answer_tokens = response.metrics.estimated_answer_tokens,
                    "answered"
                );
            }
            AnswerEvent::Failed(reason) => {
                println!();
                anyhow::bail!(reason.message());
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        index = %config.index.directory.display(),
        "docqa boot"
    );

    let assistant = Assistant::from_config(config).await?;

    match cli.command {
        Command::Ingest { paths } => {
            let mut files = Vec::new();
            for path in paths {
                if path.is_dir() {
                    let found = discover_files(&path);
                    if found.is_empty() {
                        warn!(folder = %path.display(), "no supported documents in folder");
                    }
                    files.extend(found);
                } else {
                    files.push(path);
                }
            }

            let report = assistant.ingest_batch(&files).await;
            for document in &report.indexed {
                println!(
                    "indexed   {}  {} ({} chunks)",
                    document.document_id,
                    document.source_path,
                    document.chunk_count()
                );
            }
            for document in &report.unchanged {
                println!("unchanged {}  {}", document.document_id, document.source_path);
            }
            for skipped in &report.skipped_files {
                println!("skipped   {}: {}", skipped.path.display(), skipped.reason);
            }
            println!(
                "{} indexed, {} unchanged, {} skipped, {} chunks written",
                report.indexed.len(),
                report.unchanged.len(),
                report.skipped_files.len(),
                report.chunk_count()
            );
        }
        Command::Ask {
            question,
            top_k,
            max_context_chars,
            documents,
        } => {
            let mut request = assistant.request(question);
            if let Some(top_k) = top_k {
                request.top_k = top_k;
            }
            if let Some(budget) = max_context_chars {
                request.max_context_chars = budget;
            }
            request.filters.document_ids = documents;
            ask(&assistant, request).await?;
        }
        Command::Delete { document_id } => {
            if assistant.document(&document_id).await.is_none() {
                anyhow::bail!("no document with id {document_id}");
            }
            let removed = assistant.delete_document(&document_id).await?;
            println!("deleted {document_id} ({removed} chunks)");
        }
        Command::List => {
            let documents = assistant.documents().await;
            if documents.is_empty() {
                println!("no documents indexed");
            }
            for document in documents {
                println!(
                    "{}  {:<12} {:>5} chunks  {}  {}",
                    document.document_id,
                    document.format.as_str(),
                    document.chunk_count(),
                    document.ingested_at.format("%Y-%m-%d %H:%M"),
                    document.source_path
                );
            }
        }
        Command::Stats => {
            let stats = assistant.stats().await;
            println!("collection: {}", stats.collection);
            println!("dimensions: {}", stats.dimensions);
            println!("documents:  {}", stats.documents);
            println!("chunks:     {}", stats.chunks);
        }
    }

    assistant.close().await?;
    Ok(())
}
