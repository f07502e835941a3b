//! bokji - medical and welfare support assistant CLI

mod commands;
mod config;
mod session;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use bokji_ai::Model;
use bokji_ai::providers::openai::OpenAIProvider;
use bokji_pipeline::{
    Answer, Capability, Extractor, LlmCapability, MemoryDocumentIndex, Pipeline, PipelineEvent,
    Stores, StubCapability,
};

use crate::config::Config;
use crate::session::Session;

/// bokji - medical and welfare support assistant
#[derive(Parser, Debug)]
#[command(name = "bokji")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Conversation owner
    #[arg(short, long, default_value = "local-user")]
    user: String,

    /// Run in non-interactive mode with a single utterance
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Model to use (default from config: gpt-4o-mini)
    #[arg(short, long)]
    model: Option<String>,

    /// Use the built-in keyword capability instead of a model endpoint
    #[arg(long)]
    offline: bool,

    /// Verbose output: debug logs and pipeline events
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("bokji=debug,bokji_pipeline=debug,bokji_ai=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        let path = Config::init().context("creating config file")?;
        println!("Config file at: {}", path.display());
        return Ok(());
    }

    let mut cfg = Config::load();
    if let Some(model) = args.model {
        cfg.model = model;
    }

    let pipeline = build_pipeline(&cfg, args.offline)?;
    if args.verbose {
        spawn_event_printer(pipeline.subscribe());
    }

    let mut session = Session::new(args.user);
    if let Some(command) = args.command {
        return run_turn(&pipeline, &mut session, &command).await;
    }
    run_interactive(&pipeline, &mut session).await
}

fn build_pipeline(cfg: &Config, offline: bool) -> anyhow::Result<Pipeline> {
    let (capability, extractor): (Arc<dyn Capability>, Arc<dyn Extractor>) = if offline {
        let stub = Arc::new(StubCapability::new());
        (stub.clone() as Arc<dyn Capability>, stub as Arc<dyn Extractor>)
    } else {
        let Some(api_key) = cfg.api_key() else {
            anyhow::bail!(
                "No API key found. Set OPENAI_API_KEY, add api_key to {} (bokji --init-config), or pass --offline",
                Config::config_path().display()
            );
        };
        let mut model = Model::openai(&cfg.model);
        if let Some(base_url) = &cfg.base_url {
            model = model.with_base_url(base_url);
        }
        let llm = Arc::new(
            LlmCapability::new(Arc::new(OpenAIProvider::new(api_key)), model)
                .with_retry_config(cfg.retry_config())
                .with_answer_temperature(cfg.answer_temperature),
        );
        (llm.clone() as Arc<dyn Capability>, llm as Arc<dyn Extractor>)
    };

    let mut stores = Stores::default();
    if let Some(path) = &cfg.documents_path {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy documents from {}", path.display()))?;
        let index = MemoryDocumentIndex::from_json(&json)?;
        tracing::info!(documents = index.len(), "policy documents loaded");
        stores.documents = Arc::new(index);
    }

    Ok(Pipeline::new(cfg.pipeline_config(), capability, extractor, stores))
}

fn spawn_event_printer(mut receiver: broadcast::Receiver<PipelineEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            match event {
                PipelineEvent::StageEntered { stage } => eprintln!("[stage: {stage}]"),
                PipelineEvent::RoutingDecided { decision } => eprintln!(
                    "[route: target={} retrieval={} ({})]",
                    decision.target, decision.required_retrieval, decision.reason
                ),
                PipelineEvent::WriteRecorded { writer, outcome } => {
                    eprintln!("[write {writer}: {outcome:?}]")
                }
                PipelineEvent::RetrievalAssembled {
                    facts,
                    documents,
                    degraded,
                } => {
                    eprintln!("[retrieval: {facts} facts, {documents} documents]");
                    for source in degraded {
                        eprintln!("[retrieval degraded: {source}]");
                    }
                }
                PipelineEvent::CompactionDecided {
                    turn_count,
                    summary_updated,
                } => eprintln!("[compaction: turn {turn_count}, summary updated: {summary_updated}]"),
                PipelineEvent::Error { message } => eprintln!("[error: {message}]"),
                PipelineEvent::RunStart { .. } | PipelineEvent::AnswerReady { .. } => {}
            }
        }
    });
}

async fn run_turn(pipeline: &Pipeline, session: &mut Session, utterance: &str) -> anyhow::Result<()> {
    let turn = session.next_turn();
    let state = pipeline
        .run(session.user_id(), utterance, turn, Some(session.carried()))
        .await?;
    if let Some(answer) = state.answer() {
        print_answer(answer);
    }
    session.record(state);
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.display_text());
    if answer.policies.is_empty() {
        return;
    }
    println!();
    println!("추천 정책:");
    for (i, card) in answer.policies.iter().enumerate() {
        println!("  {}. {}", i + 1, card.title);
        if !card.eligibility.is_empty() {
            println!("     자격: {}", card.eligibility);
        }
        if !card.benefits.is_empty() {
            println!("     혜택: {}", card.benefits);
        }
        if let Some(url) = &card.application_url {
            println!("     신청: {url}");
        }
    }
}

async fn run_interactive(pipeline: &Pipeline, session: &mut Session) -> anyhow::Result<()> {
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("bokji ({}) - /help for commands", session.user_id());
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) = commands::execute_command(input, session) {
            match result {
                commands::CommandResult::Clear => {
                    session.clear();
                    println!("Cleared conversation.");
                }
                commands::CommandResult::Exit => break,
                commands::CommandResult::Message(msg) => println!("{msg}"),
                commands::CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{cmd}");
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        // A failed turn is reported and the conversation continues
        if let Err(e) = run_turn(pipeline, session, input).await {
            eprintln!("Error: {e:#}");
        }
        println!();
    }

    Ok(())
}
