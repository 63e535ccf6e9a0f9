use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use log::{info, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use llama_dual_chat::chat::{format, templates, ChannelDecoder};
use llama_dual_chat::{
    load_config, ControllerEvent, ControllerState, DialectId, InferenceEngine, LifecycleController,
    Script, ScriptedEngine,
};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Parser)]
#[command(name = "llama-dual-chat")]
#[command(version)]
#[command(about = "Split streaming model output into thinking and answer channels", long_about = None)]
struct Cli {
    /// Also log to stderr, at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file
    #[arg(long, global = true, default_value = "dual_chat_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the detected capabilities of a model file as JSON
    Classify { model: String },
    /// Replay a raw transcript through the decoder and print the events
    Decode {
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 4)]
        chunk_size: usize,
        file: PathBuf,
    },
    /// Run one chat turn against a canned reply
    Demo {
        /// Defaults to the configured model path
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        no_thinking: bool,
        /// Skip the reasoning pass after this many fragments
        #[arg(long)]
        skip_after: Option<usize>,
        message: String,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = "logs";
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_path)?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file_appender)));
    let mut root = Root::builder().appender("file");
    let level = if verbose {
        let console = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    log4rs::init_config(builder.build(root.build(level))?)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = setup_logging(cli.verbose) {
        eprintln!("Failed to set up logging: {e}");
    }

    match cli.command {
        Commands::Classify { model } => classify(&model),
        Commands::Decode {
            model,
            chunk_size,
            file,
        } => decode(&model, chunk_size, &file),
        Commands::Demo {
            model,
            no_thinking,
            skip_after,
            message,
        } => demo(&cli.config, model, !no_thinking, skip_after, &message),
    }
}

fn classify(model: &str) -> Result<()> {
    let (_, capabilities) = format::detect(model);
    let report = serde_json::json!({
        "model": model,
        "capabilities": capabilities,
        "dual_mode": templates::is_dual_mode(model),
        "chat_format": format::chat_format(model),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn decode(model: &str, chunk_size: usize, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading transcript {}", file.display()))?;
    let (dialect, _) = format::detect(model);
    info!("Decoding {} as {}", file.display(), dialect);

    let chars: Vec<char> = raw.chars().collect();
    let mut decoder = ChannelDecoder::new(dialect);
    let mut events = Vec::new();
    for chunk in chars.chunks(chunk_size.max(1)) {
        events.extend(decoder.feed(&chunk.iter().collect::<String>()));
    }
    events.extend(decoder.finish());

    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    let state = decoder.state();
    println!("--- thinking ({} bytes)\n{}", state.emitted_thinking_len(), state.thinking());
    println!("--- answer ({} bytes)\n{}", state.emitted_answer_len(), state.answer());
    Ok(())
}

/// A plausible reply in the given dialect.
fn canned_reply(dialect: DialectId) -> &'static str {
    match dialect {
        DialectId::Harmony => {
            "<|channel|>analysis<|message|>The user wants a short explanation. Keep it simple and accurate.<|end|>\
             <|start|>assistant<|channel|>final<|message|>Rust guarantees memory safety without a garbage collector.<|return|>"
        }
        DialectId::XmlTags => {
            "<thinking>\nThe user wants a short explanation. Keep it simple and accurate.\n</thinking>\n\n\
             <final_answer>\nRust guarantees memory safety without a garbage collector.\n</final_answer>"
        }
        DialectId::QwenClosingOnly => {
            "The user wants a short explanation. Keep it simple and accurate.\n</think>\n\n\
             Rust guarantees memory safety without a garbage collector."
        }
        DialectId::GraniteToggle => {
            "<think_on>The user wants a short explanation. Keep it simple and accurate.<think_off>\
             Rust guarantees memory safety without a garbage collector."
        }
        DialectId::AprielMarkers => {
            "The user wants a short explanation. Keep it simple and accurate.\n\
             [BEGIN FINAL RESPONSE]\nRust guarantees memory safety without a garbage collector.\n[END FINAL RESPONSE]"
        }
        DialectId::SmollmSimulated => {
            "Let me think... The user wants a short explanation.\n\
             Answer: Rust guarantees memory safety without a garbage collector."
        }
        DialectId::Plain => "Rust guarantees memory safety without a garbage collector.",
    }
}

fn demo(
    config_path: &Path,
    model: Option<String>,
    thinking: bool,
    skip_after: Option<usize>,
    message: &str,
) -> Result<()> {
    let config = load_config(config_path);
    let model = model
        .or_else(|| config.model_path.clone())
        .context("no model given; pass --model or set DUAL_CHAT_MODEL_PATH")?;
    let thinking = thinking && config.thinking_mode;
    let (dialect, capabilities) = format::detect(&model);
    let reply_dialect = if thinking && capabilities.supports_thinking {
        dialect
    } else if dialect == DialectId::Harmony {
        DialectId::Harmony
    } else {
        DialectId::Plain
    };

    let (engine, gate) =
        ScriptedEngine::gated([Script::chunked(canned_reply(reply_dialect), 6).stale_after_stop(2)]);
    if skip_after.is_some() {
        // The concise pass that replaces a skipped one.
        engine.push_script(Script::chunked("A memory-safe systems language.", 6));
    }
    let engine: Arc<dyn InferenceEngine> = Arc::new(engine);

    let mut controller = LifecycleController::new(config);
    controller.load_model(&model, engine);
    let events = controller.subscribe();
    controller.send(message, thinking)?;

    let mut released = 0usize;
    while controller.state().is_active() {
        if skip_after.is_some_and(|limit| released >= limit)
            && controller.state() == ControllerState::StreamingThinking
        {
            controller.skip();
            break;
        }
        gate.release(1);
        released += 1;
        controller.wait_until(|s| !s.is_active(), Duration::from_millis(20));
        print_events(&events)?;
    }

    gate.open();
    controller.wait_idle(Duration::from_secs(10));
    print_events(&events)?;

    let stats = controller.history().stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_events(events: &Receiver<ControllerEvent>) -> Result<()> {
    for event in events.try_iter() {
        match event {
            ControllerEvent::Stream { session, event } => {
                println!("[session {}] {}", session, serde_json::to_string(&event)?);
            }
            ControllerEvent::MessageAppended(message) => {
                println!("[message] {}", serde_json::to_string(&message)?);
            }
        }
    }
    Ok(())
}
