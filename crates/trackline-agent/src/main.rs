//! trackline - capture location samples and deliver them through an
//! offline-buffering queue.
//!
//! Run with: `cargo run -p trackline-agent -- run`

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use time::Date;
use time::macros::format_description;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trackline_agent::{
    Config, LineSource, Overrides, SimulatedSource, build_pipeline, open_queue, summary_client,
};
use trackline_core::{EventReceiver, Pipeline};

/// trackline - offline-buffering location uploader.
#[derive(Parser, Debug)]
#[command(name = "trackline")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Queue database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Collection endpoint base URL (overrides config).
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture and upload samples until interrupted (default).
    Run {
        /// Where positions come from.
        #[arg(long, value_enum, default_value_t = SourceKind::Simulated)]
        source: SourceKind,

        /// Print pipeline events to stdout.
        #[arg(long)]
        events: bool,
    },

    /// List samples waiting for upload, oldest first.
    Pending,

    /// Show queue statistics.
    Status,

    /// Run one drain now.
    Flush,

    /// Delete every pending sample.
    Clear {
        /// Confirm deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Show samples quarantined after repeated rejection or eviction.
    DeadLetters {
        /// Move them back into the pending queue.
        #[arg(long, conflicts_with = "clear")]
        requeue: bool,

        /// Delete them.
        #[arg(long)]
        clear: bool,
    },

    /// Show the locations the endpoint recorded on a day.
    Summary {
        /// Day to query (YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        date: Date,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Random walk from the configured origin.
    Simulated,
    /// `lat,lon[,timestamp]` lines on standard input.
    Stdin,
}

fn parse_date(s: &str) -> Result<Date, String> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    Overrides {
        database: args.database,
        endpoint: args.endpoint,
    }
    .apply(&mut config);

    init_logging(&config.logging.level)?;

    let json = args.json;
    match args.command.unwrap_or(Command::Run {
        source: SourceKind::Simulated,
        events: false,
    }) {
        Command::Run { source, events } => run(config, source, events).await,
        Command::Pending => pending(&config, json).await,
        Command::Status => status(&config, json),
        Command::Flush => flush(&config, json).await,
        Command::Clear { yes } => clear(&config, yes),
        Command::DeadLetters { requeue, clear } => dead_letters(&config, requeue, clear, json),
        Command::Summary { date } => summary(&config, date, json).await,
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = level.to_lowercase();
            let mut filter = EnvFilter::new("warn");
            for target in ["trackline", "trackline_agent", "trackline_core", "trackline_store"] {
                filter = filter.add_directive(format!("{}={}", target, level).parse()?);
            }
            filter
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(config: Config, source: SourceKind, print_events: bool) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config)?;

    let backlog = pipeline.queue().lock().await.pending_count()?;
    if backlog > 0 {
        info!("{} sample(s) pending from a previous session", backlog);
    }

    let printer = print_events.then(|| tokio::spawn(print_events_from(pipeline.subscribe_events())));

    let handle = match source {
        SourceKind::Simulated => {
            let capture = &config.capture;
            pipeline.start(
                SimulatedSource::new(
                    capture.origin_latitude,
                    capture.origin_longitude,
                    capture.interval(),
                )
                .into_stream(),
            )
        }
        SourceKind::Stdin => pipeline.start(LineSource::stdin().into_stream()),
    };

    let source_ended = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
            false
        }
        _ = handle.source_finished() => true,
    };

    handle.stop().await;

    if source_ended {
        // Give the last captures one more chance before exiting
        let outcome = pipeline.flush().await?;
        info!("Final drain: {}", outcome);
    }

    let remaining = pipeline.queue().lock().await.pending_count()?;
    if remaining > 0 {
        info!("{} sample(s) left queued for the next session", remaining);
    }

    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

async fn print_events_from(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Cannot serialize event: {}", e),
            },
            Err(RecvError::Lagged(missed)) => warn!("Event printer skipped {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn pending(config: &Config, json: bool) -> anyhow::Result<()> {
    let queue = open_queue(&config.storage)?;
    let entries = queue.list_pending()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No pending samples");
        return Ok(());
    }
    for entry in &entries {
        print!("{:>6}  {}", entry.id.to_string(), entry.sample);
        if entry.attempts > 0 {
            print!("  attempts={}", entry.attempts);
        }
        if let Some(error) = &entry.last_error {
            print!("  last_error={}", error);
        }
        println!();
    }
    println!("{} pending", entries.len());
    Ok(())
}

fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let queue = open_queue(&config.storage)?;
    let stats = queue.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Queue:        {}", config.storage.path.display());
    println!("Pending:      {}", stats.pending);
    println!("Dead letters: {}", stats.dead_letters);
    if let Some(oldest) = stats.oldest_captured_at {
        println!("Oldest:       {}", oldest);
    }
    match queue.capacity() {
        Some(capacity) => println!("Capacity:     {}", capacity),
        None => println!("Capacity:     unbounded"),
    }
    Ok(())
}

async fn flush(config: &Config, json: bool) -> anyhow::Result<()> {
    let pipeline: Pipeline = build_pipeline(config)?;
    let outcome = pipeline.flush().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome);
    }
    Ok(())
}

fn clear(config: &Config, yes: bool) -> anyhow::Result<()> {
    if !yes {
        anyhow::bail!("refusing to delete pending samples without --yes");
    }
    let removed = open_queue(&config.storage)?.clear()?;
    println!("Removed {} pending sample(s)", removed);
    Ok(())
}

fn dead_letters(config: &Config, requeue: bool, clear: bool, json: bool) -> anyhow::Result<()> {
    let queue = open_queue(&config.storage)?;

    if requeue {
        let moved = queue.requeue_dead_letters()?;
        println!("Requeued {} sample(s)", moved);
        return Ok(());
    }
    if clear {
        let removed = queue.clear_dead_letters()?;
        println!("Removed {} dead letter(s)", removed);
        return Ok(());
    }

    let letters = queue.list_dead_letters()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
        return Ok(());
    }

    if letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }
    for letter in &letters {
        println!(
            "{:>6}  {}  attempts={}  reason={}",
            letter.id.to_string(),
            letter.sample,
            letter.attempts,
            letter.reason
        );
    }
    println!("{} dead letter(s)", letters.len());
    Ok(())
}

async fn summary(config: &Config, date: Date, json: bool) -> anyhow::Result<()> {
    let client = summary_client(config)?;
    let locations = client.locations_on(date).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&locations)?);
        return Ok(());
    }

    if locations.is_empty() {
        println!("No locations recorded on {}", date);
        return Ok(());
    }
    for point in &locations {
        println!(
            "{}  {:.6}, {:.6}",
            point.timestamp, point.latitude, point.longitude
        );
    }
    Ok(())
}
