//! Command-line front-end.
//!
//! Reads the token from `DISCORD_TOKEN` (a `.env` file is honoured), looks up
//! both guilds and clones one into the other while printing log lines and
//! progress as they arrive.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};

use guild_cloner::{
    ChannelSink, ClientConfig, CloneError, CloneEvent, CloneOptions, CloneOrchestrator,
    CloneStats, ConfigError, DiscordHttpClient,
};

/// Clone the roles, channels and recent messages of one Discord server into
/// another.
#[derive(Parser, Debug)]
#[command(name = "guild_cloner")]
#[command(about = "Clone the structure of one Discord server into another")]
struct Args {
    /// Source guild id
    source: String,

    /// Destination guild id. Its roles and channels are deleted first.
    dest: String,

    /// Account token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Send the token as a bot token (`Bot ` prefix)
    #[arg(long, env = "DISCORD_BOT", default_value = "false")]
    bot: bool,

    /// JSON file with clone options; flags below override it
    #[arg(long)]
    options: Option<PathBuf>,

    #[arg(long)]
    no_roles: bool,

    #[arg(long)]
    no_categories: bool,

    #[arg(long)]
    no_text_channels: bool,

    #[arg(long)]
    no_voice_channels: bool,

    #[arg(long)]
    no_messages: bool,

    #[arg(long)]
    no_name_icon: bool,

    /// Most recent messages copied per channel
    #[arg(long)]
    messages_limit: Option<u32>,

    /// Confirm that the destination may be wiped
    #[arg(long)]
    yes: bool,
}

impl Args {
    fn clone_options(&self) -> Result<CloneOptions, ConfigError> {
        let mut options = match &self.options {
            Some(path) => {
                let invalid = |message: String| ConfigError::OptionsFile {
                    path: path.display().to_string(),
                    message,
                };
                let raw = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
                serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?
            }
            None => CloneOptions::default(),
        };

        options.clone_roles &= !self.no_roles;
        options.clone_categories &= !self.no_categories;
        options.clone_text_channels &= !self.no_text_channels;
        options.clone_voice_channels &= !self.no_voice_channels;
        options.clone_messages &= !self.no_messages;
        options.clone_name_icon &= !self.no_name_icon;
        if let Some(limit) = self.messages_limit {
            options.messages_limit = limit;
        }

        options.validate()?;
        Ok(options)
    }
}

fn print_stats(stats: &CloneStats) {
    println!();
    println!("Roles created:    {}/{}", stats.roles_created, stats.total_roles);
    println!(
        "Channels created: {}/{} ({} categories, {} text, {} voice)",
        stats.channels_created(),
        stats.total_channels,
        stats.categories_created,
        stats.text_channels_created,
        stats.voice_channels_created
    );
    println!("Messages copied:  {}", stats.messages_copied);
    println!(
        "Deleted:          {} roles, {} channels",
        stats.roles_deleted, stats.channels_deleted
    );
    println!("Errors:           {}", stats.errors);
    println!("Elapsed:          {:.1}s", stats.elapsed_time.as_secs_f64());
}

async fn run(args: Args) -> Result<bool, CloneError> {
    let options = args.clone_options()?;
    let token = args
        .token
        .clone()
        .ok_or_else(|| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

    let client = DiscordHttpClient::connect(ClientConfig::new(token).bot(args.bot))?;

    let (sink, events) = ChannelSink::bounded(1024);
    let orchestrator = CloneOrchestrator::new(Arc::new(sink.clone()));
    let progress = sink.progress_callback();
    orchestrator.set_progress_callback(move |value| progress(value));
    drop(sink);

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CloneEvent::Log { message, level } => println!("[{}] {}", level, message),
                CloneEvent::Progress(value) => println!("Progress: {:.0}%", value * 100.0),
            }
        }
    });

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling clone");
            cancel.cancel();
        }
    });

    let Some(source) = orchestrator.lookup_guild(&client, &args.source).await? else {
        return Err(CloneError::SourceUnavailable(args.source));
    };
    let Some(dest) = orchestrator.lookup_guild(&client, &args.dest).await? else {
        error!(guild_id = %args.dest, "destination guild not found");
        return Ok(false);
    };

    if !args.yes {
        error!(
            dest = %dest.name,
            "refusing to wipe the destination without --yes"
        );
        return Ok(false);
    }

    let done = orchestrator
        .start_clone(&source, &dest, &client, &options)
        .await;
    let stats = orchestrator.get_stats();

    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer task failed");
    }
    print_stats(&stats);
    Ok(done)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "clone aborted");
            ExitCode::from(2)
        }
    }
}
