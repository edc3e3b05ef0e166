//! Headless call participant
//!
//! Joins or hosts a video call through the signaling server and prints what
//! happens, or queries the call directory.
//!
//! # Usage
//!
//! ```bash
//! # Join a call by its shareable link
//! cargo run -p vcme-call-client -- \
//!   --token $VCME_TOKEN --user-id u-42 \
//!   join abc-def-ghi
//!
//! # Create a call, host it and admit everyone who asks
//! cargo run -p vcme-call-client -- \
//!   --config ./call-client.toml \
//!   host --title "Standup" --auto-admit
//!
//! # Call history
//! cargo run -p vcme-call-client -- logs
//! ```

mod directory;
mod session;
mod settings;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directory::{CallRecord, CallSummary, DirectoryClient, NewCall};
use session::{CallReport, DriveOptions, Outcome};
use settings::{ClientSettings, Overrides, ResolvedSettings};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vcme_core::{CallContext, CallOrchestrator};

/// VCME call client
///
/// Command-line participant for VCME video calls.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, env = "VCME_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket signaling server URL
    #[arg(long, env = "VCME_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Call directory REST API URL
    #[arg(long, env = "VCME_API_URL")]
    api_url: Option<String>,

    /// Bearer credential
    #[arg(long, env = "VCME_TOKEN", hide_env_values = true)]
    token: String,

    /// Participant id of the local user
    #[arg(long, env = "VCME_USER_ID")]
    user_id: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "VCME_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// Capture audio only
    #[arg(long)]
    audio_only: bool,

    /// Log and print events as JSON
    #[arg(long, env = "VCME_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a call by its shareable link
    Join {
        /// Shareable call link
        call_link: String,

        /// Admit waiting participants automatically
        #[arg(long)]
        auto_admit: bool,
    },

    /// Create a call and host it
    Host {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Admit waiting participants automatically
        #[arg(long)]
        auto_admit: bool,
    },

    /// List calls hosted by the local user
    List,

    /// Show the call history of the local user
    Logs,

    /// Mark a call as ended
    End {
        call_id: String,

        /// Call length in seconds
        #[arg(long, default_value_t = 0)]
        duration: u64,

        #[arg(long, default_value_t = 0)]
        participant_count: usize,

        #[arg(long, default_value = "")]
        title: String,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("call-client")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "VCME call client starting");

    let file_settings = match &args.config {
        Some(path) => ClientSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ClientSettings::default(),
    };
    let settings = file_settings.resolve(Overrides {
        signaling_url: args.signaling_url.clone(),
        api_url: args.api_url.clone(),
        user_id: args.user_id.clone(),
        stun_servers: args.stun_servers.clone(),
        audio_only: args.audio_only,
    })?;

    info!(
        signaling_url = %settings.call.signaling_url,
        api_url = %settings.api_url,
        user_id = %settings.user_id,
        stun_servers = settings.call.stun_servers.len(),
        turn_servers = settings.call.turn_servers.len(),
        "Configuration loaded"
    );

    let directory = DirectoryClient::new(&settings.api_url, args.token.clone())?;

    match args.command {
        Command::Join {
            call_link,
            auto_admit,
        } => {
            let call = directory
                .find_by_link(&call_link)
                .await
                .with_context(|| format!("looking up call {}", call_link))?;
            let options = DriveOptions {
                auto_admit,
                json: args.log_json,
                ..Default::default()
            };
            let report = run_call(&settings, &args.token, &call, options).await;
            report_outcome(&report);
        }

        Command::Host {
            title,
            description,
            auto_admit,
        } => {
            let call = directory
                .create_call(&NewCall {
                    title: title.clone(),
                    description,
                    host_id: settings.user_id.clone(),
                })
                .await
                .context("creating call")?;
            println!("Created call {}, share link: {}", call.id, call.call_link);

            let started = Instant::now();
            let options = DriveOptions {
                auto_admit,
                json: args.log_json,
                ..Default::default()
            };
            let report = run_call(&settings, &args.token, &call, options).await;
            report_outcome(&report);

            let summary = CallSummary {
                duration: started.elapsed().as_secs(),
                participant_count: report.peak_participants,
                title,
            };
            if let Err(e) = directory.end_call(&call.id, &summary).await {
                warn!("Failed to record the end of call {}: {}", call.id, e);
            }
        }

        Command::List => {
            for call in directory.list_calls().await? {
                println!(
                    "{}  {}  {}",
                    call.id,
                    call.call_link,
                    call.title.as_deref().unwrap_or("")
                );
            }
        }

        Command::Logs => {
            for log in directory.logs(&settings.user_id).await? {
                println!(
                    "{}  {}  {}s  {} participants",
                    log.call_id.as_deref().unwrap_or("-"),
                    log.title.as_deref().unwrap_or(""),
                    log.duration.unwrap_or(0),
                    log.participant_count.unwrap_or(0)
                );
            }
        }

        Command::End {
            call_id,
            duration,
            participant_count,
            title,
        } => {
            directory
                .end_call(
                    &call_id,
                    &CallSummary {
                        duration,
                        participant_count,
                        title,
                    },
                )
                .await?;
            println!("Call {} ended", call_id);
        }
    }

    Ok(())
}

/// Run the orchestrator for one call until it ends or Ctrl+C
async fn run_call(
    settings: &ResolvedSettings,
    token: &str,
    call: &CallRecord,
    options: DriveOptions,
) -> CallReport {
    let ctx = CallContext::new(settings.call.clone(), settings.user_id.clone(), token);
    let (orchestrator, handle, mut events) = CallOrchestrator::new(ctx);
    let orchestrator_task = tokio::spawn(orchestrator.run());

    info!(call_id = %call.id, call_link = %call.call_link, "Joining call");
    if let Err(e) = handle.join(&call.id, &call.call_link) {
        warn!("Failed to request join: {}", e);
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = session::drive(&handle, &mut events, options, shutdown).await;

    drop(handle);
    if let Err(e) = orchestrator_task.await {
        warn!("Call orchestrator ended abnormally: {}", e);
    }
    report
}

fn report_outcome(report: &CallReport) {
    match &report.outcome {
        Outcome::Ended(Some(reason)) => info!("Call ended: {}", reason),
        Outcome::Ended(None) => info!("Call ended"),
        Outcome::Interrupted => info!("Left the call"),
        Outcome::Stopped => warn!("Call orchestrator stopped unexpectedly"),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
