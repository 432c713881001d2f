use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voice_console::api::{BackendClient, SessionApi};
use voice_console::audio::CpalBackend;
use voice_console::http::{create_router, AppState, CallStarter};
use voice_console::session::{CallConfig, CallDeps, CallHandle, SessionController, SessionState};
use voice_console::speech::SystemSpeech;
use voice_console::Config;

#[derive(Parser)]
#[command(name = "voice-console")]
#[command(about = "Live test calls against a voice agent", version)]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/voice-console")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one call in the terminal until Ctrl+C or the session ends
    Call {
        /// Agent to call (defaults to session.agent_id)
        #[arg(short, long)]
        agent: Option<String>,
    },
    /// Serve the local control API
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(&cli.config)?;

    info!("Voice Console v{}", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", config.backend.base_url);

    let api = Arc::new(BackendClient::new(&config.backend).context("Failed to create backend client")?);

    match cli.command {
        Command::Call { agent } => {
            let agent = agent
                .or_else(|| config.session.agent_id.clone())
                .context("No agent given; pass --agent or set session.agent_id")?;
            run_call(&config, api, &agent).await
        }
        Command::Serve => {
            serve(config, api).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn device_call(config: &Config, api: Arc<BackendClient>, agent_id: &str) -> CallHandle {
    let deps = CallDeps {
        api: api as Arc<dyn SessionApi>,
        audio: Box::new(CpalBackend::new()),
        speech: Arc::new(SystemSpeech::new(&config.speech)),
    };
    SessionController::new(CallConfig::from(config), deps).spawn(agent_id)
}

async fn run_call(config: &Config, api: Arc<BackendClient>, agent_id: &str) -> Result<ExitCode> {
    let call = device_call(config, api, agent_id);
    info!("Call {} starting, press Ctrl+C to hang up", call.id());

    let mut snapshots = call.subscribe();
    let mut level = call.input_level();
    let mut meter = tokio::time::interval(Duration::from_secs(2));
    let mut last_state = call.snapshot().state;
    let mut hung_up = false;

    while !call.is_finished() {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = snapshots.borrow_and_update().state.clone();
                if state != last_state {
                    println!("state: {}", state);
                    last_state = state;
                }
                if last_state.is_terminal() {
                    break;
                }
            }
            _ = meter.tick() => {
                if last_state == SessionState::Active {
                    let rms = *level.borrow_and_update();
                    println!("input level: {:>5.1}%", rms * 100.0);
                }
            }
            result = tokio::signal::ctrl_c(), if !hung_up => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Hanging up");
                hung_up = true;
                call.end();
            }
        }
    }

    let Some(outcome) = call.wait().await else {
        anyhow::bail!("Call task stopped without reporting an outcome");
    };

    println!("final state: {}", outcome.state);
    println!(
        "agent frames: {}, first after {}",
        outcome.latency.inbound_frames,
        outcome
            .latency
            .first_inbound_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string())
    );
    if !outcome.teardown.is_clean() {
        warn!("Teardown finished with errors: {:?}", outcome.teardown.steps);
    }

    Ok(match outcome.state {
        SessionState::Ended => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn serve(config: Config, api: Arc<BackendClient>) -> Result<()> {
    let addr = format!("{}:{}", config.http.bind, config.http.port);
    let default_agent = config.session.agent_id.clone();

    let start_call: Arc<CallStarter> = Arc::new(move |agent_id: &str| -> Result<CallHandle> {
        Ok(device_call(&config, Arc::clone(&api), agent_id))
    });

    let state = AppState::new(start_call, default_agent);
    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Control API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down control API");
            // The backend must hear about the end before the runtime goes away
            if let Some(outcome) = state.end_live_call().await {
                info!("Call {} finished during shutdown: {}", outcome.call_id, outcome.state);
            }
        })
        .await
        .context("Control API server failed")?;

    Ok(())
}
