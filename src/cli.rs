//! CLI interface for vox-agent
//!
//! Thin glue over the library: every subcommand assembles a worker from
//! [`WorkerOptions`] and the provider environment, then hands control to
//! the session runtime. Exit code 0 on success, non-zero on any
//! unhandled error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{ProviderEnv, WorkerOptions};
use crate::providers::traits::{LlmProvider, SttProvider, TtsProvider};
use crate::providers::{plugin, HttpLlm, HttpStt, HttpTts};
use crate::session::session::ProviderSet;
use crate::session::{BaseAgent, Session, SessionOptions};
use crate::worker::{room::Room, MockRoom, Worker};

const DEFAULT_STT_MODEL: &str = "whisper-1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TTS_MODEL: &str = "tts-1";

#[derive(Parser)]
#[command(name = "vox-agent")]
#[command(about = "Real-time voice-agent runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a config.toml with worker options
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run with hot reload: restart the worker whenever sources change
    Dev {
        /// Directory to watch for changes
        #[arg(long, default_value = "src")]
        watch: PathBuf,
    },
    /// Local-only session: mock room, fake credentials, no hardware
    Console,
    /// Production mode: connect to the configured media server
    Start,
    /// Attach to a specific room
    Connect {
        /// Room name to join
        #[arg(long)]
        room: String,
    },
    /// Validate configuration and provider environment
    Test,
    /// Fetch model/resource files needed at runtime
    DownloadFiles,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Dev { watch } => run_dev(config_path, watch).await,
        Commands::Console => {
            let options = load_options(config_path)?.for_console();
            run_worker(options, true).await
        }
        Commands::Start => {
            let options = load_options(config_path)?;
            run_worker(options, false).await
        }
        Commands::Connect { room } => {
            let mut options = load_options(config_path)?;
            options.room_name = Some(room);
            run_worker(options, false).await
        }
        Commands::Test => run_self_test(config_path),
        Commands::DownloadFiles => run_download_files(),
    }
}

fn load_options(path: Option<PathBuf>) -> Result<WorkerOptions> {
    WorkerOptions::load(path.as_deref())
}

/// Build the provider set from the environment. An `AGENTS_*_SERVICE`
/// override naming a registered plugin goes through the plugin registry;
/// any other value selects the model used by the default HTTP provider.
fn build_providers(env: &ProviderEnv) -> Result<ProviderSet> {
    let registry = plugin::global();

    let stt = match env.stt_service.as_deref() {
        Some(name) if registry.contains(name) => match registry.create(name, env)? {
            plugin::ProviderInstance::Stt(stt) => stt,
            other => anyhow::bail!("plugin {} is a {} provider, not stt", name, other.kind()),
        },
        service => {
            let model = service.unwrap_or(DEFAULT_STT_MODEL);
            Arc::new(HttpStt::new(require_key(env)?, model)) as Arc<dyn SttProvider>
        }
    };
    let llm = match env.llm_service.as_deref() {
        Some(name) if registry.contains(name) => match registry.create(name, env)? {
            plugin::ProviderInstance::Llm(llm) => llm,
            other => anyhow::bail!("plugin {} is a {} provider, not llm", name, other.kind()),
        },
        service => {
            let model = service.unwrap_or(DEFAULT_LLM_MODEL);
            Arc::new(HttpLlm::new(require_key(env)?, model)) as Arc<dyn LlmProvider>
        }
    };
    let tts = match env.tts_service.as_deref() {
        Some(name) if registry.contains(name) => match registry.create(name, env)? {
            plugin::ProviderInstance::Tts(tts) => tts,
            other => anyhow::bail!("plugin {} is a {} provider, not tts", name, other.kind()),
        },
        service => {
            let model = service.unwrap_or(DEFAULT_TTS_MODEL);
            Arc::new(HttpTts::new(require_key(env)?, model)) as Arc<dyn TtsProvider>
        }
    };

    Ok(ProviderSet { stt, llm, tts })
}

fn require_key(env: &ProviderEnv) -> Result<String> {
    env.require_openai_key()
        .context("providers need OPENAI_API_KEY")
}

fn build_device(console: bool) -> Box<dyn crate::audio::device::AudioDevice> {
    #[cfg(feature = "voice")]
    if !console {
        return Box::new(crate::audio::device::CpalDevice::new(
            crate::audio::device::DeviceOptions::default(),
        ));
    }
    let _ = console;
    Box::new(crate::audio::device::LoopbackDevice::new(
        crate::audio::device::DeviceOptions::default(),
    ))
}

async fn run_worker(options: WorkerOptions, console: bool) -> Result<()> {
    let providers = build_providers(&ProviderEnv::from_env())?;
    let agent = Arc::new(
        BaseAgent::new(options.agent_name.clone())
            .with_instructions("You are a helpful voice assistant. Keep replies short and conversational; they will be spoken aloud."),
    );

    let room: Option<Box<dyn Room>> = if console {
        Some(Box::new(MockRoom::new(
            options.room_name.clone().unwrap_or_else(|| "console".into()),
        )))
    } else {
        // Media transport plugs in through the library API; the bundled
        // CLI runs against the local audio device only.
        None
    };

    let worker = Worker::new(options)?;
    let cancel = worker.cancel_token();

    // Ctrl-C stops the worker, which cancels every session.
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            ctrlc_cancel.cancel();
        }
    });

    worker
        .run(room, move |ctx| async move {
            let device = build_device(console);
            let session = Session::start(agent, providers, device, SessionOptions::default())
                .await?;
            info!("session {} ready", session.id());
            ctx.cancel.cancelled().await;
            session.close().await
        })
        .await?;
    Ok(())
}

/// Hot-reload loop: run the console worker, restart on file changes.
async fn run_dev(config_path: Option<PathBuf>, watch: PathBuf) -> Result<()> {
    use notify::{RecursiveMode, Watcher};

    loop {
        let (change_tx, mut change_rx) = tokio::sync::mpsc::channel::<()>(1);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if event.is_ok() {
                let _ = change_tx.try_send(());
            }
        })
        .context("creating file watcher")?;
        watcher
            .watch(&watch, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", watch.display()))?;
        info!("dev mode: watching {} for changes", watch.display());

        let options = load_options(config_path.clone())?.for_console();
        let providers = build_providers(&ProviderEnv::from_env())?;
        let agent = Arc::new(BaseAgent::new(options.agent_name.clone()));
        let worker = Worker::new(options)?;
        let cancel = worker.cancel_token();

        let restart_cancel = cancel.clone();
        let change_task = tokio::spawn(async move {
            let changed = change_rx.recv().await.is_some();
            if changed {
                info!("source change detected, restarting worker");
                restart_cancel.cancel();
            }
            changed
        });

        let ctrlc_cancel = cancel.clone();
        let ctrlc_task = tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            ctrlc_cancel.cancel();
        });

        worker
            .run(None, move |ctx| async move {
                let device = build_device(true);
                let session =
                    Session::start(agent, providers, device, SessionOptions::default()).await?;
                ctx.cancel.cancelled().await;
                session.close().await
            })
            .await?;

        ctrlc_task.abort();
        // Dropping the watcher closes the change channel, so the await
        // below resolves even when no change fired.
        drop(watcher);
        match change_task.await {
            Ok(true) => {
                // Debounce editor save bursts before the next cycle.
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }
            _ => return Ok(()), // ctrl-c path
        }
    }
}

/// Configuration and environment self-check.
fn run_self_test(config_path: Option<PathBuf>) -> Result<()> {
    let options = load_options(config_path)?;
    println!("worker options: agent={} host={}:{}", options.agent_name, options.host, options.port);

    match options.validate() {
        Ok(()) => println!("media server configuration: ok"),
        Err(e) => println!("media server configuration: {} (console mode unaffected)", e),
    }

    let env = ProviderEnv::from_env();
    println!(
        "OPENAI_API_KEY: {}",
        if env.openai_api_key.is_some() { "set" } else { "missing" }
    );
    for (name, value) in [
        ("AGENTS_STT_SERVICE", &env.stt_service),
        ("AGENTS_LLM_SERVICE", &env.llm_service),
        ("AGENTS_TTS_SERVICE", &env.tts_service),
        ("AGENTS_VAD_SERVICE", &env.vad_service),
    ] {
        if let Some(value) = value {
            println!("{}: {}", name, value);
        }
    }

    if env.openai_api_key.is_none() {
        anyhow::bail!("no provider credentials configured");
    }
    println!("self test passed");
    Ok(())
}

/// The bundled providers are remote APIs; nothing needs prefetching. The
/// cache directory is still created so plugins that do download have a
/// home.
fn run_download_files() -> Result<()> {
    let cache = std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".cache"))
        .join("vox-agent");
    std::fs::create_dir_all(&cache)
        .with_context(|| format!("creating cache dir {}", cache.display()))?;
    println!("cache directory ready: {}", cache.display());
    println!("no model files required by the configured providers");
    if ProviderEnv::from_env().vad_service.is_some() {
        warn!("AGENTS_VAD_SERVICE is set; external VAD models are fetched by their plugin");
    }
    Ok(())
}
