use anyhow::Context;
use clap::Parser;
use simple_xiaozhi::{load_config, Pcm16Codec, VoiceClient};
use std::path::PathBuf;
use std::sync::Arc;
use xiaozhi_protocol::listen_mode;

#[derive(Parser, Debug)]
#[command(name = "xiaozhi-client")]
#[command(about = "Stream microphone audio to a voice assistant and cache its spoken replies")]
struct Args {
    /// JSON config file (config/config.json is used when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listening mode sent with listen/start
    #[arg(long, default_value = listen_mode::REALTIME)]
    mode: String,

    /// Directory for cached TTS replies (enables the cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Disable the TTS cache
    #[arg(long, conflicts_with = "cache_dir")]
    no_cache: bool,

    /// 16 kHz mono 16-bit WAV file streamed as microphone input
    #[arg(long)]
    input_wav: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    log::info!("🚀 Initializing xiaozhi client");

    let mut settings =
        load_config(args.config.as_deref()).context("Failed to load configuration")?;
    settings = settings.with_listen_mode(&args.mode);
    if let Some(cache_dir) = args.cache_dir {
        settings = settings.with_cache_dir(cache_dir).with_cache_enabled(true);
    }
    if args.no_cache {
        settings = settings.with_cache_enabled(false);
    }
    let settings = Arc::new(settings);

    let mut codec = Pcm16Codec::new(
        settings.audio.input_sample_rate,
        settings.audio.frame_duration_ms,
    );
    if let Some(input_wav) = args.input_wav {
        codec = codec.with_input_wav(input_wav);
    }

    let client = VoiceClient::new(Arc::clone(&settings), Box::new(codec));
    client
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Voice session failed")?;

    println!("\n👋 Goodbye!");
    Ok(())
}
