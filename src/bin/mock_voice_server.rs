use clap::Parser;
use log::info;
use simple_xiaozhi::mock_server::{MockServerConfig, MockVoiceServer};

#[derive(Parser, Debug)]
#[command(name = "mock-voice-server")]
#[command(about = "Local WebSocket voice server for exercising the client without a backend")]
struct Args {
    /// Address to bind the WebSocket server to
    #[arg(short, long, default_value = "127.0.0.1:8765")]
    address: String,

    /// Session id returned in the hello reply
    #[arg(long, default_value = "mock-session")]
    session_id: String,

    /// Never answer the client's hello (exercises the handshake timeout)
    #[arg(long)]
    no_hello: bool,

    /// Send received audio frames straight back to the client
    #[arg(long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("🚀 Starting mock voice server with args: {:?}", args);

    let config = MockServerConfig {
        bind_address: args.address,
        reply_hello: !args.no_hello,
        session_id: args.session_id,
        echo_audio: args.echo,
    };

    let server = MockVoiceServer::new(config).start().await?;
    info!("🎭 Mock voice server ready at {}", server.url());

    tokio::signal::ctrl_c().await?;
    info!("🛑 Received Ctrl+C, shutting down...");

    let texts = server.received_texts().len();
    let binaries = server.received_binaries().len();
    server.stop();
    info!(
        "🛑 Mock voice server stopped ({} connection(s), {} text and {} audio frame(s) received)",
        server.connection_count(),
        texts,
        binaries
    );

    Ok(())
}
