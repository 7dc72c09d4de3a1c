use serde_json::Value;
use simple_xiaozhi::codec::{encode_pcm16, Pcm16Codec};
use simple_xiaozhi::config::ClientSettings;
use simple_xiaozhi::mock_server::{MockServerConfig, MockServerHandle, MockVoiceServer};
use simple_xiaozhi::VoiceClient;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(reply_hello: bool) -> MockServerHandle {
    env_logger::try_init().ok();
    MockVoiceServer::new(MockServerConfig {
        reply_hello,
        ..MockServerConfig::default()
    })
    .start()
    .await
    .unwrap()
}

fn client_for(server: &MockServerHandle, cache_dir: &Path) -> Arc<VoiceClient> {
    let settings = ClientSettings::new(&server.url(), "token", "device-1", "client-1")
        .unwrap()
        .with_cache_dir(cache_dir)
        .with_cache_enabled(true)
        .with_handshake_timeout(Duration::from_millis(300));
    let settings = Arc::new(settings);
    let codec = Pcm16Codec::new(
        settings.audio.input_sample_rate,
        settings.audio.frame_duration_ms,
    );
    Arc::new(VoiceClient::new(settings, Box::new(codec)))
}

fn cached_files(cache_root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for session in fs::read_dir(cache_root).unwrap() {
        let session = session.unwrap().path();
        if session.is_dir() {
            for file in fs::read_dir(&session).unwrap() {
                files.push(file.unwrap().path());
            }
        }
    }
    files.sort();
    files
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_session_caches_spoken_reply() {
    let server = start_server(true).await;
    let cache_root = tempfile::tempdir().unwrap();
    let client = client_for(&server, cache_root.path());

    let runner = Arc::clone(&client);
    let run = tokio::spawn(async move { runner.run(std::future::pending()).await });

    // hello, then listen/start
    let texts = server.wait_for_texts(2, WAIT).await;
    assert_eq!(texts.len(), 2);
    let listen: Value = serde_json::from_str(&texts[1]).unwrap();
    assert_eq!(listen["type"], "listen");
    assert_eq!(listen["state"], "start");
    assert_eq!(listen["mode"], "realtime");

    server.send_text(r#"{"type":"stt","text":"what time is it"}"#);
    server.send_text(r#"{"type":"tts","state":"start"}"#);
    server.send_text(r#"{"type":"tts","state":"sentence_start","text":"It is noon."}"#);
    server.send_binary(encode_pcm16(&[10; 480]));
    server.send_binary(encode_pcm16(&[20; 240]));
    server.send_text(r#"{"type":"tts","state":"stop"}"#);

    let cache = Arc::clone(client.cache());
    assert!(wait_until(|| cache.utterance_count() == 1).await);

    server.close_connection();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());

    let files = cached_files(cache_root.path());
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("_0001.wav"), "unexpected name {}", name);

    let mut reader = hound::WavReader::open(&files[0]).unwrap();
    assert_eq!(reader.spec().sample_rate, 24000);
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 720);
    assert_eq!(samples[0], 10);
    assert_eq!(samples[719], 20);

    // teardown ran and stays a no-op
    assert!(!client.pipeline().is_running());
    assert!(client.cache().session_dir().is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn test_explicit_shutdown_sends_listen_stop() {
    let server = start_server(true).await;
    let cache_root = tempfile::tempdir().unwrap();
    let client = client_for(&server, cache_root.path());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = Arc::clone(&client);
    let run = tokio::spawn(async move {
        runner
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });

    server.wait_for_texts(2, WAIT).await;
    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());

    let texts = server.wait_for_texts(3, WAIT).await;
    let last: Value = serde_json::from_str(texts.last().unwrap()).unwrap();
    assert_eq!(last["type"], "listen");
    assert_eq!(last["state"], "stop");
    assert!(!client.transport().is_connected().await);

    // nothing was spoken, so nothing was cached
    assert!(cached_files(cache_root.path()).is_empty());
}

#[tokio::test]
async fn test_missing_hello_fails_run_and_cleans_up() {
    let server = start_server(false).await;
    let cache_root = tempfile::tempdir().unwrap();
    let client = client_for(&server, cache_root.path());

    let result = tokio::time::timeout(WAIT, client.run(std::future::pending()))
        .await
        .unwrap();

    let err = result.unwrap_err();
    assert!(err.is_handshake_timeout(), "unexpected error {}", err);
    assert!(!client.transport().is_connected().await);
    assert!(!client.pipeline().is_running());
    assert!(client.cache().session_dir().is_none());
}

#[tokio::test]
#[cfg_attr(not(feature = "test-integration"), ignore)]
async fn test_handshake_with_configured_endpoint() {
    env_logger::try_init().ok();
    let settings = match simple_xiaozhi::load_config(None) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            log::info!("No endpoint configured - skipping: {}", e);
            return;
        }
    };

    let client = VoiceClient::new(
        Arc::clone(&settings),
        Box::new(Pcm16Codec::new(16000, 20)),
    );
    client.transport().connect().await.unwrap();
    client.transport().handshake().await.unwrap();
    client.shutdown().await;
}
