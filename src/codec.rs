use async_trait::async_trait;
use hound::WavReader;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Wire codec name of [`Pcm16Codec`]
pub const PCM_FORMAT: &str = "pcm_s16le";

/// Invoked with each freshly encoded frame, possibly from a codec worker thread
pub type EncodedCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked with the samples of each decoded inbound frame
pub type DecodedCallback = Arc<dyn Fn(&[i16]) + Send + Sync>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec not initialized")]
    NotInitialized,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unsupported input audio: {0}")]
    UnsupportedInput(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes outbound audio to the wire codec and decodes inbound frames.
///
/// Callbacks are registered before `initialize`; an implementation may start
/// producing encoded frames as soon as `initialize` returns.
#[async_trait]
pub trait AudioCodec: Send {
    /// Wire codec name announced in `hello`
    fn format(&self) -> &str;

    async fn initialize(&mut self) -> Result<(), CodecError>;

    fn set_encoded_callback(&mut self, callback: EncodedCallback);

    fn set_decoded_callback(&mut self, callback: DecodedCallback);

    /// Accept one inbound wire frame for decoding
    async fn write_audio(&mut self, frame: &[u8]) -> Result<(), CodecError>;

    async fn close(&mut self) -> Result<(), CodecError>;
}

/// Raw 16-bit little-endian PCM "codec".
///
/// Outbound audio comes from an optional 16-bit mono WAV file streamed in
/// real time on a worker thread; without one the codec is receive-only.
pub struct Pcm16Codec {
    input_wav: Option<PathBuf>,
    sample_rate: u32,
    frame_duration_ms: u32,
    encoded: Option<EncodedCallback>,
    decoded: Option<DecodedCallback>,
    should_stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    initialized: bool,
    frames_decoded: u64,
}

impl Pcm16Codec {
    pub fn new(sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self {
            input_wav: None,
            sample_rate,
            frame_duration_ms,
            encoded: None,
            decoded: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            initialized: false,
            frames_decoded: 0,
        }
    }

    /// Stream this WAV file as the outbound audio source
    pub fn with_input_wav(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_wav = Some(path.into());
        self
    }

    /// Samples per outbound frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    fn start_worker(&mut self, path: PathBuf, callback: EncodedCallback) {
        let frame_samples = self.frame_samples().max(1);
        let frame_duration = Duration::from_millis(self.frame_duration_ms as u64);
        let should_stop = Arc::clone(&self.should_stop);

        self.worker = Some(thread::spawn(move || {
            match stream_wav(&path, frame_samples, frame_duration, &should_stop, callback) {
                Ok(frames) => log::info!("🎵 Input {} finished ({} frames)", path.display(), frames),
                Err(e) => log::error!("❌ Input {} failed: {}", path.display(), e),
            }
        }));
    }
}

#[async_trait]
impl AudioCodec for Pcm16Codec {
    fn format(&self) -> &str {
        PCM_FORMAT
    }

    async fn initialize(&mut self) -> Result<(), CodecError> {
        if self.initialized {
            return Ok(());
        }

        self.should_stop.store(false, Ordering::SeqCst);
        if let Some(path) = self.input_wav.clone() {
            verify_input(&path, self.sample_rate)?;
            match self.encoded.clone() {
                Some(callback) => self.start_worker(path, callback),
                None => log::warn!("⚠️  Input WAV configured but no encoded callback registered"),
            }
        }

        self.initialized = true;
        log::info!(
            "🎛️  PCM codec ready ({} Hz, {} ms frames)",
            self.sample_rate,
            self.frame_duration_ms
        );
        Ok(())
    }

    fn set_encoded_callback(&mut self, callback: EncodedCallback) {
        self.encoded = Some(callback);
    }

    fn set_decoded_callback(&mut self, callback: DecodedCallback) {
        self.decoded = Some(callback);
    }

    async fn write_audio(&mut self, frame: &[u8]) -> Result<(), CodecError> {
        if !self.initialized {
            return Err(CodecError::NotInitialized);
        }
        let samples = decode_pcm16(frame)?;
        self.frames_decoded += 1;
        if let Some(callback) = &self.decoded {
            callback(&samples);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CodecError> {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::error!("❌ Codec input thread panicked"),
                Err(e) => log::error!("❌ Failed to join codec input thread: {}", e),
            }
        }
        if self.initialized {
            log::debug!("PCM codec closed after {} decoded frames", self.frames_decoded);
        }
        self.initialized = false;
        Ok(())
    }
}

impl Drop for Pcm16Codec {
    fn drop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }
}

/// Little-endian bytes to samples; an odd trailing byte is an error
pub fn decode_pcm16(frame: &[u8]) -> Result<Vec<i16>, CodecError> {
    if frame.len() % 2 != 0 {
        return Err(CodecError::InvalidFrame(format!(
            "odd PCM frame length {}",
            frame.len()
        )));
    }
    Ok(frame
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

pub fn encode_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn verify_input(path: &Path, sample_rate: u32) -> Result<(), CodecError> {
    let reader = WavReader::new(BufReader::new(File::open(path)?))?;
    let spec = reader.spec();

    log::info!(
        "📊 Input file: {}Hz, {} channels, {} bits",
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    if spec.sample_rate != sample_rate {
        return Err(CodecError::UnsupportedInput(format!(
            "expected {}Hz sample rate, got {}Hz",
            sample_rate, spec.sample_rate
        )));
    }
    if spec.channels != 1 {
        return Err(CodecError::UnsupportedInput(format!(
            "expected mono audio, got {} channels",
            spec.channels
        )));
    }
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(CodecError::UnsupportedInput(format!(
            "expected 16-bit integer samples, got {} bits",
            spec.bits_per_sample
        )));
    }
    Ok(())
}

/// Stream a WAV file as frames paced at real time. Returns frames emitted.
fn stream_wav(
    path: &Path,
    frame_samples: usize,
    frame_duration: Duration,
    should_stop: &AtomicBool,
    callback: EncodedCallback,
) -> Result<u64, CodecError> {
    let mut reader = WavReader::new(BufReader::new(File::open(path)?))?;
    let mut samples = reader.samples::<i16>();
    let mut frame = Vec::with_capacity(frame_samples);
    let mut frames_sent = 0u64;
    let mut next_deadline = Instant::now();

    loop {
        if should_stop.load(Ordering::SeqCst) {
            log::debug!("Codec input thread stopping");
            break;
        }

        frame.clear();
        for sample in samples.by_ref().take(frame_samples) {
            frame.push(sample?);
        }
        if frame.is_empty() {
            break;
        }
        // pad the tail so every frame has the same duration
        frame.resize(frame_samples, 0);

        callback(encode_pcm16(&frame));
        frames_sent += 1;

        next_deadline += frame_duration;
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        }
    }

    Ok(frames_sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn write_test_wav(path: &Path, sample_rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_pcm_conversion() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = encode_pcm16(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(decode_pcm16(&bytes).unwrap(), samples);

        assert!(matches!(
            decode_pcm16(&[1, 2, 3]),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_frame_samples() {
        assert_eq!(Pcm16Codec::new(16000, 20).frame_samples(), 320);
        assert_eq!(Pcm16Codec::new(24000, 60).frame_samples(), 1440);
    }

    #[tokio::test]
    async fn test_decode_requires_initialize() {
        let mut codec = Pcm16Codec::new(16000, 20);
        assert!(matches!(
            codec.write_audio(&[0, 0]).await,
            Err(CodecError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_decoded_callback_receives_samples() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let mut codec = Pcm16Codec::new(16000, 20);
        codec.set_decoded_callback(Arc::new(move |samples: &[i16]| {
            sink.lock().unwrap().extend_from_slice(samples);
        }));
        codec.initialize().await.unwrap();

        codec.write_audio(&encode_pcm16(&[5, -5])).await.unwrap();
        codec.write_audio(&encode_pcm16(&[7])).await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![5, -5, 7]);
        assert_eq!(codec.frames_decoded(), 2);
        codec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_input_wav_is_streamed_in_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.wav");
        // 2.5 frames of 160 samples at 8 kHz / 20 ms
        let source: Vec<i16> = (0..400).map(|i| i as i16).collect();
        write_test_wav(&path, 8000, &source);

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);

        let mut codec = Pcm16Codec::new(8000, 20).with_input_wav(&path);
        codec.set_encoded_callback(Arc::new(move |frame: Vec<u8>| {
            sink.lock().unwrap().push(frame);
        }));
        codec.initialize().await.unwrap();

        // three frames at 20 ms pacing
        tokio::time::sleep(Duration::from_millis(300)).await;
        codec.close().await.unwrap();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 320));
        let first = decode_pcm16(&frames[0]).unwrap();
        assert_eq!(first[0], 0);
        assert_eq!(first[159], 159);
        let last = decode_pcm16(&frames[2]).unwrap();
        assert_eq!(last[79], 399);
        assert_eq!(last[80], 0);
    }

    #[tokio::test]
    async fn test_input_wav_format_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.wav");
        write_test_wav(&path, 44100, &[0; 10]);

        let mut codec = Pcm16Codec::new(16000, 20).with_input_wav(&path);
        codec.set_encoded_callback(Arc::new(|_frame: Vec<u8>| {}));
        assert!(matches!(
            codec.initialize().await,
            Err(CodecError::UnsupportedInput(_))
        ));
    }
}
