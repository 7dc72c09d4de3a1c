//! Per-session cache of spoken replies.
//!
//! Decoded TTS audio between a `tts start` and `tts stop` is collected into
//! one buffer and written out as a 16-bit mono WAV file inside a directory
//! created for the session.

use crate::config::CacheSettings;
use chrono::Local;
use dasp_sample::ToSample;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),
}

/// Sample types accepted by [`TtsCache::append_audio`].
///
/// Integers keep their value and saturate at the `i16` range. Floats are
/// full-scale `[-1.0, 1.0]` and get rescaled.
pub trait CacheSample: Copy {
    fn to_pcm16(self) -> i16;
}

impl CacheSample for i16 {
    fn to_pcm16(self) -> i16 {
        self
    }
}

macro_rules! impl_integer_sample {
    ($($t:ty),*) => {
        $(
            impl CacheSample for $t {
                fn to_pcm16(self) -> i16 {
                    self.clamp(i16::MIN as $t, i16::MAX as $t) as i16
                }
            }
        )*
    };
}

impl_integer_sample!(i32, i64);

impl CacheSample for f32 {
    fn to_pcm16(self) -> i16 {
        ToSample::<i16>::to_sample_(self)
    }
}

impl CacheSample for f64 {
    fn to_pcm16(self) -> i16 {
        ToSample::<i16>::to_sample_(self)
    }
}

/// A reply written to disk by [`TtsCache::end_tts`]
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceFile {
    pub path: PathBuf,
    pub sample_count: usize,
    pub chunk_count: usize,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    enabled: bool,
    session_dir: Option<PathBuf>,
    utterance_count: u32,
    collecting: bool,
    chunks: Vec<Vec<i16>>,
    start_time: Option<String>,
}

pub struct TtsCache {
    cache_dir: PathBuf,
    sample_rate: u32,
    channels: u16,
    state: Mutex<CacheState>,
}

impl TtsCache {
    pub fn new(settings: &CacheSettings, sample_rate: u32) -> Self {
        Self {
            cache_dir: settings.cache_dir.clone(),
            sample_rate,
            channels: 1,
            state: Mutex::new(CacheState {
                enabled: settings.enabled,
                ..CacheState::default()
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(
            &CacheSettings {
                enabled: false,
                ..CacheSettings::default()
            },
            24000,
        )
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn is_collecting(&self) -> bool {
        self.state().collecting
    }

    /// Directory of the active session, if one is open
    pub fn session_dir(&self) -> Option<PathBuf> {
        self.state().session_dir.clone()
    }

    /// Files written in the active session
    pub fn utterance_count(&self) -> u32 {
        self.state().utterance_count
    }

    /// Create `<cache_dir>/<YYYYMMDD-HHMMSS>/`. A failure disables caching
    /// for the rest of the run.
    pub fn start_session(&self) -> Option<PathBuf> {
        let mut state = self.state();
        if !state.enabled {
            return None;
        }
        if let Some(dir) = &state.session_dir {
            log::debug!("TTS cache session already open: {}", dir.display());
            return Some(dir.clone());
        }

        let dir = self
            .cache_dir
            .join(Local::now().format("%Y%m%d-%H%M%S").to_string());
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                log::info!("📁 TTS cache session: {}", dir.display());
                state.session_dir = Some(dir.clone());
                state.utterance_count = 0;
                Some(dir)
            }
            Err(e) => {
                log::warn!(
                    "⚠️  Failed to create TTS cache directory {}: {} (caching disabled)",
                    dir.display(),
                    e
                );
                state.enabled = false;
                None
            }
        }
    }

    /// Flush any pending reply and retire the session directory
    pub fn end_session(&self) {
        let mut state = self.state();
        if state.collecting {
            self.flush(&mut state);
        }
        if let Some(dir) = state.session_dir.take() {
            log::info!(
                "📁 TTS cache session closed: {} ({} file(s))",
                dir.display(),
                state.utterance_count
            );
        }
        state.utterance_count = 0;
    }

    /// Begin collecting a reply. An unfinished reply is written out first.
    pub fn start_tts(&self) {
        let mut state = self.state();
        if !state.enabled || state.session_dir.is_none() {
            return;
        }
        if state.collecting && !state.chunks.is_empty() {
            log::debug!("TTS start while collecting, saving previous reply");
            self.flush(&mut state);
        }
        state.chunks.clear();
        state.collecting = true;
        state.start_time = Some(Local::now().format("%H%M%S").to_string());
        log::debug!("🗣️  Collecting TTS audio");
    }

    /// Append decoded samples; ignored unless a reply is being collected
    pub fn append_audio<S: CacheSample>(&self, samples: &[S]) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state();
        if !state.enabled || !state.collecting {
            return;
        }
        state
            .chunks
            .push(samples.iter().map(|&s| s.to_pcm16()).collect());
    }

    /// Finish the current reply and write it out
    pub fn end_tts(&self) -> Option<UtteranceFile> {
        let mut state = self.state();
        if !state.enabled || !state.collecting {
            return None;
        }
        self.flush(&mut state)
    }

    fn flush(&self, state: &mut CacheState) -> Option<UtteranceFile> {
        state.collecting = false;
        let start_time = state.start_time.take();
        let chunks = std::mem::take(&mut state.chunks);
        if chunks.is_empty() {
            return None;
        }
        let session_dir = state.session_dir.clone()?;

        state.utterance_count += 1;
        let start_time =
            start_time.unwrap_or_else(|| Local::now().format("%H%M%S").to_string());
        let path = session_dir.join(format!("{}_{:04}.wav", start_time, state.utterance_count));

        let chunk_count = chunks.len();
        let samples = chunks.concat();
        let duration_secs =
            samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64);

        match write_wav(&path, &samples, self.sample_rate, self.channels) {
            Ok(()) => {
                log::info!(
                    "💾 TTS audio saved: {} (duration: {:.2}s, chunks: {})",
                    path.display(),
                    duration_secs,
                    chunk_count
                );
                Some(UtteranceFile {
                    path,
                    sample_count: samples.len(),
                    chunk_count,
                    sample_rate: self.sample_rate,
                    duration_secs,
                })
            }
            Err(e) => {
                log::warn!("⚠️  Failed to save TTS audio {}: {}", path.display(), e);
                if path.exists() {
                    if let Err(e) = fs::remove_file(&path) {
                        log::debug!("Could not remove partial file {}: {}", path.display(), e);
                    }
                }
                None
            }
        }
    }
}

/// Canonical 44-byte header followed by 16-bit little-endian samples
pub fn write_wav(
    path: &Path,
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> Result<(), CacheError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
