use simple_xiaozhi::config::CacheSettings;
use simple_xiaozhi::tts_cache::TtsCache;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

fn cache_in(dir: &Path) -> TtsCache {
    TtsCache::new(
        &CacheSettings {
            enabled: true,
            cache_dir: dir.to_path_buf(),
        },
        24000,
    )
}

fn read_samples(path: &Path) -> Vec<i16> {
    let mut reader = hound::WavReader::open(path).unwrap();
    reader.samples::<i16>().map(|s| s.unwrap()).collect()
}

#[test]
fn test_reply_is_written_as_one_wav() {
    env_logger::try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let session = cache.start_session().expect("session dir");

    cache.start_tts();
    cache.append_audio(&vec![100i16; 8000]);
    cache.append_audio(&vec![200i16; 8000]);
    cache.append_audio(&vec![300i16; 4000]);
    let file = cache.end_tts().expect("utterance written");

    assert_eq!(file.sample_count, 20000);
    assert_eq!(file.chunk_count, 3);
    assert!((file.duration_secs - 0.833).abs() < 0.001);
    assert!(file.path.starts_with(&session));

    let name = file.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("_0001.wav"), "unexpected name {}", name);
    assert_eq!(name.len(), "HHMMSS_0001.wav".len());

    // 44-byte header + 40000 data bytes
    let bytes = fs::read(&file.path).unwrap();
    assert_eq!(bytes.len(), 44 + 40000);
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
    assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 1);
    assert_eq!(
        u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
        24000
    );
    assert_eq!(u16::from_le_bytes([bytes[34], bytes[35]]), 16);
    assert_eq!(
        u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]),
        40000
    );

    let spec = hound::WavReader::open(&file.path).unwrap().spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 24000);
    assert_eq!(spec.bits_per_sample, 16);
}

#[test]
fn test_chunks_are_concatenated_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    cache.start_session().unwrap();

    cache.start_tts();
    cache.append_audio(&[1i16, 2, 3]);
    cache.append_audio(&[4i16]);
    cache.append_audio::<i16>(&[]);
    cache.append_audio(&[5i16, 6]);
    let file = cache.end_tts().unwrap();

    assert_eq!(file.chunk_count, 3);
    assert_eq!(read_samples(&file.path), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_empty_reply_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let session = cache.start_session().unwrap();

    cache.start_tts();
    assert!(cache.end_tts().is_none());
    assert_eq!(cache.utterance_count(), 0);
    assert_eq!(fs::read_dir(&session).unwrap().count(), 0);

    // the next real reply still gets the first sequence number
    cache.start_tts();
    cache.append_audio(&[7i16; 10]);
    let file = cache.end_tts().unwrap();
    assert!(file.path.to_string_lossy().ends_with("_0001.wav"));
}

#[test]
fn test_restart_flushes_previous_reply() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let session = cache.start_session().unwrap();

    cache.start_tts();
    cache.append_audio(&[1i16; 100]);
    cache.start_tts();
    cache.append_audio(&[2i16; 50]);
    let second = cache.end_tts().unwrap();

    assert_eq!(cache.utterance_count(), 2);
    assert!(second.path.to_string_lossy().ends_with("_0002.wav"));
    assert_eq!(read_samples(&second.path), vec![2i16; 50]);

    let mut names: Vec<String> = fs::read_dir(&session)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort_by(|a, b| a[7..].cmp(&b[7..]));
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("_0001.wav"));
    assert_eq!(read_samples(&session.join(&names[0])), vec![1i16; 100]);
}

#[test]
fn test_end_session_flushes_pending_reply() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let session = cache.start_session().unwrap();

    cache.start_tts();
    cache.append_audio(&[9i16; 24]);
    cache.end_session();

    assert!(!cache.is_collecting());
    assert!(cache.session_dir().is_none());
    assert_eq!(fs::read_dir(&session).unwrap().count(), 1);
}

#[test]
fn test_unwritable_cache_dir_disables_cache() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"file").unwrap();

    let cache = cache_in(&blocker);
    assert!(cache.start_session().is_none());
    assert!(!cache.is_enabled());

    cache.start_tts();
    cache.append_audio(&[1i16; 10]);
    assert!(cache.end_tts().is_none());
}

#[test]
fn test_failed_write_does_not_stop_later_replies() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let session = cache.start_session().unwrap();

    // the session directory vanishes under the cache mid-reply
    cache.start_tts();
    cache.append_audio(&[3i16; 10]);
    fs::remove_dir_all(&session).unwrap();
    assert!(cache.end_tts().is_none());
    assert!(!cache.is_collecting());
    assert!(cache.is_enabled());

    fs::create_dir_all(&session).unwrap();
    cache.start_tts();
    cache.append_audio(&[4i16; 10]);
    let file = cache.end_tts().expect("next reply written");

    assert!(file.path.to_string_lossy().ends_with("_0002.wav"));
    assert_eq!(read_samples(&file.path), vec![4i16; 10]);
    assert_eq!(fs::read_dir(&session).unwrap().count(), 1);
}

#[test]
fn test_concurrent_appends_are_all_kept() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(cache_in(dir.path()));
    cache.start_session().unwrap();
    cache.start_tts();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..50 {
                    cache.append_audio(&[5i16; 48]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let file = cache.end_tts().unwrap();
    assert_eq!(file.chunk_count, 200);
    assert_eq!(file.sample_count, 200 * 48);
}
