//! Content-addressed speech cache in front of a synthesis collaborator.
//!
//! Entries are keyed by the SHA-256 of the normalized speaker and the spoken
//! text, written once and never mutated. Prefetching resolves every spoken
//! part of a script concurrently and hands the timeline an ordered book of
//! clip paths.

mod http;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};

use crate::config::SpeechConfig;
use crate::script::Thread;

pub use http::HttpSpeechClient;

const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

/// One call to the synthesis collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub speaker: String,
    pub voice_id: String,
    pub text: String,
    pub settings: VoiceSettings,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns encoded audio bytes (mp3 or anything ffmpeg can decode).
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct VoiceMap {
    default_voice: String,
    voices: BTreeMap<String, String>,
}

impl VoiceMap {
    pub fn new(default_voice: impl Into<String>, voices: &BTreeMap<String, String>) -> Self {
        Self {
            default_voice: default_voice.into(),
            voices: voices
                .iter()
                .map(|(speaker, voice)| (normalize_speaker(speaker), voice.clone()))
                .collect(),
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(config.default_voice.clone(), &config.voices)
    }

    pub fn voice_for(&self, speaker: &str) -> &str {
        self.voices
            .get(&normalize_speaker(speaker))
            .map(String::as_str)
            .unwrap_or(&self.default_voice)
    }
}

/// Trim, lowercase and collapse inner whitespace.
pub fn normalize_speaker(speaker: &str) -> String {
    speaker
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn cache_key(speaker: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_speaker(speaker).as_bytes());
    hasher.update(KEY_SEPARATOR.to_string().as_bytes());
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub struct SpeechCache {
    cache_dir: PathBuf,
    working_copy_dir: PathBuf,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voices: VoiceMap,
    settings: VoiceSettings,
    in_flight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SpeechCache {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        working_copy_dir: impl Into<PathBuf>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voices: VoiceMap,
        settings: VoiceSettings,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let working_copy_dir = working_copy_dir.into();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create speech cache {}", cache_dir.display()))?;
        fs::create_dir_all(&working_copy_dir).with_context(|| {
            format!(
                "failed to create speech working copy dir {}",
                working_copy_dir.display()
            )
        })?;
        Ok(Self {
            cache_dir,
            working_copy_dir,
            synthesizer,
            voices,
            settings,
            in_flight: StdMutex::new(HashMap::new()),
        })
    }

    pub fn entry_path(&self, speaker: &str, text: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.mp3", cache_key(speaker, text)))
    }

    /// Returns the cached clip for `(speaker, text)`, synthesizing it on a miss.
    pub async fn resolve_speech(&self, speaker: &str, text: &str) -> Result<PathBuf> {
        if text.trim().is_empty() {
            bail!("cannot synthesize empty text for speaker '{speaker}'");
        }
        let key = cache_key(speaker, text);
        let path = self.cache_dir.join(format!("{key}.mp3"));
        if is_populated(&path) {
            tracing::debug!(speaker, file = %path.display(), "speech cache hit");
            return Ok(path);
        }

        let guard = self.key_guard(&key)?;
        let _held = guard.lock().await;
        // Another task may have filled the entry while we waited.
        if is_populated(&path) {
            return Ok(path);
        }

        let request = SpeechRequest {
            speaker: speaker.to_owned(),
            voice_id: self.voices.voice_for(speaker).to_owned(),
            text: text.to_owned(),
            settings: self.settings.clone(),
        };
        tracing::info!(speaker, voice = %request.voice_id, "synthesizing speech");
        let bytes = self
            .synthesizer
            .synthesize(&request)
            .await
            .with_context(|| format!("speech synthesis failed for speaker '{speaker}'"))?;
        if bytes.is_empty() {
            bail!("speech synthesis returned no audio for speaker '{speaker}'");
        }

        write_atomic(&self.cache_dir, &path, &bytes)?;
        let working_copy = self.working_copy_dir.join(format!("{key}.mp3"));
        fs::copy(&path, &working_copy).with_context(|| {
            format!(
                "failed to copy speech clip into working dir {}",
                working_copy.display()
            )
        })?;
        Ok(path)
    }

    fn key_guard(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut guards = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("speech in-flight registry poisoned"))?;
        Ok(guards
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

fn is_populated(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write speech clip for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|error| anyhow!("failed to persist speech clip {}: {}", path.display(), error))?;
    Ok(())
}

/// A spoken part of the script, in script order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeechLine {
    pub speaker: String,
    pub text: String,
}

pub fn collect_speech_requests(threads: &[Thread]) -> Vec<SpeechLine> {
    threads
        .iter()
        .flat_map(|thread| thread.messages.iter())
        .flat_map(|message| message.spoken_parts())
        .map(|part| SpeechLine {
            speaker: part.speaker.to_owned(),
            text: part.text.to_owned(),
        })
        .collect()
}

/// Resolved clip paths, one per spoken line, in script order.
#[derive(Debug, Clone, Default)]
pub struct SpeechBook {
    entries: Vec<(SpeechLine, PathBuf)>,
    by_key: HashMap<String, usize>,
}

impl SpeechBook {
    pub fn insert(&mut self, line: SpeechLine, path: PathBuf) {
        let key = cache_key(&line.speaker, &line.text);
        self.by_key.entry(key).or_insert(self.entries.len());
        self.entries.push((line, path));
    }

    pub fn get(&self, speaker: &str, text: &str) -> Option<&Path> {
        self.by_key
            .get(&cache_key(speaker, text))
            .map(|&index| self.entries[index].1.as_path())
    }

    pub fn require(&self, speaker: &str, text: &str) -> Result<&Path> {
        self.get(speaker, text)
            .ok_or_else(|| anyhow!("no speech clip was resolved for {speaker}: '{text}'"))
    }

    pub fn entries(&self) -> &[(SpeechLine, PathBuf)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves every line concurrently, at most `max_concurrency` at a time.
/// Results are written back in input order; the first failure aborts the rest.
pub async fn prefetch_speech(
    cache: Arc<SpeechCache>,
    lines: Vec<SpeechLine>,
    max_concurrency: usize,
) -> Result<SpeechBook> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = Vec::with_capacity(lines.len());

    for line in &lines {
        let cache = Arc::clone(&cache);
        let semaphore = Arc::clone(&semaphore);
        let speaker = line.speaker.clone();
        let text = line.text.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("speech prefetch semaphore closed"))?;
            cache.resolve_speech(&speaker, &text).await
        }));
    }

    let mut book = SpeechBook::default();
    let mut pending = tasks.into_iter();
    for (index, line) in lines.into_iter().enumerate() {
        let Some(task) = pending.next() else {
            break;
        };
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow!("speech task {index} panicked: {join_error}")),
        };
        match result {
            Ok(path) => book.insert(line, path),
            Err(error) => {
                for remaining in pending {
                    remaining.abort();
                }
                return Err(error.context(format!("speech line {index} failed")));
            }
        }
    }
    tracing::info!(lines = book.len(), "speech prefetch complete");
    Ok(book)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingSynth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechSynthesizer for CountingSynth {
        async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(format!("{}:{}", request.voice_id, request.text).into_bytes())
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl SpeechSynthesizer for FailingSynth {
        async fn synthesize(&self, _request: &SpeechRequest) -> Result<Vec<u8>> {
            bail!("provider returned 503")
        }
    }

    fn settings() -> VoiceSettings {
        VoiceSettings {
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }

    fn cache_with(
        dir: &Path,
        synth: Arc<dyn SpeechSynthesizer>,
    ) -> SpeechCache {
        let mut voices = BTreeMap::new();
        voices.insert("Alice".to_owned(), "voice-alice".to_owned());
        SpeechCache::new(
            dir.join("cache"),
            dir.join("work"),
            synth,
            VoiceMap::new("narrator", &voices),
            settings(),
        )
        .unwrap()
    }

    #[test]
    fn speaker_normalization_and_keys() {
        assert_eq!(normalize_speaker("  Big   Bob "), "big bob");
        assert_eq!(cache_key("Alice", "Hello"), cache_key(" alice ", "Hello"));
        assert_ne!(cache_key("Alice", "Hello"), cache_key("Alice", "Hello!"));
        assert_eq!(cache_key("a", "b").len(), 64);
    }

    #[test]
    fn voice_map_falls_back_to_default() {
        let mut voices = BTreeMap::new();
        voices.insert("Alice".to_owned(), "voice-alice".to_owned());
        let map = VoiceMap::new("narrator", &voices);
        assert_eq!(map.voice_for("ALICE"), "voice-alice");
        assert_eq!(map.voice_for("Bob"), "narrator");
    }

    #[tokio::test]
    async fn repeated_resolution_hits_cache() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
        });
        let cache = cache_with(dir.path(), synth.clone());

        let first = cache.resolve_speech("Alice", "Hello").await.unwrap();
        let second = cache.resolve_speech("Alice", "Hello").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_to_string(&first).unwrap(), "voice-alice:Hello");
        let key = cache_key("Alice", "Hello");
        assert!(dir.path().join("work").join(format!("{key}.mp3")).is_file());
    }

    #[tokio::test]
    async fn concurrent_identical_requests_synthesize_once() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(cache_with(dir.path(), synth.clone()));
        let lines = vec![
            SpeechLine {
                speaker: "Alice".into(),
                text: "Hi".into(),
            };
            6
        ];
        let book = prefetch_speech(cache, lines, 4).await.unwrap();
        assert_eq!(book.len(), 6);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefetch_keeps_script_order() {
        let dir = tempdir().unwrap();
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(cache_with(dir.path(), synth));
        let lines = ["one", "two", "three"]
            .iter()
            .map(|text| SpeechLine {
                speaker: "Bob".into(),
                text: (*text).into(),
            })
            .collect::<Vec<_>>();
        let book = prefetch_speech(cache, lines, 2).await.unwrap();
        let texts = book
            .entries()
            .iter()
            .map(|(line, _)| line.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, ["one", "two", "three"]);
        assert!(book.get("bob", "two").is_some());
        assert!(book.require("Bob", "four").is_err());
    }

    #[tokio::test]
    async fn synthesis_failure_is_an_error_and_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let cache = cache_with(dir.path(), Arc::new(FailingSynth));
        let error = cache.resolve_speech("Alice", "Hello").await.unwrap_err();
        assert!(format!("{error:#}").contains("503"));
        assert!(!cache.entry_path("Alice", "Hello").exists());
    }
}
