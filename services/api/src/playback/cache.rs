//! services/api/src/playback/cache.rs
//!
//! Per-document-session cache of synthesized sentence audio, populated
//! lazily. Entries are never evicted within a session (bounded by the
//! document's sentence count) and are released wholesale when the session
//! ends.

use futures::future::join_all;
use lectern_core::ports::{PortResult, SpeechSynthesisService};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::warn;

type AudioHandle = Arc<Vec<u8>>;

/// Maps sentence index to a synthesized-audio handle.
pub struct SentenceAudioCache {
    synth: Arc<dyn SpeechSynthesisService>,
    entries: Mutex<HashMap<usize, Arc<OnceCell<AudioHandle>>>>,
}

impl SentenceAudioCache {
    pub fn new(synth: Arc<dyn SpeechSynthesisService>) -> Self {
        Self {
            synth,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for a sentence, synthesizing it first if
    /// needed. Concurrent callers for the same index share one synthesis
    /// call; a failed synthesis leaves the slot empty so a later call can
    /// retry.
    pub async fn get(&self, index: usize, text: &str) -> PortResult<AudioHandle> {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(index).or_default().clone()
        };
        let audio = cell
            .get_or_try_init(|| async {
                let bytes = self.synth.synthesize(text).await?;
                Ok::<_, lectern_core::ports::PortError>(Arc::new(bytes))
            })
            .await?;
        Ok(audio.clone())
    }

    /// Fire-and-forget synthesis of one sentence, used to warm index + 1
    /// while index is playing. Best-effort: errors are swallowed.
    pub fn prefetch(&self, index: usize, text: String) {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(index).or_default().clone()
        };
        let synth = self.synth.clone();
        tokio::spawn(async move {
            let filled = cell
                .get_or_try_init(|| async {
                    let bytes = synth.synthesize(&text).await?;
                    Ok::<_, lectern_core::ports::PortError>(Arc::new(bytes))
                })
                .await;
            if let Err(e) = filled {
                warn!("Prefetch of sentence {} failed: {}", index, e);
            }
        });
    }

    /// Warms a window of sentences in parallel, e.g. around a seek target.
    /// Like `prefetch`, failures are ignored.
    pub async fn warm(&self, entries: Vec<(usize, String)>) {
        let tasks = entries
            .into_iter()
            .map(|(index, text)| async move {
                if let Err(e) = self.get(index, &text).await {
                    warn!("Warmup of sentence {} failed: {}", index, e);
                }
            })
            .collect::<Vec<_>>();
        join_all(tasks).await;
    }

    /// Number of populated or in-flight slots, mainly for diagnostics.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSynth;
    use std::time::Duration;

    #[tokio::test]
    async fn repeated_gets_synthesize_once() {
        let synth = FakeSynth::instant();
        let cache = SentenceAudioCache::new(synth.clone());

        let first = cache.get(0, "Hello there.").await.unwrap();
        let second = cache.get(0, "Hello there.").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(synth.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_synthesis_call() {
        let synth = FakeSynth::with_delay(Duration::from_millis(30));
        let cache = Arc::new(SentenceAudioCache::new(synth.clone()));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(3, "Sentence 3.").await })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(3, "Sentence 3.").await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(synth.call_count(), 1);
    }

    #[tokio::test]
    async fn failed_synthesis_can_be_retried() {
        let synth = FakeSynth::failing_first(1);
        let cache = Arc::new(SentenceAudioCache::new(synth.clone()));

        // Prefetch swallows the failure.
        cache.prefetch(0, "Sentence 0.".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A direct get retries and succeeds.
        let audio = cache.get(0, "Sentence 0.").await.unwrap();
        assert!(!audio.is_empty());
    }

    #[tokio::test]
    async fn warm_fills_a_window() {
        let synth = FakeSynth::instant();
        let cache = SentenceAudioCache::new(synth.clone());

        cache
            .warm(vec![
                (5, "Sentence 5.".to_string()),
                (6, "Sentence 6.".to_string()),
                (7, "Sentence 7.".to_string()),
            ])
            .await;

        assert_eq!(cache.len(), 3);
        assert_eq!(synth.call_count(), 3);
    }
}
