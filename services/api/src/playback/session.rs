//! services/api/src/playback/session.rs
//!
//! The playback loop for one open document: sequential sentence playback
//! with seek, synchronous stop, next-sentence prefetch, and debounced
//! persistence of the listening position.

use crate::playback::cache::SentenceAudioCache;
use lectern_core::ports::{AudioSink, DatabaseService, PortResult, SpeechSynthesisService};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

//=========================================================================================
// Debounced Position Writes
//=========================================================================================

/// Coalesces rapid position updates into one write after a short quiet
/// period. Best-effort: a lost write only degrades resume accuracy.
struct PositionDebouncer {
    db: Arc<dyn DatabaseService>,
    document_id: Uuid,
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl PositionDebouncer {
    fn new(db: Arc<dyn DatabaseService>, document_id: Uuid, delay: Duration) -> Self {
        Self {
            db,
            document_id,
            delay,
            pending: Mutex::new(None),
        }
    }

    fn record(&self, sentence_index: i64) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let db = self.db.clone();
        let document_id = self.document_id;
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = db.upsert_playback_position(document_id, sentence_index).await {
                warn!(
                    "Best-effort position write for document {} failed: {}",
                    document_id, e
                );
            }
        }));
    }
}

//=========================================================================================
// The Playback Session
//=========================================================================================

/// Drives sentence-by-sentence playback for one open document. Sentences
/// are snapshotted in reading order at open time; audio is synthesized
/// lazily through the session's cache. Cloning is cheap and shares the
/// cache, the cancellation state, and the debouncer.
#[derive(Clone)]
pub struct PlaybackSession {
    db: Arc<dyn DatabaseService>,
    sink: Arc<dyn AudioSink>,
    cache: Arc<SentenceAudioCache>,
    document_id: Uuid,
    sentences: Arc<Vec<String>>,
    /// Token of the current play session. Cancelled on stop or seek; a new
    /// play always gets a fresh token, never resumes a cancelled one.
    current: Arc<Mutex<CancellationToken>>,
    debouncer: Arc<PositionDebouncer>,
}

impl PlaybackSession {
    /// Opens a playback session over the sentences stored so far. With a
    /// partially extracted document this is the unlocked prefix; reopening
    /// after extraction completes picks up the rest.
    pub async fn open(
        db: Arc<dyn DatabaseService>,
        synth: Arc<dyn SpeechSynthesisService>,
        sink: Arc<dyn AudioSink>,
        document_id: Uuid,
        position_debounce: Duration,
    ) -> PortResult<Self> {
        let sentences = db
            .list_sentences(document_id)
            .await?
            .into_iter()
            .map(|s| s.text)
            .collect::<Vec<_>>();
        info!(
            "Opened playback session for document {} with {} sentences",
            document_id,
            sentences.len()
        );
        Ok(Self {
            db: db.clone(),
            sink,
            cache: Arc::new(SentenceAudioCache::new(synth)),
            document_id,
            sentences: Arc::new(sentences),
            current: Arc::new(Mutex::new(CancellationToken::new())),
            debouncer: Arc::new(PositionDebouncer::new(db, document_id, position_debounce)),
        })
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    /// Last persisted listening position, for resume.
    pub async fn resume_index(&self) -> PortResult<i64> {
        Ok(self
            .db
            .get_playback_position(self.document_id)
            .await?
            .map(|p| p.sentence_index)
            .unwrap_or(0))
    }

    /// Starts sequential playback at `start`. Any in-flight loop is
    /// cancelled first; the new loop runs in the background until the
    /// document ends or the session is stopped.
    pub fn play_from(&self, start: usize) {
        let token = self.fresh_session();
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.run_loop(start, token).await {
                error!(
                    "Playback loop for document {} failed: {}",
                    session.document_id, e
                );
            }
        });
    }

    /// Seeks: cancels the in-flight loop and restarts at the new index.
    pub fn jump_to(&self, index: usize) {
        info!(
            "Seek to sentence {} in document {}",
            index, self.document_id
        );
        self.play_from(index);
    }

    /// Synchronously halts audio output and prevents any further synthesis
    /// for this play session.
    pub fn stop(&self) {
        self.current.lock().unwrap().cancel();
    }

    /// Cancels the previous play session and installs a fresh token.
    fn fresh_session(&self) -> CancellationToken {
        let mut current = self.current.lock().unwrap();
        current.cancel();
        let fresh = CancellationToken::new();
        *current = fresh.clone();
        fresh
    }

    async fn run_loop(&self, start: usize, token: CancellationToken) -> PortResult<()> {
        let mut index = start;
        while index < self.sentences.len() {
            if token.is_cancelled() {
                info!("Playback cancelled at sentence {}", index);
                return Ok(());
            }

            // Cancellation during synthesis abandons the wait; the cache
            // slot still fills for the next session.
            let audio = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                audio = self.cache.get(index, &self.sentences[index]) => audio?,
            };

            // Warm the next sentence while this one is playing.
            if index + 1 < self.sentences.len() {
                self.cache
                    .prefetch(index + 1, self.sentences[index + 1].clone());
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Playback stopped during sentence {}", index);
                    return Ok(());
                }
                played = self.sink.play(&audio) => played?,
            }

            self.debouncer.record(index as i64);
            index += 1;
        }

        info!("Document {} playback finished", self.document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        document_for, free_user, seed_sentences, FakeSink, FakeSynth, MemoryDb,
    };
    use tokio::time::timeout;

    async fn open_session(
        db: &Arc<MemoryDb>,
        synth: Arc<FakeSynth>,
        sink: Arc<FakeSink>,
        sentence_count: usize,
    ) -> (PlaybackSession, Uuid) {
        let user = free_user(db).await;
        let doc = document_for(db, &user).await;
        seed_sentences(db, doc.id, sentence_count).await;
        let session = PlaybackSession::open(
            db.clone(),
            synth,
            sink,
            doc.id,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        (session, doc.id)
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
        timeout(Duration::from_secs(5), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn plays_every_sentence_in_order() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let synth = FakeSynth::instant();
        let sink = FakeSink::instant();
        let (session, _) = open_session(&db, synth, sink.clone(), 4).await;

        session.play_from(0);
        wait_until("all sentences played", || sink.play_count() == 4).await;

        let played = sink.played_texts();
        assert_eq!(
            played,
            vec![
                "Sentence 0.",
                "Sentence 1.",
                "Sentence 2.",
                "Sentence 3."
            ]
        );
    }

    #[tokio::test]
    async fn stop_halts_playback_and_further_synthesis() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let synth = FakeSynth::instant();
        let sink = FakeSink::with_delay(Duration::from_millis(40));
        let (session, _) = open_session(&db, synth.clone(), sink.clone(), 50).await;

        session.play_from(0);
        wait_until("first sentence to start", || sink.play_count() >= 1).await;
        session.stop();

        // Give any stray loop iteration time to surface.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let synth_calls = synth.call_count();
        let plays = sink.play_count();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(synth.call_count(), synth_calls);
        assert_eq!(sink.play_count(), plays);
        assert!(plays < 50);
    }

    #[tokio::test]
    async fn jump_cancels_the_running_loop_and_restarts() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let synth = FakeSynth::instant();
        let sink = FakeSink::with_delay(Duration::from_millis(30));
        let (session, _) = open_session(&db, synth, sink.clone(), 10).await;

        session.play_from(0);
        wait_until("playback to start", || sink.play_count() >= 1).await;
        session.jump_to(7);

        wait_until("seek target to play", || {
            sink.played_texts().iter().any(|t| t == "Sentence 7.")
        })
        .await;
        wait_until("tail to finish", || {
            sink.played_texts().iter().any(|t| t == "Sentence 9.")
        })
        .await;

        // Nothing between the cancel point and the seek target played.
        let played = sink.played_texts();
        assert!(!played.iter().any(|t| t == "Sentence 5."));
    }

    #[tokio::test]
    async fn prefetch_warms_the_next_sentence() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let synth = FakeSynth::instant();
        let sink = FakeSink::with_delay(Duration::from_millis(50));
        let (session, _) = open_session(&db, synth.clone(), sink.clone(), 5).await;

        session.play_from(0);
        wait_until("first sentence to start", || sink.play_count() >= 1).await;

        // While sentence 0 is still playing, sentence 1 is already being
        // synthesized.
        wait_until("next sentence to be warmed", || {
            synth.texts().iter().any(|t| t == "Sentence 1.")
        })
        .await;
        session.stop();
    }

    #[tokio::test]
    async fn position_writes_are_debounced_to_the_latest_index() {
        let db = MemoryDb::with_lifetime_tier("free", 10);
        let synth = FakeSynth::instant();
        let sink = FakeSink::instant();
        let (session, doc_id) = open_session(&db, synth, sink.clone(), 6).await;

        session.play_from(0);
        wait_until("all sentences played", || sink.play_count() == 6).await;

        // Rapid per-sentence updates coalesce; after the quiet period only
        // the final position is on disk.
        wait_until("debounced write to land", || db.position_writes() >= 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let position = db.get_playback_position(doc_id).await.unwrap().unwrap();
        assert_eq!(position.sentence_index, 5);
        assert!(db.position_writes() < 6);
    }
}
