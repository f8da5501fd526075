//! services/api/src/playback/mod.rs
//!
//! Scrubbable sentence-by-sentence playback: a per-session synthesized-audio
//! cache and the playback loop that drives it.

pub mod cache;
pub mod session;

pub use cache::SentenceAudioCache;
pub use session::PlaybackSession;
