pub mod blobstore;
pub mod db;
pub mod tts;
pub mod worker;

pub use blobstore::HttpBlobStore;
pub use db::DbAdapter;
pub use tts::OpenAiSpeechAdapter;
pub use worker::HttpWorkerAdapter;
