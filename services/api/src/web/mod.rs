pub mod billing;
pub mod callbacks;
pub mod protocol;
pub mod rest;
pub mod state;

// Re-export the handlers the binary wires into the router.
pub use billing::billing_webhook_handler;
pub use callbacks::{
    completed_callback_handler, failed_callback_handler, page_callback_handler,
    progress_callback_handler,
};
pub use rest::{
    get_job_handler, get_latest_job_handler, get_position_handler, get_usage_handler,
    list_pages_handler, list_sentences_handler, sentence_audio_handler, submit_job_handler,
    update_position_handler, upload_document_handler, wait_job_handler,
};
