pub mod api_client;
pub mod audio;
pub mod metrics;
pub mod narration;
pub mod playback;
pub mod storage;
pub mod stt;
pub mod synthesis;
