pub mod error;
pub mod matcher;
pub mod resolution;
pub mod settings;
pub mod story;
pub mod stt;
pub mod types;
