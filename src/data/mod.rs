pub mod cache;
pub mod decoder;
pub mod scoring;
pub mod stream_api;
pub mod types;
