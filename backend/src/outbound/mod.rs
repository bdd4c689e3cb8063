//! Outbound adapters: persistence, blob storage, and the TTS provider.

pub mod blob;
pub mod persistence;
pub mod provider;
