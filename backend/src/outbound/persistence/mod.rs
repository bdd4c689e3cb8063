//! PostgreSQL persistence adapters.

pub mod diesel_job_store;
pub mod diesel_ledger_store;
pub mod diesel_slot_queue;
pub mod diesel_story_store;
pub mod diesel_voice_store;
pub mod models;
pub mod pool;
pub mod schema;

pub use diesel_job_store::DieselJobStore;
pub use diesel_ledger_store::DieselLedgerStore;
pub use diesel_slot_queue::DieselSlotQueue;
pub use diesel_story_store::DieselStoryStore;
pub use diesel_voice_store::DieselVoiceStore;
pub use pool::{DbPool, PoolConfig, PoolError};
