//! Diesel table definitions for the PostgreSQL schema.
//!
//! These definitions must match the migrations exactly; `diesel
//! print-schema` can regenerate them from a live database.

diesel::table! {
    /// User accounts with the cached spendable balance.
    users (id) {
        id -> Uuid,
        /// Cached Σ amount_remaining over unexpired lots; reconciled lazily.
        credits_balance_cached -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Credit lots: one source, one expiry per row. Retained for audit.
    credit_lots (id) {
        id -> Uuid,
        user_id -> Uuid,
        source -> Varchar,
        amount_granted -> Int8,
        amount_remaining -> Int8,
        expires_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Ledger rows. A partial unique index enforces at most one applied
    /// debit per job.
    credit_transactions (id) {
        id -> Uuid,
        user_id -> Uuid,
        amount -> Int8,
        kind -> Varchar,
        status -> Varchar,
        reason -> Varchar,
        job_id -> Nullable<Uuid>,
        story_id -> Nullable<Uuid>,
        metadata -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Transaction-to-lot mapping; Σ amounts per transaction equals the
    /// transaction amount.
    credit_allocations (tx_id, lot_id) {
        tx_id -> Uuid,
        lot_id -> Uuid,
        amount -> Int8,
    }
}

diesel::table! {
    /// Voices and their remote slot bindings. `remote_voice_id` carries a
    /// partial unique index while populated.
    voices (id) {
        id -> Uuid,
        user_id -> Uuid,
        name -> Varchar,
        provider -> Varchar,
        sample_blob_key -> Nullable<Varchar>,
        sample_bytes -> Int8,
        remote_voice_id -> Nullable<Varchar>,
        allocation_status -> Varchar,
        last_used_at -> Nullable<Timestamptz>,
        allocated_at -> Nullable<Timestamptz>,
        slot_lock_expires_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Slot lifecycle audit log.
    slot_events (id) {
        id -> Uuid,
        voice_id -> Uuid,
        user_id -> Uuid,
        event_type -> Varchar,
        reason -> Varchar,
        metadata -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Synthesis jobs, unique per (user, voice, story).
    synthesis_jobs (id) {
        id -> Uuid,
        user_id -> Uuid,
        voice_id -> Uuid,
        story_id -> Uuid,
        status -> Varchar,
        credits_charged -> Int8,
        artifact_blob_key -> Nullable<Varchar>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Durable allocation queue, FIFO per provider with `sequence` breaking
    /// enqueue-time ties.
    slot_queue_entries (voice_id) {
        voice_id -> Uuid,
        user_id -> Uuid,
        provider -> Varchar,
        enqueued_at -> Timestamptz,
        attempts -> Int4,
        sequence -> Int8,
    }
}

diesel::table! {
    /// Bedtime stories, read-only from this service's point of view.
    stories (id) {
        id -> Uuid,
        title -> Varchar,
        body -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(credit_lots -> users (user_id));
diesel::joinable!(credit_transactions -> users (user_id));
diesel::joinable!(credit_allocations -> credit_transactions (tx_id));
diesel::joinable!(credit_allocations -> credit_lots (lot_id));
diesel::joinable!(voices -> users (user_id));
diesel::joinable!(slot_events -> voices (voice_id));
diesel::joinable!(synthesis_jobs -> voices (voice_id));
diesel::joinable!(synthesis_jobs -> stories (story_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    credit_lots,
    credit_transactions,
    credit_allocations,
    voices,
    slot_events,
    synthesis_jobs,
    slot_queue_entries,
    stories,
);
