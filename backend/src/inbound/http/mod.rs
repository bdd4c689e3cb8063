//! HTTP inbound adapter exposing REST endpoints.

pub mod admin;
pub mod audio;
pub mod auth;
pub mod credits;
pub mod error;
pub mod schemas;
pub mod state;
pub mod voices;

pub use error::ApiResult;

use actix_web::web;

/// Register every route under the service scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(voices::upload_voice)
        .service(voices::get_voice)
        .service(voices::delete_voice)
        .service(audio::start_synthesis)
        .service(audio::fetch_audio)
        .service(credits::credit_summary)
        .service(credits::credit_history)
        .service(admin::grant_credits)
        .service(admin::voice_slots_status)
        .service(admin::force_process_queue);
}
