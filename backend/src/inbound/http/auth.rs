//! Request identity extractors.
//!
//! Authentication itself is a gateway concern: the gateway validates the
//! JWT and forwards the subject in `X-User-Id`. These extractors only read
//! the forwarded identity; they never see credentials.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use uuid::Uuid;

use crate::domain::ids::UserId;
use crate::domain::Error;
use crate::inbound::http::state::HttpState;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthedUser(pub UserId);

impl FromRequest for AuthedUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let parsed = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok());
        ready(match parsed {
            Some(user_id) => Ok(AuthedUser(UserId::from_uuid(user_id))),
            None => Err(Error::unauthorized("missing or invalid user identity")),
        })
    }
}

/// Marker extractor gating admin routes on the shared admin token.
#[derive(Debug, Clone, Copy)]
pub struct AdminGuard;

impl FromRequest for AdminGuard {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let configured = req
            .app_data::<web::Data<HttpState>>()
            .and_then(|state| state.config.admin_token.clone());
        let presented = req
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        ready(match (configured, presented) {
            (Some(expected), Some(token)) if expected == token => Ok(AdminGuard),
            _ => Err(Error::forbidden("admin access denied")),
        })
    }
}
