//! Credit HTTP handlers.
//!
//! ```text
//! GET /me/credits          Balance, lots, and recent history
//! GET /me/credits/history  Paged transactions, newest first
//! ```

use actix_web::{get, web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::credits::{CreditLot, CreditTransaction, HistoryQuery, TransactionKind};
use crate::domain::Error;
use crate::inbound::http::auth::AuthedUser;
use crate::inbound::http::schemas::ErrorSchema;
use crate::inbound::http::state::HttpState;
use crate::inbound::http::ApiResult;

/// One lot as shown to the owner.
#[derive(Debug, Serialize, ToSchema)]
pub struct LotView {
    pub lot_id: crate::domain::ids::LotId,
    pub source: String,
    pub amount_granted: i64,
    pub amount_remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditLot> for LotView {
    fn from(lot: CreditLot) -> Self {
        Self {
            lot_id: lot.id,
            source: lot.source.as_str().to_string(),
            amount_granted: lot.amount_granted,
            amount_remaining: lot.amount_remaining,
            expires_at: lot.expires_at,
            created_at: lot.created_at,
        }
    }
}

/// One ledger row as shown to the owner.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionView {
    pub tx_id: crate::domain::ids::TxId,
    pub amount: i64,
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub job_id: Option<crate::domain::ids::JobId>,
    pub story_id: Option<crate::domain::ids::StoryId>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransaction> for TransactionView {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            tx_id: tx.id,
            amount: tx.amount,
            kind: tx.kind.as_str().to_string(),
            status: tx.status.as_str().to_string(),
            reason: tx.reason,
            job_id: tx.job_id,
            story_id: tx.story_id,
            created_at: tx.created_at,
        }
    }
}

/// Balance summary with pricing configuration for client display.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreditSummaryResponse {
    pub balance: i64,
    pub unit_label: String,
    pub unit_size: u32,
    pub lots: Vec<LotView>,
    pub history: Vec<TransactionView>,
}

/// Balance, lots, and recent history for the caller.
#[utoipa::path(
    get,
    path = "/me/credits",
    responses(
        (status = 200, description = "Credit summary", body = CreditSummaryResponse),
        (status = 401, description = "Unauthorized", body = ErrorSchema)
    ),
    tags = ["credits"],
    operation_id = "creditSummary"
)]
#[get("/me/credits")]
pub async fn credit_summary(
    state: web::Data<HttpState>,
    user: AuthedUser,
) -> ApiResult<web::Json<CreditSummaryResponse>> {
    let summary = state.ledger.summary(user.0).await.map_err(Error::from)?;
    let history = state
        .ledger
        .history(
            user.0,
            HistoryQuery {
                limit: Some(10),
                offset: 0,
                kinds: None,
            },
        )
        .await
        .map_err(Error::from)?;

    Ok(web::Json(CreditSummaryResponse {
        balance: summary.active_balance,
        unit_label: state.ledger.unit_label().to_string(),
        unit_size: state.ledger.unit_size(),
        lots: summary.lots.into_iter().map(LotView::from).collect(),
        history: history.into_iter().map(TransactionView::from).collect(),
    }))
}

/// History paging parameters.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct HistoryParams {
    /// Page size, clamped to `[1, 100]`. Defaults to 20.
    pub limit: Option<u32>,
    /// Rows to skip.
    pub offset: Option<u32>,
    /// Comma-separated transaction kinds, e.g. `debit,refund`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

fn parse_kinds(raw: Option<&str>) -> Result<Option<Vec<TransactionKind>>, Error> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut kinds = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let kind = item
            .parse::<TransactionKind>()
            .map_err(Error::invalid_request)?;
        kinds.push(kind);
    }
    Ok(if kinds.is_empty() { None } else { Some(kinds) })
}

/// Page through the caller's transactions, newest first.
#[utoipa::path(
    get,
    path = "/me/credits/history",
    params(HistoryParams),
    responses(
        (status = 200, description = "Transaction page", body = [TransactionView]),
        (status = 401, description = "Unauthorized", body = ErrorSchema)
    ),
    tags = ["credits"],
    operation_id = "creditHistory"
)]
#[get("/me/credits/history")]
pub async fn credit_history(
    state: web::Data<HttpState>,
    user: AuthedUser,
    params: web::Query<HistoryParams>,
) -> ApiResult<web::Json<Vec<TransactionView>>> {
    let kinds = parse_kinds(params.kind.as_deref())?;
    let rows = state
        .ledger
        .history(
            user.0,
            HistoryQuery {
                limit: params.limit,
                offset: params.offset.unwrap_or(0),
                kinds,
            },
        )
        .await
        .map_err(Error::from)?;
    Ok(web::Json(rows.into_iter().map(TransactionView::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_comma_separated_kinds() {
        let kinds = parse_kinds(Some("debit, refund")).expect("parse");
        assert_eq!(
            kinds,
            Some(vec![TransactionKind::Debit, TransactionKind::Refund])
        );
    }

    #[rstest]
    fn rejects_unknown_kinds() {
        assert!(parse_kinds(Some("debit,teleport")).is_err());
    }

    #[rstest]
    fn empty_filter_means_no_filter() {
        assert_eq!(parse_kinds(None).expect("parse"), None);
        assert_eq!(parse_kinds(Some(" , ")).expect("parse"), None);
    }
}
