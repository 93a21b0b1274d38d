use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{LinkedRecord, TransactionKind};
use crate::error::AppError;
use crate::ports::TransactionLedger;
use crate::services::InitiateRequest;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiatePayload {
    pub kind: String,
    /// Decimal string, e.g. "500.00". A string keeps float rounding out
    /// of the money path.
    pub amount: String,
    pub phone_number: String,
    pub reference: String,
    pub description: Option<String>,
    pub sale_id: Option<Uuid>,
    pub purchase_order_id: Option<Uuid>,
}

impl InitiatePayload {
    fn into_request(self) -> Result<InitiateRequest, AppError> {
        let kind = TransactionKind::parse(&self.kind).ok_or_else(|| {
            AppError::BadRequest(format!(
                "kind must be STK_PUSH, B2C or REFUND, got '{}'",
                self.kind
            ))
        })?;
        let amount = BigDecimal::from_str(&self.amount)
            .map_err(|_| AppError::BadRequest(format!("invalid amount '{}'", self.amount)))?;
        let linked_record = match (self.sale_id, self.purchase_order_id) {
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest(
                    "a transaction may reference a sale or a purchase order, not both".to_string(),
                ))
            }
            (Some(sale_id), None) => Some(LinkedRecord::Sale(sale_id)),
            (None, Some(po_id)) => Some(LinkedRecord::PurchaseOrder(po_id)),
            (None, None) => None,
        };

        Ok(InitiateRequest {
            kind,
            amount,
            phone_number: self.phone_number,
            reference: self.reference,
            description: self.description,
            linked_record,
        })
    }
}

pub async fn initiate(
    State(state): State<AppState>,
    Json(payload): Json<InitiatePayload>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.into_request()?;
    let tx = state.payments.initiate(request).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn status(
    State(state): State<AppState>,
    Path(correlation_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.payments.status(&correlation_id).await?;
    Ok(Json(tx))
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, AppError> {
    let limit = pagination.limit.clamp(1, 500);
    let offset = pagination.offset.max(0);
    let transactions = state.ledger.list(limit, offset).await?;
    Ok(Json(transactions))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.ledger.find_by_id(id).await?;
    Ok(Json(tx))
}
