//! Inbound Daraja notifications: STK push callbacks and B2C result and
//! timeout webhooks.
//!
//! Every handler answers HTTP 200 with an acknowledgement body no matter
//! what happened internally. A non-200 makes the gateway retry, and a
//! retry of a callback we already processed (or can never process) buys
//! nothing.

use axum::{body::Bytes, extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::TransactionStatus;
use crate::ports::{LedgerError, TransactionLedger};
use crate::AppState;

/// Acknowledgement body Daraja expects back from every webhook.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    fn rejected(desc: &str) -> Self {
        Self {
            result_code: 1,
            result_desc: desc.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    #[allow(dead_code)]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<serde_json::Value>,
}

impl StkCallback {
    /// The receipt number is delivered as a metadata item; its value is
    /// usually a string but numeric items appear in the same list.
    fn receipt_number(&self) -> Option<String> {
        let items = &self.metadata.as_ref()?.items;
        let item = items.iter().find(|item| item.name == "MpesaReceiptNumber")?;
        match item.value.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// `POST /payments/callback`. The body is taken as raw bytes and parsed
/// by hand: a malformed payload still needs the 200-with-ack treatment,
/// which a `Json` extractor rejection would bypass.
pub async fn stk_callback(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let envelope: StkCallbackEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "Discarding malformed STK callback");
            return Json(CallbackAck::rejected("Invalid payload"));
        }
    };
    let callback = envelope.body.stk_callback;

    let tx = match state
        .ledger
        .find_by_correlation(&callback.checkout_request_id)
        .await
    {
        Ok(tx) => tx,
        Err(LedgerError::NotFound(_)) => {
            warn!(
                checkout_request_id = %callback.checkout_request_id,
                "STK callback for unknown transaction"
            );
            return Json(CallbackAck::rejected("Transaction not found"));
        }
        Err(err) => {
            warn!(error = %err, "Ledger lookup failed during STK callback");
            return Json(CallbackAck::rejected("Internal error"));
        }
    };

    let (to, detail, receipt) = if callback.result_code == 0 {
        match callback.receipt_number() {
            Some(receipt) => (
                TransactionStatus::Success,
                callback.result_desc.clone(),
                Some(receipt),
            ),
            None => {
                // A success verdict without a receipt number violates the
                // callback contract; the money trail cannot be completed.
                warn!(transaction_id = %tx.id, "STK success callback missing MpesaReceiptNumber");
                (
                    TransactionStatus::Failed,
                    "Success callback missing MpesaReceiptNumber".to_string(),
                    None,
                )
            }
        }
    } else {
        (
            TransactionStatus::Failed,
            callback.result_desc.clone(),
            None,
        )
    };

    match state
        .ledger
        .transition(tx.id, to, &detail, receipt.as_deref())
        .await
    {
        Ok(updated) => {
            info!(
                transaction_id = %updated.id,
                status = %updated.status,
                "STK callback processed"
            );
            Json(CallbackAck::accepted())
        }
        Err(LedgerError::InvalidTransition { from, .. }) => {
            // Duplicate or late delivery of a callback already applied.
            info!(
                transaction_id = %tx.id,
                status = %from,
                "Ignoring STK callback for settled transaction"
            );
            Json(CallbackAck::accepted())
        }
        Err(err) => {
            warn!(transaction_id = %tx.id, error = %err, "STK callback transition failed");
            Json(CallbackAck::rejected("Internal error"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct B2cResultEnvelope {
    #[serde(rename = "Result")]
    result: B2cResult,
}

#[derive(Debug, Deserialize)]
struct B2cResult {
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    #[serde(rename = "ResultCode")]
    result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
    #[serde(rename = "TransactionID", default)]
    transaction_id: String,
}

/// `POST /payments/b2c/result`. The gateway receipt arrives as the
/// top-level `TransactionID` rather than a metadata item.
pub async fn b2c_result(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let envelope: B2cResultEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "Discarding malformed B2C result");
            return Json(CallbackAck::rejected("Invalid payload"));
        }
    };
    let result = envelope.result;

    let tx = match state
        .ledger
        .find_by_correlation(&result.conversation_id)
        .await
    {
        Ok(tx) => tx,
        Err(LedgerError::NotFound(_)) => {
            warn!(
                conversation_id = %result.conversation_id,
                "B2C result for unknown transaction"
            );
            return Json(CallbackAck::rejected("Transaction not found"));
        }
        Err(err) => {
            warn!(error = %err, "Ledger lookup failed during B2C result");
            return Json(CallbackAck::rejected("Internal error"));
        }
    };

    let (to, receipt) = if result.result_code == 0 {
        let receipt = if result.transaction_id.is_empty() {
            None
        } else {
            Some(result.transaction_id.clone())
        };
        (TransactionStatus::Success, receipt)
    } else {
        (TransactionStatus::Failed, None)
    };

    match state
        .ledger
        .transition(tx.id, to, &result.result_desc, receipt.as_deref())
        .await
    {
        Ok(updated) => {
            info!(
                transaction_id = %updated.id,
                status = %updated.status,
                "B2C result processed"
            );
            Json(CallbackAck::accepted())
        }
        Err(LedgerError::InvalidTransition { from, .. }) => {
            info!(
                transaction_id = %tx.id,
                status = %from,
                "Ignoring B2C result for settled transaction"
            );
            Json(CallbackAck::accepted())
        }
        Err(err) => {
            warn!(transaction_id = %tx.id, error = %err, "B2C result transition failed");
            Json(CallbackAck::rejected("Internal error"))
        }
    }
}

/// `POST /payments/b2c/timeout`. The queue timed out before the gateway
/// produced a verdict; the entry stays Pending for the reconciliation
/// sweeps to settle.
pub async fn b2c_timeout(body: Bytes) -> impl IntoResponse {
    warn!(
        payload_bytes = body.len(),
        "B2C queue timeout notification received"
    );
    Json(CallbackAck::accepted())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_receipt_from_metadata() {
        let body = r#"{
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "CallbackMetadata": {
                "Item": [
                    {"Name": "Amount", "Value": 500.0},
                    {"Name": "MpesaReceiptNumber", "Value": "ABC123"},
                    {"Name": "TransactionDate", "Value": 20240101120000},
                    {"Name": "PhoneNumber", "Value": 254712345678}
                ]
            }
        }"#;

        let callback: StkCallback = serde_json::from_str(body).unwrap();
        assert_eq!(callback.receipt_number().as_deref(), Some("ABC123"));
    }

    #[test]
    fn failure_callbacks_omit_metadata() {
        let body = r#"{
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": 1032,
            "ResultDesc": "Request cancelled by user"
        }"#;

        let callback: StkCallback = serde_json::from_str(body).unwrap();
        assert_eq!(callback.result_code, 1032);
        assert!(callback.receipt_number().is_none());
    }

    #[test]
    fn metadata_without_receipt_item_yields_none() {
        let body = r#"{
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": 0,
            "CallbackMetadata": {"Item": [{"Name": "Amount", "Value": 500.0}]}
        }"#;

        let callback: StkCallback = serde_json::from_str(body).unwrap();
        assert!(callback.receipt_number().is_none());
    }

    #[test]
    fn ack_serializes_with_daraja_field_names() {
        let value = serde_json::to_value(CallbackAck::accepted()).unwrap();
        assert_eq!(value["ResultCode"], 0);
        assert_eq!(value["ResultDesc"], "Accepted");
    }
}
