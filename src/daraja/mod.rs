//! Safaricom Daraja gateway client: OAuth token handling, STK push
//! (customer collections), STK push status query, and B2C payouts.

pub mod client;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::phone::CanonicalPhone;

pub use client::DarajaClient;

#[derive(Error, Debug)]
pub enum DarajaError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("gateway rejected request ({code}): {description}")]
    Business { code: String, description: String },

    #[error("gateway circuit breaker is open")]
    CircuitOpen,

    #[error("amount not representable on the wire: {0}")]
    Amount(String),
}

impl DarajaError {
    /// Explicit rejections map to a Failed ledger entry; everything else
    /// is transient and left to the reconciliation sweep.
    pub fn is_business_rejection(&self) -> bool {
        matches!(self, DarajaError::Business { .. })
    }
}

/// Parameters for an STK push (customer-initiated collection).
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub phone: CanonicalPhone,
    pub amount: BigDecimal,
    pub reference: String,
    pub description: String,
    pub callback_url: String,
}

/// Correlation pair issued by the gateway for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
}

/// Outcome of an explicit STK push status query. An empty result code
/// means the gateway has not settled the transaction yet.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionStatus {
    #[serde(rename = "ResultCode", default)]
    pub result_code: String,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
}

/// Parameters for a B2C payout (supplier payment or refund).
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub phone: CanonicalPhone,
    pub amount: BigDecimal,
    pub occasion: String,
    pub remarks: String,
    pub result_url: String,
    pub timeout_url: String,
}

/// Correlation pair issued by the gateway for a payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutHandle {
    pub conversation_id: String,
    pub originator_conversation_id: String,
}

/// Outbound gateway operations. Network calls only; ledger bookkeeping
/// is the caller's responsibility.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_collection(
        &self,
        request: &CollectionRequest,
    ) -> Result<CollectionHandle, DarajaError>;

    async fn query_collection(
        &self,
        checkout_request_id: &str,
    ) -> Result<CollectionStatus, DarajaError>;

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutHandle, DarajaError>;
}

// --- Wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StkPushRequest {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: String,
    pub amount: u64,
    pub party_a: String,
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub call_back_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StkQueryRequest {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct B2cRequest {
    pub initiator_name: String,
    pub security_credential: String,
    #[serde(rename = "CommandID")]
    pub command_id: String,
    pub amount: u64,
    pub party_a: String,
    pub party_b: String,
    pub remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_time_out_url: String,
    #[serde(rename = "ResultURL")]
    pub result_url: String,
    pub occasion: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct B2cResponse {
    #[serde(rename = "ConversationID")]
    pub conversation_id: String,
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
}

/// Error body Daraja attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
pub(crate) struct GatewayErrorBody {
    #[serde(rename = "errorCode")]
    pub error_code: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::normalize;
    use std::str::FromStr;

    #[test]
    fn stk_push_request_uses_daraja_field_names() {
        let request = StkPushRequest {
            business_short_code: "174379".into(),
            password: "cGFzcw==".into(),
            timestamp: "20240101120000".into(),
            transaction_type: "CustomerPayBillOnline".into(),
            amount: 500,
            party_a: "254712345678".into(),
            party_b: "174379".into(),
            phone_number: "254712345678".into(),
            call_back_url: "https://example.com/payments/callback".into(),
            account_reference: "SALE-001".into(),
            transaction_desc: "Payment for SALE-001".into(),
        };

        let value = serde_json::to_value(&request).unwrap();
        for key in [
            "BusinessShortCode",
            "Password",
            "Timestamp",
            "TransactionType",
            "Amount",
            "PartyA",
            "PartyB",
            "PhoneNumber",
            "CallBackURL",
            "AccountReference",
            "TransactionDesc",
        ] {
            assert!(value.get(key).is_some(), "missing field {}", key);
        }
        assert_eq!(value["Amount"], 500);
    }

    #[test]
    fn b2c_request_uses_daraja_field_names() {
        let request = B2cRequest {
            initiator_name: "apiuser".into(),
            security_credential: "sec".into(),
            command_id: "BusinessPayment".into(),
            amount: 1200,
            party_a: "174379".into(),
            party_b: "254712345678".into(),
            remarks: "Supplier payment".into(),
            queue_time_out_url: "https://example.com/payments/b2c/timeout".into(),
            result_url: "https://example.com/payments/b2c/result".into(),
            occasion: "PO-9".into(),
        };

        let value = serde_json::to_value(&request).unwrap();
        for key in [
            "InitiatorName",
            "SecurityCredential",
            "CommandID",
            "Amount",
            "PartyA",
            "PartyB",
            "Remarks",
            "QueueTimeOutURL",
            "ResultURL",
            "Occasion",
        ] {
            assert!(value.get(key).is_some(), "missing field {}", key);
        }
    }

    #[test]
    fn parses_stk_push_response() {
        let body = r#"{
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success. Request accepted for processing"
        }"#;

        let parsed: StkPushResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.merchant_request_id, "29115-34620561-1");
        assert_eq!(parsed.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(parsed.response_code, "0");
    }

    #[test]
    fn parses_query_response_without_result_code() {
        // Still-processing responses may omit ResultCode entirely.
        let parsed: CollectionStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.result_code, "");
        assert_eq!(parsed.result_desc, "");
    }

    #[test]
    fn collection_request_carries_canonical_phone() {
        let request = CollectionRequest {
            phone: normalize("0712345678").unwrap(),
            amount: BigDecimal::from_str("500.00").unwrap(),
            reference: "SALE-001".into(),
            description: "Payment for SALE-001".into(),
            callback_url: "https://example.com/cb".into(),
        };
        assert_eq!(request.phone.as_str(), "254712345678");
    }
}
