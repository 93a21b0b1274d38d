//! Payment initiation and status lookup.
//!
//! Ledger entries are created Pending before the gateway is contacted,
//! so a crash mid-initiation leaves a Pending row the timeout sweep
//! eventually cancels rather than losing the attempt entirely.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use thiserror::Error;
use uuid::Uuid;

use crate::config::CallbackUrls;
use crate::daraja::{CollectionRequest, DarajaError, PaymentGateway, PayoutRequest};
use crate::domain::{
    CorrelationIds, LinkedRecord, NewTransaction, Transaction, TransactionKind, TransactionStatus,
};
use crate::error::AppError;
use crate::phone::{self, PhoneError};
use crate::ports::{LedgerError, TransactionLedger};

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error(transparent)]
    InvalidPhone(#[from] PhoneError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Gateway(#[from] DarajaError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidPhone(e) => AppError::Validation(e.to_string()),
            PaymentError::Validation(msg) => AppError::Validation(msg),
            PaymentError::Gateway(e) => e.into(),
            PaymentError::Ledger(e) => e.into(),
        }
    }
}

/// Caller-facing initiation parameters, kind-agnostic.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub phone_number: String,
    pub reference: String,
    pub description: Option<String>,
    pub linked_record: Option<LinkedRecord>,
}

#[derive(Clone)]
pub struct PaymentService {
    ledger: Arc<dyn TransactionLedger>,
    gateway: Arc<dyn PaymentGateway>,
    urls: CallbackUrls,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        gateway: Arc<dyn PaymentGateway>,
        urls: CallbackUrls,
    ) -> Self {
        Self {
            ledger,
            gateway,
            urls,
        }
    }

    /// Creates a Pending ledger entry, calls the gateway, and records the
    /// correlation ids the gateway issued. A gateway failure marks the
    /// entry Failed and surfaces the error to the caller.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<Transaction, PaymentError> {
        let phone = phone::normalize(&request.phone_number)?;
        let amount = request.amount.with_scale(2);
        if amount <= BigDecimal::from(0) {
            return Err(PaymentError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }

        if request.kind == TransactionKind::Refund {
            self.check_refund_cap(&request, &amount).await?;
        }

        let tx = self
            .ledger
            .create(NewTransaction {
                kind: request.kind,
                amount: amount.clone(),
                phone: phone.clone(),
                linked_record: request.linked_record,
            })
            .await?;

        tracing::info!(
            transaction_id = %tx.id,
            kind = %tx.kind,
            amount = %tx.amount,
            "Initiating payment"
        );

        let description = request
            .description
            .clone()
            .unwrap_or_else(|| format!("Payment for {}", request.reference));

        let ids = match request.kind {
            TransactionKind::StkPush => {
                let handle = self
                    .call_gateway(
                        tx.id,
                        self.gateway.initiate_collection(&CollectionRequest {
                            phone,
                            amount,
                            reference: request.reference,
                            description,
                            callback_url: self.urls.stk_callback_url.clone(),
                        }),
                    )
                    .await?;
                CorrelationIds::Collection {
                    merchant_request_id: handle.merchant_request_id,
                    checkout_request_id: handle.checkout_request_id,
                }
            }
            TransactionKind::B2c | TransactionKind::Refund => {
                let handle = self
                    .call_gateway(
                        tx.id,
                        self.gateway.initiate_payout(&PayoutRequest {
                            phone,
                            amount,
                            occasion: request.reference,
                            remarks: description,
                            result_url: self.urls.b2c_result_url.clone(),
                            timeout_url: self.urls.b2c_timeout_url.clone(),
                        }),
                    )
                    .await?;
                CorrelationIds::Payout {
                    conversation_id: handle.conversation_id,
                    originator_conversation_id: handle.originator_conversation_id,
                }
            }
        };

        let tx = self.ledger.attach_correlation(tx.id, ids).await?;
        Ok(tx)
    }

    /// Looks up an entry by its gateway correlation id. When the entry is
    /// a still-Pending collection, one best-effort status query runs
    /// against the gateway before answering; a query failure degrades to
    /// the stored state.
    pub async fn status(&self, correlation_id: &str) -> Result<Transaction, PaymentError> {
        let tx = self.ledger.find_by_correlation(correlation_id).await?;
        if tx.status != TransactionStatus::Pending || !tx.kind.is_collection() {
            return Ok(tx);
        }
        let Some(checkout_request_id) = tx.checkout_request_id.clone() else {
            return Ok(tx);
        };

        match self.gateway.query_collection(&checkout_request_id).await {
            Ok(status) => {
                match self
                    .apply_query_result(&tx, &status.result_code, &status.result_desc)
                    .await
                {
                    Ok(updated) => Ok(updated),
                    // A callback can settle the entry between the lookup
                    // and the refresh; whatever won is the answer.
                    Err(LedgerError::InvalidTransition { .. }) => {
                        tracing::info!(
                            transaction_id = %tx.id,
                            "Entry settled during status refresh"
                        );
                        Ok(self.ledger.find_by_id(tx.id).await?)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => {
                tracing::warn!(
                    transaction_id = %tx.id,
                    error = %err,
                    "Status query failed, answering from stored state"
                );
                Ok(tx)
            }
        }
    }

    /// Applies an explicit query outcome to a Pending collection entry.
    /// Shared with the reconciliation sweep. An empty result code means
    /// the gateway has not settled yet, so the entry stays Pending. A
    /// query-confirmed Success carries no receipt number; only the
    /// callback path delivers one.
    pub(crate) async fn apply_query_result(
        &self,
        tx: &Transaction,
        result_code: &str,
        result_desc: &str,
    ) -> Result<Transaction, LedgerError> {
        match result_code {
            "" => Ok(tx.clone()),
            "0" => {
                self.ledger
                    .transition(tx.id, TransactionStatus::Success, result_desc, None)
                    .await
            }
            _ => {
                self.ledger
                    .transition(tx.id, TransactionStatus::Failed, result_desc, None)
                    .await
            }
        }
    }

    async fn check_refund_cap(
        &self,
        request: &InitiateRequest,
        amount: &BigDecimal,
    ) -> Result<(), PaymentError> {
        let Some(LinkedRecord::Sale(sale_id)) = request.linked_record else {
            return Err(PaymentError::Validation(
                "a refund must reference the sale being refunded".to_string(),
            ));
        };
        let total = self
            .ledger
            .sale_total(sale_id)
            .await?
            .ok_or_else(|| PaymentError::Validation(format!("sale {} not found", sale_id)))?;
        if *amount > total {
            return Err(PaymentError::Validation(format!(
                "refund of {} exceeds sale total {}",
                amount, total
            )));
        }
        Ok(())
    }

    /// Awaits a gateway call; on failure marks the entry Failed before
    /// propagating. The transition is best effort, the gateway error is
    /// the one the caller needs to see.
    async fn call_gateway<T>(
        &self,
        transaction_id: Uuid,
        fut: impl std::future::Future<Output = Result<T, DarajaError>>,
    ) -> Result<T, PaymentError> {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %err,
                    "Gateway call failed during initiation"
                );
                if let Err(transition_err) = self
                    .ledger
                    .transition(
                        transaction_id,
                        TransactionStatus::Failed,
                        &err.to_string(),
                        None,
                    )
                    .await
                {
                    tracing::error!(
                        transaction_id = %transaction_id,
                        error = %transition_err,
                        "Failed to mark transaction after gateway error"
                    );
                }
                Err(PaymentError::Gateway(err))
            }
        }
    }
}
