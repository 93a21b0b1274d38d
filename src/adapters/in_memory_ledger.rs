//! In-memory implementation of [`TransactionLedger`]. Backs the
//! integration test suites; the per-store mutex gives the same
//! at-most-one-terminal-transition guarantee the Postgres adapter gets
//! from its compare-and-set update.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    CorrelationIds, LinkedRecord, NewTransaction, Transaction, TransactionStatus,
};
use crate::ports::{LedgerError, LedgerResult, TransactionLedger};

#[derive(Default)]
struct Store {
    transactions: HashMap<Uuid, Transaction>,
    sale_totals: HashMap<Uuid, BigDecimal>,
    sale_receipts: HashMap<Uuid, String>,
    purchase_orders: HashSet<Uuid>,
    purchase_order_receipts: HashMap<Uuid, String>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    store: Mutex<Store>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sale the ledger can link against and cap refunds by.
    pub fn seed_sale(&self, sale_id: Uuid, total: BigDecimal) {
        let mut store = self.store.lock().expect("ledger mutex poisoned");
        store.sale_totals.insert(sale_id, total);
    }

    /// Registers a purchase order the ledger can link against.
    pub fn seed_purchase_order(&self, purchase_order_id: Uuid) {
        let mut store = self.store.lock().expect("ledger mutex poisoned");
        store.purchase_orders.insert(purchase_order_id);
    }

    /// Receipt stamped onto a sale by a Success transition, if any.
    pub fn sale_receipt(&self, sale_id: Uuid) -> Option<String> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        store.sale_receipts.get(&sale_id).cloned()
    }

    pub fn purchase_order_receipt(&self, purchase_order_id: Uuid) -> Option<String> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        store
            .purchase_order_receipts
            .get(&purchase_order_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        let store = self.store.lock().expect("ledger mutex poisoned");
        store.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TransactionLedger for InMemoryLedger {
    async fn create(&self, new: NewTransaction) -> LedgerResult<Transaction> {
        if new.amount <= BigDecimal::from(0) {
            return Err(LedgerError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }

        let tx = Transaction::new(new);
        let mut store = self.store.lock().expect("ledger mutex poisoned");
        store.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn attach_correlation(
        &self,
        id: Uuid,
        ids: CorrelationIds,
    ) -> LedgerResult<Transaction> {
        let mut store = self.store.lock().expect("ledger mutex poisoned");

        let key = ids.matching_key().to_string();
        let taken = store.transactions.values().any(|tx| {
            tx.id != id
                && (tx.checkout_request_id.as_deref() == Some(key.as_str())
                    || tx.conversation_id.as_deref() == Some(key.as_str()))
        });
        if taken {
            return Err(LedgerError::Validation(format!(
                "correlation id {} already in use",
                key
            )));
        }

        let tx = store
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        if !ids.matches_kind(tx.kind) {
            return Err(LedgerError::Validation(format!(
                "correlation ids do not match {} transaction {}",
                tx.kind, id
            )));
        }

        match ids {
            CorrelationIds::Collection {
                merchant_request_id,
                checkout_request_id,
            } => {
                tx.merchant_request_id = Some(merchant_request_id);
                tx.checkout_request_id = Some(checkout_request_id);
            }
            CorrelationIds::Payout {
                conversation_id,
                originator_conversation_id,
            } => {
                tx.conversation_id = Some(conversation_id);
                tx.originator_conversation_id = Some(originator_conversation_id);
            }
        }
        tx.updated_at = Utc::now();
        Ok(tx.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> LedgerResult<Transaction> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        store
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> LedgerResult<Transaction> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        store
            .transactions
            .values()
            .find(|tx| {
                tx.checkout_request_id.as_deref() == Some(correlation_id)
                    || tx.conversation_id.as_deref() == Some(correlation_id)
                    || tx.originator_conversation_id.as_deref() == Some(correlation_id)
            })
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(correlation_id.to_string()))
    }

    async fn transition(
        &self,
        id: Uuid,
        to: TransactionStatus,
        detail: &str,
        receipt: Option<&str>,
    ) -> LedgerResult<Transaction> {
        if receipt.is_some() && to != TransactionStatus::Success {
            return Err(LedgerError::Validation(
                "receipt reference only allowed on a Success transition".to_string(),
            ));
        }

        let mut store = self.store.lock().expect("ledger mutex poisoned");
        let current = store
            .transactions
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?
            .clone();

        if !current.status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: current.status,
                to,
            });
        }

        let tx = store
            .transactions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        tx.status = to;
        tx.result_desc = Some(detail.to_string());
        if let Some(receipt) = receipt {
            tx.mpesa_receipt_number = Some(receipt.to_string());
        }
        tx.updated_at = Utc::now();
        let updated = tx.clone();

        // Stamp the linked record in the same critical section so the
        // ledger transition and the collaborator update stay atomic.
        if to == TransactionStatus::Success {
            if let (Some(receipt), Some(linked)) = (receipt, updated.linked_record) {
                match linked {
                    LinkedRecord::Sale(sale_id) => {
                        if store.sale_totals.contains_key(&sale_id) {
                            store.sale_receipts.insert(sale_id, receipt.to_string());
                        } else {
                            tracing::warn!(
                                transaction_id = %updated.id,
                                sale_id = %sale_id,
                                "Linked sale missing, receipt not stamped"
                            );
                        }
                    }
                    LinkedRecord::PurchaseOrder(po_id) => {
                        if store.purchase_orders.contains(&po_id) {
                            store
                                .purchase_order_receipts
                                .insert(po_id, receipt.to_string());
                        } else {
                            tracing::warn!(
                                transaction_id = %updated.id,
                                purchase_order_id = %po_id,
                                "Linked purchase order missing, receipt not stamped"
                            );
                        }
                    }
                }
            }
        }

        Ok(updated)
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> LedgerResult<Vec<Transaction>> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        let mut stale: Vec<Transaction> = store
            .transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|tx| tx.created_at);
        Ok(stale)
    }

    async fn list(&self, limit: i64, offset: i64) -> LedgerResult<Vec<Transaction>> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        let mut all: Vec<Transaction> = store.transactions.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn sale_total(&self, sale_id: Uuid) -> LedgerResult<Option<BigDecimal>> {
        let store = self.store.lock().expect("ledger mutex poisoned");
        Ok(store.sale_totals.get(&sale_id).cloned())
    }

    async fn ping(&self) -> LedgerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionKind;
    use crate::phone::normalize;
    use std::str::FromStr;

    fn new_collection(amount: &str) -> NewTransaction {
        NewTransaction {
            kind: TransactionKind::StkPush,
            amount: BigDecimal::from_str(amount).unwrap(),
            phone: normalize("0712345678").unwrap(),
            linked_record: None,
        }
    }

    fn collection_ids(key: &str) -> CorrelationIds {
        CorrelationIds::Collection {
            merchant_request_id: format!("mr-{}", key),
            checkout_request_id: key.to_string(),
        }
    }

    #[tokio::test]
    async fn create_rejects_non_positive_amount() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(
            ledger.create(new_collection("0")).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.create(new_collection("-10")).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn correlation_lookup_round_trip() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.create(new_collection("500.00")).await.unwrap();
        ledger
            .attach_correlation(tx.id, collection_ids("cr-1"))
            .await
            .unwrap();

        let found = ledger.find_by_correlation("cr-1").await.unwrap();
        assert_eq!(found.id, tx.id);
        assert!(matches!(
            ledger.find_by_correlation("cr-unknown").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn correlation_key_cannot_be_reused() {
        let ledger = InMemoryLedger::new();
        let first = ledger.create(new_collection("100.00")).await.unwrap();
        let second = ledger.create(new_collection("200.00")).await.unwrap();

        ledger
            .attach_correlation(first.id, collection_ids("cr-1"))
            .await
            .unwrap();
        assert!(matches!(
            ledger
                .attach_correlation(second.id, collection_ids("cr-1"))
                .await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn attach_rejects_correlation_variant_for_wrong_kind() {
        let ledger = InMemoryLedger::new();
        let collection = ledger.create(new_collection("500.00")).await.unwrap();
        let payout = ledger
            .create(NewTransaction {
                kind: TransactionKind::B2c,
                ..new_collection("500.00")
            })
            .await
            .unwrap();

        let payout_ids = CorrelationIds::Payout {
            conversation_id: "AG_1".to_string(),
            originator_conversation_id: "og-1".to_string(),
        };
        assert!(matches!(
            ledger.attach_correlation(collection.id, payout_ids).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger
                .attach_correlation(payout.id, collection_ids("cr-1"))
                .await,
            Err(LedgerError::Validation(_))
        ));

        // Neither entry picked up a matching key from the rejected pair.
        let unchanged = ledger.find_by_id(collection.id).await.unwrap();
        assert!(unchanged.conversation_id.is_none());
    }

    #[tokio::test]
    async fn transition_enforces_monotonicity() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.create(new_collection("500.00")).await.unwrap();

        let updated = ledger
            .transition(tx.id, TransactionStatus::Success, "ok", Some("ABC123"))
            .await
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Success);
        assert_eq!(updated.mpesa_receipt_number.as_deref(), Some("ABC123"));

        let late = ledger
            .transition(tx.id, TransactionStatus::Failed, "late callback", None)
            .await;
        assert!(matches!(late, Err(LedgerError::InvalidTransition { .. })));

        // Terminal fields untouched by the rejected attempt.
        let current = ledger.find_by_id(tx.id).await.unwrap();
        assert_eq!(current.status, TransactionStatus::Success);
        assert_eq!(current.result_desc.as_deref(), Some("ok"));
        assert_eq!(current.mpesa_receipt_number.as_deref(), Some("ABC123"));
    }

    #[tokio::test]
    async fn receipt_rejected_outside_success() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.create(new_collection("500.00")).await.unwrap();
        assert!(matches!(
            ledger
                .transition(tx.id, TransactionStatus::Failed, "no", Some("ABC123"))
                .await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_conflicting_transitions_one_wins() {
        let ledger = std::sync::Arc::new(InMemoryLedger::new());
        let tx = ledger.create(new_collection("500.00")).await.unwrap();

        let a = {
            let ledger = ledger.clone();
            let id = tx.id;
            tokio::spawn(async move {
                ledger
                    .transition(id, TransactionStatus::Success, "callback", Some("ABC123"))
                    .await
            })
        };
        let b = {
            let ledger = ledger.clone();
            let id = tx.id;
            tokio::spawn(async move {
                ledger
                    .transition(id, TransactionStatus::Failed, "query said failed", None)
                    .await
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "exactly one wins");
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(LedgerError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn success_transition_stamps_linked_sale() {
        let ledger = InMemoryLedger::new();
        let sale_id = Uuid::new_v4();
        ledger.seed_sale(sale_id, BigDecimal::from_str("500.00").unwrap());

        let tx = ledger
            .create(NewTransaction {
                linked_record: Some(LinkedRecord::Sale(sale_id)),
                ..new_collection("500.00")
            })
            .await
            .unwrap();
        ledger
            .transition(tx.id, TransactionStatus::Success, "ok", Some("ABC123"))
            .await
            .unwrap();

        assert_eq!(ledger.sale_receipt(sale_id).as_deref(), Some("ABC123"));
    }

    #[tokio::test]
    async fn dangling_sale_link_does_not_block_settlement() {
        let ledger = InMemoryLedger::new();
        let missing_sale = Uuid::new_v4();

        let tx = ledger
            .create(NewTransaction {
                linked_record: Some(LinkedRecord::Sale(missing_sale)),
                ..new_collection("500.00")
            })
            .await
            .unwrap();
        let updated = ledger
            .transition(tx.id, TransactionStatus::Success, "ok", Some("ABC123"))
            .await
            .unwrap();

        // The ledger entry settles; only the stamp is skipped.
        assert_eq!(updated.status, TransactionStatus::Success);
        assert_eq!(updated.mpesa_receipt_number.as_deref(), Some("ABC123"));
        assert!(ledger.sale_receipt(missing_sale).is_none());
    }

    #[tokio::test]
    async fn success_transition_stamps_linked_purchase_order() {
        let ledger = InMemoryLedger::new();
        let po_id = Uuid::new_v4();
        ledger.seed_purchase_order(po_id);

        let tx = ledger
            .create(NewTransaction {
                kind: TransactionKind::B2c,
                linked_record: Some(LinkedRecord::PurchaseOrder(po_id)),
                ..new_collection("1200.00")
            })
            .await
            .unwrap();
        ledger
            .transition(tx.id, TransactionStatus::Success, "ok", Some("REC456"))
            .await
            .unwrap();

        assert_eq!(
            ledger.purchase_order_receipt(po_id).as_deref(),
            Some("REC456")
        );
    }

    #[tokio::test]
    async fn stale_listing_filters_on_status_and_cutoff() {
        let ledger = InMemoryLedger::new();
        let pending = ledger.create(new_collection("100.00")).await.unwrap();
        let settled = ledger.create(new_collection("200.00")).await.unwrap();
        ledger
            .transition(settled.id, TransactionStatus::Failed, "declined", None)
            .await
            .unwrap();

        let stale = ledger.list_stale_pending(Utc::now()).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending.id);

        let none = ledger
            .list_stale_pending(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
