//! Postgres implementation of [`TransactionLedger`].
//!
//! The transition path is a compare-and-set `UPDATE ... WHERE status =
//! 'PENDING'`; when a callback and a reconciliation sweep race on the
//! same row, the database guarantees exactly one of them wins and the
//! other observes an already-terminal row.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{
    CorrelationIds, LinkedRecord, NewTransaction, Transaction, TransactionKind, TransactionStatus,
};
use crate::ports::{LedgerError, LedgerResult, TransactionLedger};

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionLedger for PostgresLedger {
    async fn create(&self, new: NewTransaction) -> LedgerResult<Transaction> {
        if new.amount <= BigDecimal::from(0) {
            return Err(LedgerError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }

        let tx = Transaction::new(new);
        let (sale_id, purchase_order_id) = split_linked(tx.linked_record);

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (
                id, kind, amount, phone_number, status, result_desc,
                linked_sale_id, linked_purchase_order_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(tx.id)
        .bind(tx.kind.as_str())
        .bind(&tx.amount)
        .bind(&tx.phone_number)
        .bind(tx.status.as_str())
        .bind(&tx.result_desc)
        .bind(sale_id)
        .bind(purchase_order_id)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn attach_correlation(
        &self,
        id: Uuid,
        ids: CorrelationIds,
    ) -> LedgerResult<Transaction> {
        let existing = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(id.to_string()))?
        .into_domain()?;

        if !ids.matches_kind(existing.kind) {
            return Err(LedgerError::Validation(format!(
                "correlation ids do not match {} transaction {}",
                existing.kind, id
            )));
        }

        let result = match ids {
            CorrelationIds::Collection {
                merchant_request_id,
                checkout_request_id,
            } => {
                sqlx::query_as::<_, TransactionRow>(
                    r#"
                    UPDATE transactions
                    SET merchant_request_id = $2, checkout_request_id = $3, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(merchant_request_id)
                .bind(checkout_request_id)
                .fetch_optional(&self.pool)
                .await
            }
            CorrelationIds::Payout {
                conversation_id,
                originator_conversation_id,
            } => {
                sqlx::query_as::<_, TransactionRow>(
                    r#"
                    UPDATE transactions
                    SET conversation_id = $2, originator_conversation_id = $3, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(conversation_id)
                .bind(originator_conversation_id)
                .fetch_optional(&self.pool)
                .await
            }
        };

        let row = result.map_err(|err| match &err {
            // Partial unique indexes on the matching keys enforce the
            // never-reuse invariant.
            sqlx::Error::Database(db) if db.constraint().is_some() => LedgerError::Validation(
                format!("correlation id already in use: {}", db.message()),
            ),
            _ => LedgerError::from(err),
        })?;

        row.ok_or_else(|| LedgerError::NotFound(id.to_string()))?
            .into_domain()
    }

    async fn find_by_id(&self, id: Uuid) -> LedgerResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| LedgerError::NotFound(id.to_string()))?
            .into_domain()
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> LedgerResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE checkout_request_id = $1
               OR conversation_id = $1
               OR originator_conversation_id = $1
            LIMIT 1
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| LedgerError::NotFound(correlation_id.to_string()))?
            .into_domain()
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

        let mut db_tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE transactions
            SET status = $2,
                result_desc = $3,
                mpesa_receipt_number = COALESCE($4, mpesa_receipt_number),
                updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(detail)
        .bind(receipt)
        .fetch_optional(&mut *db_tx)
        .await?;

        let row = match updated {
            Some(row) => row,
            None => {
                // CAS lost: either the row is gone or it is already
                // terminal. Report which so callers can log duplicates.
                let existing = sqlx::query_as::<_, TransactionRow>(
                    "SELECT * FROM transactions WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&mut *db_tx)
                .await?;
                db_tx.rollback().await?;

                return match existing {
                    Some(row) => {
                        let tx = row.into_domain()?;
                        Err(LedgerError::InvalidTransition {
                            id,
                            from: tx.status,
                            to,
                        })
                    }
                    None => Err(LedgerError::NotFound(id.to_string())),
                };
            }
        };

        let tx = row.into_domain()?;

        // Stamp the linked sale/purchase order inside the same database
        // transaction; the ledger transition and the collaborator update
        // commit or roll back together.
        if to == TransactionStatus::Success {
            if let Some(receipt) = receipt {
                match tx.linked_record {
                    Some(LinkedRecord::Sale(sale_id)) => {
                        let stamped = sqlx::query(
                            "UPDATE sales SET mpesa_receipt = $1, updated_at = NOW() WHERE id = $2",
                        )
                        .bind(receipt)
                        .bind(sale_id)
                        .execute(&mut *db_tx)
                        .await?;
                        if stamped.rows_affected() == 0 {
                            tracing::warn!(
                                transaction_id = %tx.id,
                                sale_id = %sale_id,
                                "Linked sale missing, receipt not stamped"
                            );
                        }
                    }
                    Some(LinkedRecord::PurchaseOrder(po_id)) => {
                        let stamped = sqlx::query(
                            "UPDATE purchase_orders SET mpesa_receipt = $1, updated_at = NOW() WHERE id = $2",
                        )
                        .bind(receipt)
                        .bind(po_id)
                        .execute(&mut *db_tx)
                        .await?;
                        if stamped.rows_affected() == 0 {
                            tracing::warn!(
                                transaction_id = %tx.id,
                                purchase_order_id = %po_id,
                                "Linked purchase order missing, receipt not stamped"
                            );
                        }
                    }
                    None => {}
                }
            }
        }

        db_tx.commit().await?;
        Ok(tx)
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM transactions
            WHERE status = 'PENDING' AND created_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn list(&self, limit: i64, offset: i64) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn sale_total(&self, sale_id: Uuid) -> LedgerResult<Option<BigDecimal>> {
        let total = sqlx::query_scalar::<_, BigDecimal>(
            "SELECT total_amount FROM sales WHERE id = $1",
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(total)
    }

    async fn ping(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn split_linked(linked: Option<LinkedRecord>) -> (Option<Uuid>, Option<Uuid>) {
    match linked {
        Some(LinkedRecord::Sale(id)) => (Some(id), None),
        Some(LinkedRecord::PurchaseOrder(id)) => (None, Some(id)),
        None => (None, None),
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    kind: String,
    amount: BigDecimal,
    phone_number: String,
    merchant_request_id: Option<String>,
    checkout_request_id: Option<String>,
    conversation_id: Option<String>,
    originator_conversation_id: Option<String>,
    mpesa_receipt_number: Option<String>,
    status: String,
    result_desc: Option<String>,
    linked_sale_id: Option<Uuid>,
    linked_purchase_order_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> LedgerResult<Transaction> {
        let kind = TransactionKind::parse(&self.kind)
            .ok_or_else(|| LedgerError::Storage(format!("unknown transaction kind: {}", self.kind)))?;
        let status = TransactionStatus::parse(&self.status).ok_or_else(|| {
            LedgerError::Storage(format!("unknown transaction status: {}", self.status))
        })?;
        let linked_record = match (self.linked_sale_id, self.linked_purchase_order_id) {
            (Some(sale_id), _) => Some(LinkedRecord::Sale(sale_id)),
            (None, Some(po_id)) => Some(LinkedRecord::PurchaseOrder(po_id)),
            (None, None) => None,
        };

        Ok(Transaction {
            id: self.id,
            kind,
            amount: self.amount,
            phone_number: self.phone_number,
            merchant_request_id: self.merchant_request_id,
            checkout_request_id: self.checkout_request_id,
            conversation_id: self.conversation_id,
            originator_conversation_id: self.originator_conversation_id,
            mpesa_receipt_number: self.mpesa_receipt_number,
            status,
            result_desc: self.result_desc,
            linked_record,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phone::normalize;
    use std::str::FromStr;

    async fn setup_pool() -> PgPool {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test DB");
        sqlx::migrate::Migrator::new(std::path::Path::new("./migrations"))
            .await
            .expect("Failed to load migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations on test DB");
        pool
    }

    #[tokio::test]
    #[ignore]
    async fn insert_transition_and_lookup_round_trip() {
        let ledger = PostgresLedger::new(setup_pool().await);

        let tx = ledger
            .create(NewTransaction {
                kind: TransactionKind::StkPush,
                amount: BigDecimal::from_str("500.00").unwrap(),
                phone: normalize("0712345678").unwrap(),
                linked_record: None,
            })
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        let key = format!("cr-{}", tx.id);
        ledger
            .attach_correlation(
                tx.id,
                CorrelationIds::Collection {
                    merchant_request_id: format!("mr-{}", tx.id),
                    checkout_request_id: key.clone(),
                },
            )
            .await
            .unwrap();

        let found = ledger.find_by_correlation(&key).await.unwrap();
        assert_eq!(found.id, tx.id);

        let updated = ledger
            .transition(tx.id, TransactionStatus::Success, "ok", Some("ABC123"))
            .await
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Success);

        let late = ledger
            .transition(tx.id, TransactionStatus::Failed, "late", None)
            .await;
        assert!(matches!(late, Err(LedgerError::InvalidTransition { .. })));
    }
}
