// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;

use duka_pay::adapters::InMemoryLedger;
use duka_pay::config::CallbackUrls;
use duka_pay::daraja::{
    CollectionHandle, CollectionRequest, CollectionStatus, DarajaError, PaymentGateway,
    PayoutHandle, PayoutRequest,
};
use duka_pay::services::{PaymentService, ReconciliationService};
use duka_pay::{create_app, AppState};

/// Scripted gateway behaviour for one endpoint.
pub enum StubResponse<T> {
    Ok(T),
    Business(&'static str, &'static str),
    Unreachable,
}

impl<T: Clone> StubResponse<T> {
    fn produce(&self) -> Result<T, DarajaError> {
        match self {
            StubResponse::Ok(value) => Ok(value.clone()),
            StubResponse::Business(code, description) => Err(DarajaError::Business {
                code: (*code).to_string(),
                description: (*description).to_string(),
            }),
            StubResponse::Unreachable => Err(DarajaError::UnexpectedStatus {
                status: 503,
                body: "Service Unavailable".to_string(),
            }),
        }
    }
}

/// In-process [`PaymentGateway`] double. Each endpoint replays whatever
/// response the test scripted into it.
pub struct StubGateway {
    pub collection: Mutex<StubResponse<CollectionHandle>>,
    pub query: Mutex<StubResponse<CollectionStatus>>,
    pub payout: Mutex<StubResponse<PayoutHandle>>,
    pub query_calls: AtomicUsize,
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            collection: Mutex::new(StubResponse::Ok(CollectionHandle {
                merchant_request_id: "29115-34620561-1".to_string(),
                checkout_request_id: "ws_CO_191220191020363925".to_string(),
            })),
            query: Mutex::new(StubResponse::Ok(CollectionStatus {
                result_code: String::new(),
                result_desc: String::new(),
            })),
            payout: Mutex::new(StubResponse::Ok(PayoutHandle {
                conversation_id: "AG_20240101_1234".to_string(),
                originator_conversation_id: "29112-34801843-1".to_string(),
            })),
            query_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_collection(&self, response: StubResponse<CollectionHandle>) {
        *self.collection.lock().unwrap() = response;
    }

    pub fn set_query(&self, response: StubResponse<CollectionStatus>) {
        *self.query.lock().unwrap() = response;
    }

    pub fn query_call_count(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn initiate_collection(
        &self,
        _request: &CollectionRequest,
    ) -> Result<CollectionHandle, DarajaError> {
        self.collection.lock().unwrap().produce()
    }

    async fn query_collection(
        &self,
        _checkout_request_id: &str,
    ) -> Result<CollectionStatus, DarajaError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.query.lock().unwrap().produce()
    }

    async fn initiate_payout(&self, _request: &PayoutRequest) -> Result<PayoutHandle, DarajaError> {
        self.payout.lock().unwrap().produce()
    }
}

pub struct TestContext {
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<StubGateway>,
    pub payments: PaymentService,
    pub reconciliation: ReconciliationService,
    pub app: Router,
}

pub fn test_context() -> TestContext {
    let ledger = Arc::new(InMemoryLedger::new());
    let gateway = Arc::new(StubGateway::new());
    let payments = PaymentService::new(
        ledger.clone(),
        gateway.clone(),
        CallbackUrls {
            stk_callback_url: "https://duka.example/payments/callback".to_string(),
            b2c_result_url: "https://duka.example/payments/b2c/result".to_string(),
            b2c_timeout_url: "https://duka.example/payments/b2c/timeout".to_string(),
        },
    );
    let reconciliation =
        ReconciliationService::new(ledger.clone(), gateway.clone(), payments.clone());
    let app = create_app(AppState {
        ledger: ledger.clone(),
        payments: payments.clone(),
    });

    TestContext {
        ledger,
        gateway,
        payments,
        reconciliation,
        app,
    }
}
