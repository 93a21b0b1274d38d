pub mod adapters;
pub mod cli;
pub mod config;
pub mod daraja;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod phone;
pub mod ports;
pub mod services;
pub mod startup;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::ports::TransactionLedger;
use crate::services::PaymentService;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn TransactionLedger>,
    pub payments: PaymentService,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/payments", post(handlers::payments::initiate))
        .route(
            "/payments/status/:correlation_id",
            get(handlers::payments::status),
        )
        .route("/payments/callback", post(handlers::webhook::stk_callback))
        .route("/payments/b2c/result", post(handlers::webhook::b2c_result))
        .route(
            "/payments/b2c/timeout",
            post(handlers::webhook::b2c_timeout),
        )
        .route("/transactions", get(handlers::payments::list_transactions))
        .route(
            "/transactions/:id",
            get(handlers::payments::get_transaction),
        )
        .with_state(state)
}
