use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config as BreakerConfig, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MpesaConfig;
use crate::daraja::{
    B2cRequest, B2cResponse, CollectionHandle, CollectionRequest, CollectionStatus, DarajaError,
    GatewayErrorBody, PaymentGateway, PayoutHandle, PayoutRequest, StkPushRequest, StkPushResponse,
    StkQueryRequest, TokenResponse,
};

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const B2C_PATH: &str = "/mpesa/b2c/v1/paymentrequest";

const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
const COMMAND_ID: &str = "BusinessPayment";

/// Password for STK endpoints: base64 of shortcode + passkey + timestamp.
pub fn derive_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

/// Daraja timestamps are `YYYYMMDDHHmmss`.
pub fn wire_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// HTTP client for the Safaricom Daraja API. Holds credentials, caches
/// the bearer token in memory, and re-authenticates once when the
/// cached token is rejected.
pub struct DarajaClient {
    http: Client,
    config: MpesaConfig,
    base_url: String,
    token: ArcSwapOption<String>,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl DarajaClient {
    pub fn new(config: MpesaConfig) -> Self {
        let base_url = config.environment.base_url().to_string();
        Self::with_base_url(config, base_url)
    }

    /// Overrides the environment-derived base URL. Used by tests to
    /// point the client at a local mock server.
    pub fn with_base_url(config: MpesaConfig, base_url: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(60), Duration::from_secs(120));
        let policy = failure_policy::consecutive_failures(3, backoff);
        let circuit_breaker = BreakerConfig::new().failure_policy(policy).build();

        DarajaClient {
            http,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: ArcSwapOption::from(None),
            circuit_breaker,
        }
    }

    /// Exchanges the configured consumer key/secret for a bearer token
    /// and caches it. Callers never see the raw credentials.
    pub async fn authenticate(&self) -> Result<String, DarajaError> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, TOKEN_PATH))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret));

        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DarajaError::Auth(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| DarajaError::Auth(format!("malformed token response: {}", err)))?;

        self.token.store(Some(Arc::new(token.access_token.clone())));
        tracing::debug!("daraja access token refreshed");
        Ok(token.access_token)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DarajaError> {
        match self.circuit_breaker.call(request.send()).await {
            Ok(response) => Ok(response),
            Err(FailsafeError::Rejected) => Err(DarajaError::CircuitOpen),
            Err(FailsafeError::Inner(err)) => Err(DarajaError::Transport(err)),
        }
    }

    async fn post_authorized<B, R>(&self, path: &str, body: &B) -> Result<R, DarajaError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = match self.token.load_full() {
            Some(cached) => (*cached).clone(),
            None => self.authenticate().await?,
        };

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .execute(self.http.post(&url).bearer_auth(&token).json(body))
            .await?;

        // Cached token may have expired server-side; re-authenticate
        // once and retry before giving up.
        let response = if response.status().as_u16() == 401 {
            let fresh = self.authenticate().await?;
            self.execute(self.http.post(&url).bearer_auth(&fresh).json(body))
                .await?
        } else {
            response
        };

        decode(response).await
    }

    fn password_pair(&self) -> (String, String) {
        let timestamp = wire_timestamp(Utc::now());
        let password = derive_password(&self.config.shortcode, &self.config.passkey, &timestamp);
        (password, timestamp)
    }
}

/// Daraja expects whole currency units on the wire; fractional cents
/// are truncated the way the original till integration did.
fn wire_amount(amount: &BigDecimal) -> Result<u64, DarajaError> {
    amount
        .with_scale(0)
        .to_u64()
        .ok_or_else(|| DarajaError::Amount(amount.to_string()))
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, DarajaError> {
    let status = response.status();
    if status.as_u16() == 401 {
        return Err(DarajaError::Auth("bearer token rejected".to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if let Ok(rejection) = serde_json::from_str::<GatewayErrorBody>(&body) {
            return Err(DarajaError::Business {
                code: rejection.error_code,
                description: rejection.error_message,
            });
        }
        return Err(DarajaError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        });
    }

    response.json::<R>().await.map_err(DarajaError::Transport)
}

#[async_trait]
impl PaymentGateway for DarajaClient {
    async fn initiate_collection(
        &self,
        request: &CollectionRequest,
    ) -> Result<CollectionHandle, DarajaError> {
        let (password, timestamp) = self.password_pair();
        let payload = StkPushRequest {
            business_short_code: self.config.shortcode.clone(),
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE.to_string(),
            amount: wire_amount(&request.amount)?,
            party_a: request.phone.as_str().to_string(),
            party_b: self.config.shortcode.clone(),
            phone_number: request.phone.as_str().to_string(),
            call_back_url: request.callback_url.clone(),
            account_reference: request.reference.clone(),
            transaction_desc: request.description.clone(),
        };

        let response: StkPushResponse = self.post_authorized(STK_PUSH_PATH, &payload).await?;
        if response.response_code != "0" {
            return Err(DarajaError::Business {
                code: response.response_code,
                description: response.response_description,
            });
        }

        tracing::info!(
            checkout_request_id = %response.checkout_request_id,
            "STK push accepted: {}",
            response.customer_message
        );

        Ok(CollectionHandle {
            merchant_request_id: response.merchant_request_id,
            checkout_request_id: response.checkout_request_id,
        })
    }

    async fn query_collection(
        &self,
        checkout_request_id: &str,
    ) -> Result<CollectionStatus, DarajaError> {
        let (password, timestamp) = self.password_pair();
        let payload = StkQueryRequest {
            business_short_code: self.config.shortcode.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        self.post_authorized(STK_QUERY_PATH, &payload).await
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutHandle, DarajaError> {
        let payload = B2cRequest {
            initiator_name: self.config.initiator_name.clone(),
            security_credential: self.config.security_credential.clone(),
            command_id: COMMAND_ID.to_string(),
            amount: wire_amount(&request.amount)?,
            party_a: self.config.shortcode.clone(),
            party_b: request.phone.as_str().to_string(),
            remarks: request.remarks.clone(),
            queue_time_out_url: request.timeout_url.clone(),
            result_url: request.result_url.clone(),
            occasion: request.occasion.clone(),
        };

        let response: B2cResponse = self.post_authorized(B2C_PATH, &payload).await?;
        if response.response_code != "0" {
            return Err(DarajaError::Business {
                code: response.response_code,
                description: response.response_description,
            });
        }

        Ok(PayoutHandle {
            conversation_id: response.conversation_id,
            originator_conversation_id: response.originator_conversation_id,
        })
    }
}
