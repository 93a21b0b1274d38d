use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

/// Target Daraja environment; selects the API base URL.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "sandbox" => Ok(MpesaEnvironment::Sandbox),
            "production" => Ok(MpesaEnvironment::Production),
            other => anyhow::bail!("MPESA_ENVIRONMENT must be 'sandbox' or 'production', got '{}'", other),
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

/// Daraja credentials and identity. Owned by the gateway client; never
/// exposed through handlers or logs.
#[derive(Debug, Deserialize, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub initiator_name: String,
    pub security_credential: String,
    pub environment: MpesaEnvironment,
}

/// Publicly reachable URLs the gateway delivers notifications to.
#[derive(Debug, Deserialize, Clone)]
pub struct CallbackUrls {
    pub stk_callback_url: String,
    pub b2c_result_url: String,
    pub b2c_timeout_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub mpesa: MpesaConfig,
    pub callbacks: CallbackUrls,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL")?,
            mpesa: MpesaConfig {
                consumer_key: env::var("MPESA_CONSUMER_KEY")?,
                consumer_secret: env::var("MPESA_CONSUMER_SECRET")?,
                shortcode: env::var("MPESA_SHORTCODE")?,
                passkey: env::var("MPESA_PASSKEY")?,
                initiator_name: env::var("MPESA_INITIATOR_NAME")?,
                security_credential: env::var("MPESA_SECURITY_CREDENTIAL")?,
                environment: MpesaEnvironment::parse(
                    &env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string()),
                )?,
            },
            callbacks: CallbackUrls {
                stk_callback_url: env::var("MPESA_CALLBACK_URL")?,
                b2c_result_url: env::var("MPESA_RESULT_URL")?,
                b2c_timeout_url: env::var("MPESA_TIMEOUT_URL")?,
            },
        })
    }
}
