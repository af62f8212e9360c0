//! Application configuration loaded from environment variables.

use crate::errors::{AppError, Result};

/// Upper bound on the OTP lifetime: one day.
const MAX_OTP_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL (e.g. sqlite:./coordinator.db)
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// HS256 key used to verify bearer tokens
    pub access_token_secret: String,
    /// Lifetime of a pickup OTP, in seconds
    pub otp_ttl_secs: i64,
    /// How often (in seconds) the expiry sweeper runs
    pub sweep_interval_secs: u64,
    /// Prefix for phone numbers stored without a leading `+`
    pub default_country_code: String,
    /// Messaging REST base URL
    pub sms_api_url: String,
    /// Messaging credentials; `None` selects the log-only sender
    pub sms: Option<SmsCredentials>,
}

#[derive(Debug, Clone)]
pub struct SmsCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./coordinator.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid API_PORT".to_string()))?,
            access_token_secret: env_var("ACCESS_TOKEN_SECRET").map_err(|_| {
                AppError::Config("ACCESS_TOKEN_SECRET environment variable is required".to_string())
            })?,
            otp_ttl_secs: env_var("OTP_TTL_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid OTP_TTL_SECS".to_string()))?,
            sweep_interval_secs: env_var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid SWEEP_INTERVAL_SECS".to_string()))?,
            default_country_code: env_var("DEFAULT_COUNTRY_CODE")
                .unwrap_or_else(|_| "+91".to_string()),
            sms_api_url: env_var("SMS_API_URL")
                .unwrap_or_else(|_| "https://api.twilio.com/2010-04-01".to_string()),
            sms: sms_from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_OTP_TTL_SECS).contains(&self.otp_ttl_secs) {
            return Err(AppError::Config(format!(
                "OTP_TTL_SECS must be between 1 and {MAX_OTP_TTL_SECS}"
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(AppError::Config(
                "SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn sms_from_env() -> Option<SmsCredentials> {
    Some(SmsCredentials {
        account_sid: env_var("TWILIO_ACCOUNT_SID").ok()?,
        auth_token: env_var("TWILIO_AUTH_TOKEN").ok()?,
        from_number: env_var("TWILIO_PHONE_NUMBER").ok()?,
    })
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}
