use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_GATEWAY_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";
pub const DEFAULT_RETURN_URL: &str = "http://localhost:5173/payment/result";
pub const DEFAULT_PAYMENT_TIMEOUT_MINUTES: u32 = 15;

/// Rate limit applied to the payment routes, per client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Sustained requests per second once the burst is spent.
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { per_second: 10, burst_size: 30 }
    }
}

impl RateLimit {
    /// Milliseconds between token refills. `None` for a zero rate; rates
    /// above 1000/s are clamped to one token per millisecond.
    pub fn replenish_interval_ms(&self) -> Option<u64> {
        1000u64.checked_div(self.per_second).map(|ms| ms.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Merchant terminal code (`vnp_TmnCode`).
    pub tmn_code: String,
    /// Shared HMAC secret agreed with the gateway.
    pub hash_secret: String,
    pub gateway_url: String,
    pub return_url: String,
    /// Origin allowed by CORS. `None` allows any origin.
    pub client_url: Option<String>,
    /// Built client assets served as the fallback route.
    pub client_dir: PathBuf,
    pub payment_timeout_minutes: u32,
    pub rate_limit: Option<RateLimit>,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            tmn_code: String::new(),
            hash_secret: String::new(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            return_url: DEFAULT_RETURN_URL.to_string(),
            client_url: None,
            client_dir: PathBuf::from("./client/dist"),
            payment_timeout_minutes: DEFAULT_PAYMENT_TIMEOUT_MINUTES,
            rate_limit: Some(RateLimit::default()),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Hash secret cannot be empty")] EmptySecret,
    #[error("Merchant code cannot be empty")] EmptyMerchantCode,
    #[error("Gateway URL cannot be empty")] EmptyGatewayUrl,
    #[error("Return URL cannot be empty")] EmptyReturnUrl,
    #[error("Payment timeout must be > 0")] InvalidTimeout,
    #[error("Rate limit and burst must be > 0")] InvalidRateLimit,
    #[error("Invalid value for {0}: {1}")] InvalidVar(&'static str, String),
}

impl CheckoutConfig {
    /// Reads `VNP_TMN_CODE`, `VNP_HASH_SECRET`, `VNP_URL`, `VNP_RETURN_URL`,
    /// `CLIENT_URL`, `CLIENT_DIR`, `PAYMENT_TIMEOUT_MINUTES` and
    /// `DISABLE_RATE_LIMIT`, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let payment_timeout_minutes = match lookup("PAYMENT_TIMEOUT_MINUTES") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidVar("PAYMENT_TIMEOUT_MINUTES", raw))?,
            None => defaults.payment_timeout_minutes,
        };
        let rate_limit = if lookup("DISABLE_RATE_LIMIT").is_some() {
            None
        } else {
            defaults.rate_limit
        };

        Ok(Self {
            tmn_code: lookup("VNP_TMN_CODE").unwrap_or_default(),
            hash_secret: lookup("VNP_HASH_SECRET").unwrap_or_default(),
            gateway_url: lookup("VNP_URL").unwrap_or(defaults.gateway_url),
            return_url: lookup("VNP_RETURN_URL").unwrap_or(defaults.return_url),
            client_url: lookup("CLIENT_URL").filter(|s| !s.trim().is_empty()),
            client_dir: lookup("CLIENT_DIR").map(PathBuf::from).unwrap_or(defaults.client_dir),
            payment_timeout_minutes,
            rate_limit,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_secret.trim().is_empty() { return Err(ConfigError::EmptySecret); }
        if self.tmn_code.trim().is_empty() { return Err(ConfigError::EmptyMerchantCode); }
        if self.gateway_url.trim().is_empty() { return Err(ConfigError::EmptyGatewayUrl); }
        if self.return_url.trim().is_empty() { return Err(ConfigError::EmptyReturnUrl); }
        if self.payment_timeout_minutes == 0 { return Err(ConfigError::InvalidTimeout); }
        if let Some(limit) = self.rate_limit {
            if limit.per_second == 0 || limit.burst_size == 0 { return Err(ConfigError::InvalidRateLimit); }
        }
        Ok(())
    }
}
