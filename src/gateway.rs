//! VNPay-specific request assembly.
//!
//! Turns a checkout request plus merchant configuration into the parameter
//! mapping the gateway expects, and produces the signed redirect URL.

use std::net::IpAddr;

use axum::http::HeaderMap;
use time::macros::{format_description, offset};
use time::{Duration, OffsetDateTime};

use crate::config::CheckoutConfig;
use crate::params::{ParamMap, ParamValue, ParameterSet};
use crate::signature::build_signed_request;
use crate::CheckoutError;

pub const VERSION: &str = "2.1.0";
pub const COMMAND_PAY: &str = "pay";
pub const CURRENCY: &str = "VND";
pub const DEFAULT_LOCALE: &str = "vn";
pub const DEFAULT_ORDER_INFO: &str = "Thanh toan don hang";
pub const DEFAULT_ORDER_TYPE: &str = "other";
pub const FALLBACK_IP: &str = "127.0.0.1";
/// The gateway takes amounts in hundredths of a dong.
pub const AMOUNT_MULTIPLIER: u64 = 100;
/// Characters that would split or re-key the unencoded redirect query.
pub const QUERY_DELIMITERS: [char; 5] = ['&', '=', '#', '?', '+'];

/// Rejects free text that cannot travel verbatim in the redirect query.
pub fn check_query_safe(field: &str, value: &str) -> Result<(), CheckoutError> {
    match value.chars().find(|c| QUERY_DELIMITERS.contains(c)) {
        Some(c) => Err(CheckoutError::InvalidArgument(format!(
            "{} must not contain '{}'",
            field, c
        ))),
        None => Ok(()),
    }
}

/// Everything the caller decides about one payment.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: String,
    /// Whole VND.
    pub amount: u64,
    pub order_info: String,
    pub order_type: String,
    pub locale: String,
    pub ip_addr: String,
    pub created_at: OffsetDateTime,
}

/// Gateway timestamps are `yyyyMMddHHmmss` in Vietnam time (GMT+7).
pub fn gateway_timestamp(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day][hour][minute][second]");
    at.to_offset(offset!(+7))
        .format(&fmt)
        .unwrap_or_default()
}

/// Short order reference in `HHmmss` form, GMT+7.
pub fn order_reference(at: OffsetDateTime) -> String {
    let fmt = format_description!("[hour][minute][second]");
    at.to_offset(offset!(+7))
        .format(&fmt)
        .unwrap_or_default()
}

/// Client address as the gateway should see it: the first
/// `x-forwarded-for` hop, else the peer address, else loopback.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| FALLBACK_IP.to_string())
}

/// Unsigned parameter mapping for a `pay` command.
pub fn payment_params(
    req: &PaymentRequest,
    config: &CheckoutConfig,
) -> Result<ParamMap, CheckoutError> {
    let minor_units = req
        .amount
        .checked_mul(AMOUNT_MULTIPLIER)
        .ok_or_else(|| CheckoutError::InvalidArgument("amount is too large".into()))?;
    check_query_safe("orderDescription", &req.order_info)?;
    check_query_safe("orderType", &req.order_type)?;
    check_query_safe("language", &req.locale)?;
    check_query_safe("ipAddr", &req.ip_addr)?;
    let expires_at = req.created_at + Duration::minutes(i64::from(config.payment_timeout_minutes));

    let mut p = ParamMap::new();
    p.insert("vnp_Version".into(), VERSION.into());
    p.insert("vnp_Command".into(), COMMAND_PAY.into());
    p.insert("vnp_TmnCode".into(), config.tmn_code.as_str().into());
    p.insert("vnp_Locale".into(), req.locale.as_str().into());
    p.insert("vnp_CurrCode".into(), CURRENCY.into());
    p.insert("vnp_TxnRef".into(), req.order_id.as_str().into());
    p.insert("vnp_OrderInfo".into(), req.order_info.as_str().into());
    p.insert("vnp_OrderType".into(), req.order_type.as_str().into());
    p.insert("vnp_Amount".into(), ParamValue::from(minor_units));
    p.insert("vnp_ReturnUrl".into(), config.return_url.as_str().into());
    p.insert("vnp_IpAddr".into(), req.ip_addr.as_str().into());
    p.insert("vnp_CreateDate".into(), gateway_timestamp(req.created_at).into());
    p.insert("vnp_ExpireDate".into(), gateway_timestamp(expires_at).into());
    Ok(p)
}

/// Signed parameters plus the URL the browser should be sent to.
#[derive(Debug, Clone)]
pub struct SignedPayment {
    pub params: ParameterSet,
    pub url: String,
}

pub fn build_payment_url(
    req: &PaymentRequest,
    config: &CheckoutConfig,
) -> Result<SignedPayment, CheckoutError> {
    let base = payment_params(req, config)?;
    let params = build_signed_request(&base, &config.hash_secret)?;
    let url = format!("{}?{}", config.gateway_url, params.to_query_string());
    Ok(SignedPayment { params, url })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{verify, SECURE_HASH};
    use axum::http::HeaderValue;
    use time::macros::datetime;

    fn config() -> CheckoutConfig {
        CheckoutConfig {
            tmn_code: "DEMO0001".into(),
            hash_secret: "SECRETKEY123".into(),
            return_url: "https://example.com/return".into(),
            ..CheckoutConfig::default()
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: "070155".into(),
            amount: 10_000,
            order_info: "Thanh toan don hang test".into(),
            order_type: "other".into(),
            locale: "vn".into(),
            ip_addr: "127.0.0.1".into(),
            created_at: datetime!(2024-01-01 00:01:55 UTC),
        }
    }

    #[test]
    fn timestamps_are_in_vietnam_time() {
        let at = datetime!(2024-01-01 00:01:55 UTC);
        assert_eq!(gateway_timestamp(at), "20240101070155");
        assert_eq!(order_reference(at), "070155");
    }

    #[test]
    fn amount_is_sent_in_minor_units() {
        let p = payment_params(&request(), &config()).unwrap();
        assert_eq!(p["vnp_Amount"], ParamValue::Integer(1_000_000));
        assert_eq!(p["vnp_ExpireDate"], ParamValue::Text("20240101071655".into()));
    }

    #[test]
    fn overflowing_amount_is_rejected() {
        let mut req = request();
        req.amount = u64::MAX;
        assert!(matches!(
            payment_params(&req, &config()),
            Err(CheckoutError::InvalidArgument(_))
        ));
    }

    #[test]
    fn payment_url_carries_verifiable_params() {
        let cfg = config();
        let signed = build_payment_url(&request(), &cfg).unwrap();
        assert!(signed.url.starts_with(&format!("{}?vnp_Amount=1000000&", cfg.gateway_url)));
        assert!(signed.url.contains("vnp_OrderInfo=Thanh toan don hang test"));
        assert!(signed.params.contains_key(SECURE_HASH));
        assert!(verify(&signed.params.into_map(), &cfg.hash_secret).valid);
    }

    #[test]
    fn query_delimiters_in_free_text_are_rejected() {
        for bad in ["Ao thun & quan", "a=b", "#1", "why?", "1+1"] {
            let mut req = request();
            req.order_info = bad.into();
            assert!(matches!(
                build_payment_url(&req, &config()),
                Err(CheckoutError::InvalidArgument(_))
            ));
        }
        let mut req = request();
        req.locale = "vn&vnp_Amount=1".into();
        assert!(payment_params(&req, &config()).is_err());
    }

    #[test]
    fn diacritics_survive_signing() {
        let mut req = request();
        req.order_info = "Thanh toán đơn hàng test".into();
        let cfg = config();
        let signed = build_payment_url(&req, &cfg).unwrap();
        assert!(signed.url.contains("vnp_OrderInfo=Thanh toán đơn hàng test&"));
        assert!(verify(&signed.params.into_map(), &cfg.hash_secret).valid);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let peer: Option<IpAddr> = "10.0.0.2".parse().ok();
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
        assert_eq!(client_ip(&HeaderMap::new(), peer), "10.0.0.2");
        assert_eq!(client_ip(&HeaderMap::new(), None), FALLBACK_IP);
    }
}
