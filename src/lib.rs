use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use thiserror::Error;
use time::OffsetDateTime;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

pub mod config;
pub mod gateway;
pub mod params;
pub mod signature;
pub mod store;

use crate::config::CheckoutConfig;
use crate::gateway::{build_payment_url, check_query_safe, client_ip, order_reference, PaymentRequest};
use crate::params::ParamValue;
use crate::signature::{verify, SignatureError, RESERVED_FIELDS};
use crate::store::{MemoryOrderStore, Order, OrderStatus, OrderStore, PaymentMethod};

/// Envelope codes shared with the client.
pub mod codes {
    pub const SUCCESS: &str = "00";
    pub const NOT_FOUND: &str = "01";
    pub const INVALID_SIGNATURE: &str = "97";
    pub const ERROR: &str = "99";
}

/// Callback messages shown to shoppers as-is.
pub mod messages {
    pub const PAYMENT_SUCCESS: &str = "Thanh toán thành công";
    pub const PAYMENT_FAILED: &str = "Thanh toán thất bại";
    pub const INVALID_SIGNATURE: &str = "Chữ ký không hợp lệ";
}

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            CheckoutError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, codes::ERROR),
            CheckoutError::NotFound(_) => (StatusCode::NOT_FOUND, codes::NOT_FOUND),
            CheckoutError::Signature(SignatureError::ReservedField(_)) => {
                (StatusCode::BAD_REQUEST, codes::ERROR)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, codes::ERROR),
        };
        if status.is_server_error() {
            METRICS.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("{}", self);
        }
        let body = ApiResponse::new(code, self.to_string(), serde_json::json!({}));
        (status, Json(body)).into_response()
    }
}

/// `{ code, message, data }` wrapper used by every API route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: String,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(code: &str, message: impl Into<String>, data: T) -> Self {
        Self { code: code.to_string(), message: message.into(), data }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    /// Whole VND, as a number or a numeric string.
    pub amount: ParamValue,
    #[serde(default)]
    pub order_description: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

fn parse_amount(amount: &ParamValue) -> Result<u64> {
    let parsed = match amount {
        ParamValue::Integer(n) => u64::try_from(*n).ok(),
        ParamValue::Text(s) => s.trim().parse::<u64>().ok(),
    };
    match parsed {
        Some(n) if n > 0 => Ok(n),
        _ => Err(CheckoutError::InvalidArgument(format!(
            "amount must be a positive integer, got {}",
            amount
        ))),
    }
}

fn non_blank(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CheckoutConfig>,
    pub store: Arc<dyn OrderStore>,
}

const MAX_ORDER_ID_ATTEMPTS: u32 = 100;

/// Stores a new pending order under an unused `HHmmss` reference.
async fn create_order(
    store: &dyn OrderStore,
    now: OffsetDateTime,
    amount: u64,
    description: &str,
    method: PaymentMethod,
) -> Result<Order> {
    let base = order_reference(now);
    for attempt in 0..MAX_ORDER_ID_ATTEMPTS {
        let order_id = if attempt == 0 { base.clone() } else { format!("{}{:02}", base, attempt) };
        let order = Order {
            order_id,
            amount,
            order_description: description.to_string(),
            payment_method: method,
            status: OrderStatus::Pending,
            create_date: gateway::gateway_timestamp(now),
            transaction_data: None,
        };
        if store.insert(order.clone()).await.map_err(CheckoutError::Store)? {
            return Ok(order);
        }
    }
    Err(CheckoutError::Internal(format!("no free order reference for {}", base)))
}

async fn create_payment_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: std::result::Result<Json<CreatePaymentBody>, JsonRejection>,
) -> Result<Json<ApiResponse<String>>> {
    let Json(body) = body.map_err(|e| CheckoutError::InvalidArgument(e.body_text()))?;
    let amount = parse_amount(&body.amount)?;
    let description = non_blank(body.order_description, gateway::DEFAULT_ORDER_INFO);
    let order_type = non_blank(body.order_type, gateway::DEFAULT_ORDER_TYPE);
    let locale = non_blank(body.language, gateway::DEFAULT_LOCALE);
    // Checked before the order exists so a rejected request leaves nothing behind.
    check_query_safe("orderDescription", &description)?;
    check_query_safe("orderType", &order_type)?;
    check_query_safe("language", &locale)?;
    let now = OffsetDateTime::now_utc();

    let order = create_order(state.store.as_ref(), now, amount, &description, body.payment_method).await?;

    if body.payment_method == PaymentMethod::Cod {
        tracing::info!("Created cash-on-delivery order {} for {} VND", order.order_id, amount);
        return Ok(Json(ApiResponse::new(
            codes::SUCCESS,
            "Order will be paid on delivery",
            order.order_id,
        )));
    }

    let req = PaymentRequest {
        order_id: order.order_id.clone(),
        amount,
        order_info: description,
        order_type,
        locale,
        ip_addr: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr.ip())),
        created_at: now,
    };
    let signed = build_payment_url(&req, &state.config)?;

    METRICS.payments_created.fetch_add(1, Ordering::Relaxed);
    tracing::info!("Created payment URL for order={} amount={} VND", order.order_id, amount);
    tracing::debug!("Redirect URL: {}", signed.url);

    Ok(Json(ApiResponse::new(codes::SUCCESS, "success", signed.url)))
}

/// Callback parameters keyed by name. A repeated key is rejected so the
/// signed set stays unambiguous.
fn parse_callback_query(raw: Option<&str>) -> Result<BTreeMap<String, String>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw.unwrap_or(""))
        .map_err(|e| CheckoutError::InvalidArgument(format!("malformed query: {}", e)))?;
    let mut params = BTreeMap::new();
    for (k, v) in pairs {
        if params.contains_key(&k) {
            return Err(CheckoutError::InvalidArgument(format!("duplicate parameter `{}`", k)));
        }
        params.insert(k, v);
    }
    Ok(params)
}

async fn payment_return_handler(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<ApiResponse<serde_json::Value>>> {
    let params = parse_callback_query(raw.as_deref())?;
    let verification = verify(&params, &state.config.hash_secret);

    let mut data = params;
    for key in RESERVED_FIELDS {
        data.remove(key);
    }
    let order_id = data.get("vnp_TxnRef").cloned().unwrap_or_default();

    if !verification.valid {
        METRICS.callbacks_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Rejected callback with invalid signature for order={}", order_id);
        return Ok(Json(ApiResponse::new(
            codes::INVALID_SIGNATURE,
            messages::INVALID_SIGNATURE,
            serde_json::json!({}),
        )));
    }
    METRICS.callbacks_verified.fetch_add(1, Ordering::Relaxed);

    let response_code = verification.response_code.unwrap_or_else(|| codes::ERROR.to_string());
    let succeeded = response_code == codes::SUCCESS;
    let status = if succeeded { OrderStatus::Success } else { OrderStatus::Failed };

    match state.store.get(&order_id).await.map_err(CheckoutError::Store)? {
        Some(order) => {
            let updated = Order { status, transaction_data: Some(data.clone()), ..order };
            let swapped = state
                .store
                .compare_and_swap(&order_id, OrderStatus::Pending, updated)
                .await
                .map_err(CheckoutError::Store)?;
            if swapped {
                tracing::info!("Order {} marked {} (code {})", order_id, status, response_code);
            } else {
                tracing::info!("Order {} already settled, ignoring callback", order_id);
            }
        }
        None => tracing::warn!("Verified callback for unknown order={}", order_id),
    }

    let message = if succeeded { messages::PAYMENT_SUCCESS } else { messages::PAYMENT_FAILED };
    let data = serde_json::to_value(&data).map_err(|e| CheckoutError::Internal(e.to_string()))?;
    Ok(Json(ApiResponse::new(&response_code, message, data)))
}

async fn order_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<Order>>> {
    match state.store.get(&order_id).await.map_err(CheckoutError::Store)? {
        Some(order) => Ok(Json(ApiResponse::new(codes::SUCCESS, "success", order))),
        None => Err(CheckoutError::NotFound("Order not found".into())),
    }
}

// ====================================================================================
// OBSERVABILITY
// ====================================================================================

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics tracking
pub struct Metrics {
    pub payments_created: AtomicU64,
    pub callbacks_verified: AtomicU64,
    pub callbacks_rejected: AtomicU64,
    pub errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            payments_created: AtomicU64::new(0),
            callbacks_verified: AtomicU64::new(0),
            callbacks_rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref METRICS: Metrics = Metrics::new();
}

async fn health_handler() -> impl IntoResponse {
    use serde_json::json;

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "vnpay-checkout"
    }))
}

/// Metrics endpoint (Prometheus-compatible plain text)
async fn metrics_handler() -> impl IntoResponse {
    let created = METRICS.payments_created.load(Ordering::Relaxed);
    let verified = METRICS.callbacks_verified.load(Ordering::Relaxed);
    let rejected = METRICS.callbacks_rejected.load(Ordering::Relaxed);
    let errors = METRICS.errors.load(Ordering::Relaxed);

    let metrics = format!(
        "# HELP checkout_payments_created_total Total number of signed payment URLs issued\n\
         # TYPE checkout_payments_created_total counter\n\
         checkout_payments_created_total {}\n\
         # HELP checkout_callbacks_verified_total Total number of callbacks with a valid signature\n\
         # TYPE checkout_callbacks_verified_total counter\n\
         checkout_callbacks_verified_total {}\n\
         # HELP checkout_callbacks_rejected_total Total number of callbacks with a missing or invalid signature\n\
         # TYPE checkout_callbacks_rejected_total counter\n\
         checkout_callbacks_rejected_total {}\n\
         # HELP checkout_errors_total Total number of internal errors\n\
         # TYPE checkout_errors_total counter\n\
         checkout_errors_total {}\n",
        created, verified, rejected, errors
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}

fn cors_layer(config: &CheckoutConfig) -> CorsLayer {
    let origin = config
        .client_url
        .as_deref()
        .and_then(|url| match HeaderValue::from_str(url) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring unusable CLIENT_URL {:?}", url);
                None
            }
        });
    match origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
        None => CorsLayer::permissive(),
    }
}

/// Router backed by a fresh in-memory order store.
pub fn router(config: CheckoutConfig) -> Router {
    router_with_store(config, Arc::new(MemoryOrderStore::new()))
}

pub fn router_with_store(config: CheckoutConfig, store: Arc<dyn OrderStore>) -> Router {
    let cors = cors_layer(&config);
    let client_dir = config.client_dir.clone();
    let rate_limit = config.rate_limit;
    let state = AppState { config: Arc::new(config), store };

    // Observability endpoints - NO rate limiting
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let mut api_routes = Router::new()
        .route("/api/create-payment", post(create_payment_handler))
        .route("/api/payment/vnpay_return", get(payment_return_handler))
        .route("/api/order/:order_id", get(order_handler))
        .with_state(state);

    match rate_limit {
        // The builder takes the interval between refills, not a rate.
        Some(limit) => match limit
            .replenish_interval_ms()
            .and_then(|ms| {
                GovernorConfigBuilder::default()
                    .per_millisecond(ms)
                    .burst_size(limit.burst_size)
                    .finish()
            })
        {
            Some(governor_conf) => {
                tracing::info!(
                    "Router configured with rate limiting: {}/sec, burst {}",
                    limit.per_second,
                    limit.burst_size
                );
                api_routes = api_routes.layer(GovernorLayer {
                    config: Box::leak(Box::new(governor_conf)),
                });
            }
            None => tracing::warn!("Invalid rate limit {:?}, serving without it", limit),
        },
        None => tracing::info!("Rate limiting disabled"),
    }

    // Client-side routes such as /payment/result fall back to index.html.
    let client = ServeDir::new(&client_dir)
        .not_found_service(ServeFile::new(client_dir.join("index.html")));

    Router::new()
        .merge(observability_routes)
        .merge(api_routes)
        .fallback_service(client)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_amount(&ParamValue::Integer(10_000)).unwrap(), 10_000);
        assert_eq!(parse_amount(&ParamValue::Text(" 25000 ".into())).unwrap(), 25_000);
        for bad in [ParamValue::Integer(0), ParamValue::Integer(-5), ParamValue::Text("abc".into())] {
            assert!(matches!(parse_amount(&bad), Err(CheckoutError::InvalidArgument(_))));
        }
    }

    #[test]
    fn callback_query_rejects_duplicates() {
        let ok = parse_callback_query(Some("b=2&a=1&c=Thanh+toan")).unwrap();
        assert_eq!(ok.get("c").map(String::as_str), Some("Thanh toan"));
        assert!(parse_callback_query(None).unwrap().is_empty());
        assert!(matches!(
            parse_callback_query(Some("a=1&a=2")),
            Err(CheckoutError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn order_ids_get_suffix_on_collision() {
        let store = MemoryOrderStore::new();
        let now = time::macros::datetime!(2024-01-01 00:01:55 UTC);
        let first = create_order(&store, now, 1, "a", PaymentMethod::Vnpay).await.unwrap();
        let second = create_order(&store, now, 1, "b", PaymentMethod::Cod).await.unwrap();
        assert_eq!(first.order_id, "070155");
        assert_eq!(second.order_id, "07015501");
        assert_eq!(second.create_date, "20240101070155");
    }
}
