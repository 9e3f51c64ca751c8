use std::net::SocketAddr;
use vnpay_checkout::{config::CheckoutConfig, router, signature};

/// Checkout server entry point.
///
/// Initializes tracing, loads and validates the gateway configuration,
/// checks that HMAC-SHA512 produces known answers, then serves the payment
/// API. A failed self-test stops the process before any traffic is accepted.
///
/// # Configuration
/// Environment variables:
/// - `VNP_TMN_CODE`, `VNP_HASH_SECRET`: merchant credentials (required)
/// - `VNP_URL`, `VNP_RETURN_URL`: gateway payment page and browser return address
/// - `CLIENT_URL`: origin allowed by CORS
/// - `PORT`: HTTP listen port (default: 3000)
/// - `RUST_LOG`: Logging verbosity (default: "vnpay_checkout=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vnpay_checkout=debug,tower_http=debug".into())
        )
        .init();

    tracing::info!("Starting checkout server");

    signature::self_test()?;

    let cfg = CheckoutConfig::from_env()?;
    cfg.validate()?;
    tracing::info!("Gateway {} for merchant {}", cfg.gateway_url, cfg.tmn_code);

    let app = router(cfg);

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    // Peer addresses feed both the rate limiter and `vnp_IpAddr`.
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
