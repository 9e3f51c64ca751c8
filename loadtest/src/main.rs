use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the checkout service.
///
/// Simulates the traffic a busy storefront sends at the payment API:
/// - Payment creation (canonicalize + HMAC-SHA512 per request)
/// - Order status polling after redirect
/// - Forged gateway callbacks (verification rejection path)
/// - Health monitoring endpoints
///
/// Start the server with `DISABLE_RATE_LIMIT=1` or the limiter will dominate
/// the results.
///
/// # Usage
/// ```bash
/// cd loadtest
/// cargo run --release -- --host http://localhost:3000 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Payment creation: <20ms p95 latency
/// - Callback verification: <10ms p95 latency
/// - Error rate: <1%

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("Checkout")
                // Primary workload: signed redirect URLs
                .register_transaction(transaction!(create_payment).set_weight(10)?)
                // Continuous health validation ensures service availability
                .register_transaction(transaction!(health_check).set_weight(1)?)
        )
        .register_scenario(
            scenario!("Callbacks")
                // Tampered callbacks exercise the full verify path without a valid secret
                .register_transaction(transaction!(forged_callback).set_weight(5)?)
        )
        .execute()
        .await?;

    Ok(())
}

/// Creates a payment, then polls the order it produced.
async fn create_payment(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let body = {
        let mut rng = rand::thread_rng();
        let amount: u64 = rng.gen_range(10..5000) * 1000;
        let language = if rng.gen_bool(0.5) { "vn" } else { "en" };
        serde_json::json!({
            "amount": amount,
            "orderDescription": "Thanh toan don hang loadtest",
            "language": language,
        })
    };

    let goose = user.post_json("/api/create-payment", &body).await?;

    // Pull vnp_TxnRef out of the redirect URL so the poll hits a real order.
    let order_id = match goose.response {
        Ok(resp) => resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|json| json["data"].as_str().map(str::to_string))
            .and_then(|url| {
                url.split('&')
                    .find_map(|pair| pair.strip_prefix("vnp_TxnRef=").map(str::to_string))
            }),
        Err(_) => None,
    };

    if let Some(order_id) = order_id {
        let _order_goose = user.get(&format!("/api/order/{}", order_id)).await?;
    }

    Ok(())
}

/// Sends a callback whose signature cannot match. The server answers 200
/// with code 97, so this measures verification cost rather than failures.
async fn forged_callback(user: &mut GooseUser) -> TransactionResult {
    let path = {
        let mut rng = rand::thread_rng();
        let sig: String = (0..128)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect();
        format!(
            "/api/payment/vnpay_return?vnp_Amount={}&vnp_ResponseCode=00&vnp_TxnRef={:06}&vnp_SecureHash={}",
            rng.gen_range(10..5000) * 100_000u64,
            rng.gen_range(0..240000u32),
            sig
        )
    };

    let _goose = user.get(&path).await?;

    Ok(())
}

/// Monitors service availability via health check endpoint.
///
/// Provides baseline for infrastructure latency separate from
/// business logic overhead.
async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
