// =============================================================================
// Bybit v5 REST layer
// =============================================================================

pub mod client;
pub mod error;
pub mod order;
pub mod rate_limit;

pub use client::MarketDataClient;
pub use error::BybitError;
pub use rate_limit::RateLimiter;

/// Public REST base URL for the chosen environment.
pub fn rest_base_url(testnet: bool) -> &'static str {
    if testnet {
        "https://api-testnet.bybit.com"
    } else {
        "https://api.bybit.com"
    }
}

/// Public streaming base URL for a category and environment.
pub fn ws_public_url(category: crate::types::Category, testnet: bool) -> String {
    let host = if testnet {
        "stream-testnet.bybit.com"
    } else {
        "stream.bybit.com"
    };
    format!("wss://{host}/v5/public/{category}")
}
