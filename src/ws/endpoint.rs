/// WebSocket API endpoints.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// USDⓈ-margined futures
    UsdMarginedFutures,
    /// Coin-margined delivery futures
    CoinMarginedFutures,
    /// Any other `ws://` or `wss://` URL, used as is
    Custom(String),
}

impl Endpoint {
    /// Base URL of this endpoint, on the live or the test network.
    #[must_use]
    pub fn url(&self, testnet: bool) -> &str {
        match (self, testnet) {
            (Self::UsdMarginedFutures, false) => "wss://ws-fapi.binance.com/ws-fapi/v1",
            (Self::UsdMarginedFutures, true) => "wss://testnet.binancefuture.com/ws-fapi/v1",
            (Self::CoinMarginedFutures, false) => "wss://ws-dapi.binance.com/ws-dapi/v1",
            (Self::CoinMarginedFutures, true) => "wss://testnet.binancefuture.com/ws-dapi/v1",
            (Self::Custom(url), _) => url,
        }
    }
}
