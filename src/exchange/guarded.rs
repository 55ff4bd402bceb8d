// Shared rate limit and per-call timeout around any exchange client

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::debug;

use super::{ExchangeClient, ExchangeError, ExchangeOrder, ExchangeResult, OrderRequest, SymbolInfo};

/// Sliding-window limiter shared by every caller of the client
#[derive(Debug)]
struct RateLimiter {
    max_calls: u32,
    window_duration: Duration,
    calls: Vec<Instant>,
}

impl RateLimiter {
    fn new(max_calls: u32, window_duration: Duration) -> Self {
        Self {
            max_calls,
            window_duration,
            calls: Vec::new(),
        }
    }

    /// How long the caller must wait before its call fits in the window
    fn reserve(&mut self, now: Instant) -> Duration {
        // Remove old calls outside the window
        self.calls.retain(|&call_time| now.duration_since(call_time) <= self.window_duration);

        let wait = if self.calls.len() >= self.max_calls as usize {
            self.calls
                .first()
                .map(|&oldest| self.window_duration.saturating_sub(now.duration_since(oldest)))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        self.calls.push(now + wait);
        wait
    }
}

/// Wraps the single exchange client every instance shares
pub struct GuardedExchange {
    inner: Arc<dyn ExchangeClient>,
    limiter: Mutex<RateLimiter>,
    call_timeout: Duration,
}

impl GuardedExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, max_calls: u32, window: Duration, call_timeout: Duration) -> Self {
        Self {
            inner,
            limiter: Mutex::new(RateLimiter::new(max_calls.max(1), window)),
            call_timeout,
        }
    }

    async fn guarded<T, F>(&self, op: &str, call: F) -> ExchangeResult<T>
    where
        F: Future<Output = ExchangeResult<T>> + Send,
    {
        let wait = self.limiter.lock().await.reserve(Instant::now());
        if !wait.is_zero() {
            debug!("⏳ Rate limit: delaying {} by {:?}", op, wait);
            sleep(wait).await;
        }

        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.call_timeout)),
        }
    }
}

#[async_trait]
impl ExchangeClient for GuardedExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.guarded("place_order", self.inner.place_order(request)).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.guarded("cancel_order", self.inner.cancel_order(symbol, order_id)).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.guarded("get_order_status", self.inner.get_order_status(symbol, order_id)).await
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.guarded("get_open_orders", self.inner.get_open_orders(symbol)).await
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64> {
        self.guarded("get_balance", self.inner.get_balance(asset)).await
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.guarded("get_price", self.inner.get_price(symbol)).await
    }

    async fn symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        self.guarded("symbol_info", self.inner.symbol_info(symbol)).await
    }
}
