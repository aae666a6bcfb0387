//! In-process exchange used by tests: records every order, close and
//! transfer, fills at a fixed price and can inject failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::error::{ConnectorError, ConnectorResult};
use crate::models::{ApiCredentials, Position, Side};

use super::types::*;
use super::{ConnectorFactory, EventReceiver, ExchangeConnector, StreamSource};

#[derive(Default)]
struct MockState {
    balance: Decimal,
    positions: HashMap<String, Position>,
    fill_price: Option<Decimal>,
    order_failures: VecDeque<ConnectorError>,
    position_failures: VecDeque<ConnectorError>,
    lost_responses: VecDeque<ConnectorError>,
    placed: HashMap<String, OrderResult>,
    order_delay: Option<Duration>,
    closed_pnl: Decimal,
    pnl_failure: Option<ConnectorError>,
    orders: Vec<OrderRequest>,
    closes: Vec<(String, Side, Decimal)>,
    transfers: Vec<TransferRequest>,
    account_id: String,
    next_order: u64,
}

pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(balance: Decimal) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                balance,
                account_id: "100001".to_string(),
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.lock().balance = balance;
    }

    pub fn set_position(&self, symbol: &str, side: Side, size: Decimal, price: Decimal) {
        self.lock().positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side,
                size,
                entry_price: price,
                mark_price: price,
            },
        );
    }

    pub fn set_fill_price(&self, price: Decimal) {
        self.lock().fill_price = Some(price);
    }

    /// The next order or close fails with `error`. Calls queue up.
    pub fn fail_next_order(&self, error: ConnectorError) {
        self.lock().order_failures.push_back(error);
    }

    /// The next position read fails with `error`.
    pub fn fail_next_positions(&self, error: ConnectorError) {
        self.lock().position_failures.push_back(error);
    }

    /// The next order fills but the caller gets `error` instead of the result.
    pub fn lose_next_response(&self, error: ConnectorError) {
        self.lock().lost_responses.push_back(error);
    }

    /// Every order and close waits this long before reaching the book.
    pub fn set_order_delay(&self, delay: Duration) {
        self.lock().order_delay = Some(delay);
    }

    pub fn set_closed_pnl(&self, pnl: Decimal) {
        self.lock().closed_pnl = pnl;
    }

    pub fn fail_closed_pnl(&self, error: ConnectorError) {
        self.lock().pnl_failure = Some(error);
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.lock().orders.clone()
    }

    pub fn closes(&self) -> Vec<(String, Side, Decimal)> {
        self.lock().closes.clone()
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.lock().transfers.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.lock().positions.get(symbol).cloned()
    }

    fn fill(state: &mut MockState, symbol: &str, side: Side, qty: Decimal, price: Decimal) {
        let entry = state.positions.entry(symbol.to_string()).or_insert(Position {
            symbol: symbol.to_string(),
            side,
            size: Decimal::ZERO,
            entry_price: price,
            mark_price: price,
        });
        if entry.side == side || entry.is_closed() {
            entry.side = side;
            entry.size += qty;
        } else if qty > entry.size {
            entry.side = side;
            entry.size = qty - entry.size;
        } else {
            entry.size -= qty;
        }
        entry.mark_price = price;
        if entry.is_closed() {
            state.positions.remove(symbol);
        }
    }

    fn take_failure(state: &mut MockState) -> ConnectorResult<()> {
        match state.order_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// An order id seen before returns its first result, as the exchange does.
    fn replayed(state: &MockState, request: &OrderRequest) -> Option<OrderResult> {
        request
            .client_order_id
            .as_ref()
            .and_then(|id| state.placed.get(id).cloned())
    }

    fn record(
        state: &mut MockState,
        request: &OrderRequest,
        price: Decimal,
    ) -> ConnectorResult<OrderResult> {
        state.next_order += 1;
        let result = OrderResult {
            order_id: format!("mock-{}", state.next_order),
            avg_price: Some(price),
            status: "Filled".to_string(),
        };
        if let Some(id) = &request.client_order_id {
            state.placed.insert(id.clone(), result.clone());
        }
        match state.lost_responses.pop_front() {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    async fn delay(&self) {
        let delay = self.lock().order_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ExchangeConnector for MockExchange {
    async fn get_wallet_balance(&self) -> ConnectorResult<Decimal> {
        Ok(self.lock().balance)
    }

    async fn get_positions(&self, symbol: Option<&str>) -> ConnectorResult<Vec<Position>> {
        let mut state = self.lock();
        if let Some(err) = state.position_failures.pop_front() {
            return Err(err);
        }
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| symbol.map(|s| s == p.symbol).unwrap_or(true))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> ConnectorResult<OrderResult> {
        self.delay().await;
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        if let Some(result) = Self::replayed(&state, request) {
            return Ok(result);
        }
        let price = state.fill_price.or(request.price).unwrap_or(Decimal::ONE);
        state.orders.push(request.clone());
        Self::fill(&mut state, &request.symbol, request.side, request.qty, price);
        Self::record(&mut state, request, price)
    }

    async fn close_position(&self, request: &OrderRequest) -> ConnectorResult<OrderResult> {
        self.delay().await;
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        if let Some(result) = Self::replayed(&state, request) {
            return Ok(result);
        }
        let Some(held) = state.positions.get(&request.symbol).cloned() else {
            return Err(ConnectorError::from_bybit(
                110017,
                "current position is zero, cannot fix reduce-only order qty",
            ));
        };
        let price = state.fill_price.unwrap_or(held.mark_price);
        state
            .closes
            .push((request.symbol.clone(), request.side, request.qty));
        let qty = request.qty.min(held.size);
        Self::fill(&mut state, &request.symbol, request.side, qty, price);
        Self::record(&mut state, request, price)
    }

    async fn internal_transfer(
        &self,
        request: &TransferRequest,
    ) -> ConnectorResult<TransferResult> {
        let mut state = self.lock();
        state.transfers.push(request.clone());
        Ok(TransferResult {
            success: true,
            transaction_id: format!("tx-{}", state.transfers.len()),
        })
    }

    async fn get_closed_pnl(&self, _window: PnlWindow) -> ConnectorResult<Decimal> {
        let state = self.lock();
        match &state.pnl_failure {
            Some(err) => Err(err.clone()),
            None => Ok(state.closed_pnl),
        }
    }

    async fn validate_credentials(&self) -> ConnectorResult<String> {
        Ok(self.lock().account_id.clone())
    }
}

/// Hands out registered [`MockExchange`]s by API key.
#[derive(Default)]
pub struct MockFactory {
    exchanges: Mutex<HashMap<String, Arc<MockExchange>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, api_key: &str, exchange: Arc<MockExchange>) {
        self.exchanges.lock().unwrap().insert(api_key.to_string(), exchange);
    }
}

impl ConnectorFactory for MockFactory {
    fn connector(
        &self,
        credentials: &ApiCredentials,
    ) -> ConnectorResult<Arc<dyn ExchangeConnector>> {
        match self.exchanges.lock().unwrap().get(&credentials.api_key) {
            Some(exchange) => Ok(Arc::clone(exchange) as Arc<dyn ExchangeConnector>),
            None => Err(ConnectorError::Credential(format!(
                "unknown API key '{}'",
                credentials.api_key
            ))),
        }
    }
}

/// Scripted private stream. Connects succeed while `accepting` is set.
pub struct MockStreamSource {
    accepting: AtomicBool,
    rejecting: AtomicBool,
    connects: AtomicUsize,
    sender: Mutex<Option<mpsc::Sender<ConnectorResult<StreamEvent>>>>,
}

impl MockStreamSource {
    pub fn new(accepting: bool) -> Arc<Self> {
        Arc::new(Self {
            accepting: AtomicBool::new(accepting),
            rejecting: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            sender: Mutex::new(None),
        })
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Connects fail on rejected credentials while set.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver an event on the current stream. Returns false when none is open.
    pub async fn push(&self, event: StreamEvent) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(Ok(event)).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the server dropping the connection.
    pub fn drop_stream(&self) {
        self.sender.lock().unwrap().take();
    }
}

#[async_trait]
impl StreamSource for MockStreamSource {
    async fn connect(&self, _credentials: &ApiCredentials) -> ConnectorResult<EventReceiver> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(ConnectorError::Credential("API key is invalid.".to_string()));
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConnectorError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
