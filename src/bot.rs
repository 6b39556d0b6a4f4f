//! Bot runner: startup reconciliation and the per-cycle decision loop.
//!
//! Handles:
//! - Adopting wallet holdings as positions at startup
//! - Gathering prices, balances and indicators each cycle
//! - Running the decision engine over every configured instrument
//! - Submitting guarded orders and applying confirmed fills to cycle state
//! - Appending fills, actions and heartbeats to the ledger

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{AssetBalance, MarketGateway, OrderRequest};
use crate::db::{ActionStats, BotState, Database, Heartbeat};
use crate::error::IndicatorError;
use crate::metrics::PortfolioMetrics;
use crate::models::{
    base_asset, quote_asset, InstrumentMeta, Position, Side, TradeAction, DEFAULT_LOT_STEP,
};
use crate::trading::{
    join_reasons, round_to_lot, Decision, DecisionEngine, EntryContext, EntrySnapshot,
    EntryTrendFilter, IndicatorEngine, Reconciler, SkipReason, TradingConfig,
};

/// Fills pulled from the exchange per ledger sync.
const LEDGER_SYNC_LIMIT: usize = 50;

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Seconds between cycles
    pub poll_interval_secs: u64,

    /// Database URL
    pub database_url: String,

    /// Mode recorded in the ledger (`live` or `paper`)
    pub mode: String,

    /// Strategy constants
    pub trading: TradingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            database_url: "sqlite:dipper.db?mode=rwc".to_string(),
            mode: "live".to_string(),
            trading: TradingConfig::default(),
        }
    }
}

/// State carried from one cycle to the next.
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    /// Open positions; absence means flat
    pub positions: BTreeMap<String, Position>,

    /// Highest price seen since entry, per open position
    pub peaks: BTreeMap<String, Decimal>,

    /// Prices observed in the previous cycle
    pub last_prices: HashMap<String, Decimal>,
}

impl CycleState {
    /// Adopt reconciled positions, seeding each peak at the average cost.
    pub fn from_reconciled(reconciled: BTreeMap<String, Option<Position>>) -> Self {
        let positions: BTreeMap<String, Position> = reconciled
            .into_iter()
            .filter_map(|(instrument, pos)| pos.map(|p| (instrument, p)))
            .collect();
        let peaks = positions
            .iter()
            .map(|(instrument, pos)| (instrument.clone(), pos.avg_cost()))
            .collect();

        Self {
            positions,
            peaks,
            last_prices: HashMap::new(),
        }
    }

    /// Apply an order the exchange accepted.
    fn apply_confirmed(&mut self, order: &TradeAction, lot_step: Decimal) {
        let instrument = order.instrument.clone();
        match order.side {
            Side::Buy => {
                let stop = order.stop_price.unwrap_or(order.price);
                let target = order.target_price.unwrap_or(order.price);
                match Position::new(order.quantity, order.price, stop, target) {
                    Ok(position) => {
                        self.positions.insert(instrument.clone(), position);
                        self.peaks.insert(instrument, order.price);
                    }
                    Err(e) => warn!(instrument = %instrument, error = %e, "Confirmed buy not tracked"),
                }
            }
            Side::Sell => {
                let remaining = self
                    .positions
                    .remove(&instrument)
                    .and_then(|pos| pos.reduce(order.quantity))
                    .filter(|pos| pos.quantity() >= lot_step);

                match remaining {
                    Some(pos) => {
                        debug!(instrument = %instrument, qty = %pos.quantity(), "Position partially closed");
                        self.positions.insert(instrument, pos);
                    }
                    None => {
                        self.peaks.remove(&instrument);
                    }
                }
            }
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Actions the decision engine proposed
    pub proposed: Vec<TradeAction>,

    /// Orders the exchange accepted, as submitted
    pub executed: Vec<TradeAction>,

    /// Why each instrument without an action was skipped
    pub rejections: BTreeMap<String, Vec<SkipReason>>,

    pub metrics: PortfolioMetrics,

    /// State for the next cycle
    pub state: CycleState,
}

/// Main bot runner.
pub struct Bot<G: MarketGateway> {
    config: BotConfig,
    db: Database,
    gateway: G,
    engine: DecisionEngine,
    indicators: IndicatorEngine,
    reconciler: Reconciler,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl<G: MarketGateway> Bot<G> {
    /// Create a new bot instance.
    pub async fn new(config: BotConfig, gateway: G) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let trading = config.trading.clone();

        Ok(Self {
            indicators: IndicatorEngine::new(trading.depth_alpha, trading.depth_levels),
            reconciler: Reconciler::from_config(&trading),
            engine: DecisionEngine::new(trading),
            config,
            db,
            gateway,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn trading(&self) -> &TradingConfig {
        self.engine.config()
    }

    /// Run until shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        let symbols = self.trading().symbols.clone();
        info!(
            mode = %self.config.mode,
            symbols = %symbols.join(", "),
            risk_pct = %(self.trading().risk_fraction * Decimal::ONE_HUNDRED),
            max_open = self.trading().max_open,
            "Starting bot"
        );

        self.db.init_bot_state(&self.config.mode).await?;

        let reconciled = self
            .reconcile_all(&symbols)
            .await
            .context("Startup reconciliation failed")?;
        let mut state = CycleState::from_reconciled(reconciled);
        state.last_prices = self.fetch_prices(&symbols).await?;
        info!(open = state.positions.len(), "Positions adopted");

        let shutdown = self.shutdown.clone();
        let wake = self.wake.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.store(true, Ordering::SeqCst);
                wake.notify_one();
            }
        });

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.run_cycle(state.clone()).await {
                Ok(report) => state = report.state,
                Err(e) => error!(error = %format!("{e:#}"), "Cycle failed, retrying next interval"),
            }
        }

        self.stop(&state).await
    }

    async fn stop(&self, state: &CycleState) -> Result<()> {
        info!("Shutting down bot...");

        let open: Vec<String> = state
            .positions
            .iter()
            .map(|(instrument, pos)| format!("{} {}@{}", instrument, pos.quantity(), pos.avg_cost().round_dp(4)))
            .collect();
        if open.is_empty() {
            info!("Stopped with no open positions");
        } else {
            warn!(positions = %open.join(", "), "Stopped with open positions");
        }

        self.db.mark_bot_stopped().await?;
        let stats = BotStats::load(&self.db).await?;
        info!("\n{}", stats);

        info!("Bot shutdown complete");
        Ok(())
    }

    // ==================== Reconciliation ====================

    /// Reconcile wallet holdings with trade history for each instrument.
    ///
    /// Instruments without a price are left out of the map.
    pub async fn reconcile_all(
        &self,
        instruments: &[String],
    ) -> Result<BTreeMap<String, Option<Position>>> {
        let balances = self
            .gateway
            .get_balance()
            .await
            .context("Failed to fetch balances")?;
        let trading = self.trading();
        let mut reconciled = BTreeMap::new();

        for instrument in instruments {
            let Some(spot) = self.gateway.get_price(instrument).await? else {
                warn!(instrument = %instrument, "No price, instrument ignored");
                continue;
            };

            let wallet_qty = balances
                .get(base_asset(instrument))
                .map(|b| b.total)
                .unwrap_or_default();
            if wallet_qty <= Decimal::ZERO {
                reconciled.insert(instrument.clone(), None);
                continue;
            }

            let fills = self
                .gateway
                .get_trade_history(instrument)
                .await
                .with_context(|| format!("Failed to load trade history for {}", instrument))?;
            let volatility = self
                .indicators
                .fetch_atr(&self.gateway, instrument, trading.atr_granularity, trading.atr_period)
                .await?;

            let position = self.reconciler.reconcile(
                instrument,
                wallet_qty,
                &fills,
                spot,
                trading.dust_floor,
                volatility,
            );
            if let Some(pos) = &position {
                info!(
                    instrument = %instrument,
                    qty = %pos.quantity(),
                    avg = %pos.avg_cost().round_dp(4),
                    stop = %pos.stop_price().round_dp(4),
                    target = %pos.target_price().round_dp(4),
                    "Adopted position"
                );
            }
            reconciled.insert(instrument.clone(), position);
        }

        Ok(reconciled)
    }

    // ==================== Cycle ====================

    /// Run one decision cycle against `state` and return the next state.
    ///
    /// Market data failures propagate. Order failures are recorded and leave
    /// the state untouched.
    pub async fn run_cycle(&mut self, mut state: CycleState) -> Result<CycleReport> {
        let trading = self.trading().clone();

        // 1. Wallet
        let balances = self
            .gateway
            .get_balance()
            .await
            .context("Failed to fetch balances")?;
        let cash = free_cash(&balances, &trading.symbols);

        // 2. Prices and metadata
        let mut prices = self.fetch_prices(&trading.symbols).await?;
        let mut metas = HashMap::new();
        for instrument in &trading.symbols {
            if !prices.contains_key(instrument) {
                continue;
            }
            match self.gateway.instrument_metadata(instrument).await {
                Ok(meta) => {
                    metas.insert(instrument.clone(), meta);
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "No instrument metadata, skipped this cycle");
                    prices.remove(instrument);
                }
            }
        }

        // 3. Positions closed outside the bot
        drop_drifted(&mut state, &balances, &metas);

        // 4. Portfolio
        let metrics = PortfolioMetrics::calculate(
            cash,
            &balances,
            &prices,
            &state.positions,
            trading.risk_fraction,
            trading.min_order_notional,
        );
        info!(
            cash = %metrics.cash.round_dp(2),
            equity = %metrics.equity.round_dp(2),
            open = metrics.open_count,
            ticket = %metrics.entry_ticket_size.round_dp(2),
            unrealized_pnl = %metrics.unrealized_pnl.round_dp(2),
            "Heartbeat"
        );
        if let Err(e) = self.db.record_heartbeat(&metrics).await {
            warn!(error = %e, "Failed to record heartbeat");
        }

        // 5. Decisions
        let mut proposed = Vec::new();
        let mut rejections = BTreeMap::new();
        let mut reserved = Decimal::ZERO;
        let mut pending_entries = 0;
        let fee_factor = Decimal::ONE + trading.fee_rate;

        for instrument in &trading.symbols {
            let (Some(&price), Some(meta)) = (prices.get(instrument), metas.get(instrument).copied()) else {
                info!(instrument = %instrument, reasons = %SkipReason::NoPrice, "Skipped");
                rejections.insert(instrument.clone(), vec![SkipReason::NoPrice]);
                continue;
            };

            let decision = if !meta.active {
                Decision::Skip(vec![SkipReason::Inactive])
            } else if let Some(position) = state.positions.get_mut(instrument) {
                let peak = state
                    .peaks
                    .entry(instrument.clone())
                    .or_insert_with(|| position.avg_cost());
                self.engine.evaluate_exit(instrument, price, position, peak)
            } else {
                let ctx = EntryContext {
                    equity: metrics.equity,
                    cash: (cash - reserved).max(Decimal::ZERO),
                    open_count: state.positions.len() + pending_entries,
                };
                let last_price = state.last_prices.get(instrument).copied();
                self.evaluate_flat(instrument, price, last_price, meta.lot_step, &ctx)
                    .await?
            };

            match decision {
                Decision::Act(action) => {
                    info!(
                        instrument = %instrument,
                        price = %price,
                        side = %action.side,
                        tag = %action.tag,
                        "Tradeable"
                    );
                    if action.side == Side::Buy {
                        reserved += action.notional() * fee_factor;
                        pending_entries += 1;
                    }
                    proposed.push(action);
                }
                Decision::Skip(reasons) => {
                    info!(instrument = %instrument, price = %price, reasons = %join_reasons(&reasons), "Skipped");
                    rejections.insert(instrument.clone(), reasons);
                }
            }
        }

        let tradeable: Vec<&str> = proposed.iter().map(|a| a.instrument.as_str()).collect();
        let listed = if tradeable.is_empty() {
            "none".to_string()
        } else {
            tradeable.join(", ")
        };
        info!(count = tradeable.len(), instruments = %listed, "Tradeable instruments");

        // 6. Prices for the next dip check
        for (instrument, price) in &prices {
            state.last_prices.insert(instrument.clone(), *price);
        }

        // 7. Execution
        let mut executed = Vec::new();
        let mut available_cash = cash;

        for action in &proposed {
            let lot_step = metas
                .get(&action.instrument)
                .map(|m| m.lot_step)
                .unwrap_or(DEFAULT_LOT_STEP);

            let Some(order) = self.guard(action, &balances, lot_step, available_cash) else {
                continue;
            };

            if let Some(ack_id) = self.submit(&order).await {
                state.apply_confirmed(&order, lot_step);
                if order.side == Side::Buy {
                    available_cash -= order.notional() * fee_factor;
                }
                self.record_action(&order, Ok(&ack_id)).await;
                executed.push(order);
            }
        }

        // 8. Ledger
        if let Err(e) = self.sync_fills().await {
            warn!(error = %format!("{e:#}"), "Ledger sync failed");
        }
        if let Err(e) = self.db.update_bot_state().await {
            warn!(error = %e, "Failed to update bot state");
        }

        Ok(CycleReport {
            proposed,
            executed,
            rejections,
            metrics,
            state,
        })
    }

    /// Gather indicators for a FLAT instrument and evaluate the entry.
    async fn evaluate_flat(
        &mut self,
        instrument: &str,
        price: Decimal,
        last_price: Option<Decimal>,
        lot_step: Decimal,
        ctx: &EntryContext,
    ) -> Result<Decision> {
        if !self.engine.can_open(ctx.open_count) {
            return Ok(Decision::Skip(vec![SkipReason::MaxOpenReached]));
        }

        let config = self.engine.config();
        let trend_granularity = match config.trend_filter {
            EntryTrendFilter::BelowTrend => config.ema_granularity,
            EntryTrendFilter::AboveHigherTimeframe => config.htf_granularity,
        };
        let (ema_period, atr_granularity, atr_period) =
            (config.ema_period, config.atr_granularity, config.atr_period);

        let Some(depth) = self.indicators.fetch_depth(&self.gateway, instrument).await? else {
            return Ok(Decision::Skip(vec![SkipReason::NoBook]));
        };

        let trend = match self
            .indicators
            .fetch_ema(&self.gateway, instrument, trend_granularity, ema_period)
            .await
        {
            Ok(value) => value,
            Err(IndicatorError::InsufficientData { .. }) => {
                return Ok(Decision::Skip(vec![SkipReason::NoTrendData]));
            }
            Err(e) => return Err(e.into()),
        };

        let volatility = self
            .indicators
            .fetch_atr(&self.gateway, instrument, atr_granularity, atr_period)
            .await?;

        debug!(
            instrument,
            price = %price,
            trend = %trend.round_dp(4),
            atr = %volatility.round_dp(6),
            depth = %depth.round_dp(2),
            "Entry inputs"
        );

        let snapshot = EntrySnapshot {
            instrument: instrument.to_string(),
            price,
            last_price,
            trend,
            volatility,
            depth,
            lot_step,
        };
        Ok(self.engine.evaluate_entry(&snapshot, ctx))
    }

    // ==================== Execution ====================

    /// Check an action against the wallet before it is submitted.
    ///
    /// Sells are clamped to the free balance; buys must cover notional plus
    /// fee. Returns `None` when the action must be skipped.
    fn guard(
        &self,
        action: &TradeAction,
        balances: &HashMap<String, AssetBalance>,
        lot_step: Decimal,
        cash: Decimal,
    ) -> Option<TradeAction> {
        if action.price <= Decimal::ZERO {
            warn!(instrument = %action.instrument, "Zero price, order skipped");
            return None;
        }

        match action.side {
            Side::Sell => {
                let free = balances
                    .get(base_asset(&action.instrument))
                    .map(|b| b.free)
                    .unwrap_or_default();
                let quantity = round_to_lot(action.quantity.min(free), lot_step);
                if quantity.is_zero() || quantity < lot_step {
                    warn!(
                        instrument = %action.instrument,
                        wanted = %action.quantity,
                        free = %free,
                        "Free balance below lot step, sell skipped"
                    );
                    return None;
                }

                Some(TradeAction {
                    quantity,
                    ..action.clone()
                })
            }
            Side::Buy => {
                let required = action.notional() * (Decimal::ONE + self.trading().fee_rate);
                if required > cash {
                    warn!(
                        instrument = %action.instrument,
                        required = %required.round_dp(2),
                        cash = %cash.round_dp(2),
                        "Insufficient cash, buy skipped"
                    );
                    return None;
                }
                Some(action.clone())
            }
        }
    }

    /// Submit a market order. Returns the order id once it has filled.
    async fn submit(&self, order: &TradeAction) -> Option<String> {
        info!(
            side = %order.side.as_str().to_uppercase(),
            instrument = %order.instrument,
            qty = %order.quantity,
            price = %order.price,
            tag = %order.tag,
            "Submitting order"
        );

        let request = OrderRequest {
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.quantity,
        };

        match self.gateway.submit_order(request).await {
            Ok(ack) if ack.status.is_filled() => {
                info!(order_id = %ack.id, instrument = %order.instrument, "Order filled");
                Some(ack.id)
            }
            Ok(ack) => {
                // An order still open may fill later; the wallet catches up on restart.
                warn!(
                    order_id = %ack.id,
                    instrument = %order.instrument,
                    status = ?ack.status,
                    "Order not filled, state unchanged"
                );
                self.record_action(order, Err(&format!("order {} not filled ({:?})", ack.id, ack.status)))
                    .await;
                None
            }
            Err(e) => {
                if e.is_execution_failure() {
                    warn!(instrument = %order.instrument, error = %e, "Order failed");
                } else {
                    error!(instrument = %order.instrument, error = %e, "Order submission error");
                }
                self.record_action(order, Err(&e.to_string())).await;
                None
            }
        }
    }

    async fn record_action(&self, action: &TradeAction, result: std::result::Result<&str, &str>) {
        if let Err(e) = self.db.record_action(action, result).await {
            warn!(instrument = %action.instrument, error = %e, "Failed to record action");
        }
    }

    // ==================== Market data ====================

    /// Current prices; unpriced or zero-priced instruments are left out.
    async fn fetch_prices(&self, instruments: &[String]) -> Result<HashMap<String, Decimal>> {
        let mut prices = HashMap::new();
        for instrument in instruments {
            match self.gateway.get_price(instrument).await? {
                Some(price) if price > Decimal::ZERO => {
                    prices.insert(instrument.clone(), price);
                }
                _ => debug!(instrument = %instrument, "No price"),
            }
        }
        Ok(prices)
    }

    /// Append recent exchange fills to the ledger. Returns how many were new.
    pub async fn sync_fills(&self) -> Result<u64> {
        let fills = self
            .gateway
            .recent_fills(LEDGER_SYNC_LIMIT)
            .await
            .context("Failed to fetch recent fills")?;
        let inserted = self.db.record_fills(&fills).await?;
        if inserted > 0 {
            info!(new = inserted, "Recorded fills");
        }
        Ok(inserted)
    }
}

/// Free balance of the quote currency the instruments trade against.
fn free_cash(balances: &HashMap<String, AssetBalance>, symbols: &[String]) -> Decimal {
    let quote = symbols.first().map(|s| quote_asset(s)).unwrap_or("USD");
    balances.get(quote).map(|b| b.free).unwrap_or_default()
}

/// Drop positions whose wallet holding fell below one lot.
fn drop_drifted(
    state: &mut CycleState,
    balances: &HashMap<String, AssetBalance>,
    metas: &HashMap<String, InstrumentMeta>,
) {
    let drifted: Vec<String> = state
        .positions
        .keys()
        .filter(|instrument| {
            let held = balances
                .get(base_asset(instrument))
                .map(|b| b.total)
                .unwrap_or_default();
            let lot_step = metas
                .get(*instrument)
                .map(|m| m.lot_step)
                .unwrap_or(DEFAULT_LOT_STEP);
            held < lot_step
        })
        .cloned()
        .collect();

    for instrument in drifted {
        warn!(instrument = %instrument, "Wallet no longer holds position, dropping");
        state.positions.remove(&instrument);
        state.peaks.remove(&instrument);
    }
}

/// Ledger summary.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub state: Option<BotState>,
    pub actions: ActionStats,
    pub fills: i64,
    pub heartbeat: Option<Heartbeat>,
}

impl BotStats {
    pub async fn load(db: &Database) -> Result<Self> {
        Ok(Self {
            state: db.get_bot_state().await.ok(),
            actions: db.action_stats().await?,
            fills: db.fill_count().await?,
            heartbeat: db.latest_heartbeat().await?,
        })
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        match &self.state {
            Some(state) => {
                writeln!(
                    f,
                    "Mode: {} ({})",
                    state.mode,
                    if state.is_running { "running" } else { "stopped" }
                )?;
                writeln!(f, "Started: {}", state.started_at)?;
                writeln!(
                    f,
                    "Cycles: {} (last {})",
                    state.cycles,
                    state.last_cycle_at.as_deref().unwrap_or("never")
                )?;
            }
            None => writeln!(f, "Mode: never started")?,
        }
        writeln!(f)?;
        if let Some(hb) = &self.heartbeat {
            writeln!(f, "Last heartbeat: {}", hb.timestamp)?;
            writeln!(f, "Cash: ${:.2}", Heartbeat::decimal(&hb.cash))?;
            writeln!(f, "Equity: ${:.2}", Heartbeat::decimal(&hb.equity))?;
            writeln!(f, "Unrealized P&L: ${:.2}", Heartbeat::decimal(&hb.unrealized_pnl))?;
            writeln!(f, "Open Positions: {}", hb.open_count)?;
            writeln!(f, "Ticket: ${:.2}", Heartbeat::decimal(&hb.ticket_size))?;
            writeln!(f)?;
        }
        writeln!(
            f,
            "Actions: {} executed, {} failed",
            self.actions.executed, self.actions.failed
        )?;
        writeln!(
            f,
            "  Entries: {}, Take profits: {}, Stop losses: {}",
            self.actions.entries, self.actions.take_profits, self.actions.stop_losses
        )?;
        write!(f, "Fills recorded: {}", self.fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderStatus, PaperConfig, PaperGateway};
    use crate::models::{ActionTag, BookLevel, Candle, Fill, Granularity};
    use crate::testing::StaticGateway;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    const SOL: &str = "SOL/USD";

    fn bars(close: Decimal, range: Decimal, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|_| Candle {
                open_time: Utc::now(),
                open: close,
                high: close + range / Decimal::TWO,
                low: close - range / Decimal::TWO,
                close,
                volume: dec!(1000),
            })
            .collect()
    }

    fn deep_book(bid: Decimal, ask: Decimal) -> crate::models::OrderBook {
        crate::models::OrderBook {
            bids: vec![BookLevel { price: bid, quantity: dec!(40) }],
            asks: vec![BookLevel { price: ask, quantity: dec!(40) }],
        }
    }

    fn fill(id: u64, side: Side, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            id,
            txid: format!("T{id}"),
            timestamp: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
            instrument: SOL.to_string(),
            side,
            quantity,
            price,
            cost: quantity * price,
            fee: Decimal::ZERO,
        }
    }

    /// SOL trading at `price` below a 150 trend, ATR 5, deep book.
    fn market(price: Decimal) -> StaticGateway {
        StaticGateway::new()
            .with_price(SOL, price)
            .with_candles(SOL, Granularity::OneHour, bars(dec!(150), dec!(2), 20))
            .with_candles(SOL, Granularity::OneMinute, bars(price, dec!(5), 15))
            .with_book(SOL, deep_book(price - dec!(0.1), price + dec!(0.1)))
            .with_balance("USD", dec!(10000), dec!(10000))
    }

    fn config() -> BotConfig {
        BotConfig {
            database_url: "sqlite::memory:".to_string(),
            mode: "paper".to_string(),
            trading: TradingConfig {
                symbols: vec![SOL.to_string()],
                ..TradingConfig::default()
            },
            ..BotConfig::default()
        }
    }

    async fn make_bot(gateway: StaticGateway) -> Bot<StaticGateway> {
        let bot = Bot::new(config(), gateway).await.unwrap();
        bot.db().init_bot_state("paper").await.unwrap();
        bot
    }

    fn state_with_last(price: Decimal) -> CycleState {
        let mut state = CycleState::default();
        state.last_prices.insert(SOL.to_string(), price);
        state
    }

    fn open_state(position: Position) -> CycleState {
        let mut reconciled = BTreeMap::new();
        reconciled.insert(SOL.to_string(), Some(position));
        CycleState::from_reconciled(reconciled)
    }

    #[tokio::test]
    async fn test_reconcile_all_adopts_fifo_residual() {
        let gateway = market(dec!(120))
            .with_price("ETH/USD", dec!(2000))
            .with_balance("SOL", dec!(3), dec!(3))
            .with_fills(
                SOL,
                vec![
                    fill(1, Side::Buy, dec!(10), dec!(100)),
                    fill(2, Side::Buy, dec!(5), dec!(110)),
                    fill(3, Side::Sell, dec!(12), dec!(120)),
                ],
            );
        let bot = make_bot(gateway).await;

        let instruments = vec![SOL.to_string(), "ETH/USD".to_string(), "TIA/USD".to_string()];
        let reconciled = bot.reconcile_all(&instruments).await.unwrap();

        let sol = reconciled[SOL].as_ref().expect("SOL adopted");
        assert_eq!(sol.quantity(), dec!(3));
        assert_eq!(sol.avg_cost(), dec!(110));
        assert!(sol.stop_price() < dec!(110));
        assert!(sol.target_price() > dec!(110));

        // Priced but not held
        assert_eq!(reconciled["ETH/USD"], None);
        // No price at all
        assert!(!reconciled.contains_key("TIA/USD"));
    }

    #[tokio::test]
    async fn test_cycle_enters_on_dip() {
        let mut bot = make_bot(market(dec!(100))).await;

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.proposed.len(), 1);
        assert_eq!(report.executed.len(), 1);
        let entry = &report.executed[0];
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.tag, ActionTag::Entry);
        assert_eq!(entry.stop_price, Some(dec!(92.5)));
        assert_eq!(entry.target_price, Some(dec!(115)));

        let position = &report.state.positions[SOL];
        assert_eq!(position.quantity(), entry.quantity);
        assert_eq!(position.avg_cost(), dec!(100));
        assert_eq!(report.state.peaks[SOL], dec!(100));
        assert_eq!(report.state.last_prices[SOL], dec!(100));

        let orders = bot.gateway().orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].quantity, entry.quantity);

        let stats = bot.db().action_stats().await.unwrap();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(bot.db().get_bot_state().await.unwrap().cycles, 1);
        assert!(bot.db().latest_heartbeat().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_first_cycle_has_no_dip() {
        let mut bot = make_bot(market(dec!(100))).await;

        let report = bot.run_cycle(CycleState::default()).await.unwrap();

        assert!(report.proposed.is_empty());
        assert_eq!(report.rejections[SOL], vec![SkipReason::NoDip]);
        assert!(bot.gateway().orders().is_empty());
    }

    #[tokio::test]
    async fn test_take_profit_sells_free_balance() {
        let gateway = market(dec!(131)).with_balance("SOL", dec!(1.5), dec!(2));
        let mut bot = make_bot(gateway).await;
        let position = Position::new(dec!(2), dec!(100), dec!(90), dec!(130)).unwrap();

        let report = bot.run_cycle(open_state(position)).await.unwrap();

        assert_eq!(report.executed.len(), 1);
        let exit = &report.executed[0];
        assert_eq!(exit.side, Side::Sell);
        assert_eq!(exit.tag, ActionTag::TakeProfit);
        assert_eq!(exit.quantity, dec!(1.5));
        assert_eq!(exit.price, dec!(131));
        assert_eq!(bot.gateway().orders()[0].quantity, dec!(1.5));

        // The unsold remainder stays tracked
        assert_eq!(report.state.positions[SOL].quantity(), dec!(0.5));
    }

    #[tokio::test]
    async fn test_stop_loss_closes_position() {
        let gateway = market(dec!(85)).with_balance("SOL", dec!(2), dec!(2));
        let mut bot = make_bot(gateway).await;
        let position = Position::new(dec!(2), dec!(100), dec!(90), dec!(130)).unwrap();

        let report = bot.run_cycle(open_state(position)).await.unwrap();

        assert_eq!(report.executed[0].tag, ActionTag::StopLoss);
        assert!(report.state.positions.is_empty());
        assert!(report.state.peaks.is_empty());
    }

    #[tokio::test]
    async fn test_holding_ratchets_stop() {
        let gateway = market(dec!(120)).with_balance("SOL", dec!(2), dec!(2));
        let mut bot = make_bot(gateway).await;
        let position = Position::new(dec!(2), dec!(100), dec!(90), dec!(130)).unwrap();

        let report = bot.run_cycle(open_state(position)).await.unwrap();

        assert!(report.executed.is_empty());
        assert_eq!(report.rejections[SOL], vec![SkipReason::NoExitSignal]);
        assert_eq!(report.state.peaks[SOL], dec!(120));
        assert_eq!(report.state.positions[SOL].stop_price(), dec!(118.8));
    }

    #[tokio::test]
    async fn test_failed_order_leaves_state_unchanged() {
        let gateway = market(dec!(100));
        gateway.reject_orders(true);
        let mut bot = make_bot(gateway).await;

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.proposed.len(), 1);
        assert!(report.executed.is_empty());
        assert!(report.state.positions.is_empty());
        assert!(report.state.peaks.is_empty());

        let stats = bot.db().action_stats().await.unwrap();
        assert_eq!(stats.executed, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_unfilled_order_leaves_state_unchanged() {
        let gateway = market(dec!(100));
        gateway.set_order_status(OrderStatus::Open);
        let mut bot = make_bot(gateway).await;

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(bot.gateway().orders().len(), 1);
        assert!(report.executed.is_empty());
        assert!(report.state.positions.is_empty());
        assert!(report.state.peaks.is_empty());

        // A resting exit keeps the position tracked
        let gateway = market(dec!(131)).with_balance("SOL", dec!(2), dec!(2));
        gateway.set_order_status(OrderStatus::Rejected);
        let mut bot = make_bot(gateway).await;
        let position = Position::new(dec!(2), dec!(100), dec!(90), dec!(130)).unwrap();

        let report = bot.run_cycle(open_state(position)).await.unwrap();

        assert!(report.executed.is_empty());
        assert_eq!(report.state.positions[SOL].quantity(), dec!(2));
        let stats = bot.db().action_stats().await.unwrap();
        assert_eq!(stats.executed, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_cash_clamped_entry_fills_with_fee() {
        // Tight ATR: risk sizing asks for more than the wallet can pay
        let inner = market(dec!(100)).with_candles(SOL, Granularity::OneMinute, bars(dec!(100), dec!(0.3), 15));
        let paper = PaperGateway::new(
            inner,
            PaperConfig {
                initial_cash: dec!(10000),
                fee_rate: dec!(0.0026),
            },
        );
        let mut bot = Bot::new(config(), paper).await.unwrap();
        bot.db().init_bot_state("paper").await.unwrap();

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.executed.len(), 1);
        let entry = &report.executed[0];
        assert!(entry.notional() < dec!(10000));
        assert!(entry.notional() > dec!(9900));
        assert_eq!(report.state.positions[SOL].quantity(), entry.quantity);

        let cash = bot.gateway().get_balance().await.unwrap()["USD"].free;
        assert!(cash >= Decimal::ZERO && cash < dec!(1));
        assert_eq!(bot.db().action_stats().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_unlisted_symbol_does_not_stop_cycle() {
        let gateway = market(dec!(100))
            .with_price("GHIBLI/USD", dec!(5))
            .with_unlisted("GHIBLI/USD")
            .with_unlisted("ZZZ/USD");
        let mut bot = make_bot(gateway).await;
        bot.engine = DecisionEngine::new(TradingConfig {
            symbols: vec![SOL.to_string(), "GHIBLI/USD".to_string(), "ZZZ/USD".to_string()],
            ..TradingConfig::default()
        });

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.rejections["GHIBLI/USD"], vec![SkipReason::NoPrice]);
        assert_eq!(report.rejections["ZZZ/USD"], vec![SkipReason::NoPrice]);
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].instrument, SOL);

        let instruments = vec![SOL.to_string(), "ZZZ/USD".to_string()];
        let reconciled = bot.reconcile_all(&instruments).await.unwrap();
        assert_eq!(reconciled[SOL], None);
        assert!(!reconciled.contains_key("ZZZ/USD"));
    }

    #[tokio::test]
    async fn test_drifted_position_dropped() {
        // Wallet emptied outside the bot
        let mut bot = make_bot(market(dec!(120))).await;
        let position = Position::new(dec!(2), dec!(100), dec!(90), dec!(130)).unwrap();

        let report = bot.run_cycle(open_state(position)).await.unwrap();

        assert!(report.state.positions.is_empty());
        assert!(report.state.peaks.is_empty());
        assert!(report.executed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_price_and_inactive_skipped() {
        let gateway = market(dec!(100)).with_meta(SOL, InstrumentMeta::new(dec!(0.01), false));
        let mut bot = make_bot(gateway).await;
        bot.engine = DecisionEngine::new(TradingConfig {
            symbols: vec![SOL.to_string(), "TIA/USD".to_string()],
            ..TradingConfig::default()
        });

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.rejections[SOL], vec![SkipReason::Inactive]);
        assert_eq!(report.rejections["TIA/USD"], vec![SkipReason::NoPrice]);
        assert!(report.proposed.is_empty());
    }

    #[tokio::test]
    async fn test_max_open_blocks_entries() {
        let mut bot = make_bot(market(dec!(100))).await;
        bot.engine = DecisionEngine::new(TradingConfig {
            symbols: vec![SOL.to_string()],
            max_open: 0,
            ..TradingConfig::default()
        });

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.rejections[SOL], vec![SkipReason::MaxOpenReached]);
    }

    #[tokio::test]
    async fn test_missing_trend_data_skipped() {
        let gateway = StaticGateway::new()
            .with_price(SOL, dec!(100))
            .with_book(SOL, deep_book(dec!(99.9), dec!(100.1)))
            .with_balance("USD", dec!(10000), dec!(10000));
        let mut bot = make_bot(gateway).await;

        let report = bot.run_cycle(state_with_last(dec!(110))).await.unwrap();

        assert_eq!(report.rejections[SOL], vec![SkipReason::NoTrendData]);
    }

    #[tokio::test]
    async fn test_cycle_syncs_fills_once() {
        let gateway = market(dec!(100)).with_fills(
            SOL,
            vec![fill(1, Side::Buy, dec!(1), dec!(100)), fill(2, Side::Buy, dec!(1), dec!(101))],
        );
        let mut bot = make_bot(gateway).await;

        let report = bot.run_cycle(CycleState::default()).await.unwrap();
        bot.run_cycle(report.state).await.unwrap();

        assert_eq!(bot.db().fill_count().await.unwrap(), 2);
        assert_eq!(bot.sync_fills().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_at_cycle_boundary() {
        let gateway = market(dec!(120))
            .with_balance("SOL", dec!(3), dec!(3))
            .with_fills(SOL, vec![fill(1, Side::Buy, dec!(3), dec!(110))]);
        let mut bot = make_bot(gateway).await;

        bot.shutdown.store(true, Ordering::SeqCst);
        bot.run().await.unwrap();

        let state = bot.db().get_bot_state().await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.cycles, 0);
        assert!(bot.gateway().orders().is_empty());
    }

    #[test]
    fn test_bot_stats_display() {
        let stats = tokio_test::block_on(async {
            let db = Database::new("sqlite::memory:").await.unwrap();
            BotStats::load(&db).await.unwrap()
        });

        let text = stats.to_string();
        assert!(text.starts_with("=== Bot Statistics ==="));
        assert!(text.contains("Mode: never started"));
        assert!(text.contains("Actions: 0 executed, 0 failed"));
        assert!(text.ends_with("Fills recorded: 0"));
    }
}
