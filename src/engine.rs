//! The per-candle decision cycle: gap handling, history upkeep, entry gating and the position
//! management ladder (partial take-profit, trailing stop, time stop).
//!
//! Single logical consumer: one closed candle at a time, across all symbols. The ledger and all
//! histories are owned here and never touched by another task.

use std::{collections::HashMap, sync::Arc};

use color_eyre::eyre::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
	config::{AppConfig, TrailMode},
	exchange_apis::{
		binance::{
			info::SymbolFilters,
			orders::{OrderManager, OrderStatus},
			BinanceClient,
		},
		Candle, Side,
	},
	indicators::atr,
	portfolio::{PortfolioState, Position},
	risk::{position_size, trade_risk, RISK_EPSILON},
	strategy::{compute_signal, Signal},
};

/// Fixed-capacity sliding window of closed candles, most-recent-last, deduplicated by close time.
#[derive(Clone, Debug, Default)]
pub struct CandleHistory {
	max_len: usize,
	candles: Vec<Candle>,
}
impl CandleHistory {
	pub fn new(max_len: usize) -> Self {
		Self { max_len, candles: Vec::new() }
	}

	/// Replaces the whole window, e.g. after a gap-triggered refresh.
	pub fn replace(&mut self, candles: Vec<Candle>) {
		self.candles = candles;
		self.trim();
	}

	/// Appends a closed candle. A candle sharing the close time of the current last one replaces
	/// it; anything older than the last is dropped to keep the window monotonic.
	pub fn push(&mut self, candle: Candle) {
		match self.candles.last() {
			Some(last) if candle.close_time == last.close_time => {
				let idx = self.candles.len() - 1;
				self.candles[idx] = candle;
			}
			Some(last) if candle.close_time < last.close_time => {}
			_ => self.candles.push(candle),
		}
		self.trim();
	}

	fn trim(&mut self) {
		if self.candles.len() > self.max_len {
			let excess = self.candles.len() - self.max_len;
			self.candles.drain(..excess);
		}
	}

	pub fn len(&self) -> usize {
		self.candles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.candles.is_empty()
	}

	pub fn as_slice(&self) -> &[Candle] {
		&self.candles
	}

	pub fn highs(&self) -> Vec<f64> {
		self.candles.iter().map(|c| c.high).collect()
	}

	pub fn lows(&self) -> Vec<f64> {
		self.candles.iter().map(|c| c.low).collect()
	}

	pub fn closes(&self) -> Vec<f64> {
		self.candles.iter().map(|c| c.close).collect()
	}
}

/// Expected, non-error reasons to pass on an entry. Logged, then the loop moves on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
	MaxPositions,
	MajorCap,
	QtyInvalidAfterFilters,
	GlobalRiskCap,
	NoFill,
}
impl SkipReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::MaxPositions => "max_positions",
			Self::MajorCap => "major_cap",
			Self::QtyInvalidAfterFilters => "qty_invalid_after_filters",
			Self::GlobalRiskCap => "global_risk_cap",
			Self::NoFill => "no_fill",
		}
	}
}

/// Stale-history predicate: more than two nominal intervals elapsed between consecutive closes.
pub fn is_gap(prev_close_time: i64, new_close_time: i64, interval_ms: i64) -> bool {
	new_close_time - prev_close_time > 2 * interval_ms
}

fn trail_candidate(mode: TrailMode, lows: &[f64], close: f64, atr_now: f64, lookback: usize, atr_mult: f64, stop_price: f64) -> f64 {
	match mode {
		TrailMode::LowestLow =>
			if lows.len() >= lookback {
				lows[lows.len() - lookback..].iter().copied().fold(f64::MAX, f64::min)
			} else {
				stop_price
			},
		TrailMode::Atr => close - atr_mult * atr_now,
	}
}

pub struct Engine {
	settings: Arc<AppConfig>,
	client: Arc<BinanceClient>,
	order_manager: OrderManager,
	portfolio: PortfolioState,
	rules: HashMap<String, SymbolFilters>,
	histories: HashMap<String, CandleHistory>,
	last_close_time: HashMap<String, i64>,
	candle_index: HashMap<String, u64>,
	equity: f64,
	interval_ms: i64,
}

impl Engine {
	pub fn new(
		settings: Arc<AppConfig>,
		client: Arc<BinanceClient>,
		order_manager: OrderManager,
		equity: f64,
		rules: HashMap<String, SymbolFilters>,
		histories: HashMap<String, CandleHistory>,
		last_close_time: HashMap<String, i64>,
	) -> Self {
		let interval_ms = settings.timeframe.interval_ms();
		Self {
			settings,
			client,
			order_manager,
			portfolio: PortfolioState::default(),
			rules,
			histories,
			last_close_time,
			candle_index: HashMap::new(),
			equity,
			interval_ms,
		}
	}

	/// Consumes closed candles until the stop signal flips or the producer goes away. The stop is
	/// only observed between candles, never mid-cycle, so in-flight submissions always complete.
	pub async fn run(mut self, mut candles_rx: mpsc::Receiver<Candle>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
		loop {
			if *stop_rx.borrow() {
				break;
			}
			tokio::select! {
				maybe_candle = candles_rx.recv() => match maybe_candle {
					Some(candle) if candle.is_closed => self.on_candle(candle).await,
					Some(_) => {}
					None => break,
				},
				_ = stop_rx.changed() => {}
			}
		}
		info!(open_positions = self.portfolio.open_count(), "engine_stopped");
		Ok(())
	}

	async fn on_candle(&mut self, candle: Candle) {
		let symbol = candle.symbol.clone();
		if !self.rules.contains_key(&symbol) {
			debug!(symbol, "candle_for_unconfigured_symbol");
			return;
		}

		if let Some(prev_close_time) = self.last_close_time.get(&symbol) {
			if is_gap(*prev_close_time, candle.close_time, self.interval_ms) {
				warn!(symbol, gap_ms = candle.close_time - prev_close_time, "candle_gap_detected");
				match self.client.klines(&symbol, self.settings.timeframe, self.settings.history_limit).await {
					Ok(fresh) => {
						if let Some(history) = self.histories.get_mut(&symbol) {
							history.replace(fresh);
						}
					}
					// Transient mid-loop failure: keep running on the (stale) window we have.
					Err(e) => warn!(symbol, error = %e, "history_refresh_failed"),
				}
			}
		}
		self.last_close_time.insert(symbol.clone(), candle.close_time);

		let close = candle.close;
		self.histories.entry(symbol.clone()).or_insert_with(|| CandleHistory::new(300)).push(candle);
		*self.candle_index.entry(symbol.clone()).or_insert(0) += 1;

		if !self.portfolio.contains(&symbol) {
			self.try_enter(&symbol).await;
		}
		if self.portfolio.contains(&symbol) {
			self.manage(&symbol, close).await;
		}
	}

	/// Gates, in order: global position cap, majors sub-cap, sized quantity, global risk cap.
	fn entry_gates(&self, signal: &Signal, rules: &SymbolFilters) -> Result<f64, SkipReason> {
		if self.portfolio.open_count() >= self.settings.max_positions {
			return Err(SkipReason::MaxPositions);
		}
		if self.settings.majors.contains(&signal.symbol) && self.portfolio.major_count(&self.settings.majors) >= self.settings.max_major_positions {
			return Err(SkipReason::MajorCap);
		}
		let qty = position_size(self.equity, self.settings.risk_pct, signal.entry_price, signal.stop_price, rules);
		if qty <= 0.0 {
			return Err(SkipReason::QtyInvalidAfterFilters);
		}
		let projected_risk = self.portfolio.open_risk() + trade_risk(signal.entry_price, signal.stop_price, qty);
		if projected_risk > self.equity * self.settings.global_open_risk_cap {
			return Err(SkipReason::GlobalRiskCap);
		}
		Ok(qty)
	}

	async fn try_enter(&mut self, symbol: &str) {
		let rules = match self.rules.get(symbol) {
			Some(r) => *r,
			None => return,
		};
		let Some(signal) = self.histories.get(symbol).and_then(|h| compute_signal(symbol, h.as_slice(), &self.settings)) else {
			return;
		};
		debug!(symbol, entry = signal.entry_price, stop = signal.stop_price, atr = signal.atr_value, level = signal.breakout_level, "signal_fired");

		let qty = match self.entry_gates(&signal, &rules) {
			Ok(qty) => qty,
			Err(reason) => {
				info!(symbol, reason = reason.as_str(), "entry_skipped");
				return;
			}
		};

		let ack = match self.order_manager.place_entry(symbol, qty, signal.entry_price, &rules, signal.reason).await {
			Ok(ack) => ack,
			Err(e) => {
				warn!(symbol, error = %e, "order_submission_failed");
				return;
			}
		};

		let mut executed_qty = ack.executed_qty;
		let mut entry_price = ack.avg_price.filter(|p| *p > 0.0).unwrap_or(signal.entry_price);

		if !self.settings.dry_run && ack.status.is_resting() {
			match self.order_manager.wait_fill(symbol, &ack.order_id, self.settings.fill_timeout()).await {
				Ok(fill) => {
					executed_qty = fill.executed_qty;
					if fill.avg_price > 0.0 {
						entry_price = fill.avg_price;
					}
					if fill.status.is_resting() {
						if let Err(e) = self.order_manager.cancel(symbol, &ack.order_id).await {
							warn!(symbol, error = %e, "order_cancel_failed");
						}
					}
				}
				Err(e) => {
					// Order state unknown: cancel best-effort and skip the entry.
					warn!(symbol, error = %e, "fill_poll_failed");
					if let Err(e) = self.order_manager.cancel(symbol, &ack.order_id).await {
						warn!(symbol, error = %e, "order_cancel_failed");
					}
					return;
				}
			}
		}

		if executed_qty <= 0.0 {
			info!(symbol, reason = SkipReason::NoFill.as_str(), "entry_skipped");
			return;
		}

		let opened_index = self.candle_index.get(symbol).copied().unwrap_or(0);
		let position = Position::new(
			symbol.to_owned(),
			entry_price,
			signal.stop_price,
			executed_qty,
			(entry_price - signal.stop_price).max(RISK_EPSILON),
			opened_index,
		);
		match self.portfolio.insert(position) {
			Ok(()) => {
				info!(symbol, side = %Side::Buy, qty = executed_qty, price = entry_price, order_id = %ack.order_id, reason = signal.reason, "position_opened");
			}
			Err(e) => warn!(symbol, error = %e, "ledger_insert_failed"),
		}
	}

	/// Exit rules are evaluated in a fixed sequence each candle: partial take-profit, trailing-stop
	/// recompute, time stop, trailing stop. At most one full exit fires; the time stop wins when
	/// both it and the trailing stop apply on the same candle.
	async fn manage(&mut self, symbol: &str, close: f64) {
		let rules = match self.rules.get(symbol) {
			Some(r) => *r,
			None => return,
		};
		let (lows, atr_now) = match self.histories.get(symbol) {
			Some(history) => {
				let atr_series = atr(&history.highs(), &history.lows(), &history.closes(), self.settings.atr_period);
				(history.lows(), atr_series.last().copied().unwrap_or(0.0))
			}
			None => return,
		};

		let snapshot = match self.portfolio.get(symbol) {
			Some(p) => p.clone(),
			None => return,
		};
		let r_gain = (close - snapshot.entry_price) / snapshot.initial_risk_per_unit.max(RISK_EPSILON);

		if !snapshot.partial_taken && r_gain >= self.settings.take_profit_r {
			let partial_qty = snapshot.qty * self.settings.partial_pct;
			match self.order_manager.place_exit_market(symbol, partial_qty, &rules, "partial_take_profit").await {
				Ok(ack) =>
					if let Some(pos) = self.portfolio.get_mut(symbol) {
						pos.qty -= ack.executed_qty;
						pos.partial_taken = true;
					},
				Err(e) => warn!(symbol, error = %e, "order_submission_failed"),
			}
		}

		let candidate = trail_candidate(
			self.settings.trail_mode,
			&lows,
			close,
			atr_now,
			self.settings.trail_lookback,
			self.settings.trail_atr_mult,
			snapshot.stop_price,
		);
		let trailing_stop = match self.portfolio.get_mut(symbol) {
			Some(pos) => {
				pos.highest_price = pos.highest_price.max(close);
				pos.ratchet_trailing_stop(candidate)
			}
			None => return,
		};

		let Some(pos_now) = self.portfolio.get(symbol).cloned() else { return };
		let candles_open = self.candle_index.get(symbol).copied().unwrap_or(0).saturating_sub(pos_now.opened_candle_index);

		if candles_open >= self.settings.time_stop_candles && r_gain < 1.0 {
			self.close_position(symbol, pos_now.qty, &rules, "time_stop").await;
			return;
		}

		if close <= trailing_stop {
			self.close_position(symbol, pos_now.qty, &rules, "trailing_stop").await;
		}
	}

	async fn close_position(&mut self, symbol: &str, qty: f64, rules: &SymbolFilters, reason: &'static str) {
		match self.order_manager.place_exit_market(symbol, qty, rules, reason).await {
			Ok(ack) => {
				self.portfolio.remove(symbol);
				if ack.status == OrderStatus::Skipped {
					debug!(symbol, reason, "position_dropped_as_dust");
				} else {
					info!(symbol, side = %Side::Sell, qty = ack.executed_qty, order_id = %ack.order_id, reason, "position_closed");
				}
			}
			// Position stays on the books; the same exit rule re-fires next candle.
			Err(e) => warn!(symbol, error = %e, "order_submission_failed"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rules() -> SymbolFilters {
		SymbolFilters {
			min_notional: 10.0,
			step_size: 0.001,
			min_qty: 0.001,
			tick_size: 0.01,
			..SymbolFilters::default()
		}
	}

	fn candle(symbol: &str, close: f64, close_time: i64) -> Candle {
		Candle {
			symbol: symbol.to_owned(),
			open: close - 1.0,
			high: close + 1.0,
			low: close - 2.0,
			close,
			volume: 1.0,
			open_time: close_time - 3_600_000 + 1,
			close_time,
			is_closed: true,
		}
	}

	fn test_engine(settings: AppConfig, equity: f64) -> Engine {
		let settings = Arc::new(settings);
		let client = Arc::new(BinanceClient::new(settings.clone()).unwrap());
		let order_manager = OrderManager::new(client.clone(), settings.clone());
		let mut rules_map = HashMap::new();
		rules_map.insert("BTCUSDT".to_owned(), rules());
		Engine::new(settings, client, order_manager, equity, rules_map, HashMap::new(), HashMap::new())
	}

	/// Seeds a trending history whose next candle at `breakout_close` fires the signal.
	fn seed_trending(engine: &mut Engine, n: usize) -> i64 {
		let interval = 3_600_000;
		let mut history = CandleHistory::new(300);
		for i in 0..n {
			history.push(candle("BTCUSDT", 100.0 + i as f64 * 0.5, (i as i64 + 1) * interval - 1));
		}
		engine.histories.insert("BTCUSDT".to_owned(), history);
		engine.last_close_time.insert("BTCUSDT".to_owned(), (n as i64) * interval - 1);
		(n as i64 + 1) * interval - 1
	}

	#[test]
	fn gap_predicate_boundary() {
		let interval = 3_600_000;
		assert!(!is_gap(0, 2 * interval, interval));
		assert!(is_gap(0, 2 * interval + 1, interval));
	}

	#[test]
	fn history_dedups_by_close_time_and_trims() {
		let mut history = CandleHistory::new(3);
		history.push(candle("BTCUSDT", 100.0, 1000));
		history.push(candle("BTCUSDT", 101.0, 2000));
		history.push(candle("BTCUSDT", 102.0, 2000)); // same close time: replace, not append
		assert_eq!(history.len(), 2);
		assert_eq!(history.as_slice().last().unwrap().close, 102.0);

		history.push(candle("BTCUSDT", 99.0, 1500)); // older than last: dropped
		assert_eq!(history.len(), 2);

		history.push(candle("BTCUSDT", 103.0, 3000));
		history.push(candle("BTCUSDT", 104.0, 4000));
		assert_eq!(history.len(), 3); // capacity trims the oldest
		assert_eq!(history.as_slice()[0].close_time, 2000);
	}

	#[test]
	fn trail_candidate_modes() {
		let lows = vec![10.0, 8.0, 9.0, 11.0];
		assert_eq!(trail_candidate(TrailMode::LowestLow, &lows, 12.0, 1.0, 3, 3.0, 5.0), 8.0);
		// Not enough lows for the lookback: fall back to the original stop.
		assert_eq!(trail_candidate(TrailMode::LowestLow, &lows, 12.0, 1.0, 10, 3.0, 5.0), 5.0);
		assert_eq!(trail_candidate(TrailMode::Atr, &lows, 12.0, 1.0, 3, 3.0, 5.0), 9.0);
	}

	#[tokio::test]
	async fn dry_run_breakout_opens_position_and_sets_trailing_stop() {
		let mut engine = test_engine(AppConfig::default(), 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);

		let breakout = {
			let highs = engine.histories["BTCUSDT"].highs();
			let recent_high = highs[highs.len() - 20..].iter().copied().fold(f64::MIN, f64::max);
			candle("BTCUSDT", recent_high + 10.0, next_close_time)
		};
		engine.on_candle(breakout).await;

		let pos = engine.portfolio.get("BTCUSDT").expect("position should have opened");
		assert!(pos.qty > 0.0);
		assert!(pos.stop_price < pos.entry_price);
		assert!(!pos.partial_taken);
		// Management ran on the opening candle, so the trailing stop is already computed.
		assert!(pos.trailing_stop.is_some());
	}

	#[tokio::test]
	async fn entry_gate_rejects_when_max_positions_reached() {
		let settings = AppConfig { max_positions: 0, ..AppConfig::default() };
		let mut engine = test_engine(settings, 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);

		let breakout = {
			let highs = engine.histories["BTCUSDT"].highs();
			let recent_high = highs[highs.len() - 20..].iter().copied().fold(f64::MIN, f64::max);
			candle("BTCUSDT", recent_high + 10.0, next_close_time)
		};
		engine.on_candle(breakout).await;
		assert!(!engine.portfolio.contains("BTCUSDT"));
	}

	#[tokio::test]
	async fn global_risk_cap_blocks_marginal_entry() {
		let settings = AppConfig { global_open_risk_cap: 0.0, ..AppConfig::default() };
		let mut engine = test_engine(settings, 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);

		let breakout = {
			let highs = engine.histories["BTCUSDT"].highs();
			let recent_high = highs[highs.len() - 20..].iter().copied().fold(f64::MIN, f64::max);
			candle("BTCUSDT", recent_high + 10.0, next_close_time)
		};
		engine.on_candle(breakout).await;
		assert!(!engine.portfolio.contains("BTCUSDT"));
	}

	#[tokio::test]
	async fn partial_take_profit_reduces_quantity_once() {
		let mut engine = test_engine(AppConfig::default(), 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);

		engine
			.portfolio
			.insert(Position::new("BTCUSDT".to_owned(), 100.0, 95.0, 1.0, 5.0, engine.candle_index.get("BTCUSDT").copied().unwrap_or(0)))
			.unwrap();

		// r_gain = (120 - 100) / 5 = 4 >= take_profit_r of 3
		engine.on_candle(candle("BTCUSDT", 120.0, next_close_time)).await;

		let pos = engine.portfolio.get("BTCUSDT").expect("position should survive a partial");
		assert!(pos.partial_taken);
		assert!((pos.qty - 0.6).abs() < 1e-9);
	}

	#[tokio::test]
	async fn time_stop_closes_unprofitable_position() {
		let settings = AppConfig { time_stop_candles: 2, ..AppConfig::default() };
		let mut engine = test_engine(settings, 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);
		let interval = 3_600_000;

		engine.portfolio.insert(Position::new("BTCUSDT".to_owned(), 141.0, 80.0, 1.0, 61.0, 0)).unwrap();

		// Two candles later, still under 1R: the time stop forces the exit even though the close
		// sits above the trailing stop.
		engine.on_candle(candle("BTCUSDT", 141.2, next_close_time)).await;
		assert!(engine.portfolio.contains("BTCUSDT"));
		engine.on_candle(candle("BTCUSDT", 141.3, next_close_time + interval)).await;
		assert!(!engine.portfolio.contains("BTCUSDT"));
	}

	#[tokio::test]
	async fn trailing_stop_exit_fires_when_close_breaches_it() {
		let mut engine = test_engine(AppConfig::default(), 10_000.0);
		let next_close_time = seed_trending(&mut engine, 80);

		// Stop at 139: above the lowest low of the window, so the ratchet keeps it as the floor.
		engine.portfolio.insert(Position::new("BTCUSDT".to_owned(), 140.0, 139.0, 1.0, 1.0, 0)).unwrap();

		engine.on_candle(candle("BTCUSDT", 138.0, next_close_time)).await;
		assert!(!engine.portfolio.contains("BTCUSDT"));
	}
}
