//! Breakout-with-trend signal evaluation. Stateless: a pure function of the candle history and the
//! configured strategy parameters.

use serde::Serialize;

use crate::{
	config::AppConfig,
	exchange_apis::Candle,
	indicators::{atr, ema},
};

/// EMA(50) needs this much warmup before the trend filter means anything.
const TREND_WARMUP: usize = 55;

/// Produced and consumed within one decision cycle; never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, derive_new::new)]
pub struct Signal {
	pub symbol: String,
	pub entry_price: f64,
	pub stop_price: f64,
	pub atr_value: f64,
	pub breakout_level: f64,
	pub reason: &'static str,
}

/// Evaluates the latest closed candle against the breakout rules.
///
/// Returns `None` on insufficient history (not an error), a failed trend filter, or a close at or
/// below the breakout level. Only candles up to and including the most recently closed one are
/// considered; the evaluator never looks ahead.
pub fn compute_signal(symbol: &str, candles: &[Candle], settings: &AppConfig) -> Option<Signal> {
	let min_len = (settings.breakout_n + 1).max(settings.atr_period + 2).max(TREND_WARMUP);
	if candles.len() < min_len {
		return None;
	}

	let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
	let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
	let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

	let ema20 = *ema(&closes, 20).last()?;
	let ema50 = *ema(&closes, 50).last()?;
	let close = *closes.last()?;

	if !(close > ema50 && ema20 > ema50) {
		return None;
	}

	let atr_now = *atr(&highs, &lows, &closes, settings.atr_period).last()?;

	// Highest high over the lookback window immediately preceding the current candle.
	let window = &highs[highs.len() - (settings.breakout_n + 1)..highs.len() - 1];
	let recent_high = window.iter().copied().fold(f64::MIN, f64::max);
	let breakout_level = recent_high + settings.breakout_buffer_atr * atr_now;

	// Strict: equality at the level does not fire.
	if close <= breakout_level {
		return None;
	}

	let stop_price = close - settings.atr_mult * atr_now;
	Some(Signal::new(symbol.to_owned(), close, stop_price, atr_now, breakout_level, "breakout_with_trend"))
}
