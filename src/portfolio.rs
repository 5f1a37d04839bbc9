//! The position ledger: exclusive owner of all open [Position] records.
//!
//! Only the orchestration loop ever touches it, so there is no internal locking; linearizability
//! falls out of the single-writer task design.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::risk::trade_risk;

#[derive(Clone, Debug, PartialEq, Serialize, derive_new::new)]
pub struct Position {
	pub symbol: String,
	pub entry_price: f64,
	/// Initial protective stop, frozen at open.
	pub stop_price: f64,
	pub qty: f64,
	/// entry - stop at open; the unit for R-multiple gain calculations for the life of the trade.
	pub initial_risk_per_unit: f64,
	pub opened_candle_index: u64,
	#[new(default)]
	pub partial_taken: bool,
	#[new(value = "entry_price")]
	pub highest_price: f64,
	/// None until first computed; ratchets monotonically upward afterwards.
	#[new(default)]
	pub trailing_stop: Option<f64>,
}
impl Position {
	/// Applies a freshly computed trailing candidate. The stored stop never loosens: it is floored
	/// at the original stop and at its own previous value.
	pub fn ratchet_trailing_stop(&mut self, candidate: f64) -> f64 {
		let floor = self.stop_price.max(candidate);
		let next = match self.trailing_stop {
			Some(current) => current.max(floor),
			None => floor,
		};
		self.trailing_stop = Some(next);
		next
	}
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LedgerError {
	#[error("position for {0} is already open")]
	AlreadyOpen(String),
}

/// At most one open position per symbol.
#[derive(Clone, Debug, Default)]
pub struct PortfolioState {
	positions: HashMap<String, Position>,
}
impl PortfolioState {
	pub fn insert(&mut self, position: Position) -> Result<(), LedgerError> {
		if self.positions.contains_key(&position.symbol) {
			return Err(LedgerError::AlreadyOpen(position.symbol.clone()));
		}
		self.positions.insert(position.symbol.clone(), position);
		Ok(())
	}

	pub fn remove(&mut self, symbol: &str) -> Option<Position> {
		self.positions.remove(symbol)
	}

	pub fn get(&self, symbol: &str) -> Option<&Position> {
		self.positions.get(symbol)
	}

	pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
		self.positions.get_mut(symbol)
	}

	pub fn contains(&self, symbol: &str) -> bool {
		self.positions.contains_key(symbol)
	}

	pub fn open_count(&self) -> usize {
		self.positions.len()
	}

	/// Aggregate open risk: sum of (entry - stop) * qty over all open positions.
	pub fn open_risk(&self) -> f64 {
		self.positions.values().map(|p| trade_risk(p.entry_price, p.stop_price, p.qty)).sum()
	}

	pub fn major_count(&self, majors: &HashSet<String>) -> usize {
		self.positions.keys().filter(|s| majors.contains(*s)).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn position(symbol: &str, entry: f64, stop: f64, qty: f64) -> Position {
		Position::new(symbol.to_owned(), entry, stop, qty, entry - stop, 0)
	}

	#[test]
	fn one_position_per_symbol() {
		let mut portfolio = PortfolioState::default();
		portfolio.insert(position("BTCUSDT", 100.0, 95.0, 1.0)).unwrap();
		let err = portfolio.insert(position("BTCUSDT", 101.0, 96.0, 1.0)).unwrap_err();
		assert_eq!(err, LedgerError::AlreadyOpen("BTCUSDT".to_owned()));
		assert_eq!(portfolio.open_count(), 1);
	}

	#[test]
	fn open_risk_is_exact_sum() {
		let mut portfolio = PortfolioState::default();
		portfolio.insert(position("BTCUSDT", 100.0, 95.0, 2.0)).unwrap();
		portfolio.insert(position("ETHUSDT", 50.0, 48.0, 10.0)).unwrap();
		assert_eq!(portfolio.open_risk(), 5.0 * 2.0 + 2.0 * 10.0);

		portfolio.remove("BTCUSDT").unwrap();
		assert_eq!(portfolio.open_risk(), 20.0);
		assert!(!portfolio.contains("BTCUSDT"));
	}

	#[test]
	fn major_count_only_counts_configured_majors() {
		let mut portfolio = PortfolioState::default();
		portfolio.insert(position("BTCUSDT", 100.0, 95.0, 1.0)).unwrap();
		portfolio.insert(position("DOGEUSDT", 0.1, 0.09, 100.0)).unwrap();
		let majors: HashSet<String> = ["BTCUSDT".to_owned(), "ETHUSDT".to_owned()].into();
		assert_eq!(portfolio.major_count(&majors), 1);
	}

	#[test]
	fn trailing_stop_never_loosens() {
		let mut pos = position("BTCUSDT", 100.0, 95.0, 1.0);
		assert_eq!(pos.trailing_stop, None);

		assert_eq!(pos.ratchet_trailing_stop(93.0), 95.0); // floored at the original stop
		assert_eq!(pos.ratchet_trailing_stop(97.0), 97.0);
		assert_eq!(pos.ratchet_trailing_stop(96.0), 97.0); // lower candidate is ignored
		assert_eq!(pos.ratchet_trailing_stop(102.0), 102.0);
		assert_eq!(pos.trailing_stop, Some(102.0));
	}

	#[test]
	fn new_position_starts_at_entry_high_water() {
		let pos = position("BTCUSDT", 100.0, 95.0, 1.0);
		assert_eq!(pos.highest_price, 100.0);
		assert!(!pos.partial_taken);
	}
}
