//! Risk-budget position sizing under exchange quantization rules.

use crate::exchange_apis::binance::info::{ensure_min_notional, round_step_down, round_step_up, SymbolFilters};

/// Guards divisions by per-unit risk; entry <= stop should not occur given the evaluator's
/// invariant, but must not crash sizing.
pub const RISK_EPSILON: f64 = 1e-12;

/// Converts an entry/stop pair and account equity into an order quantity obeying the exchange rules
/// and the per-trade risk budget.
///
/// Returns `0.0` when the risk budget and the exchange minimums are irreconcilable; that is a
/// valid "untradeable size" outcome, not an error.
pub fn position_size(equity: f64, risk_pct: f64, entry_price: f64, stop_price: f64, rules: &SymbolFilters) -> f64 {
	let risk_amount = equity * risk_pct;
	let per_unit_risk = (entry_price - stop_price).max(RISK_EPSILON);
	let raw_qty = risk_amount / per_unit_risk;

	let mut qty = round_step_down(raw_qty, rules.step_size);
	if qty < rules.min_qty {
		qty = rules.min_qty;
	}

	if !ensure_min_notional(entry_price, qty, rules.min_notional) {
		let min_qty_for_notional = rules.min_notional / entry_price;
		qty = round_step_up(min_qty_for_notional, rules.step_size);
		if qty < rules.min_qty {
			qty = rules.min_qty;
		}
	}

	if let Some(max_qty) = rules.max_qty {
		if qty > max_qty {
			qty = round_step_down(max_qty, rules.step_size);
		}
	}

	if !ensure_min_notional(entry_price, qty, rules.min_notional) {
		return 0.0;
	}

	qty
}

/// Open risk contributed by one trade, used for portfolio aggregate accounting.
pub fn trade_risk(entry_price: f64, stop_price: f64, qty: f64) -> f64 {
	(entry_price - stop_price).max(0.0) * qty
}
