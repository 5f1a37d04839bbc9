//! Spot `exchangeInfo` model and the per-symbol quantization rules derived from it.
//!
//! Binance encodes numerics as strings and ships filter metadata as a heterogeneous list; both are
//! handled here so the rest of the crate only ever sees [SymbolFilters].

use rust_decimal::{
	prelude::{FromPrimitive, ToPrimitive},
	Decimal,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeInfo {
	pub symbols: Vec<SpotSymbol>,
}
impl ExchangeInfo {
	pub fn symbol(&self, symbol: &str) -> Option<&SpotSymbol> {
		self.symbols.iter().find(|s| s.symbol == symbol)
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpotSymbol {
	pub symbol: String,
	pub filters: Vec<Filter>,
}
impl SpotSymbol {
	/// Collapses the filter list into the rule set order placement needs. Missing optional filters
	/// never fail resolution: `minNotional` falls back through the `NOTIONAL` variant to zero.
	pub fn symbol_filters(&self) -> SymbolFilters {
		let mut rules = SymbolFilters::default();
		for filter in &self.filters {
			match filter {
				Filter::PriceFilter(pf) => {
					rules.tick_size = pf.tick_size;
					rules.min_price = (pf.min_price > 0.0).then_some(pf.min_price);
					rules.max_price = (pf.max_price > 0.0).then_some(pf.max_price);
				}
				Filter::LotSize(ls) => {
					rules.step_size = ls.step_size;
					rules.min_qty = ls.min_qty;
					rules.max_qty = (ls.max_qty > 0.0).then_some(ls.max_qty);
				}
				Filter::MinNotional(mn) => rules.min_notional = mn.min_notional,
				Filter::Notional(n) => rules.min_notional = n.min_notional,
				Filter::Unknown => {}
			}
		}
		rules
	}
}

/// Typed view over the raw filter objects. Anything we don't consume deserializes as `Unknown`
/// instead of failing the whole `exchangeInfo` response.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "filterType")]
pub enum Filter {
	#[serde(rename = "PRICE_FILTER")]
	PriceFilter(PriceFilter),
	#[serde(rename = "LOT_SIZE")]
	LotSize(LotSizeFilter),
	#[serde(rename = "MIN_NOTIONAL")]
	MinNotional(MinNotionalFilter),
	#[serde(rename = "NOTIONAL")]
	Notional(NotionalFilter),
	#[serde(other)]
	Unknown,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
	#[serde_as(as = "DisplayFromStr")]
	pub min_price: f64,
	#[serde_as(as = "DisplayFromStr")]
	pub max_price: f64,
	#[serde_as(as = "DisplayFromStr")]
	pub tick_size: f64,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
	#[serde_as(as = "DisplayFromStr")]
	pub max_qty: f64,
	#[serde_as(as = "DisplayFromStr")]
	pub min_qty: f64,
	#[serde_as(as = "DisplayFromStr")]
	pub step_size: f64,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinNotionalFilter {
	#[serde_as(as = "DisplayFromStr")]
	pub min_notional: f64,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotionalFilter {
	#[serde_as(as = "DisplayFromStr")]
	pub min_notional: f64,
}

/// Exchange-imposed rounding and size rules for one symbol. Fetched once at startup and treated as
/// immutable for the process lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
	pub min_notional: f64,
	pub step_size: f64,
	pub min_qty: f64,
	pub tick_size: f64,
	pub max_qty: Option<f64>,
	pub min_price: Option<f64>,
	pub max_price: Option<f64>,
}

fn quantize(value: f64, step: f64, round_up: bool) -> f64 {
	if step <= 0.0 {
		return value;
	}
	let (Some(v), Some(s)) = (Decimal::from_f64(value), Decimal::from_f64(step)) else {
		return value;
	};
	let steps = if round_up { (v / s).ceil() } else { (v / s).floor() };
	(steps * s).to_f64().unwrap_or(value)
}

/// Largest multiple of `step` at or below `value`. Exact decimal arithmetic, so step boundaries
/// don't drift the way binary-float division would. `step <= 0` is a passthrough.
pub fn round_step_down(value: f64, step: f64) -> f64 {
	quantize(value, step, false)
}

/// Smallest multiple of `step` at or above `value`.
pub fn round_step_up(value: f64, step: f64) -> f64 {
	quantize(value, step, true)
}

pub fn round_tick(price: f64, tick_size: f64) -> f64 {
	round_step_down(price, tick_size)
}

pub fn ensure_min_notional(price: f64, qty: f64, min_notional: f64) -> bool {
	price * qty >= min_notional
}

/// Renders `value` at the decimal precision implied by `step`'s exponent, e.g. step 0.001 -> 3 places.
pub fn format_by_step(value: f64, step: f64) -> String {
	let decimals = Decimal::from_f64(step).map_or(0, |s| s.normalize().scale()) as usize;
	format!("{value:.decimals$}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_step_down_is_decimal_exact() {
		assert_eq!(round_step_down(1.2345, 0.01), 1.23);
		assert_eq!(round_step_down(0.3, 0.1), 0.3);
		assert_eq!(round_step_down(123.456, 0.001), 123.456);
	}

	#[test]
	fn round_step_up_is_decimal_exact() {
		assert_eq!(round_step_up(1.231, 0.01), 1.24);
		assert_eq!(round_step_up(1.23, 0.01), 1.23);
	}

	#[test]
	fn zero_step_is_passthrough() {
		assert_eq!(round_step_down(1.2345, 0.0), 1.2345);
		assert_eq!(round_step_up(1.2345, -1.0), 1.2345);
	}

	#[test]
	fn format_follows_step_exponent() {
		assert_eq!(format_by_step(1.2, 0.001), "1.200");
		assert_eq!(format_by_step(42.0, 1.0), "42");
		assert_eq!(format_by_step(0.5, 0.01), "0.50");
	}

	#[test]
	fn min_notional_check() {
		assert!(ensure_min_notional(100.0, 0.1, 10.0));
		assert!(!ensure_min_notional(100.0, 0.01, 10.0));
	}

	fn symbol_json(filters: &str) -> String {
		format!(
			r#"{{"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT", "filters": {filters}}}"#
		)
	}

	#[test]
	fn parses_filters_from_exchange_info() {
		let raw = symbol_json(
			r#"[
				{"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01"},
				{"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000.0", "stepSize": "0.00001"},
				{"filterType": "NOTIONAL", "minNotional": "5.00"},
				{"filterType": "PERCENT_PRICE_BY_SIDE", "bidMultiplierUp": "5", "askMultiplierDown": "0.2"}
			]"#,
		);
		let symbol: SpotSymbol = serde_json::from_str(&raw).unwrap();
		let rules = symbol.symbol_filters();
		insta::assert_json_snapshot!(rules, @r###"
  {
    "min_notional": 5.0,
    "step_size": 1e-5,
    "min_qty": 1e-5,
    "tick_size": 0.01,
    "max_qty": 9000.0,
    "min_price": 0.01,
    "max_price": 1000000.0
  }
  "###);
	}

	#[test]
	fn missing_notional_filter_defaults_to_zero() {
		let raw = symbol_json(
			r#"[
				{"filterType": "PRICE_FILTER", "minPrice": "0", "maxPrice": "0", "tickSize": "0.01"},
				{"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "0", "stepSize": "0.001"}
			]"#,
		);
		let symbol: SpotSymbol = serde_json::from_str(&raw).unwrap();
		let rules = symbol.symbol_filters();
		assert_eq!(rules.min_notional, 0.0);
		assert_eq!(rules.max_qty, None);
		assert_eq!(rules.min_price, None);
	}

	#[test]
	fn legacy_min_notional_variant_is_honored() {
		let raw = symbol_json(r#"[{"filterType": "MIN_NOTIONAL", "minNotional": "10.00"}]"#);
		let symbol: SpotSymbol = serde_json::from_str(&raw).unwrap();
		assert_eq!(symbol.symbol_filters().min_notional, 10.0);
	}
}
