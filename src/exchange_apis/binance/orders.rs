//! Order submission, fill polling and the simulation-mode synthesis of both. Every submission and
//! skip is reported through the structured event log; that trail exists in dry-run too.

use std::{collections::HashMap, sync::Arc, time::Duration};

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tracing::info;
use uuid::Uuid;

use super::{
	info::{format_by_step, round_step_down, round_tick, SymbolFilters},
	BinanceClient,
};
use crate::{
	config::{AppConfig, EntryOrderType},
	exchange_apis::Side,
};

/// Stop-limit entries cap slippage at 0.1% above the trigger.
const STOP_LIMIT_OFFSET: f64 = 1.001;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
	#[serde(rename = "NEW")]
	New,
	#[serde(rename = "PARTIALLY_FILLED")]
	PartiallyFilled,
	#[serde(rename = "FILLED")]
	Filled,
	#[serde(rename = "CANCELED")]
	Canceled,
	#[serde(rename = "REJECTED")]
	Rejected,
	#[serde(rename = "EXPIRED")]
	Expired,
	#[serde(rename = "EXPIRED_IN_MATCH")]
	ExpiredInMatch,
	/// Local-only: the order was never submitted (dust exit).
	#[serde(rename = "SKIPPED")]
	Skipped,
}
impl OrderStatus {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, Self::New | Self::PartiallyFilled)
	}

	/// Still on the book; the caller is responsible for canceling after a fill-wait timeout.
	pub fn is_resting(&self) -> bool {
		matches!(self, Self::New | Self::PartiallyFilled)
	}
}

/// /api/v3/order response. STOP_LOSS_LIMIT submissions come back as bare ACKs, so everything past
/// the id is optional.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
	pub order_id: i64,
	#[serde(default)]
	pub status: Option<OrderStatus>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	#[serde(default)]
	pub executed_qty: Option<f64>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	#[serde(default)]
	pub price: Option<f64>,
	#[serde_as(as = "Option<DisplayFromStr>")]
	#[serde(default)]
	pub cummulative_quote_qty: Option<f64>,
}
impl OrderResponse {
	/// Realized average price, when the exchange reported enough to derive it.
	pub fn avg_fill_price(&self) -> Option<f64> {
		match (self.cummulative_quote_qty, self.executed_qty) {
			(Some(quote), Some(qty)) if quote > 0.0 && qty > 0.0 => Some(quote / qty),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OrderId {
	Exchange(i64),
	/// Synthesized in simulation mode; never touches the exchange.
	Synthetic(String),
	None,
}
impl std::fmt::Display for OrderId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Exchange(id) => write!(f, "{id}"),
			Self::Synthetic(id) => write!(f, "{id}"),
			Self::None => write!(f, "N/A"),
		}
	}
}

/// What the gateway reports back for one submission.
#[derive(Clone, Debug, PartialEq, derive_new::new)]
pub struct OrderAck {
	pub order_id: OrderId,
	pub status: OrderStatus,
	pub executed_qty: f64,
	pub avg_price: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, derive_new::new)]
pub struct FillOutcome {
	pub executed_qty: f64,
	pub avg_price: f64,
	pub status: OrderStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
	#[error("order quantity too small for {symbol}: {qty} < {min_qty}")]
	OrderTooSmall { symbol: String, qty: f64, min_qty: f64 },
	#[error("order submission failed: {0}")]
	Gateway(eyre::Report),
}

pub struct OrderManager {
	client: Arc<BinanceClient>,
	settings: Arc<AppConfig>,
}

impl OrderManager {
	pub fn new(client: Arc<BinanceClient>, settings: Arc<AppConfig>) -> Self {
		Self { client, settings }
	}

	/// Submits a long entry. Quantity is floored to the lot step first; below the exchange minimum
	/// it is a hard reject, unlike exits.
	pub async fn place_entry(&self, symbol: &str, qty: f64, trigger_price: f64, rules: &SymbolFilters, reason: &str) -> Result<OrderAck, ExecError> {
		let qty = round_step_down(qty, rules.step_size);
		if qty < rules.min_qty {
			return Err(ExecError::OrderTooSmall {
				symbol: symbol.to_owned(),
				qty,
				min_qty: rules.min_qty,
			});
		}

		if self.settings.dry_run {
			let ack = OrderAck::new(Self::synthetic_id("SIM", symbol), OrderStatus::Filled, qty, Some(trigger_price));
			info!(symbol, side = %Side::Buy, qty, price = trigger_price, order_id = %ack.order_id, reason, "order_simulated");
			return Ok(ack);
		}

		let params = entry_params(symbol, qty, trigger_price, rules, self.settings.entry_order_type);
		let response = self.client.new_order(params).await.map_err(ExecError::Gateway)?;
		info!(symbol, side = %Side::Buy, qty, price = trigger_price, order_id = response.order_id, reason, "order_sent");

		let avg_price = response.avg_fill_price();
		Ok(OrderAck::new(
			OrderId::Exchange(response.order_id),
			// A bare ACK means accepted, not filled; the fill wait decides what actually happened.
			response.status.unwrap_or(OrderStatus::New),
			response.executed_qty.unwrap_or(0.0),
			avg_price,
		))
	}

	/// Market-sells `qty`. Below-minimum quantities are a skipped "dust" no-op, not an error.
	pub async fn place_exit_market(&self, symbol: &str, qty: f64, rules: &SymbolFilters, reason: &str) -> Result<OrderAck, ExecError> {
		let qty = round_step_down(qty, rules.step_size);
		if qty < rules.min_qty {
			info!(symbol, side = %Side::Sell, qty, price = 0.0, order_id = %OrderId::None, reason, "exit_skipped_dust");
			return Ok(OrderAck::new(OrderId::None, OrderStatus::Skipped, 0.0, None));
		}

		if self.settings.dry_run {
			let ack = OrderAck::new(Self::synthetic_id("SIMEXIT", symbol), OrderStatus::Filled, qty, None);
			info!(symbol, side = %Side::Sell, qty, price = 0.0, order_id = %ack.order_id, reason, "exit_simulated");
			return Ok(ack);
		}

		let mut params = HashMap::<&'static str, String>::new();
		params.insert("symbol", symbol.to_owned());
		params.insert("side", Side::Sell.to_string());
		params.insert("type", "MARKET".to_owned());
		params.insert("quantity", format_by_step(qty, rules.step_size));

		let response = self.client.new_order(params).await.map_err(ExecError::Gateway)?;
		info!(symbol, side = %Side::Sell, qty, price = 0.0, order_id = response.order_id, reason, "exit_sent");

		let avg_price = response.avg_fill_price();
		Ok(OrderAck::new(
			OrderId::Exchange(response.order_id),
			response.status.unwrap_or(OrderStatus::Filled),
			response.executed_qty.unwrap_or(qty),
			avg_price,
		))
	}

	/// Polls order status until a terminal state or `timeout`, whichever first; returns the last
	/// known quantities either way. Synthetic orders are filled by definition.
	pub async fn wait_fill(&self, symbol: &str, order_id: &OrderId, timeout: Duration) -> Result<FillOutcome> {
		let OrderId::Exchange(id) = order_id else {
			return Ok(FillOutcome::new(0.0, 0.0, OrderStatus::Filled));
		};

		let deadline = tokio::time::Instant::now() + timeout;
		let mut outcome = FillOutcome::new(0.0, 0.0, OrderStatus::New);
		loop {
			let order = self.client.get_order(symbol, *id).await?;
			outcome.status = order.status.clone().unwrap_or(OrderStatus::New);
			outcome.executed_qty = order.executed_qty.unwrap_or(0.0);
			outcome.avg_price = order.avg_fill_price().or(order.price.filter(|p| *p > 0.0)).unwrap_or(0.0);
			if outcome.status.is_terminal() || tokio::time::Instant::now() >= deadline {
				break;
			}
			tokio::time::sleep(self.settings.poll_interval()).await;
		}
		Ok(outcome)
	}

	pub async fn cancel(&self, symbol: &str, order_id: &OrderId) -> Result<()> {
		if let OrderId::Exchange(id) = order_id {
			self.client.cancel_order(symbol, *id).await?;
			info!(symbol, order_id = id, "order_canceled");
		}
		Ok(())
	}

	fn synthetic_id(prefix: &str, symbol: &str) -> OrderId {
		OrderId::Synthetic(format!("{prefix}-{symbol}-{}", Uuid::new_v4()))
	}
}

fn entry_params(symbol: &str, qty: f64, trigger_price: f64, rules: &SymbolFilters, style: EntryOrderType) -> HashMap<&'static str, String> {
	let mut params = HashMap::<&'static str, String>::new();
	params.insert("symbol", symbol.to_owned());
	params.insert("side", Side::Buy.to_string());
	params.insert("quantity", format_by_step(qty, rules.step_size));
	match style {
		EntryOrderType::Market => {
			params.insert("type", "MARKET".to_owned());
		}
		EntryOrderType::StopLimit => {
			let stop_price = round_tick(trigger_price, rules.tick_size);
			let limit_price = round_tick(trigger_price * STOP_LIMIT_OFFSET, rules.tick_size);
			params.insert("type", "STOP_LOSS_LIMIT".to_owned());
			params.insert("timeInForce", "GTC".to_owned());
			params.insert("stopPrice", format_by_step(stop_price, rules.tick_size));
			params.insert("price", format_by_step(limit_price, rules.tick_size));
		}
	}
	params
}
