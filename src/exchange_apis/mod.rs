pub mod binance;

use serde::{Deserialize, Serialize};
use url::Url;

/// Which Binance venue REST and WS calls are routed to. Chosen once at startup, never re-resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Venue {
	SpotTestnet,
	SpotMainnet,
}
impl Venue {
	pub fn rest_base(&self) -> Url {
		match self {
			Self::SpotTestnet => Url::parse("https://testnet.binance.vision").unwrap(),
			Self::SpotMainnet => Url::parse("https://api.binance.com").unwrap(),
		}
	}

	pub fn ws_base(&self) -> Url {
		match self {
			Self::SpotTestnet => Url::parse("wss://testnet.binance.vision").unwrap(),
			Self::SpotMainnet => Url::parse("wss://stream.binance.com:9443").unwrap(),
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
	#[default]
	#[serde(rename = "BUY")]
	Buy,
	#[serde(rename = "SELL")]
	Sell,
}
impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Buy => write!(f, "BUY"),
			Self::Sell => write!(f, "SELL"),
		}
	}
}

/// One interval candle. Immutable once `is_closed`; only closed candles are appended to history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
	pub symbol: String,
	pub open: f64,
	pub high: f64,
	pub low: f64,
	pub close: f64,
	pub volume: f64,
	pub open_time: i64,
	pub close_time: i64,
	pub is_closed: bool,
}
