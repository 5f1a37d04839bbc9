//! Static configuration, resolved once at startup and passed by `Arc` into every component.
//! Defaults < optional TOML file < environment variables; nothing is re-read at runtime.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::exchange_apis::Venue;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	pub testnet: bool,
	/// Simulation mode: orders are synthesized locally, nothing is submitted to the exchange.
	pub dry_run: bool,
	/// Required, in addition to `dry_run = false` and `testnet = false`, before any order reaches
	/// the production venue.
	pub allow_live_mainnet: bool,
	pub api_key: Option<String>,
	pub api_secret: Option<SecretString>,

	pub symbols: Vec<String>,
	pub timeframe: Timeframe,

	pub risk_pct: f64,
	pub atr_mult: f64,
	pub breakout_n: usize,
	pub atr_period: usize,
	pub breakout_buffer_atr: f64,

	pub take_profit_r: f64,
	pub partial_pct: f64,
	pub trail_mode: TrailMode,
	pub trail_lookback: usize,
	pub trail_atr_mult: f64,
	pub time_stop_candles: u64,

	pub max_positions: usize,
	pub majors: HashSet<String>,
	pub max_major_positions: usize,
	pub global_open_risk_cap: f64,

	pub entry_order_type: EntryOrderType,
	/// Equity assumed when no credentials are configured or the account balance reads zero.
	pub equity_fallback: f64,
	pub history_limit: usize,

	pub poll_interval_sec: f64,
	pub fill_timeout_sec: u64,
	pub recv_window_ms: u64,
	pub http_timeout_sec: u64,
	pub rest_max_retries: u32,
	pub ws_max_reconnect_delay_sec: u64,

	pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			testnet: true,
			dry_run: true,
			allow_live_mainnet: false,
			api_key: None,
			api_secret: None,
			symbols: vec!["BTCUSDT".to_owned(), "ETHUSDT".to_owned()],
			timeframe: Timeframe::new(1, TimeframeUnit::Hours),
			risk_pct: 0.0075,
			atr_mult: 2.0,
			breakout_n: 20,
			atr_period: 14,
			breakout_buffer_atr: 0.1,
			take_profit_r: 3.0,
			partial_pct: 0.4,
			trail_mode: TrailMode::LowestLow,
			trail_lookback: 20,
			trail_atr_mult: 3.0,
			time_stop_candles: 10,
			max_positions: 5,
			majors: ["BTCUSDT".to_owned(), "ETHUSDT".to_owned()].into(),
			max_major_positions: 2,
			global_open_risk_cap: 0.03,
			entry_order_type: EntryOrderType::Market,
			equity_fallback: 10_000.0,
			history_limit: 250,
			poll_interval_sec: 2.0,
			fill_timeout_sec: 20,
			recv_window_ms: 5000,
			http_timeout_sec: 10,
			rest_max_retries: 5,
			ws_max_reconnect_delay_sec: 30,
			log_file: None,
		}
	}
}

impl AppConfig {
	pub fn read(explicit_path: Option<&Path>) -> Result<Self> {
		let mut builder = config::Config::builder();
		builder = match explicit_path {
			Some(path) => builder.add_source(config::File::from(path)),
			None => builder.add_source(config::File::with_name("breakout_engine").required(false)),
		};
		builder = builder.add_source(
			config::Environment::default()
				.try_parsing(true)
				.list_separator(",")
				.with_list_parse_key("symbols")
				.with_list_parse_key("majors"),
		);
		let raw = builder.build().wrap_err("Failed to assemble configuration sources")?;
		raw.try_deserialize().wrap_err("Failed to deserialize configuration")
	}

	pub fn venue(&self) -> Venue {
		if self.testnet { Venue::SpotTestnet } else { Venue::SpotMainnet }
	}

	pub fn has_credentials(&self) -> bool {
		self.api_key.as_deref().is_some_and(|k| !k.is_empty()) && self.api_secret.as_ref().is_some_and(|s| !s.expose_secret().is_empty())
	}

	/// The safety gate: refuses mainnet live trading without the explicit override, and live
	/// trading of any kind without credentials. Fatal at startup.
	pub fn assert_startup_safety(&self) -> Result<()> {
		if !self.testnet && !self.dry_run && !self.allow_live_mainnet {
			bail!("Mainnet live trading blocked. Set allow_live_mainnet = true explicitly.");
		}
		if !self.dry_run && !self.has_credentials() {
			bail!("Live mode requires api_key and api_secret.");
		}
		Ok(())
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs_f64(self.poll_interval_sec)
	}

	pub fn fill_timeout(&self) -> Duration {
		Duration::from_secs(self.fill_timeout_sec)
	}

	pub fn ws_max_reconnect_delay(&self) -> Duration {
		Duration::from_secs(self.ws_max_reconnect_delay_sec)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailMode {
	LowestLow,
	Atr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrderType {
	Market,
	StopLimit,
}

/// Candle interval in the format of "15m", "1h", "4h", "1d".
#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr, derive_new::new)]
pub struct Timeframe {
	pub n: u32,
	pub unit: TimeframeUnit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeframeUnit {
	Minutes,
	Hours,
	Days,
}

impl Timeframe {
	pub fn duration(&self) -> Duration {
		let unit_secs = match self.unit {
			TimeframeUnit::Minutes => 60,
			TimeframeUnit::Hours => 60 * 60,
			TimeframeUnit::Days => 24 * 60 * 60,
		};
		Duration::from_secs(self.n as u64 * unit_secs)
	}

	pub fn interval_ms(&self) -> i64 {
		self.duration().as_millis() as i64
	}
}

impl std::str::FromStr for Timeframe {
	type Err = eyre::Report;

	fn from_str(s: &str) -> Result<Self> {
		let Some(suffix) = s.chars().last() else {
			bail!("Invalid timeframe: empty string");
		};
		let digits = &s[..s.len() - suffix.len_utf8()];
		let n: u32 = digits.parse().map_err(|_| eyre!("Invalid timeframe: {s}"))?;
		if n == 0 {
			bail!("Invalid timeframe: {s}");
		}
		let unit = match suffix {
			'm' => TimeframeUnit::Minutes,
			'h' => TimeframeUnit::Hours,
			'd' => TimeframeUnit::Days,
			_ => bail!("Unsupported timeframe suffix: {s}"),
		};
		Ok(Self { n, unit })
	}
}

impl std::fmt::Display for Timeframe {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let suffix = match self.unit {
			TimeframeUnit::Minutes => 'm',
			TimeframeUnit::Hours => 'h',
			TimeframeUnit::Days => 'd',
		};
		write!(f, "{}{}", self.n, suffix)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn timeframe_roundtrip() {
		let tf: Timeframe = "1h".parse().unwrap();
		assert_eq!(tf.interval_ms(), 3_600_000);
		assert_eq!(tf.to_string(), "1h");

		let tf: Timeframe = "15m".parse().unwrap();
		assert_eq!(tf.interval_ms(), 900_000);

		assert!("1x".parse::<Timeframe>().is_err());
		assert!("h".parse::<Timeframe>().is_err());
		assert!("0h".parse::<Timeframe>().is_err());
	}

	#[test]
	fn defaults_are_testnet_dry_run() {
		let settings = AppConfig::default();
		assert!(settings.testnet);
		assert!(settings.dry_run);
		assert!(!settings.allow_live_mainnet);
		assert_eq!(settings.venue(), Venue::SpotTestnet);
		assert_eq!(settings.symbols, vec!["BTCUSDT", "ETHUSDT"]);
	}

	#[test]
	fn mainnet_live_requires_explicit_override() {
		let settings = AppConfig {
			testnet: false,
			dry_run: false,
			api_key: Some("k".to_owned()),
			api_secret: Some(SecretString::from("s".to_owned())),
			..AppConfig::default()
		};
		assert!(settings.assert_startup_safety().is_err());

		let settings = AppConfig { allow_live_mainnet: true, ..settings };
		assert!(settings.assert_startup_safety().is_ok());
	}

	#[test]
	fn live_mode_requires_credentials() {
		let settings = AppConfig { dry_run: false, ..AppConfig::default() };
		assert!(settings.assert_startup_safety().is_err());

		let settings = AppConfig {
			api_key: Some("key".to_owned()),
			api_secret: Some(SecretString::from("secret".to_owned())),
			..settings
		};
		assert!(settings.assert_startup_safety().is_ok());
		assert!(settings.has_credentials());
	}

	#[test]
	fn empty_credentials_do_not_count() {
		let settings = AppConfig {
			api_key: Some(String::new()),
			api_secret: Some(SecretString::from(String::new())),
			..AppConfig::default()
		};
		assert!(!settings.has_credentials());
	}

	#[test]
	fn trail_mode_parses_from_config_strings() {
		#[derive(Deserialize)]
		struct Wrapper {
			trail_mode: TrailMode,
			entry_order_type: EntryOrderType,
		}
		let w: Wrapper = serde_json::from_str(r#"{"trail_mode": "lowest_low", "entry_order_type": "stop_limit"}"#).unwrap();
		assert_eq!(w.trail_mode, TrailMode::LowestLow);
		assert_eq!(w.entry_order_type, EntryOrderType::StopLimit);
	}
}
