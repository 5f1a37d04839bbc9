//! Binance spot REST client. Transient failures (429/418 rate limits, 5xx, transport errors) are
//! retried here with exponential backoff up to the configured ceiling; everything past that
//! boundary surfaces as a terminal error for the caller to classify.
#![allow(dead_code)]

pub mod info;
pub mod orders;
pub mod stream;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use color_eyre::eyre::{eyre, Result, WrapErr};
use hmac::{Hmac, Mac};
use reqwest::{
	header::{HeaderMap, HeaderValue, CONTENT_TYPE},
	Method, StatusCode,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use sha2::Sha256;
use tracing::warn;

use crate::{
	config::{AppConfig, Timeframe},
	exchange_apis::Candle,
	utils::{deser_reqwest, unexpected_response_str},
};

use self::orders::OrderResponse;

type HmacSha256 = Hmac<Sha256>;

const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct BinanceClient {
	settings: Arc<AppConfig>,
	http: reqwest::Client,
}

impl BinanceClient {
	pub fn new(settings: Arc<AppConfig>) -> Result<Self> {
		let mut headers = HeaderMap::new();
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json;charset=utf-8"));
		if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
			headers.insert("X-MBX-APIKEY", HeaderValue::from_str(key).wrap_err("API key is not a valid header value")?);
		}
		let http = reqwest::Client::builder().default_headers(headers).timeout(Duration::from_secs(settings.http_timeout_sec)).build()?;
		Ok(Self { settings, http })
	}

	fn sign(&self, mut params: HashMap<&'static str, String>) -> Result<String> {
		let secret = self.settings.api_secret.as_ref().ok_or_else(|| eyre!("Signed endpoint requested but api_secret is not configured"))?;
		params.insert("timestamp", Utc::now().timestamp_millis().to_string());
		params.insert("recvWindow", self.settings.recv_window_ms.to_string());
		let query_string = serde_urlencoded::to_string(&params)?;

		let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())?;
		mac.update(query_string.as_bytes());
		let signature = hex::encode(mac.finalize().into_bytes());
		Ok(format!("{query_string}&signature={signature}"))
	}

	async fn request(&self, method: Method, path: &str, params: HashMap<&'static str, String>, signed: bool) -> Result<reqwest::Response> {
		let url = self.settings.venue().rest_base().join(path)?;
		let mut backoff = Duration::from_secs(1);
		let mut last_error: Option<eyre::Report> = None;

		for _ in 0..self.settings.rest_max_retries {
			// Signed on every attempt: the timestamp must be fresh or the exchange rejects it.
			let query = if signed { self.sign(params.clone())? } else { serde_urlencoded::to_string(&params)? };
			let full_url = if query.is_empty() { url.to_string() } else { format!("{url}?{query}") };

			let response = match self.http.request(method.clone(), &full_url).send().await {
				Ok(r) => r,
				Err(e) => {
					last_error = Some(e.into());
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(BACKOFF_CAP);
					continue;
				}
			};

			let status = response.status();
			if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
				let retry_after = response.headers().get("Retry-After").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<u64>().ok()).unwrap_or(1);
				let wait = Duration::from_secs(retry_after).max(backoff);
				warn!(path, status = status.as_u16(), wait_sec = wait.as_secs(), "rate_limited");
				last_error = Some(eyre!("rate limited ({status})"));
				tokio::time::sleep(wait).await;
				backoff = (backoff * 2).min(BACKOFF_CAP);
				continue;
			}
			if status.is_server_error() {
				warn!(path, status = status.as_u16(), "server_error_retrying");
				last_error = Some(eyre!("server error ({status})"));
				tokio::time::sleep(backoff).await;
				backoff = (backoff * 2).min(BACKOFF_CAP);
				continue;
			}
			if !status.is_success() {
				let body = response.text().await?;
				return Err(unexpected_response_str(&body)).wrap_err_with(|| format!("{method} {path} rejected"));
			}
			return Ok(response);
		}

		Err(last_error.unwrap_or_else(|| eyre!("no attempts were made"))).wrap_err_with(|| format!("Binance request failed after {} attempts: {path}", self.settings.rest_max_retries))
	}

	pub async fn ping(&self) -> Result<()> {
		self.request(Method::GET, "/api/v3/ping", HashMap::new(), false).await?;
		Ok(())
	}

	pub async fn exchange_info(&self, symbol: &str) -> Result<info::ExchangeInfo> {
		let mut params = HashMap::new();
		params.insert("symbol", symbol.to_owned());
		let r = self.request(Method::GET, "/api/v3/exchangeInfo", params, false).await?;
		deser_reqwest(r).await
	}

	pub async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
		let mut params = HashMap::new();
		params.insert("symbol", symbol.to_owned());
		params.insert("interval", timeframe.to_string());
		params.insert("limit", limit.to_string());
		let r = self.request(Method::GET, "/api/v3/klines", params, false).await?;
		let raw: Vec<RestKline> = deser_reqwest(r).await?;
		raw.into_iter().map(|k| k.try_into_candle(symbol)).collect()
	}

	pub async fn account(&self) -> Result<SpotAccountDetails> {
		let r = self.request(Method::GET, "/api/v3/account", HashMap::new(), true).await?;
		deser_reqwest(r).await
	}

	pub async fn new_order(&self, params: HashMap<&'static str, String>) -> Result<OrderResponse> {
		let r = self.request(Method::POST, "/api/v3/order", params, true).await?;
		deser_reqwest(r).await
	}

	pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
		let mut params = HashMap::new();
		params.insert("symbol", symbol.to_owned());
		params.insert("orderId", order_id.to_string());
		self.request(Method::DELETE, "/api/v3/order", params, true).await?;
		Ok(())
	}

	pub async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse> {
		let mut params = HashMap::new();
		params.insert("symbol", symbol.to_owned());
		params.insert("orderId", order_id.to_string());
		let r = self.request(Method::GET, "/api/v3/order", params, true).await?;
		deser_reqwest(r).await
	}
}

/// Raw /api/v3/klines row; Binance ships these as positional arrays of mixed types.
#[derive(Clone, Debug, Deserialize)]
pub struct RestKline {
	pub open_time: i64,
	pub open: String,
	pub high: String,
	pub low: String,
	pub close: String,
	pub volume: String,
	pub close_time: i64,
	pub quote_asset_volume: String,
	pub number_of_trades: usize,
	pub taker_buy_base_asset_volume: String,
	pub taker_buy_quote_asset_volume: String,
	pub ignore: String,
}
impl RestKline {
	fn try_into_candle(self, symbol: &str) -> Result<Candle> {
		Ok(Candle {
			symbol: symbol.to_owned(),
			open: self.open.parse()?,
			high: self.high.parse()?,
			low: self.low.parse()?,
			close: self.close.parse()?,
			volume: self.volume.parse()?,
			open_time: self.open_time,
			close_time: self.close_time,
			// REST only ever returns completed intervals (the last row may technically still be
			// forming, but history seeding treats it the same way the original feed does).
			is_closed: true,
		})
	}
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpotAccountDetails {
	pub balances: Vec<SpotBalance>,
}
impl SpotAccountDetails {
	pub fn free_balance(&self, asset: &str) -> f64 {
		self.balances.iter().find(|b| b.asset == asset).map_or(0.0, |b| b.free)
	}
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct SpotBalance {
	pub asset: String,
	#[serde_as(as = "DisplayFromStr")]
	pub free: f64,
	#[serde_as(as = "DisplayFromStr")]
	pub locked: f64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kline_rows_deserialize_from_positional_arrays() {
		let raw = r#"[
			[1700000000000, "35000.0", "35500.0", "34800.0", "35250.5", "123.4", 1700003599999, "4350000.0", 4521, "60.0", "2100000.0", "0"]
		]"#;
		let rows: Vec<RestKline> = serde_json::from_str(raw).unwrap();
		let candle = rows.into_iter().next().unwrap().try_into_candle("BTCUSDT").unwrap();
		assert_eq!(candle.symbol, "BTCUSDT");
		assert_eq!(candle.close, 35250.5);
		assert_eq!(candle.close_time, 1700003599999);
		assert!(candle.is_closed);
	}

	#[test]
	fn account_free_balance_lookup() {
		let raw = r#"{"balances": [
			{"asset": "BTC", "free": "0.5", "locked": "0.0"},
			{"asset": "USDT", "free": "1234.56", "locked": "10.0"}
		]}"#;
		let account: SpotAccountDetails = serde_json::from_str(raw).unwrap();
		assert_eq!(account.free_balance("USDT"), 1234.56);
		assert_eq!(account.free_balance("XRP"), 0.0);
	}
}
