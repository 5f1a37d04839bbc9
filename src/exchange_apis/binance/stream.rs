//! Live multi-symbol kline feed over one combined WebSocket subscription.
//!
//! Disconnects are never fatal: every failure transitions back through Connecting with exponential
//! backoff, and an idle link is health-checked with a ping before being declared dead.

use std::time::Duration;

use color_eyre::eyre::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tokio::{
	net::TcpStream,
	sync::{mpsc, watch},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::Timeframe, exchange_apis::Candle};

/// How long the message loop waits before health-checking an apparently idle connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(35);
/// How long a health-check ping may go unanswered before the link is declared dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect schedule: one unit, doubling, capped; reset on every successful connection.
#[derive(Clone, Debug)]
pub struct Backoff {
	current: Duration,
	max: Duration,
}
impl Backoff {
	pub fn new(max: Duration) -> Self {
		Self {
			current: INITIAL_RECONNECT_DELAY,
			max,
		}
	}

	/// Delay to sleep before the next attempt; the one after doubles.
	pub fn next_delay(&mut self) -> Duration {
		let delay = self.current;
		self.current = (self.current * 2).min(self.max);
		delay
	}

	pub fn reset(&mut self) {
		self.current = INITIAL_RECONNECT_DELAY;
	}
}

enum LoopExit {
	Stop,
	Reconnect,
}
impl LoopExit {
	fn is_stop(&self) -> bool {
		matches!(self, Self::Stop)
	}
}

pub struct KlineStream {
	url: Url,
	max_reconnect_delay: Duration,
}

impl KlineStream {
	pub fn new(ws_base: &Url, symbols: &[String], timeframe: Timeframe, max_reconnect_delay: Duration) -> Result<Self> {
		let streams = symbols.iter().map(|s| format!("{}@kline_{}", s.to_lowercase(), timeframe)).collect::<Vec<_>>().join("/");
		let url = Url::parse(&format!("{}/stream?streams={streams}", ws_base.as_str().trim_end_matches('/')))?;
		Ok(Self { url, max_reconnect_delay })
	}

	/// Runs until the stop signal flips or the consumer goes away. Only fully closed candles are
	/// forwarded; in-progress updates are discarded at the parse site.
	pub async fn run(self, tx: mpsc::Sender<Candle>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
		let mut backoff = Backoff::new(self.max_reconnect_delay);
		while !*stop_rx.borrow() {
			match connect_async(self.url.as_str()).await {
				Ok((ws, _)) => {
					info!(url = %self.url, "ws_connected");
					backoff.reset();
					if self.message_loop(ws, &tx, &mut stop_rx).await.is_stop() {
						break;
					}
				}
				Err(e) => warn!(reason = %e, "ws_connect_failed"),
			}
			if *stop_rx.borrow() {
				break;
			}
			let delay = backoff.next_delay();
			debug!(delay_sec = delay.as_secs(), "ws_reconnect_backoff");
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = stop_rx.changed() => {}
			}
		}
		info!("ws_stream_stopped");
		Ok(())
	}

	async fn message_loop(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>, tx: &mpsc::Sender<Candle>, stop_rx: &mut watch::Receiver<bool>) -> LoopExit {
		let (mut write, mut read) = ws.split();
		let mut awaiting_pong = false;
		loop {
			if *stop_rx.borrow() {
				return LoopExit::Stop;
			}
			let wait = if awaiting_pong { PONG_TIMEOUT } else { IDLE_TIMEOUT };
			let next = tokio::select! {
				next = tokio::time::timeout(wait, read.next()) => next,
				_ = stop_rx.changed() => continue,
			};
			match next {
				Err(_) if awaiting_pong => {
					warn!("ws_health_check_failed");
					return LoopExit::Reconnect;
				}
				Err(_) => {
					// Idle is not proof of a dead link; ask before tearing down.
					if let Err(e) = write.send(Message::Ping(Vec::new())).await {
						warn!(reason = %e, "ws_ping_failed");
						return LoopExit::Reconnect;
					}
					awaiting_pong = true;
				}
				Ok(None) => {
					warn!("ws_closed_by_server");
					return LoopExit::Reconnect;
				}
				Ok(Some(Err(e))) => {
					warn!(reason = %e, "ws_error");
					return LoopExit::Reconnect;
				}
				Ok(Some(Ok(msg))) => {
					awaiting_pong = false; // any inbound frame proves liveness
					match msg {
						Message::Text(text) => {
							let Some(candle) = parse_kline_event(&text) else { continue };
							if !candle.is_closed {
								continue;
							}
							if tx.send(candle).await.is_err() {
								// Consumer is gone; nothing left to stream for.
								return LoopExit::Stop;
							}
						}
						Message::Ping(payload) =>
							if write.send(Message::Pong(payload)).await.is_err() {
								return LoopExit::Reconnect;
							},
						_ => {}
					}
				}
			}
		}
	}
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct WsKline {
	#[serde(rename = "t")]
	open_time: i64,
	#[serde(rename = "T")]
	close_time: i64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "o")]
	open: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "h")]
	high: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "l")]
	low: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "c")]
	close: f64,
	#[serde_as(as = "DisplayFromStr")]
	#[serde(rename = "v")]
	volume: f64,
	#[serde(rename = "x")]
	is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct WsKlineEvent {
	#[serde(rename = "s")]
	symbol: String,
	#[serde(rename = "k")]
	kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamMessage {
	data: WsKlineEvent,
}

/// Combined-stream payloads wrap the event under `data`; raw streams don't. Anything that isn't a
/// kline event (subscription acks and the like) yields `None`.
fn parse_kline_event(text: &str) -> Option<Candle> {
	let event = serde_json::from_str::<CombinedStreamMessage>(text).map(|m| m.data).or_else(|_| serde_json::from_str::<WsKlineEvent>(text)).ok()?;
	Some(Candle {
		symbol: event.symbol,
		open: event.kline.open,
		high: event.kline.high,
		low: event.kline.low,
		close: event.kline.close,
		volume: event.kline.volume,
		open_time: event.kline.open_time,
		close_time: event.kline.close_time,
		is_closed: event.kline.is_closed,
	})
}
