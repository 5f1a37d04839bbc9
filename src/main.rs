mod config;
mod engine;
mod exchange_apis;
mod indicators;
mod portfolio;
mod risk;
mod strategy;
mod utils;

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use tokio::{
	sync::{mpsc, watch},
	task::JoinSet,
};
use tracing::{info, warn};

use crate::{
	config::AppConfig,
	engine::{CandleHistory, Engine},
	exchange_apis::binance::{orders::OrderManager, stream::KlineStream, BinanceClient},
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
	/// Path to a TOML config file. Without it, `breakout_engine.toml` is picked up when present.
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,
	/// Use testnet endpoints regardless of what the config says
	#[arg(long, global = true)]
	testnet: bool,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the trading loop
	Run,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	let cli = Cli::parse();

	let mut settings = match AppConfig::read(cli.config.as_deref()) {
		Ok(s) => s,
		Err(e) => {
			eprintln!("Loading config failed:\n{}", utils::format_eyre_chain_for_user(e));
			std::process::exit(1);
		}
	};
	if cli.testnet {
		settings.testnet = true;
	}
	utils::init_subscriber(settings.log_file.clone());

	let result = match cli.command {
		Commands::Run => run(Arc::new(settings)).await,
	};
	if let Err(e) = result {
		eprintln!("{}", utils::format_eyre_chain_for_user(e));
		std::process::exit(1);
	}
	Ok(())
}

async fn run(settings: Arc<AppConfig>) -> Result<()> {
	settings.assert_startup_safety()?;

	let client = Arc::new(BinanceClient::new(settings.clone())?);
	client.ping().await.wrap_err("Exchange REST ping failed")?;

	let equity = resolve_equity(&client, &settings).await?;
	info!(equity, dry_run = settings.dry_run, testnet = settings.testnet, timeframe = %settings.timeframe, "starting");

	let mut rules = HashMap::new();
	let mut histories = HashMap::new();
	let mut last_close_time = HashMap::new();
	for symbol in &settings.symbols {
		let exchange_info = client.exchange_info(symbol).await.wrap_err_with(|| format!("Failed to fetch exchange info for {symbol}"))?;
		let symbol_info = exchange_info.symbol(symbol).ok_or_else(|| eyre!("{symbol} missing from exchangeInfo response"))?;
		rules.insert(symbol.clone(), symbol_info.symbol_filters());

		let candles = client.klines(symbol, settings.timeframe, settings.history_limit).await.wrap_err_with(|| format!("Failed to fetch initial history for {symbol}"))?;
		let mut history = CandleHistory::new(300);
		history.replace(candles);
		if history.is_empty() {
			warn!(symbol, "no_initial_history");
		} else if let Some(last) = history.as_slice().last() {
			last_close_time.insert(symbol.clone(), last.close_time);
		}
		info!(symbol, candles = history.len(), "symbol_initialized");
		histories.insert(symbol.clone(), history);
	}

	let (stop_tx, stop_rx) = watch::channel(false);
	spawn_stop_listener(stop_tx.clone());

	let (candle_tx, candle_rx) = mpsc::channel(256);
	let stream = KlineStream::new(&settings.venue().ws_base(), &settings.symbols, settings.timeframe, settings.ws_max_reconnect_delay())?;
	let mut js = JoinSet::new();
	js.spawn(stream.run(candle_tx, stop_rx.clone()));

	let order_manager = OrderManager::new(client.clone(), settings.clone());
	let engine = Engine::new(settings.clone(), client, order_manager, equity, rules, histories, last_close_time);
	engine.run(candle_rx, stop_rx).await?;

	// The engine is done; ask the stream to wind down and drain its task.
	let _ = stop_tx.send(true);
	while let Some(joined) = js.join_next().await {
		match joined {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!(error = %e, "stream_task_failed"),
			Err(e) => warn!(error = %e, "stream_task_panicked"),
		}
	}
	Ok(())
}

/// Free USDT when credentials are configured; the simulation default otherwise, and also when the
/// account reads empty so an unfunded testnet account can still paper-trade.
async fn resolve_equity(client: &BinanceClient, settings: &AppConfig) -> Result<f64> {
	if !settings.has_credentials() {
		return Ok(settings.equity_fallback);
	}
	let account = client.account().await.wrap_err("Failed to fetch account balances")?;
	let usdt = account.free_balance("USDT");
	Ok(if usdt > 0.0 { usdt } else { settings.equity_fallback })
}

fn spawn_stop_listener(stop_tx: watch::Sender<bool>) {
	tokio::spawn(async move {
		let ctrl_c = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				Ok(mut sigterm) => {
					tokio::select! {
						_ = ctrl_c => {}
						_ = sigterm.recv() => {}
					}
				}
				Err(e) => {
					warn!(error = %e, "sigterm_hook_failed");
					let _ = ctrl_c.await;
				}
			}
		}
		#[cfg(not(unix))]
		{
			let _ = ctrl_c.await;
		}
		info!("shutdown_requested");
		let _ = stop_tx.send(true);
	});
}
