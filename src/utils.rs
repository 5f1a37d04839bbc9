use std::{path::PathBuf, sync::Arc};

use color_eyre::eyre::Result;
use serde::de::DeserializeOwned;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Structured JSON logging to stdout, or to `log_path` when configured. The event log is the
/// system's sole observability surface, so this is installed before anything else can fail.
///
/// # Panics
/// On a second invocation, or when the log file cannot be opened.
pub fn init_subscriber(log_path: Option<PathBuf>) {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or(tracing_subscriber::EnvFilter::new("info"));

	match log_path {
		Some(path) => {
			let file = std::fs::OpenOptions::new().create(true).append(true).open(&path).expect("Failed to open log file");
			let formatting_layer = tracing_subscriber::fmt::layer().json().with_writer(Arc::new(file));
			tracing_subscriber::Registry::default().with(env_filter).with(formatting_layer).with(ErrorLayer::default()).init();
		}
		None => {
			let formatting_layer = tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout);
			tracing_subscriber::Registry::default().with(env_filter).with(formatting_layer).with(ErrorLayer::default()).init();
		}
	}
}

/// Fatal errors surface to the operator through this, not through a Debug dump.
pub fn format_eyre_chain_for_user(e: eyre::Report) -> String {
	let chain = e.chain().rev().collect::<Vec<_>>();
	let mut s = String::new();
	for (i, e) in chain.into_iter().enumerate() {
		if i > 0 {
			s.push('\n');
		}
		s.push_str("-> ");
		s.push_str(&e.to_string());
	}
	s
}

/// Basically reqwest's `json()`, but surfaces the body's content on deserialization error.
pub async fn deser_reqwest<T: DeserializeOwned>(r: reqwest::Response) -> Result<T> {
	let text = r.text().await?;

	match serde_json::from_str::<T>(&text) {
		Ok(deserialized) => Ok(deserialized),
		Err(_) => Err(unexpected_response_str(&text)),
	}
}

pub fn unexpected_response_str(s: &str) -> eyre::Report {
	let s = match serde_json::from_str::<serde_json::Value>(s) {
		Ok(v) => serde_json::to_string_pretty(&v).unwrap_or_else(|_| s.to_owned()),
		Err(_) => s.to_owned(),
	};
	let report = eyre::Report::msg(s);
	report.wrap_err("Unexpected API response")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn eyre_chain_renders_innermost_first() {
		let inner = eyre::eyre!("connection refused");
		let wrapped = inner.wrap_err("exchange REST ping failed");
		let rendered = format_eyre_chain_for_user(wrapped);
		assert_eq!(rendered, "-> connection refused\n-> exchange REST ping failed");
	}

	#[test]
	fn unexpected_response_pretty_prints_json_bodies() {
		let report = unexpected_response_str(r#"{"code":-1121,"msg":"Invalid symbol."}"#);
		let rendered = format!("{report:?}");
		assert!(rendered.contains("Invalid symbol."));
	}
}
