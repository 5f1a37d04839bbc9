//! Pure numeric indicators. No state, no I/O; callers are responsible for supplying enough history
//! for the values to be meaningful.

/// Exponential moving average, seeded with the first element. Output has the same length as the input.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
	if values.is_empty() {
		return Vec::new();
	}
	let alpha = 2.0 / (period as f64 + 1.0);
	let mut out = Vec::with_capacity(values.len());
	let mut prev = values[0];
	out.push(prev);
	for value in &values[1..] {
		prev = alpha * value + (1.0 - alpha) * prev;
		out.push(prev);
	}
	out
}

/// True range series. At index 0 the previous close is taken to be the current close, so TR0 = high0 - low0.
pub fn true_ranges(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
	let mut trs = Vec::with_capacity(highs.len());
	for i in 0..highs.len() {
		let prev_close = if i > 0 { closes[i - 1] } else { closes[i] };
		let tr = (highs[i] - lows[i]).max((highs[i] - prev_close).abs()).max((lows[i] - prev_close).abs());
		trs.push(tr);
	}
	trs
}

/// Average true range: EMA of true ranges with the same period.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
	ema(&true_ranges(highs, lows, closes), period)
}
