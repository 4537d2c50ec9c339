use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use reqwest::{Client, ClientBuilder, Url};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

use crate::activity_log::ActivityLog;
use crate::command::Command;
use crate::config::{ConfiguredTimeZone, MarketConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct MarketPoint {
    pub label: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("market api error: {0}")]
    Api(String),
    #[error("unexpected payload: {0}")]
    Schema(String),
}

/// One unvalidated record as delivered by the quote service.
#[derive(Debug, Clone)]
struct RawRecord {
    label: Option<String>,
    timestamp: Option<i64>,
    open: Value,
    high: Value,
    low: Value,
    close: Value,
    volume: Value,
}

impl RawRecord {
    fn is_valid(&self) -> bool {
        [&self.open, &self.high, &self.low, &self.close, &self.volume]
            .iter()
            .all(|value| value.is_number())
    }

    fn validate(self, timezone: ConfiguredTimeZone, label_format: &str) -> Option<MarketPoint> {
        let open = self.open.as_f64()?;
        let high = self.high.as_f64()?;
        let low = self.low.as_f64()?;
        let close = self.close.as_f64()?;
        let volume = self.volume.as_f64()?;
        let label = self
            .label
            .or_else(|| {
                self.timestamp
                    .and_then(|ts| timezone.format_timestamp(ts.saturating_mul(1_000), label_format))
            })
            .unwrap_or_else(|| "--".to_string());
        Some(MarketPoint {
            label,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

/// Lazily yields the records that carry all five numeric fields.
pub struct ValidatedPoints {
    records: std::vec::IntoIter<RawRecord>,
    timezone: ConfiguredTimeZone,
    label_format: &'static str,
}

impl ValidatedPoints {
    pub fn empty() -> Self {
        ValidatedPoints {
            records: Vec::new().into_iter(),
            timezone: ConfiguredTimeZone::Local,
            label_format: DAILY_LABEL_FORMAT,
        }
    }

    fn new(records: Vec<RawRecord>, timezone: ConfiguredTimeZone, label_format: &'static str) -> Self {
        ValidatedPoints {
            records: records.into_iter(),
            timezone,
            label_format,
        }
    }
}

impl Iterator for ValidatedPoints {
    type Item = MarketPoint;

    fn next(&mut self) -> Option<MarketPoint> {
        for record in self.records.by_ref() {
            if let Some(point) = record.validate(self.timezone, self.label_format) {
                return Some(point);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.records.size_hint().1)
    }
}

const DAILY_LABEL_FORMAT: &str = "%Y-%m-%d";
const INTRADAY_LABEL_FORMAT: &str = "%m-%d %H:%M";

fn label_format_for(interval: &str) -> &'static str {
    let lower = interval.trim().to_ascii_lowercase();
    if lower.ends_with('d') || lower.ends_with("wk") || lower.ends_with("mo") {
        DAILY_LABEL_FORMAT
    } else {
        INTRADAY_LABEL_FORMAT
    }
}

/// Accepts either a plain array of OHLCV objects or a column-oriented chart
/// envelope (`chart.result[0].indicators.quote[0]`).
fn parse_payload(payload: Value) -> Result<Vec<RawRecord>, MarketError> {
    match payload {
        Value::Array(items) => Ok(items.into_iter().map(record_from_object).collect()),
        Value::Object(mut root) => {
            let chart = root
                .remove("chart")
                .ok_or_else(|| MarketError::Schema("missing `chart` object".to_string()))?;
            if let Some(error) = chart.get("error").filter(|error| !error.is_null()) {
                let description = error
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(MarketError::Api(description));
            }
            let result = chart
                .get("result")
                .and_then(|result| result.get(0))
                .ok_or_else(|| MarketError::Schema("missing `chart.result[0]`".to_string()))?;
            records_from_columns(result)
        }
        other => Err(MarketError::Schema(format!(
            "expected array or object, got {}",
            json_kind(&other)
        ))),
    }
}

fn record_from_object(item: Value) -> RawRecord {
    let field = |name: &str| item.get(name).cloned().unwrap_or(Value::Null);
    let label = ["name", "label", "date"]
        .iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    RawRecord {
        label,
        timestamp: item.get("timestamp").and_then(Value::as_i64),
        open: field("open"),
        high: field("high"),
        low: field("low"),
        close: field("close"),
        volume: field("volume"),
    }
}

fn records_from_columns(result: &Value) -> Result<Vec<RawRecord>, MarketError> {
    let timestamps = result
        .get("timestamp")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let quote = result
        .get("indicators")
        .and_then(|indicators| indicators.get("quote"))
        .and_then(|quote| quote.get(0))
        .ok_or_else(|| MarketError::Schema("missing `indicators.quote[0]`".to_string()))?;
    let column = |name: &str| -> Vec<Value> {
        quote
            .get(name)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let (open, high, low, close, volume) = (
        column("open"),
        column("high"),
        column("low"),
        column("close"),
        column("volume"),
    );
    let len = [timestamps.len(), open.len(), high.len(), low.len(), close.len(), volume.len()]
        .into_iter()
        .max()
        .unwrap_or(0);
    let at = |values: &[Value], idx: usize| values.get(idx).cloned().unwrap_or(Value::Null);
    Ok((0..len)
        .map(|idx| RawRecord {
            label: None,
            timestamp: timestamps.get(idx).and_then(Value::as_i64),
            open: at(&open, idx),
            high: at(&high, idx),
            low: at(&low, idx),
            close: at(&close, idx),
            volume: at(&volume, idx),
        })
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Source of validated points for a symbol. Never fails: problems yield an
/// empty sequence.
pub trait PointSource: Send + Sync {
    fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ValidatedPoints>;
}

pub struct MarketDataFetcher {
    http: Client,
    config: MarketConfig,
    timezone: ConfiguredTimeZone,
    log: ActivityLog,
    tx: broadcast::Sender<Command>,
}

impl MarketDataFetcher {
    pub fn new(
        config: MarketConfig,
        timezone: ConfiguredTimeZone,
        log: ActivityLog,
        tx: broadcast::Sender<Command>,
    ) -> anyhow::Result<Self> {
        let http = ClientBuilder::new()
            .user_agent(concat!("stocksense/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .read_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(MarketDataFetcher {
            http,
            config,
            timezone,
            log,
            tx,
        })
    }

    fn emit_error(&self, message: String) {
        let _ = self.log.error(message.clone());
        let _ = self.tx.send(Command::Error(message));
    }

    fn chart_url(&self, symbol: &str) -> Result<Url, MarketError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|err| MarketError::Endpoint(format!("{}: {err}", self.config.endpoint)))?;
        url.path_segments_mut()
            .map_err(|_| MarketError::Endpoint(self.config.endpoint.clone()))?
            .pop_if_empty()
            .extend(["v8", "finance", "chart", symbol]);
        Ok(url)
    }

    async fn request_records(&self, symbol: &str) -> Result<Vec<RawRecord>, MarketError> {
        let url = self.chart_url(symbol)?;
        let payload: Value = self
            .http
            .get(url)
            .query(&[
                ("range", self.config.range.as_str()),
                ("interval", self.config.interval.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_payload(payload)
    }

    pub async fn fetch(&self, symbol: &str) -> ValidatedPoints {
        let records = match self.request_records(symbol).await {
            Ok(records) => records,
            Err(err) => {
                self.emit_error(format!("failed to load market data for {symbol}: {err}"));
                return ValidatedPoints::empty();
            }
        };
        if !records.iter().any(RawRecord::is_valid) {
            let message = format!("no valid data points found for {symbol}");
            let _ = self.log.warn(message.clone());
            let _ = self.tx.send(Command::Error(message));
        }
        ValidatedPoints::new(records, self.timezone, label_format_for(&self.config.interval))
    }
}

impl PointSource for MarketDataFetcher {
    fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ValidatedPoints> {
        Box::pin(MarketDataFetcher::fetch(self, symbol))
    }
}

/// Snapshot behind the gain/loss figure.
#[derive(Debug, Clone, PartialEq)]
pub struct StockSelection {
    pub symbol: String,
    pub start_price: Option<f64>,
    pub current_price: Option<f64>,
}

impl StockSelection {
    pub fn from_points(symbol: &str, points: &[MarketPoint]) -> Option<Self> {
        let first = points.first()?;
        let last = points.last()?;
        Some(StockSelection {
            symbol: symbol.to_string(),
            start_price: Some(first.close),
            current_price: Some(last.close),
        })
    }

    pub fn change_label(&self) -> String {
        percent_change_label(self.start_price, self.current_price)
    }
}

pub fn percent_change_label(start: Option<f64>, current: Option<f64>) -> String {
    let (Some(start), Some(current)) = (start, current) else {
        return "0.00".to_string();
    };
    if start == 0.0 || current == 0.0 {
        return "0.00".to_string();
    }
    let change = (current - start) / start.abs() * 100.0;
    if !change.is_finite() {
        return "0.00".to_string();
    }
    let sign = if change >= 0.0 { "+" } else { "" };
    format!("{sign}{change:.2}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketRequest {
    pub symbol: String,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct MarketUpdate {
    pub generation: u64,
    pub symbol: String,
    pub points: Vec<MarketPoint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchPhase {
    Idle,
    Loading,
}

/// View-side market state. Only results for the latest selection are applied.
pub struct MarketState {
    selected: String,
    generation: u64,
    phase: FetchPhase,
    points: Vec<MarketPoint>,
    selection: Option<StockSelection>,
    last_updated: Option<DateTime<Local>>,
}

impl MarketState {
    pub fn new(symbol: &str) -> Self {
        MarketState {
            selected: symbol.to_string(),
            generation: 0,
            phase: FetchPhase::Idle,
            points: Vec::new(),
            selection: None,
            last_updated: None,
        }
    }

    pub fn selected(&self) -> &str {
        &self.selected
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub fn points(&self) -> &[MarketPoint] {
        &self.points
    }

    pub fn selection(&self) -> Option<&StockSelection> {
        self.selection.as_ref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Local>> {
        self.last_updated
    }

    pub fn change_label(&self) -> String {
        self.selection
            .as_ref()
            .map(StockSelection::change_label)
            .unwrap_or_else(|| "0.00".to_string())
    }

    /// Starts a new generation for `symbol` and returns the request for the poller.
    pub fn select(&mut self, symbol: &str) -> MarketRequest {
        self.generation += 1;
        self.selected = symbol.to_string();
        self.clear_for_loading();
        MarketRequest {
            symbol: self.selected.clone(),
            generation: self.generation,
        }
    }

    pub fn begin_loading(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.clear_for_loading();
        true
    }

    pub fn apply(&mut self, update: MarketUpdate) -> bool {
        if update.generation != self.generation || update.symbol != self.selected {
            return false;
        }
        self.phase = FetchPhase::Idle;
        self.selection = StockSelection::from_points(&update.symbol, &update.points);
        self.points = update.points;
        self.last_updated = Some(Local::now());
        true
    }

    /// Detaches the state from any running poller. Late results for the
    /// current generation are ignored and an unfinished fetch stops showing
    /// as loading. Points already shown are kept.
    pub fn suspend(&mut self) {
        self.generation += 1;
        self.phase = FetchPhase::Idle;
    }

    fn clear_for_loading(&mut self) {
        self.phase = FetchPhase::Loading;
        self.points.clear();
        self.selection = None;
    }
}

enum PollStep {
    Fetched(Vec<MarketPoint>),
    Superseded(MarketRequest),
    Closed,
}

/// Refetches the current selection on a fixed interval and immediately on
/// every new selection. A newer selection drops the in-flight fetch.
pub struct MarketPoller {
    source: Arc<dyn PointSource>,
    rx: mpsc::Receiver<MarketRequest>,
    tx: broadcast::Sender<Command>,
    interval: Duration,
}

impl MarketPoller {
    pub fn spawn(
        source: Arc<dyn PointSource>,
        tx: broadcast::Sender<Command>,
        interval: Duration,
        initial: MarketRequest,
    ) -> PollerHandle {
        let (request_tx, rx) = mpsc::channel(8);
        let poller = MarketPoller {
            source,
            rx,
            tx,
            interval,
        };
        let task = tokio::spawn(poller.run(initial));
        PollerHandle { request_tx, task }
    }

    async fn run(mut self, initial: MarketRequest) {
        let mut current = initial;
        loop {
            let _ = self.tx.send(Command::MarketLoading(current.generation));
            let source = Arc::clone(&self.source);
            let symbol = current.symbol.clone();
            let step = tokio::select! {
                points = source.fetch(&symbol) => PollStep::Fetched(points.collect()),
                request = self.rx.recv() => match request {
                    Some(next) => PollStep::Superseded(next),
                    None => PollStep::Closed,
                },
            };
            match step {
                PollStep::Fetched(points) => {
                    let _ = self.tx.send(Command::MarketData(MarketUpdate {
                        generation: current.generation,
                        symbol,
                        points,
                    }));
                }
                PollStep::Superseded(next) => {
                    current = next;
                    continue;
                }
                PollStep::Closed => return,
            }
            tokio::select! {
                _ = time::sleep(self.interval) => {}
                request = self.rx.recv() => match request {
                    Some(next) => current = next,
                    None => return,
                },
            }
        }
    }
}

/// Owning handle for a running poller. Dropping it stops polling.
pub struct PollerHandle {
    request_tx: mpsc::Sender<MarketRequest>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn request(&self, request: MarketRequest) -> bool {
        self.request_tx.try_send(request).is_ok()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::activity_log::LogLevel;

    fn points_from(payload: Value) -> Vec<MarketPoint> {
        let records = parse_payload(payload).unwrap();
        ValidatedPoints::new(records, ConfiguredTimeZone::Utc, DAILY_LABEL_FORMAT).collect()
    }

    fn point(label: &str, close: f64) -> MarketPoint {
        MarketPoint {
            label: label.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn percent_change_formats_sign_and_guards_zero() {
        assert_eq!(percent_change_label(Some(100.0), Some(110.0)), "+10.00");
        assert_eq!(percent_change_label(Some(100.0), Some(95.0)), "-5.00");
        assert_eq!(percent_change_label(Some(100.0), Some(100.0)), "+0.00");
        assert_eq!(percent_change_label(Some(0.0), Some(110.0)), "0.00");
        assert_eq!(percent_change_label(None, Some(110.0)), "0.00");
        assert_eq!(percent_change_label(Some(100.0), None), "0.00");
    }

    #[test]
    fn all_valid_records_yield_same_count() {
        let payload = json!([
            {"name": "Mon", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100},
            {"name": "Tue", "open": 1.5, "high": 2.5, "low": 1.0, "close": 2.0, "volume": 120},
            {"name": "Wed", "open": 2.0, "high": 2.2, "low": 1.8, "close": 1.9, "volume": 90}
        ]);
        let points = points_from(payload);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].label, "Mon");
        assert_eq!(points[2].close, 1.9);
    }

    #[test]
    fn drops_records_missing_a_numeric_field() {
        let payload = json!([
            {"name": "ok", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100},
            {"name": "no-volume", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5},
            {"name": "string-close", "open": 1.0, "high": 2.0, "low": 0.5, "close": "1.5", "volume": 1},
            {"name": "null-open", "open": null, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 1},
            "garbage"
        ]);
        let points = points_from(payload);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].label, "ok");
    }

    #[test]
    fn reads_chart_columns_and_skips_null_rows() {
        let payload = json!({
            "chart": {
                "result": [{
                    "timestamp": [1700000000, 1700086400, 1700172800],
                    "indicators": {"quote": [{
                        "open": [10.0, null, 12.0],
                        "high": [11.0, 12.0, 13.0],
                        "low": [9.0, 10.0, 11.0],
                        "close": [10.5, 11.5, 12.5],
                        "volume": [1000, 1100, 1200]
                    }]}
                }],
                "error": null
            }
        });
        let points = points_from(payload);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "2023-11-14");
        assert_eq!(points[1].close, 12.5);
    }

    #[test]
    fn chart_error_and_schema_mismatch_are_errors() {
        let payload = json!({"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}}});
        assert!(matches!(parse_payload(payload), Err(MarketError::Api(_))));
        assert!(matches!(parse_payload(json!({"foo": 1})), Err(MarketError::Schema(_))));
        assert!(matches!(parse_payload(json!("nope")), Err(MarketError::Schema(_))));
    }

    #[test]
    fn empty_sequence_yields_nothing() {
        assert_eq!(ValidatedPoints::empty().count(), 0);
    }

    #[test]
    fn interval_picks_label_format() {
        assert_eq!(label_format_for("1d"), DAILY_LABEL_FORMAT);
        assert_eq!(label_format_for("1wk"), DAILY_LABEL_FORMAT);
        assert_eq!(label_format_for("15m"), INTRADAY_LABEL_FORMAT);
    }

    #[test]
    fn chart_url_appends_symbol_path() {
        let (tx, _rx) = broadcast::channel(4);
        let config = MarketConfig {
            endpoint: "https://example.com/api/".to_string(),
            ..MarketConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MarketDataFetcher::new(
            config,
            ConfiguredTimeZone::Utc,
            ActivityLog::new(dir.path().join("log.jsonl")),
            tx,
        )
        .unwrap();
        let url = fetcher.chart_url("BRK.B").unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/v8/finance/chart/BRK.B");
    }

    #[test]
    fn selection_tracks_first_and_last_close() {
        let points = vec![point("a", 100.0), point("b", 105.0), point("c", 110.0)];
        let selection = StockSelection::from_points("AAPL", &points).unwrap();
        assert_eq!(selection.start_price, Some(100.0));
        assert_eq!(selection.current_price, Some(110.0));
        assert_eq!(selection.change_label(), "+10.00");
        assert!(StockSelection::from_points("AAPL", &[]).is_none());
    }

    #[test]
    fn state_cycle_replaces_points() {
        let mut state = MarketState::new("AAPL");
        let request = state.select("AAPL");
        assert_eq!(state.phase(), FetchPhase::Loading);
        assert!(state.apply(MarketUpdate {
            generation: request.generation,
            symbol: "AAPL".to_string(),
            points: vec![point("a", 100.0), point("b", 110.0)],
        }));
        assert_eq!(state.phase(), FetchPhase::Idle);
        assert_eq!(state.points().len(), 2);
        assert_eq!(state.change_label(), "+10.00");

        assert!(state.begin_loading(request.generation));
        assert!(state.points().is_empty());
        assert!(state.selection().is_none());

        assert!(state.apply(MarketUpdate {
            generation: request.generation,
            symbol: "AAPL".to_string(),
            points: vec![point("c", 120.0)],
        }));
        assert_eq!(state.points().len(), 1);
    }

    #[test]
    fn failed_fetch_leaves_state_empty() {
        let mut state = MarketState::new("AAPL");
        let request = state.select("AAPL");
        assert!(state.apply(MarketUpdate {
            generation: request.generation,
            symbol: "AAPL".to_string(),
            points: Vec::new(),
        }));
        assert!(state.points().is_empty());
        assert!(state.selection().is_none());
        assert_eq!(state.change_label(), "0.00");
        assert_eq!(state.phase(), FetchPhase::Idle);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut state = MarketState::new("AAPL");
        let first = state.select("AAPL");
        let second = state.select("MSFT");
        assert!(!state.begin_loading(first.generation));
        assert!(!state.apply(MarketUpdate {
            generation: first.generation,
            symbol: "AAPL".to_string(),
            points: vec![point("a", 1.0)],
        }));
        assert!(state.points().is_empty());
        assert_eq!(state.selected(), "MSFT");
        assert!(state.apply(MarketUpdate {
            generation: second.generation,
            symbol: "MSFT".to_string(),
            points: vec![point("m", 2.0)],
        }));
        assert_eq!(state.points()[0].label, "m");
    }

    #[test]
    fn suspend_stops_loading_and_ignores_late_results() {
        let mut state = MarketState::new("AAPL");
        let first = state.select("AAPL");
        assert!(state.apply(MarketUpdate {
            generation: first.generation,
            symbol: "AAPL".to_string(),
            points: vec![point("a", 100.0)],
        }));
        assert!(state.begin_loading(first.generation));
        assert_eq!(state.phase(), FetchPhase::Loading);

        state.suspend();
        assert_eq!(state.phase(), FetchPhase::Idle);
        assert!(!state.begin_loading(first.generation));
        assert!(!state.apply(MarketUpdate {
            generation: first.generation,
            symbol: "AAPL".to_string(),
            points: vec![point("late", 1.0)],
        }));
        assert_eq!(state.phase(), FetchPhase::Idle);

        let next = state.select("AAPL");
        assert!(next.generation > first.generation);
        assert_eq!(state.phase(), FetchPhase::Loading);
    }

    fn fetcher_for(
        endpoint: &str,
        dir: &tempfile::TempDir,
    ) -> (MarketDataFetcher, broadcast::Receiver<Command>, ActivityLog) {
        let (tx, rx) = broadcast::channel(16);
        let log = ActivityLog::new(dir.path().join("activity.jsonl"));
        let config = MarketConfig {
            endpoint: endpoint.to_string(),
            ..MarketConfig::default()
        };
        let fetcher = MarketDataFetcher::new(config, ConfiguredTimeZone::Utc, log.clone(), tx).unwrap();
        (fetcher, rx, log)
    }

    /// Answers a single HTTP request with `body` and returns the endpoint URL.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_empty_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, mut rx, log) = fetcher_for("http://127.0.0.1:9/", &dir);

        assert_eq!(fetcher.fetch("AAPL").await.count(), 0);

        match rx.try_recv().unwrap() {
            Command::Error(message) => assert!(message.contains("AAPL"), "{message}"),
            other => panic!("unexpected command: {other:?}"),
        }
        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert!(entries[0].message.starts_with("failed to load market data for AAPL"));
    }

    #[tokio::test]
    async fn all_invalid_records_log_a_warning() {
        let endpoint = serve_once(
            r#"[{"name": "Mon", "open": null, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100}]"#,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let (fetcher, mut rx, log) = fetcher_for(&endpoint, &dir);

        assert_eq!(fetcher.fetch("AAPL").await.count(), 0);

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].message, "no valid data points found for AAPL");
        assert!(matches!(rx.try_recv(), Ok(Command::Error(_))));
    }

    struct FakeSource;

    impl PointSource for FakeSource {
        fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ValidatedPoints> {
            Box::pin(async move {
                if symbol == "SLOW" {
                    time::sleep(Duration::from_secs(30)).await;
                }
                let record = RawRecord {
                    label: Some(symbol.to_string()),
                    timestamp: None,
                    open: json!(1.0),
                    high: json!(2.0),
                    low: json!(0.5),
                    close: json!(1.5),
                    volume: json!(10),
                };
                ValidatedPoints::new(vec![record], ConfiguredTimeZone::Utc, DAILY_LABEL_FORMAT)
            })
        }
    }

    async fn next_data(rx: &mut broadcast::Receiver<Command>) -> MarketUpdate {
        loop {
            match rx.recv().await.unwrap() {
                Command::MarketData(update) => return update,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn poller_fetches_initial_selection() {
        let (tx, mut rx) = broadcast::channel(16);
        let request = MarketRequest {
            symbol: "AAPL".to_string(),
            generation: 1,
        };
        let _handle = MarketPoller::spawn(Arc::new(FakeSource), tx, Duration::from_secs(3_600), request);
        match rx.recv().await.unwrap() {
            Command::MarketLoading(generation) => assert_eq!(generation, 1),
            other => panic!("unexpected command: {other:?}"),
        }
        let update = time::timeout(Duration::from_secs(5), next_data(&mut rx))
            .await
            .unwrap();
        assert_eq!(update.generation, 1);
        assert_eq!(update.points.len(), 1);
        assert_eq!(update.points[0].label, "AAPL");
    }

    #[tokio::test]
    async fn newer_selection_cancels_in_flight_fetch() {
        let (tx, mut rx) = broadcast::channel(16);
        let handle = MarketPoller::spawn(
            Arc::new(FakeSource),
            tx,
            Duration::from_secs(3_600),
            MarketRequest {
                symbol: "SLOW".to_string(),
                generation: 1,
            },
        );
        assert!(handle.request(MarketRequest {
            symbol: "FAST".to_string(),
            generation: 2,
        }));
        let update = time::timeout(Duration::from_secs(5), next_data(&mut rx))
            .await
            .unwrap();
        assert_eq!(update.generation, 2);
        assert_eq!(update.symbol, "FAST");
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl PointSource for CountingSource {
        fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ValidatedPoints> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let record = RawRecord {
                    label: Some(format!("{symbol}-{call}")),
                    timestamp: None,
                    open: json!(1.0),
                    high: json!(2.0),
                    low: json!(0.5),
                    close: json!(1.5),
                    volume: json!(10),
                };
                ValidatedPoints::new(vec![record], ConfiguredTimeZone::Utc, DAILY_LABEL_FORMAT)
            })
        }
    }

    #[tokio::test]
    async fn poller_refetches_after_interval() {
        let (tx, mut rx) = broadcast::channel(16);
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let _handle = MarketPoller::spawn(
            source.clone(),
            tx,
            Duration::from_millis(20),
            MarketRequest {
                symbol: "AAPL".to_string(),
                generation: 7,
            },
        );
        for expected in ["AAPL-1", "AAPL-2", "AAPL-3"] {
            let update = time::timeout(Duration::from_secs(5), next_data(&mut rx))
                .await
                .unwrap();
            assert_eq!(update.generation, 7);
            assert_eq!(update.points[0].label, expected);
        }
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn dropping_handle_stops_polling() {
        let (tx, mut rx) = broadcast::channel(16);
        let handle = MarketPoller::spawn(
            Arc::new(FakeSource),
            tx.clone(),
            Duration::from_millis(10),
            MarketRequest {
                symbol: "AAPL".to_string(),
                generation: 1,
            },
        );
        time::timeout(Duration::from_secs(5), next_data(&mut rx))
            .await
            .unwrap();
        drop(handle);
        time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
