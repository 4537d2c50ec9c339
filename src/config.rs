use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use chrono_tz::Tz;
use clap::Parser;

pub const DEFAULT_SYMBOLS: [&str; 7] = ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA", "META", "NVDA"];
const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MARKET_ENDPOINT: &str = "https://query1.finance.yahoo.com";

#[derive(Parser, Clone, Debug)]
#[clap(name = "stocksense", about = "Personal finance dashboard for the terminal")]
pub struct CliParams {
    /// Symbols offered in the market picker; comma separated or pass multiple times
    #[clap(
        short = 's',
        long = "symbol",
        value_delimiter = ',',
        num_args = 1..,
        default_values_t = DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    )]
    pub symbols: Vec<String>,

    /// Gemini API key used by the financial assistant
    #[clap(long = "gemini-api-key", env = "GEMINI_API_KEY")]
    pub gemini_api_key: Option<String>,

    /// Gemini model name for content generation
    #[clap(long = "gemini-model", env = "GEMINI_MODEL", default_value = "gemini-1.5-pro")]
    pub gemini_model: String,

    /// Gemini endpoint base URL
    #[clap(
        long = "gemini-endpoint",
        env = "GEMINI_API_BASE",
        default_value = DEFAULT_GEMINI_ENDPOINT
    )]
    pub gemini_endpoint: String,

    /// Chart API base URL serving OHLCV history
    #[clap(
        long = "market-endpoint",
        env = "MARKET_API_BASE",
        default_value = DEFAULT_MARKET_ENDPOINT
    )]
    pub market_endpoint: String,

    /// History range requested per symbol (e.g., 5d, 1mo, 3mo)
    #[clap(long = "range", default_value = "1mo")]
    pub range: String,

    /// Bar interval requested per symbol (e.g., 1d, 1h, 15m)
    #[clap(long = "interval", default_value = "1d")]
    pub interval: String,

    /// Delay between market refreshes (e.g., 30s, 5m, 1h)
    #[clap(long = "poll-interval", value_name = "DURATION", default_value = "5m")]
    pub poll_interval: DurationSpec,

    /// File holding the persisted light/dark preference
    #[clap(long = "prefs", default_value = "stocksense_prefs.json")]
    pub prefs_path: PathBuf,

    /// Append-only activity log (JSON lines)
    #[clap(long = "log", default_value = "stocksense_activity.jsonl")]
    pub log_path: PathBuf,

    /// Time zone used for message and chart labels (local, utc, or an IANA name)
    #[clap(long = "timezone", default_value = "local")]
    pub timezone: ConfiguredTimeZone,
}

impl CliParams {
    pub fn symbols(&self) -> Vec<String> {
        normalize_symbols(&self.symbols)
    }

    pub fn gemini_config(&self) -> GeminiConfig {
        let api_key = self
            .gemini_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        let model = match self.gemini_model.trim() {
            "" => "gemini-1.5-pro".to_string(),
            other => other.to_string(),
        };
        GeminiConfig {
            api_key,
            endpoint: normalize_endpoint(&self.gemini_endpoint, DEFAULT_GEMINI_ENDPOINT),
            model,
        }
    }

    pub fn market_config(&self) -> MarketConfig {
        MarketConfig {
            endpoint: normalize_endpoint(&self.market_endpoint, DEFAULT_MARKET_ENDPOINT),
            range: self.range.trim().to_string(),
            interval: self.interval.trim().to_string(),
            poll_interval: self.poll_interval.as_duration(),
        }
    }
}

/// Credential is optional at startup; its absence only fails individual chat requests.
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct MarketConfig {
    pub endpoint: String,
    pub range: String,
    pub interval: String,
    pub poll_interval: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        MarketConfig {
            endpoint: DEFAULT_MARKET_ENDPOINT.to_string(),
            range: "1mo".to_string(),
            interval: "1d".to_string(),
            poll_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DurationSpec(Duration);

impl DurationSpec {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for DurationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration = parse_duration_spec(s)?;
        Ok(DurationSpec(duration))
    }
}

fn parse_duration_spec(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration spec cannot be empty (examples: 30s, 5m, 1h)".to_string());
    }
    let split_idx = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| "duration spec must end with a unit like s, m, h, or d".to_string())?;
    if split_idx == 0 {
        return Err("duration spec must start with a number (examples: 30s, 5m)".to_string());
    }
    let (value_part, unit_part) = trimmed.split_at(split_idx);
    let value: f64 = value_part.parse().map_err(|_| {
        format!("invalid numeric portion `{value_part}` in duration spec `{trimmed}`")
    })?;
    let seconds_multiplier = match unit_part.trim().to_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60.0 * 60.0,
        "d" | "day" | "days" => 60.0 * 60.0 * 24.0,
        other => {
            return Err(format!(
                "unsupported duration unit `{other}` (use s, m, h, or d)"
            ));
        }
    };
    let seconds = value * seconds_multiplier;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("duration must be positive: `{trimmed}`"));
    }
    if seconds > Duration::MAX.as_secs_f64() {
        return Err(format!("duration `{trimmed}` is too large"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConfiguredTimeZone {
    Local,
    Utc,
    Named(Tz),
}

impl ConfiguredTimeZone {
    pub fn format_timestamp(&self, timestamp_ms: i64, fmt: &str) -> Option<String> {
        match self {
            ConfiguredTimeZone::Local => Local
                .timestamp_millis_opt(timestamp_ms)
                .single()
                .map(|dt| dt.format(fmt).to_string()),
            ConfiguredTimeZone::Utc => Utc
                .timestamp_millis_opt(timestamp_ms)
                .single()
                .map(|dt| dt.format(fmt).to_string()),
            ConfiguredTimeZone::Named(tz) => tz
                .timestamp_millis_opt(timestamp_ms)
                .single()
                .map(|dt| dt.format(fmt).to_string()),
        }
    }
}

impl FromStr for ConfiguredTimeZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
            return Ok(ConfiguredTimeZone::Local);
        }
        if trimmed.eq_ignore_ascii_case("utc") {
            return Ok(ConfiguredTimeZone::Utc);
        }
        trimmed
            .parse::<Tz>()
            .map(ConfiguredTimeZone::Named)
            .map_err(|err| format!("unknown time zone `{trimmed}`: {err}"))
    }
}

fn normalize_endpoint(value: &str, fallback: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for raw in symbols {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.is_empty() || normalized.contains(&upper) {
            continue;
        }
        normalized.push(upper);
    }
    if normalized.is_empty() {
        normalized = DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect();
    }
    normalized
}
