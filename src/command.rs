use crate::market::MarketUpdate;

/// Events published by background tasks; the view subscribes and is the only
/// writer of UI state. Chat replies travel on their own channel so a lagging
/// subscriber cannot lose them.
#[derive(Debug, Clone)]
pub enum Command {
    MarketLoading(u64),
    MarketData(MarketUpdate),
    Error(String),
    Exit,
}
