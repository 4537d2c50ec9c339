mod activity_log;
mod charts;
mod chat;
mod clipboard;
mod command;
mod config;
mod gemini;
mod market;
mod markup;
mod preferences;
mod theme;
mod tui;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::sync::broadcast;

use crate::activity_log::ActivityLog;
use crate::clipboard::SystemClipboard;
use crate::command::Command;
use crate::gemini::GeminiClient;
use crate::market::MarketDataFetcher;
use crate::preferences::Preferences;
use crate::tui::{Services, TuiApp};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let param = config::CliParams::parse();
    let (tx, mut rx) = broadcast::channel::<Command>(64);

    let log = ActivityLog::new(param.log_path.clone());
    let preferences = match Preferences::load_or_default(&param.prefs_path) {
        Ok(preferences) => preferences,
        Err(err) => {
            let _ = log.warn(format!("ignoring unreadable preferences: {err:#}"));
            Preferences::reset_at(&param.prefs_path)
        }
    };

    let gemini_config = param.gemini_config();
    let model = GeminiClient::new(&gemini_config).context("failed to build Gemini client")?;
    if !model.has_credential() {
        let _ = log.warn("GEMINI_API_KEY is not set; assistant requests will fail");
    }
    let market_config = param.market_config();
    let poll_interval = market_config.poll_interval;
    let fetcher = MarketDataFetcher::new(market_config, param.timezone, log.clone(), tx.clone())
        .context("failed to build market data client")?;

    let services = Services {
        model: Arc::new(model),
        source: Arc::new(fetcher),
        clipboard: Box::new(SystemClipboard::new()),
        log,
        tx: tx.clone(),
    };
    let mut app = TuiApp::new(
        param.symbols(),
        preferences,
        poll_interval,
        param.timezone,
        services,
    );
    let app_result = tokio::select! {
        result = app.run(&mut rx) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    let _ = tx.send(Command::Exit);
    app.dispose();
    app_result.map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}
