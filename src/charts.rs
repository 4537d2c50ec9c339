//! Presentational helpers over validated market points. Nothing here owns
//! state; callers pass the latest points and a palette on every frame.

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

use crate::market::MarketPoint;
use crate::theme::Palette;

const BODY: char = '┃';
const WICK: char = '│';
const VOID: char = ' ';

/// Low/high envelope with a small margin so extremes stay visible.
pub fn price_bounds(points: &[MarketPoint]) -> Option<(f64, f64)> {
    let low = points.iter().map(|p| p.low).fold(f64::INFINITY, f64::min);
    let high = points.iter().map(|p| p.high).fold(f64::NEG_INFINITY, f64::max);
    if !low.is_finite() || !high.is_finite() {
        return None;
    }
    if (high - low).abs() < f64::EPSILON {
        let padding = (high.abs() * 0.05).max(1.0);
        return Some((low - padding, high + padding));
    }
    let margin = (high - low) * 0.02;
    Some((low - margin, high + margin))
}

/// Close prices as chart coordinates, x being the point index.
pub fn close_series(points: &[MarketPoint]) -> Vec<(f64, f64)> {
    points
        .iter()
        .enumerate()
        .map(|(idx, point)| (idx as f64, point.close))
        .collect()
}

pub fn is_bullish(point: &MarketPoint) -> bool {
    point.close >= point.open
}

fn overlaps(a_low: f64, a_high: f64, b_low: f64, b_high: f64) -> bool {
    a_low <= b_high && b_low <= a_high
}

/// Glyph for one candle in one row; row 0 is the top of the plot.
pub fn candle_glyph(point: &MarketPoint, row: usize, height: usize, bounds: (f64, f64)) -> char {
    if height == 0 {
        return VOID;
    }
    let (min, max) = bounds;
    let step = (max - min) / height as f64;
    let cell_high = max - row as f64 * step;
    let cell_low = cell_high - step;
    let body_low = point.open.min(point.close);
    let body_high = point.open.max(point.close);
    if overlaps(body_low, body_high, cell_low, cell_high) {
        BODY
    } else if overlaps(point.low, point.high, cell_low, cell_high) {
        WICK
    } else {
        VOID
    }
}

/// Renders the most recent candles that fit into `width` columns.
pub fn candlestick_lines(
    points: &[MarketPoint],
    width: usize,
    height: usize,
    palette: &Palette,
) -> Vec<Line<'static>> {
    let visible = &points[points.len().saturating_sub(width)..];
    let Some(bounds) = price_bounds(visible) else {
        return Vec::new();
    };
    (0..height)
        .map(|row| {
            let spans: Vec<Span<'static>> = visible
                .iter()
                .map(|point| {
                    let color = if is_bullish(point) {
                        palette.bullish
                    } else {
                        palette.bearish
                    };
                    Span::styled(
                        candle_glyph(point, row, height, bounds).to_string(),
                        Style::default().fg(color),
                    )
                })
                .collect();
            Line::from(spans)
        })
        .collect()
}

/// Detail lines for the highlighted point.
pub fn point_detail_lines(point: &MarketPoint, palette: &Palette) -> Vec<Line<'static>> {
    let row = |label: &str, value: String, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<7}"), Style::default().fg(palette.text_secondary)),
            Span::styled(value, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        ])
    };
    vec![
        row("Time", point.label.clone(), palette.text),
        row("Open", format!("${:.2}", point.open), palette.primary),
        row("High", format!("${:.2}", point.high), palette.secondary),
        row("Low", format!("${:.2}", point.low), palette.secondary),
        row("Close", format!("${:.2}", point.close), palette.error),
        row("Volume", group_thousands(point.volume), palette.text_secondary),
    ]
}

pub fn group_thousands(value: f64) -> String {
    if !value.is_finite() {
        return "-".to_string();
    }
    let rounded = value.round() as i128;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}
