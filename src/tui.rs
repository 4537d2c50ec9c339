use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::{DefaultTerminal, Frame};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::GraphType;
use ratatui::widgets::{Axis, Block, Chart, Clear, Dataset, Paragraph, Tabs, Wrap};
use tokio::sync::{broadcast, mpsc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::activity_log::{ActivityLog, ActivityLogEntry, LogLevel};
use crate::charts;
use crate::chat::{ChatError, ChatSession, Completion, LanguageModel, Role, SendRejected};
use crate::clipboard::Clipboard;
use crate::command::Command;
use crate::config::ConfiguredTimeZone;
use crate::market::{FetchPhase, MarketPoller, MarketState, PointSource, PollerHandle};
use crate::markup::parse_emphasis;
use crate::preferences::Preferences;
use crate::theme::Palette;

const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const SYMBOL_COLUMN_WIDTH: usize = 10;
const DETAIL_PANEL_WIDTH: u16 = 26;
const MAX_SYMBOL_LEN: usize = 12;
const RECENT_ACTIVITY_LIMIT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tab {
    Overview,
    Markets,
    Assistant,
}

impl Tab {
    const ALL: [Tab; 3] = [Tab::Overview, Tab::Markets, Tab::Assistant];

    fn title(self) -> &'static str {
        match self {
            Tab::Overview => "Overview",
            Tab::Markets => "Markets",
            Tab::Assistant => "Assistant",
        }
    }

    fn index(self) -> usize {
        Tab::ALL.iter().position(|tab| *tab == self).unwrap_or(0)
    }

    fn cycle(self, reverse: bool) -> Tab {
        let len = Tab::ALL.len();
        let idx = if reverse {
            (self.index() + len - 1) % len
        } else {
            (self.index() + 1) % len
        };
        Tab::ALL[idx]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChartMode {
    Close,
    Candles,
}

impl ChartMode {
    fn label(self) -> &'static str {
        match self {
            ChartMode::Close => "close price",
            ChartMode::Candles => "candlesticks",
        }
    }
}

struct ChatReply {
    epoch: u64,
    result: Result<String, ChatError>,
}

enum InputOutcome {
    Idle,
    Changed,
    Exit,
}

/// Collaborators the view talks to; everything behind a trait can be faked in tests.
pub struct Services {
    pub model: Arc<dyn LanguageModel>,
    pub source: Arc<dyn PointSource>,
    pub clipboard: Box<dyn Clipboard>,
    pub log: ActivityLog,
    pub tx: broadcast::Sender<Command>,
}

struct MarketView {
    symbols: Vec<String>,
    selected_idx: usize,
    state: MarketState,
    poller: Option<PollerHandle>,
    chart_mode: ChartMode,
    cursor: Option<usize>,
    symbol_input: Option<String>,
}

impl MarketView {
    fn new(symbols: Vec<String>) -> Self {
        let first = symbols.first().cloned().unwrap_or_default();
        MarketView {
            symbols,
            selected_idx: 0,
            state: MarketState::new(&first),
            poller: None,
            chart_mode: ChartMode::Close,
            cursor: None,
            symbol_input: None,
        }
    }

    fn selected_symbol(&self) -> &str {
        self.symbols
            .get(self.selected_idx)
            .map(String::as_str)
            .unwrap_or_else(|| self.state.selected())
    }

    fn cursor_index(&self) -> Option<usize> {
        let len = self.state.points().len();
        if len == 0 {
            return None;
        }
        Some(self.cursor.map(|idx| clamp_index(idx, len)).unwrap_or(len - 1))
    }

    fn move_cursor(&mut self, delta: isize) {
        let len = self.state.points().len();
        let Some(current) = self.cursor_index() else {
            return;
        };
        let next = current as isize + delta;
        self.cursor = if next >= len as isize {
            None
        } else {
            Some(next.max(0) as usize)
        };
    }
}

struct AssistantView {
    session: ChatSession,
    input: String,
    selected_message: Option<usize>,
    reset_confirmation: bool,
    rendered_rows: usize,
    view_height: usize,
}

impl AssistantView {
    fn new() -> Self {
        AssistantView {
            session: ChatSession::new(),
            input: String::new(),
            selected_message: None,
            reset_confirmation: false,
            rendered_rows: 0,
            view_height: 0,
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let len = self.session.messages().len();
        if len == 0 {
            self.selected_message = None;
            return;
        }
        self.selected_message = match (self.selected_message, delta < 0) {
            (None, true) => Some(len - 1),
            (None, false) => None,
            (Some(idx), true) => Some(idx.saturating_sub(1)),
            (Some(idx), false) if idx + 1 < len => Some(idx + 1),
            (Some(_), false) => None,
        };
    }

    fn copy_target(&self) -> Option<usize> {
        let messages = self.session.messages();
        self.selected_message
            .filter(|idx| {
                messages
                    .get(*idx)
                    .is_some_and(|message| message.role == Role::Assistant)
            })
            .or_else(|| {
                messages
                    .iter()
                    .rposition(|message| message.role == Role::Assistant)
            })
    }

    fn max_scroll(&self) -> usize {
        self.rendered_rows.saturating_sub(self.view_height)
    }
}

pub struct TuiApp {
    tab: Tab,
    market: MarketView,
    assistant: AssistantView,
    services: Services,
    reply_tx: mpsc::UnboundedSender<ChatReply>,
    reply_rx: Option<mpsc::UnboundedReceiver<ChatReply>>,
    recent_activity: Vec<ActivityLogEntry>,
    poll_interval: Duration,
    preferences: Preferences,
    palette: Palette,
    timezone: ConfiguredTimeZone,
    status_message: Option<String>,
    status_visible_until: Option<Instant>,
    status_is_error: bool,
    exit_confirmation: bool,
    spinner_index: usize,
    last_draw: Instant,
    min_redraw_gap: Duration,
}

impl TuiApp {
    pub fn new(
        symbols: Vec<String>,
        preferences: Preferences,
        poll_interval: Duration,
        timezone: ConfiguredTimeZone,
        services: Services,
    ) -> TuiApp {
        let min_redraw_gap = Duration::from_millis(100);
        let palette = Palette::for_mode(preferences.theme_mode());
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut app = TuiApp {
            tab: Tab::Overview,
            market: MarketView::new(symbols),
            assistant: AssistantView::new(),
            services,
            reply_tx,
            reply_rx: Some(reply_rx),
            recent_activity: Vec::new(),
            poll_interval,
            preferences,
            palette,
            timezone,
            status_message: None,
            status_visible_until: None,
            status_is_error: false,
            exit_confirmation: false,
            spinner_index: 0,
            last_draw: Instant::now() - min_redraw_gap,
            min_redraw_gap,
        };
        app.refresh_recent_activity();
        app
    }

    fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(3));
        self.status_is_error = false;
    }

    fn set_error_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.status_visible_until = Some(Instant::now() + Duration::from_secs(5));
        self.status_is_error = true;
    }

    fn clear_status_if_allowed(&mut self, now: Instant) -> bool {
        match self.status_visible_until {
            Some(visible_until) if now < visible_until => false,
            _ if self.status_message.is_none() => false,
            _ => {
                self.status_message = None;
                self.status_visible_until = None;
                self.status_is_error = false;
                true
            }
        }
    }

    fn log_error(&mut self, message: String) {
        if let Err(err) = self.services.log.error(message.clone()) {
            self.set_error_status_message(format!("{message} (activity log unavailable: {err})"));
        } else {
            self.set_error_status_message(message);
            self.refresh_recent_activity();
        }
    }

    /// Reloads the Overview's activity list. An unreadable log keeps the previous list.
    fn refresh_recent_activity(&mut self) {
        if let Ok(entries) = self.services.log.recent(RECENT_ACTIVITY_LIMIT) {
            self.recent_activity = entries;
        }
    }

    pub fn dispose(&self) {
        ratatui::restore();
    }

    pub async fn run(&mut self, rx: &mut broadcast::Receiver<Command>) -> Result<()> {
        color_eyre::install()?;
        let mut replies = self
            .reply_rx
            .take()
            .ok_or_else(|| eyre!("chat reply channel is already in use"))?;
        let mut terminal = ratatui::init();
        let result = self.event_loop(&mut terminal, rx, &mut replies).await;
        self.reply_rx = Some(replies);
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut DefaultTerminal,
        rx: &mut broadcast::Receiver<Command>,
        replies: &mut mpsc::UnboundedReceiver<ChatReply>,
    ) -> Result<()> {
        let mut input_tick = tokio::time::interval(self.min_redraw_gap);
        terminal.draw(|frame| self.render(frame))?;
        self.last_draw = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = input_tick.tick() => {
                    let mut should_redraw = self.on_frame_tick(Instant::now());
                    match self.poll_input()? {
                        InputOutcome::Exit => return Ok(()),
                        InputOutcome::Changed => should_redraw = true,
                        InputOutcome::Idle => {}
                    }
                    if should_redraw {
                        terminal.draw(|frame| self.render(frame))?;
                        self.last_draw = Instant::now();
                    }
                }
                Some(reply) = replies.recv() => {
                    self.finish_chat_reply(reply);
                    self.draw_if_due(terminal)?;
                }
                result = rx.recv() => {
                    match result {
                        Ok(Command::Exit) => return Ok(()),
                        Ok(command) => {
                            self.handle_command(command);
                            self.draw_if_due(terminal)?;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
        Ok(())
    }

    fn draw_if_due(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        if self.last_draw.elapsed() >= self.min_redraw_gap {
            terminal.draw(|frame| self.render(frame))?;
            self.last_draw = Instant::now();
        }
        Ok(())
    }

    fn on_frame_tick(&mut self, now: Instant) -> bool {
        let mut changed = self.clear_status_if_allowed(now);
        if self.assistant.session.expire_highlights(now) {
            changed = true;
        }
        if self.assistant.session.is_busy() || self.market.state.phase() == FetchPhase::Loading {
            self.spinner_index = (self.spinner_index + 1) % SPINNER_FRAMES.len();
            changed = true;
        }
        changed
    }

    fn spinner(&self) -> char {
        SPINNER_FRAMES[self.spinner_index % SPINNER_FRAMES.len()]
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::MarketLoading(generation) => {
                if self.market.state.begin_loading(generation) {
                    self.market.cursor = None;
                }
            }
            Command::MarketData(update) => {
                if self.market.state.apply(update) {
                    self.market.cursor = None;
                }
            }
            Command::Error(message) => {
                self.set_error_status_message(message);
                self.refresh_recent_activity();
            }
            Command::Exit => {}
        }
    }

    fn finish_chat_reply(&mut self, reply: ChatReply) {
        let completion = self
            .assistant
            .session
            .complete(reply.epoch, reply.result, Instant::now());
        match completion {
            Completion::Replied => {
                if self.tab != Tab::Assistant {
                    self.set_status_message("Vision replied (Assistant tab)");
                }
            }
            Completion::Failed => {
                let detail = self
                    .assistant
                    .session
                    .last_error()
                    .unwrap_or("unknown error")
                    .to_string();
                self.log_error(format!("assistant request failed: {detail}"));
            }
            Completion::Discarded => {}
        }
    }

    fn poll_input(&mut self) -> Result<InputOutcome> {
        let mut outcome = InputOutcome::Idle;
        while event::poll(Duration::from_millis(0))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if self.handle_key_event(key) {
                        return Ok(InputOutcome::Exit);
                    }
                    outcome = InputOutcome::Changed;
                }
                Event::Resize(_, _) => outcome = InputOutcome::Changed,
                _ => {}
            }
        }
        Ok(outcome)
    }

    fn handle_key_event(&mut self, key: KeyEvent) -> bool {
        if self.exit_confirmation {
            return self.handle_exit_confirmation_key(key);
        }
        if self.assistant.reset_confirmation {
            if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                self.assistant.reset_confirmation = false;
                return true;
            }
            self.handle_reset_confirmation_key(key);
            return false;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => {
                    self.prompt_exit_confirmation();
                    return false;
                }
                KeyCode::Char('t') => {
                    self.toggle_theme();
                    return false;
                }
                _ => {}
            }
        }
        if self.market.symbol_input.is_some() {
            self.handle_symbol_input_key(key);
            return false;
        }
        match key.code {
            KeyCode::Tab => self.switch_tab(self.tab.cycle(false)),
            KeyCode::BackTab => self.switch_tab(self.tab.cycle(true)),
            KeyCode::Esc => self.prompt_exit_confirmation(),
            _ => match self.tab {
                Tab::Overview => self.handle_overview_key(key),
                Tab::Markets => self.handle_market_key(key),
                Tab::Assistant => self.handle_assistant_key(key),
            },
        }
        false
    }

    /// Shortcuts shared by the tabs that do not capture typed text.
    fn handle_navigation_char(&mut self, ch: char) -> bool {
        match ch {
            '1' => self.switch_tab(Tab::Overview),
            '2' => self.switch_tab(Tab::Markets),
            '3' => self.switch_tab(Tab::Assistant),
            't' | 'T' => self.toggle_theme(),
            'q' | 'Q' => self.prompt_exit_confirmation(),
            _ => return false,
        }
        true
    }

    fn prompt_exit_confirmation(&mut self) {
        if self.exit_confirmation {
            return;
        }
        self.exit_confirmation = true;
        self.set_status_message("Quit stocksense? Y/Enter to confirm, N/Esc to cancel");
    }

    fn handle_exit_confirmation_key(&mut self, key: KeyEvent) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            if let KeyCode::Char('c') = key.code {
                self.exit_confirmation = false;
                return true;
            }
        }
        match key.code {
            KeyCode::Char('y')
            | KeyCode::Char('Y')
            | KeyCode::Char('q')
            | KeyCode::Char('Q')
            | KeyCode::Enter => {
                self.exit_confirmation = false;
                true
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.exit_confirmation = false;
                self.set_status_message("Quit cancelled");
                false
            }
            _ => false,
        }
    }

    fn switch_tab(&mut self, tab: Tab) {
        if self.tab == tab {
            return;
        }
        if self.tab == Tab::Markets {
            self.market.poller = None;
            self.market.state.suspend();
            self.market.symbol_input = None;
        }
        self.tab = tab;
        if tab == Tab::Markets {
            let symbol = self.market.selected_symbol().to_string();
            self.start_poller(&symbol);
        }
    }

    fn start_poller(&mut self, symbol: &str) {
        if symbol.is_empty() {
            return;
        }
        let request = self.market.state.select(symbol);
        self.market.cursor = None;
        self.market.poller = Some(MarketPoller::spawn(
            Arc::clone(&self.services.source),
            self.services.tx.clone(),
            self.poll_interval,
            request,
        ));
    }

    fn select_symbol(&mut self, symbol: &str) {
        let request = self.market.state.select(symbol);
        self.market.cursor = None;
        let delivered = self
            .market
            .poller
            .as_ref()
            .is_some_and(|poller| poller.request(request.clone()));
        if !delivered {
            self.market.poller = Some(MarketPoller::spawn(
                Arc::clone(&self.services.source),
                self.services.tx.clone(),
                self.poll_interval,
                request,
            ));
        }
    }

    fn move_symbol(&mut self, delta: isize) {
        let len = self.market.symbols.len();
        if len == 0 {
            return;
        }
        let next = (self.market.selected_idx as isize + delta).rem_euclid(len as isize) as usize;
        if next == self.market.selected_idx {
            return;
        }
        self.market.selected_idx = next;
        let symbol = self.market.symbols[next].clone();
        self.select_symbol(&symbol);
    }

    fn toggle_theme(&mut self) {
        match self.preferences.toggle_dark_mode() {
            Ok(mode) => {
                self.palette = Palette::for_mode(mode);
                self.set_status_message(format!("Theme: {}", mode.label()));
            }
            Err(err) => {
                self.palette = Palette::for_mode(self.preferences.theme_mode());
                self.log_error(format!("failed to save theme preference: {err}"));
            }
        }
    }

    fn handle_overview_key(&mut self, key: KeyEvent) {
        if let KeyCode::Char(ch) = key.code {
            self.handle_navigation_char(ch);
        }
    }

    fn handle_market_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => self.move_symbol(-1),
            KeyCode::Down | KeyCode::Char('j') => self.move_symbol(1),
            KeyCode::Left | KeyCode::Char('h') => self.market.move_cursor(-1),
            KeyCode::Right | KeyCode::Char('l') => self.market.move_cursor(1),
            KeyCode::Char('/') | KeyCode::Char('i') => {
                self.market.symbol_input = Some(String::new());
            }
            KeyCode::Char('c') | KeyCode::Char('C') => {
                self.market.chart_mode = match self.market.chart_mode {
                    ChartMode::Close => ChartMode::Candles,
                    ChartMode::Candles => ChartMode::Close,
                };
            }
            KeyCode::Char('r') | KeyCode::Char('R') => {
                let symbol = self.market.selected_symbol().to_string();
                self.select_symbol(&symbol);
                self.set_status_message(format!("Refreshing {symbol}"));
            }
            KeyCode::Char(ch) => {
                self.handle_navigation_char(ch);
            }
            _ => {}
        }
    }

    fn handle_symbol_input_key(&mut self, key: KeyEvent) {
        let Some(input) = self.market.symbol_input.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Esc => self.market.symbol_input = None,
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Enter => {
                let symbol = input.trim().to_ascii_uppercase();
                self.market.symbol_input = None;
                if !symbol.is_empty() {
                    self.commit_symbol(symbol);
                }
            }
            KeyCode::Char(ch)
                if input.len() < MAX_SYMBOL_LEN
                    && (ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '^' | '=')) =>
            {
                input.push(ch.to_ascii_uppercase());
            }
            _ => {}
        }
    }

    fn commit_symbol(&mut self, symbol: String) {
        let idx = match self.market.symbols.iter().position(|s| *s == symbol) {
            Some(idx) => idx,
            None => {
                self.market.symbols.push(symbol.clone());
                self.market.symbols.len() - 1
            }
        };
        self.market.selected_idx = idx;
        self.select_symbol(&symbol);
    }

    fn handle_assistant_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('r') => {
                    self.assistant.reset_confirmation = true;
                }
                KeyCode::Char('y') => self.copy_message(),
                _ => {}
            }
            return;
        }
        match key.code {
            KeyCode::Enter => self.submit_chat(),
            KeyCode::Backspace => {
                self.assistant.input.pop();
            }
            KeyCode::Up => self.assistant.move_selection(-1),
            KeyCode::Down => self.assistant.move_selection(1),
            KeyCode::PageUp => {
                let rows = self.assistant.view_height.saturating_sub(1).max(1);
                let max = self.assistant.max_scroll();
                self.assistant.session.scroll_mut().scroll_up(rows, max);
            }
            KeyCode::PageDown => {
                let rows = self.assistant.view_height.saturating_sub(1).max(1);
                self.assistant.session.scroll_mut().scroll_down(rows);
            }
            KeyCode::End => {
                self.assistant.session.scroll_mut().follow();
                self.assistant.selected_message = None;
            }
            KeyCode::F(n) => self.apply_suggestion(n as usize),
            KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::ALT) => {
                self.assistant.input.push(ch);
            }
            _ => {}
        }
    }

    fn apply_suggestion(&mut self, number: usize) {
        let Some(suggestions) = self.assistant.session.suggestions() else {
            return;
        };
        if let Some(text) = number.checked_sub(1).and_then(|idx| suggestions.get(idx)) {
            self.assistant.input = text.to_string();
        }
    }

    fn submit_chat(&mut self) {
        match self.assistant.session.begin_send(&self.assistant.input) {
            Ok(pending) => {
                self.assistant.input.clear();
                self.assistant.selected_message = None;
                let model = Arc::clone(&self.services.model);
                let reply_tx = self.reply_tx.clone();
                tokio::spawn(async move {
                    let result = model.generate(&pending.prompt).await;
                    let _ = reply_tx.send(ChatReply {
                        epoch: pending.epoch,
                        result,
                    });
                });
            }
            Err(SendRejected::Empty) => {}
            Err(SendRejected::Busy) => {
                self.set_status_message("Vision is still answering the previous question");
            }
        }
    }

    fn handle_reset_confirmation_key(&mut self, key: KeyEvent) {
        let confirmed = match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => true,
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => false,
            _ => return,
        };
        self.assistant.reset_confirmation = false;
        if self.assistant.session.reset(confirmed, Instant::now()) {
            self.assistant.input.clear();
            self.assistant.selected_message = None;
            self.assistant.rendered_rows = 0;
            self.set_status_message("Conversation reset");
        } else {
            self.set_status_message("Reset cancelled");
        }
    }

    fn copy_message(&mut self) {
        let Some(index) = self.assistant.copy_target() else {
            self.set_status_message("Nothing to copy yet");
            return;
        };
        let copied = self.assistant.session.copy_message(
            index,
            self.services.clipboard.as_ref(),
            Instant::now(),
        );
        if copied && self.assistant.session.copy_status() != Some("Copied!") {
            self.log_error("failed to copy message to the clipboard".to_string());
        }
    }

    fn render(&mut self, frame: &mut Frame) {
        let area = frame.area();
        frame.render_widget(Block::default().style(self.base_style()), area);
        let has_status = self.status_message.is_some() && area.height >= 12;
        let mut constraints = vec![Constraint::Length(3), Constraint::Min(5)];
        if has_status {
            constraints.push(Constraint::Length(3));
        }
        constraints.push(Constraint::Length(1));
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(area);
        self.render_tabs(frame, chunks[0]);
        match self.tab {
            Tab::Overview => self.render_overview(frame, chunks[1]),
            Tab::Markets => self.render_markets(frame, chunks[1]),
            Tab::Assistant => self.render_assistant(frame, chunks[1]),
        }
        if has_status {
            self.render_status(frame, chunks[2]);
        }
        self.render_key_hints(frame, chunks[chunks.len() - 1]);
        if self.assistant.reset_confirmation {
            self.render_reset_confirmation(frame);
        }
        if self.exit_confirmation {
            self.render_exit_confirmation(frame);
        }
    }

    fn base_style(&self) -> Style {
        Style::default()
            .bg(self.palette.background)
            .fg(self.palette.text)
    }

    fn border_style(&self) -> Style {
        Style::default().fg(self.palette.text_secondary)
    }

    fn panel(&self, title: impl Into<Line<'static>>) -> Block<'static> {
        Block::bordered()
            .title(title)
            .border_style(self.border_style())
            .style(self.base_style())
    }

    fn render_tabs(&self, frame: &mut Frame, area: Rect) {
        let titles = Tab::ALL
            .iter()
            .map(|tab| Line::from(format!(" {} ", tab.title())));
        let title = Line::from(vec![
            Span::styled(
                "stocksense",
                Style::default()
                    .fg(self.palette.primary)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(" [{}]", self.preferences.theme_mode().label()),
                Style::default().fg(self.palette.text_secondary),
            ),
        ]);
        let tabs = Tabs::new(titles)
            .block(self.panel(title))
            .style(Style::default().fg(self.palette.text_secondary))
            .highlight_style(
                Style::default()
                    .fg(self.palette.primary)
                    .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
            )
            .select(self.tab.index());
        frame.render_widget(tabs, area);
    }

    fn render_overview(&self, frame: &mut Frame, area: Rect) {
        let palette = &self.palette;
        let heading = Style::default()
            .fg(palette.primary)
            .add_modifier(Modifier::BOLD);
        let muted = Style::default().fg(palette.text_secondary);
        let mut lines = vec![
            Line::from(Span::styled("Your money at a glance", heading)),
            Line::from(""),
            Line::from(vec![
                Span::styled("Watchlist  ", muted),
                Span::raw(self.market.symbols.join(", ")),
            ]),
        ];
        match self.market.state.selection() {
            Some(selection) => {
                let change = self.market.state.change_label();
                lines.push(Line::from(vec![
                    Span::styled("Last quote ", muted),
                    Span::styled(
                        selection.symbol.clone(),
                        Style::default().add_modifier(Modifier::BOLD),
                    ),
                    Span::raw(format!(
                        " ${:.2} ",
                        selection.current_price.unwrap_or_default()
                    )),
                    Span::styled(format!("{change}%"), self.change_style(&change)),
                ]));
            }
            None => lines.push(Line::from(Span::styled(
                "Open the Markets tab to load quotes.",
                muted,
            ))),
        }
        let session = &self.assistant.session;
        let assistant_state = if session.is_busy() {
            "answering".to_string()
        } else if let Some(err) = session.last_error() {
            format!("last request failed: {err}")
        } else {
            "ready".to_string()
        };
        lines.push(Line::from(vec![
            Span::styled("Assistant  ", muted),
            Span::raw(format!(
                "{} messages, {assistant_state}",
                session.messages().len()
            )),
        ]));
        lines.push(Line::from(vec![
            Span::styled("Theme      ", muted),
            Span::raw(format!(
                "{} (t or Ctrl+T to switch)",
                self.preferences.theme_mode().label()
            )),
        ]));
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("Recent activity", heading)));
        if self.recent_activity.is_empty() {
            lines.push(Line::from(Span::styled("No warnings or errors logged.", muted)));
        }
        for entry in self.recent_activity.iter().rev() {
            let level_color = match entry.level {
                LogLevel::Warn => palette.warning,
                LogLevel::Error => palette.error,
            };
            lines.push(Line::from(vec![
                Span::styled(
                    format!(
                        "{} ",
                        self.timezone
                            .format_timestamp(entry.timestamp.timestamp_millis(), "%m-%d %H:%M")
                            .unwrap_or_default()
                    ),
                    muted,
                ),
                Span::styled(
                    format!("{:<6}", entry.level.label()),
                    Style::default().fg(level_color),
                ),
                Span::raw(entry.message.clone()),
            ]));
        }
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Press 2 for market analysis or 3 to ask Vision, your financial assistant.",
            muted,
        )));
        let paragraph = Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(self.panel("Overview"));
        frame.render_widget(paragraph, area);
    }

    fn change_style(&self, change: &str) -> Style {
        let color = if change.starts_with('-') {
            self.palette.bearish
        } else if change.starts_with('+') {
            self.palette.bullish
        } else {
            self.palette.text_secondary
        };
        Style::default().fg(color).add_modifier(Modifier::BOLD)
    }

    fn render_markets(&self, frame: &mut Frame, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length(SYMBOL_COLUMN_WIDTH as u16 + 4),
                Constraint::Min(20),
            ])
            .split(area);
        self.render_symbol_list(frame, columns[0]);
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(4), Constraint::Min(5)])
            .split(columns[1]);
        self.render_market_header(frame, rows[0]);
        let has_detail =
            rows[1].width > DETAIL_PANEL_WIDTH * 3 && !self.market.state.points().is_empty();
        if has_detail {
            let chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Min(30), Constraint::Length(DETAIL_PANEL_WIDTH)])
                .split(rows[1]);
            self.render_market_chart(frame, chunks[0]);
            self.render_point_detail(frame, chunks[1]);
        } else {
            self.render_market_chart(frame, rows[1]);
        }
    }

    fn render_symbol_list(&self, frame: &mut Frame, area: Rect) {
        let visible = area.height.saturating_sub(2) as usize;
        let (start, end) = visible_range(
            self.market.symbols.len(),
            visible,
            self.market.selected_idx,
        );
        let lines: Vec<Line> = self.market.symbols[start..end]
            .iter()
            .enumerate()
            .map(|(offset, symbol)| {
                let selected = start + offset == self.market.selected_idx;
                let text = pad_to_width(&clip_to_width(symbol, SYMBOL_COLUMN_WIDTH), SYMBOL_COLUMN_WIDTH);
                Line::from(Span::styled(format!(" {text}"), row_style(selected, &self.palette)))
            })
            .collect();
        let mut block = self.panel("Symbols");
        if let Some(input) = &self.market.symbol_input {
            block = block.title_bottom(Line::from(Span::styled(
                format!("> {input}_"),
                Style::default().fg(self.palette.warning),
            )));
        }
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_market_header(&self, frame: &mut Frame, area: Rect) {
        let state = &self.market.state;
        let symbol = state.selected().to_string();
        let mut first = vec![Span::styled(
            symbol.clone(),
            Style::default()
                .fg(self.palette.primary)
                .add_modifier(Modifier::BOLD),
        )];
        if let Some(price) = state.selection().and_then(|s| s.current_price) {
            let change = state.change_label();
            first.push(Span::raw(format!("  ${price:.2}  ")));
            first.push(Span::styled(format!("{change}%"), self.change_style(&change)));
        }
        let muted = Style::default().fg(self.palette.text_secondary);
        let second = match state.phase() {
            FetchPhase::Loading => Line::from(Span::styled(
                format!("{} Loading {symbol}...", self.spinner()),
                Style::default().fg(self.palette.info),
            )),
            FetchPhase::Idle if state.points().is_empty() => {
                Line::from(Span::styled("No data available", muted))
            }
            FetchPhase::Idle => {
                let updated = state
                    .last_updated()
                    .and_then(|ts| {
                        self.timezone
                            .format_timestamp(ts.timestamp_millis(), "%H:%M:%S")
                    })
                    .unwrap_or_else(|| "--:--:--".to_string());
                Line::from(Span::styled(
                    format!(
                        "{} points · updated {updated} · {} (c to switch)",
                        state.points().len(),
                        self.market.chart_mode.label()
                    ),
                    muted,
                ))
            }
        };
        let paragraph = Paragraph::new(vec![Line::from(first), second]).block(self.panel("Market"));
        frame.render_widget(paragraph, area);
    }

    fn render_market_chart(&self, frame: &mut Frame, area: Rect) {
        let points = self.market.state.points();
        if points.is_empty() {
            let message = match self.market.state.phase() {
                FetchPhase::Loading => format!("{} Fetching market data...", self.spinner()),
                FetchPhase::Idle => format!("No data available for {}", self.market.state.selected()),
            };
            let paragraph = Paragraph::new(message)
                .alignment(Alignment::Center)
                .style(Style::default().fg(self.palette.text_secondary))
                .block(self.panel("Chart"));
            frame.render_widget(paragraph, area);
            return;
        }
        match self.market.chart_mode {
            ChartMode::Close => self.render_close_chart(frame, area),
            ChartMode::Candles => self.render_candles(frame, area),
        }
    }

    fn render_close_chart(&self, frame: &mut Frame, area: Rect) {
        let points = self.market.state.points();
        let series = charts::close_series(points);
        let (min_y, max_y) = charts::price_bounds(points).unwrap_or((0.0, 1.0));
        let last_idx = points.len().saturating_sub(1);
        let x_labels = vec![
            Span::styled(
                points[0].label.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw(points[last_idx / 2].label.clone()),
            Span::styled(
                points[last_idx].label.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            ),
        ];
        let y_labels = vec![
            Span::styled(format!("{min_y:.2}"), Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(format!("{:.2}", f64::midpoint(min_y, max_y))),
            Span::styled(format!("{max_y:.2}"), Style::default().add_modifier(Modifier::BOLD)),
        ];
        let marker: Vec<(f64, f64)> = self
            .market
            .cursor_index()
            .map(|idx| vec![(idx as f64, points[idx].close)])
            .unwrap_or_default();
        let datasets = vec![
            Dataset::default()
                .name(self.market.state.selected().to_string())
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(self.palette.primary))
                .data(&series),
            Dataset::default()
                .marker(symbols::Marker::Dot)
                .graph_type(GraphType::Scatter)
                .style(Style::default().fg(self.palette.warning))
                .data(&marker),
        ];
        let chart = Chart::new(datasets)
            .block(self.panel("Close price"))
            .x_axis(
                Axis::default()
                    .title("Time")
                    .style(self.border_style())
                    .labels(x_labels)
                    .labels_alignment(Alignment::Left)
                    .bounds([0.0, last_idx.max(1) as f64]),
            )
            .y_axis(
                Axis::default()
                    .title("USD")
                    .style(self.border_style())
                    .labels(y_labels)
                    .bounds([min_y, max_y]),
            );
        frame.render_widget(chart, area);
    }

    fn render_candles(&self, frame: &mut Frame, area: Rect) {
        let points = self.market.state.points();
        let block = self.panel("Candlesticks");
        let inner = block.inner(area);
        let width = inner.width as usize;
        let visible = &points[points.len().saturating_sub(width)..];
        let high = visible.iter().map(|p| p.high).fold(f64::NEG_INFINITY, f64::max);
        let low = visible.iter().map(|p| p.low).fold(f64::INFINITY, f64::min);
        let block = if high.is_finite() && low.is_finite() {
            block.title_bottom(Line::from(Span::styled(
                format!("H {high:.2} · L {low:.2}"),
                Style::default().fg(self.palette.text_secondary),
            )))
        } else {
            block
        };
        let lines = charts::candlestick_lines(points, width, inner.height as usize, &self.palette);
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_point_detail(&self, frame: &mut Frame, area: Rect) {
        let points = self.market.state.points();
        let Some(idx) = self.market.cursor_index() else {
            return;
        };
        let title = format!("Point {}/{}", idx + 1, points.len());
        let paragraph = Paragraph::new(charts::point_detail_lines(&points[idx], &self.palette))
            .block(self.panel(title));
        frame.render_widget(paragraph, area);
    }

    fn render_assistant(&mut self, frame: &mut Frame, area: Rect) {
        let suggestions = self.assistant.session.suggestions();
        let suggestion_height = match suggestions {
            Some(items) if area.height > 16 => items.len() as u16 + 2,
            _ => 0,
        };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(5),
                Constraint::Length(suggestion_height),
                Constraint::Length(3),
            ])
            .split(area);
        self.render_conversation(frame, chunks[0]);
        if let (Some(items), true) = (suggestions, suggestion_height > 0) {
            self.render_suggestions(frame, chunks[1], items);
        }
        self.render_chat_input(frame, chunks[2]);
    }

    fn render_conversation(&mut self, frame: &mut Frame, area: Rect) {
        let lines = self.conversation_lines();
        let inner_width = area.width.saturating_sub(2);
        let view_height = area.height.saturating_sub(2) as usize;
        let total_rows = Self::wrapped_line_count(&lines, inner_width);
        if self.assistant.rendered_rows > 0 && total_rows > self.assistant.rendered_rows {
            let added = total_rows - self.assistant.rendered_rows;
            self.assistant.session.scroll_mut().content_grew(added);
        }
        self.assistant.rendered_rows = total_rows;
        self.assistant.view_height = view_height;
        let max_offset = total_rows.saturating_sub(view_height);
        let from_bottom = self.assistant.session.scroll().rows_from_bottom().min(max_offset);
        let offset = max_offset - from_bottom;

        let mut title = vec![Span::styled(
            "Vision · financial assistant",
            Style::default()
                .fg(self.palette.primary)
                .add_modifier(Modifier::BOLD),
        )];
        if let Some(status) = self.assistant.session.copy_status() {
            title.push(Span::styled(
                format!(" [{status}]"),
                Style::default().fg(self.palette.warning),
            ));
        }
        let mut block = self.panel(Line::from(title));
        if self.assistant.session.scroll().show_jump_to_latest() {
            block = block.title_bottom(Line::from(Span::styled(
                " ↓ newer messages below · End to jump ",
                Style::default().fg(self.palette.info),
            )));
        }
        let paragraph = Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .scroll((offset.min(u16::MAX as usize) as u16, 0))
            .block(block);
        frame.render_widget(paragraph, area);
    }

    fn conversation_lines(&self) -> Vec<Line<'static>> {
        let palette = &self.palette;
        let mut lines = Vec::new();
        for (idx, message) in self.assistant.session.messages().iter().enumerate() {
            let name_color = match message.role {
                Role::Assistant => palette.primary,
                Role::User => palette.secondary,
            };
            let mut name_style = Style::default().fg(name_color).add_modifier(Modifier::BOLD);
            if self.assistant.selected_message == Some(idx) {
                name_style = name_style.add_modifier(Modifier::REVERSED);
            }
            let time = self
                .timezone
                .format_timestamp(message.timestamp.timestamp_millis(), "%H:%M")
                .unwrap_or_default();
            let mut header = vec![
                Span::styled(message.role.display_name(), name_style),
                Span::styled(
                    format!(" · {time}"),
                    Style::default().fg(palette.text_secondary),
                ),
            ];
            if message.is_new() {
                header.push(Span::styled(
                    " new",
                    Style::default()
                        .fg(palette.warning)
                        .add_modifier(Modifier::BOLD),
                ));
            }
            lines.push(Line::from(header));
            for text_line in message.text.lines() {
                let line = match message.role {
                    Role::Assistant => Line::from(
                        parse_emphasis(text_line)
                            .into_iter()
                            .map(|segment| {
                                let mut style = Style::default().fg(palette.text);
                                if segment.bold {
                                    style = style.add_modifier(Modifier::BOLD);
                                }
                                if segment.italic {
                                    style = style.add_modifier(Modifier::ITALIC);
                                }
                                Span::styled(segment.text, style)
                            })
                            .collect::<Vec<_>>(),
                    ),
                    Role::User => Line::from(Span::styled(
                        text_line.to_string(),
                        Style::default().fg(palette.text),
                    )),
                };
                lines.push(line);
            }
            lines.push(Line::from(""));
        }
        if self.assistant.session.is_busy() {
            lines.push(Line::from(Span::styled(
                format!("Vision is typing {}", self.spinner()),
                Style::default()
                    .fg(palette.text_secondary)
                    .add_modifier(Modifier::ITALIC),
            )));
        }
        lines
    }

    fn render_suggestions(&self, frame: &mut Frame, area: Rect, items: &[&str]) {
        let width = area.width.saturating_sub(8) as usize;
        let lines: Vec<Line> = items
            .iter()
            .enumerate()
            .map(|(idx, text)| {
                Line::from(vec![
                    Span::styled(
                        format!("F{} ", idx + 1),
                        Style::default()
                            .fg(self.palette.secondary)
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::raw(clip_to_width(text, width)),
                ])
            })
            .collect();
        frame.render_widget(Paragraph::new(lines).block(self.panel("Quick questions")), area);
    }

    fn render_chat_input(&self, frame: &mut Frame, area: Rect) {
        let title = if self.assistant.session.is_busy() {
            "Message (waiting for Vision...)"
        } else {
            "Message (Enter to send)"
        };
        let width = area.width.saturating_sub(5) as usize;
        let text = tail_to_width(&self.assistant.input, width);
        let line = Line::from(vec![
            Span::styled("> ", Style::default().fg(self.palette.primary)),
            Span::raw(text),
            Span::styled("▏", Style::default().fg(self.palette.primary)),
        ]);
        frame.render_widget(Paragraph::new(line).block(self.panel(title)), area);
    }

    fn render_status(&self, frame: &mut Frame, area: Rect) {
        if let Some(message) = &self.status_message {
            let color = if self.status_is_error {
                self.palette.error
            } else {
                self.palette.warning
            };
            let status = Paragraph::new(message.as_str())
                .style(Style::default().fg(color))
                .alignment(Alignment::Left)
                .block(self.panel("Status"));
            frame.render_widget(status, area);
        }
    }

    fn render_key_hints(&self, frame: &mut Frame, area: Rect) {
        let hint = match self.tab {
            Tab::Overview => "Tab/1-3 switch view · t theme · q quit",
            Tab::Markets if self.market.symbol_input.is_some() => {
                "type a symbol · Enter load · Esc cancel"
            }
            Tab::Markets => {
                "↑↓ symbol · / custom symbol · ←→ inspect · c chart · r refresh · t theme · q quit"
            }
            Tab::Assistant => {
                "Enter send · F1-F5 suggestion · ↑↓ select · Ctrl+Y copy · Ctrl+R reset · PgUp/PgDn scroll · Ctrl+T theme · Esc quit"
            }
        };
        let paragraph = Paragraph::new(clip_to_width(hint, area.width as usize))
            .style(Style::default().fg(self.palette.text_secondary));
        frame.render_widget(paragraph, area);
    }

    fn render_exit_confirmation(&self, frame: &mut Frame) {
        let lines = vec![
            Line::from(Span::styled(
                "Quit stocksense?",
                Style::default()
                    .fg(self.palette.error)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from("Y/Enter to quit · N/Esc to stay"),
            Line::from("Ctrl+C quits immediately"),
        ];
        self.render_popup(frame, "Confirm exit", lines);
    }

    fn render_reset_confirmation(&self, frame: &mut Frame) {
        let lines = vec![
            Line::from(Span::styled(
                "Start a new conversation?",
                Style::default()
                    .fg(self.palette.warning)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from("The current chat history will be cleared."),
            Line::from("Y/Enter to reset · N/Esc to keep it"),
        ];
        self.render_popup(frame, "Reset chat", lines);
    }

    fn render_popup(&self, frame: &mut Frame, title: &'static str, lines: Vec<Line<'static>>) {
        let area = frame.area();
        if area.width < 24 || area.height < 5 {
            return;
        }
        let popup_width = area.width.saturating_sub(20).clamp(28, 50);
        let popup_height = 6;
        let left = area.x + (area.width.saturating_sub(popup_width)) / 2;
        let top = area.y + (area.height.saturating_sub(popup_height)) / 2;
        let popup = Rect::new(left, top, popup_width.min(area.width), popup_height);
        let paragraph = Paragraph::new(lines)
            .alignment(Alignment::Left)
            .block(self.panel(title));
        frame.render_widget(Clear, popup);
        frame.render_widget(paragraph, popup);
    }

    fn wrapped_line_count(lines: &[Line], max_width: u16) -> usize {
        if max_width == 0 {
            return lines.len();
        }
        let width = max_width as usize;
        lines
            .iter()
            .map(|line| {
                let line_width: usize = line.spans.iter().map(|span| span.content.width()).sum();
                if line_width == 0 {
                    1
                } else {
                    line_width.div_ceil(width)
                }
            })
            .sum()
    }
}

fn row_style(selected: bool, palette: &Palette) -> Style {
    if selected {
        Style::default()
            .bg(palette.primary)
            .fg(palette.background)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(palette.text)
    }
}

fn clip_to_width(value: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }
    if UnicodeWidthStr::width(value) <= width {
        return value.to_string();
    }
    let mut result = String::new();
    let mut remaining = width.saturating_sub(1);
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if ch_width > remaining {
            break;
        }
        result.push(ch);
        remaining = remaining.saturating_sub(ch_width);
    }
    result.push('…');
    result
}

/// Keeps the end of `value` visible, as an input line scrolls with the cursor.
fn tail_to_width(value: &str, width: usize) -> String {
    if UnicodeWidthStr::width(value) <= width {
        return value.to_string();
    }
    let mut kept = Vec::new();
    let mut remaining = width;
    for ch in value.chars().rev() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if ch_width > remaining {
            break;
        }
        kept.push(ch);
        remaining -= ch_width;
    }
    kept.into_iter().rev().collect()
}

fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    if current >= width {
        return value.to_string();
    }
    format!("{value}{}", " ".repeat(width - current))
}

fn clamp_index(idx: usize, len: usize) -> usize {
    if len == 0 { 0 } else { idx.min(len - 1) }
}

fn visible_range(len: usize, visible: usize, selected: usize) -> (usize, usize) {
    if len == 0 || visible == 0 {
        return (0, 0);
    }
    if len <= visible {
        return (0, len);
    }
    let max_start = len - visible;
    let clamped = clamp_index(selected, len);
    let start = clamped.min(max_start);
    (start, start + visible)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use tempfile::TempDir;

    use super::*;
    use crate::chat::{RESET_MESSAGE, WELCOME_MESSAGE};
    use crate::market::ValidatedPoints;
    use crate::theme::ThemeMode;

    struct EchoModel;

    impl LanguageModel for EchoModel {
        fn generate<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, Result<String, ChatError>> {
            Box::pin(async { Ok("Start with a **50/30/20** split.".to_string()) })
        }
    }

    struct EmptySource;

    impl PointSource for EmptySource {
        fn fetch<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, ValidatedPoints> {
            Box::pin(async { ValidatedPoints::empty() })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingClipboard(Arc<Mutex<Vec<String>>>);

    impl Clipboard for RecordingClipboard {
        fn write_text(&self, text: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Never finishes, so the market stays in its loading phase.
    struct StalledSource;

    impl PointSource for StalledSource {
        fn fetch<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, ValidatedPoints> {
            Box::pin(futures_util::future::pending())
        }
    }

    fn app(dir: &TempDir) -> (TuiApp, broadcast::Receiver<Command>, RecordingClipboard) {
        app_with_source(dir, Arc::new(EmptySource))
    }

    fn app_with_source(
        dir: &TempDir,
        source: Arc<dyn PointSource>,
    ) -> (TuiApp, broadcast::Receiver<Command>, RecordingClipboard) {
        let (tx, rx) = broadcast::channel(16);
        let clipboard = RecordingClipboard::default();
        let services = Services {
            model: Arc::new(EchoModel),
            source,
            clipboard: Box::new(clipboard.clone()),
            log: ActivityLog::new(dir.path().join("activity.jsonl")),
            tx,
        };
        let preferences = Preferences::load_or_default(dir.path().join("prefs.json")).unwrap();
        let app = TuiApp::new(
            vec!["AAPL".to_string(), "MSFT".to_string()],
            preferences,
            Duration::from_secs(300),
            ConfiguredTimeZone::Utc,
            services,
        );
        (app, rx, clipboard)
    }

    fn press(app: &mut TuiApp, code: KeyCode) -> bool {
        app.handle_key_event(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(app: &mut TuiApp, ch: char) -> bool {
        app.handle_key_event(KeyEvent::new(KeyCode::Char(ch), KeyModifiers::CONTROL))
    }

    fn type_text(app: &mut TuiApp, text: &str) {
        for ch in text.chars() {
            press(app, KeyCode::Char(ch));
        }
    }

    async fn next_reply(app: &mut TuiApp) -> ChatReply {
        let replies = app.reply_rx.as_mut().unwrap();
        tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn poller_lives_only_while_markets_tab_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        assert!(app.market.poller.is_none());
        press(&mut app, KeyCode::Char('2'));
        assert_eq!(app.tab, Tab::Markets);
        assert!(app.market.poller.is_some());
        assert_eq!(app.market.state.phase(), FetchPhase::Loading);
        press(&mut app, KeyCode::Tab);
        assert_eq!(app.tab, Tab::Assistant);
        assert!(app.market.poller.is_none());
    }

    #[tokio::test]
    async fn leaving_markets_mid_fetch_stops_the_spinner() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx, _) = app_with_source(&dir, Arc::new(StalledSource));
        press(&mut app, KeyCode::Char('2'));
        let command = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let generation = match command {
            Command::MarketLoading(generation) => generation,
            other => panic!("unexpected command: {other:?}"),
        };
        app.handle_command(Command::MarketLoading(generation));
        assert_eq!(app.market.state.phase(), FetchPhase::Loading);
        assert!(app.on_frame_tick(Instant::now()));

        press(&mut app, KeyCode::Char('1'));
        assert!(app.market.poller.is_none());
        assert_eq!(app.market.state.phase(), FetchPhase::Idle);
        app.handle_command(Command::MarketLoading(generation));
        assert_eq!(app.market.state.phase(), FetchPhase::Idle);
        assert!(!app.on_frame_tick(Instant::now()));
    }

    #[tokio::test]
    async fn typed_symbol_is_added_and_selected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Markets);
        press(&mut app, KeyCode::Char('/'));
        type_text(&mut app, "brk.b");
        press(&mut app, KeyCode::Enter);
        assert!(app.market.symbol_input.is_none());
        assert_eq!(app.market.symbols.last().map(String::as_str), Some("BRK.B"));
        assert_eq!(app.market.selected_idx, 2);
        assert_eq!(app.market.state.selected(), "BRK.B");
    }

    #[tokio::test]
    async fn symbol_navigation_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Markets);
        press(&mut app, KeyCode::Up);
        assert_eq!(app.market.state.selected(), "MSFT");
        press(&mut app, KeyCode::Down);
        assert_eq!(app.market.state.selected(), "AAPL");
    }

    #[tokio::test]
    async fn enter_sends_and_reply_lands_in_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        type_text(&mut app, "How do I budget?");
        press(&mut app, KeyCode::Enter);
        assert!(app.assistant.input.is_empty());
        assert!(app.assistant.session.is_busy());

        let reply = next_reply(&mut app).await;
        app.finish_chat_reply(reply);
        assert!(rx.try_recv().is_err());
        let messages = app.assistant.session.messages();
        assert!(!app.assistant.session.is_busy());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].text, "Start with a **50/30/20** split.");
        assert!(messages[2].is_new());
    }

    #[tokio::test]
    async fn chat_reply_survives_a_lagging_bus() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, mut rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        type_text(&mut app, "Should I pay off debt first?");
        press(&mut app, KeyCode::Enter);
        for generation in 0..64 {
            app.services.tx.send(Command::MarketLoading(generation)).unwrap();
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        let reply = next_reply(&mut app).await;
        app.finish_chat_reply(reply);
        assert!(!app.assistant.session.is_busy());
        assert_eq!(app.assistant.session.messages().len(), 3);
    }

    #[tokio::test]
    async fn typing_on_assistant_tab_does_not_trigger_shortcuts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        type_text(&mut app, "q2t");
        assert_eq!(app.assistant.input, "q2t");
        assert_eq!(app.tab, Tab::Assistant);
        assert!(!app.exit_confirmation);
    }

    #[test]
    fn suggestion_keys_fill_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        press(&mut app, KeyCode::F(3));
        assert_eq!(app.assistant.input, "How do I create a monthly budget?");
        press(&mut app, KeyCode::F(9));
        assert_eq!(app.assistant.input, "How do I create a monthly budget?");
    }

    #[test]
    fn reset_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        type_text(&mut app, "draft");
        ctrl(&mut app, 'r');
        assert!(app.assistant.reset_confirmation);
        press(&mut app, KeyCode::Char('n'));
        assert!(!app.assistant.reset_confirmation);
        assert_eq!(app.assistant.session.messages()[0].text, WELCOME_MESSAGE);
        assert_eq!(app.assistant.input, "draft");

        ctrl(&mut app, 'r');
        press(&mut app, KeyCode::Char('y'));
        let messages = app.assistant.session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, RESET_MESSAGE);
        assert!(app.assistant.input.is_empty());
    }

    #[test]
    fn ctrl_c_in_reset_popup_quits() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.switch_tab(Tab::Assistant);
        ctrl(&mut app, 'r');
        assert!(app.assistant.reset_confirmation);
        assert!(ctrl(&mut app, 'c'));
        assert!(!app.assistant.reset_confirmation);
        assert_eq!(app.assistant.session.messages()[0].text, WELCOME_MESSAGE);
    }

    #[test]
    fn copy_defaults_to_latest_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, clipboard) = app(&dir);
        app.switch_tab(Tab::Assistant);
        ctrl(&mut app, 'y');
        assert_eq!(clipboard.0.lock().unwrap().as_slice(), [WELCOME_MESSAGE.to_string()]);
        assert_eq!(app.assistant.session.copy_status(), Some("Copied!"));
    }

    #[test]
    fn theme_toggle_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        assert_eq!(app.palette, Palette::for_mode(ThemeMode::Light));
        press(&mut app, KeyCode::Char('t'));
        assert_eq!(app.palette, Palette::for_mode(ThemeMode::Dark));
        let stored = Preferences::load_or_default(dir.path().join("prefs.json")).unwrap();
        assert!(stored.dark_mode());
    }

    #[test]
    fn exit_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        assert!(!press(&mut app, KeyCode::Char('q')));
        assert!(app.exit_confirmation);
        assert!(!press(&mut app, KeyCode::Esc));
        assert!(!app.exit_confirmation);
        press(&mut app, KeyCode::Esc);
        assert!(press(&mut app, KeyCode::Enter));
    }

    #[test]
    fn error_commands_reach_the_status_bar() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _rx, _) = app(&dir);
        app.handle_command(Command::Error("no valid data points found for AAPL".to_string()));
        assert!(app.status_is_error);
        assert_eq!(
            app.status_message.as_deref(),
            Some("no valid data points found for AAPL")
        );
    }

    #[test]
    fn overview_keeps_the_latest_activity() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path().join("activity.jsonl"));
        for idx in 0..6 {
            log.warn(format!("stale warning {idx}")).unwrap();
        }
        let (mut app, _rx, _) = app(&dir);
        assert_eq!(app.recent_activity.len(), RECENT_ACTIVITY_LIMIT);
        assert_eq!(
            app.recent_activity.last().map(|entry| entry.message.as_str()),
            Some("stale warning 5")
        );

        log.error("failed to load market data for AAPL: timeout").unwrap();
        app.handle_command(Command::Error(
            "failed to load market data for AAPL: timeout".to_string(),
        ));
        let latest = app.recent_activity.last().unwrap();
        assert_eq!(latest.level, LogLevel::Error);
        assert_eq!(latest.message, "failed to load market data for AAPL: timeout");
    }

    #[test]
    fn width_helpers() {
        assert_eq!(clip_to_width("NVDA", 10), "NVDA");
        assert_eq!(clip_to_width("GOOGLEPLEX", 5), "GOOG…");
        assert_eq!(tail_to_width("retirement", 4), "ment");
        assert_eq!(pad_to_width("AAPL", 6), "AAPL  ");
        assert_eq!(visible_range(10, 4, 8), (6, 10));
        assert_eq!(visible_range(3, 4, 2), (0, 3));
    }
}
