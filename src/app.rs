use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{select, unbounded, Receiver};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::board;
use crate::config::{self, Config};
use crate::data::BoardApiService;
use crate::events::{Bus, Signal};
use crate::lifecycle::{EmbedLifecycleManager, LifecycleConfig, PlaceholderId};
use crate::logging;
use crate::media::{self, HttpMediaBackend};
use crate::render::{FeedSurface, RenderEngine, RenderSettings, Surface};
use crate::storage;
use crate::sync::{failure_is_retryable, failure_reason, BackgroundRefresher, MergeResult, SyncEngine, SyncMode};
use crate::view;
use crate::viewer::{PendingUpdate, Viewer, ViewerEvent};

const VIEWPORT_ROWS: usize = 40;
const TICK: Duration = Duration::from_millis(250);
const SCROLL_STEP: isize = (VIEWPORT_ROWS / 2) as isize;

#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Sync once, print the feed and exit.
    pub once: bool,
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Refresh,
    Clear,
    Toggle,
    Select(u64),
    Load(u64),
    /// Moves the viewport by this many rows; negative scrolls up.
    Scroll(isize),
    Top,
    Bottom,
    Quit,
    Help,
}

/// Parses one line typed at the prompt. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<std::result::Result<Command, String>> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    let arg = parts.next().map(str::parse::<u64>);
    let cmd = match (head, arg) {
        ("r", None) => Ok(Command::Refresh),
        ("c", None) => Ok(Command::Clear),
        ("t", None) => Ok(Command::Toggle),
        ("q", None) => Ok(Command::Quit),
        ("h" | "?", None) => Ok(Command::Help),
        ("s", Some(Ok(id))) => Ok(Command::Select(id)),
        ("l", Some(Ok(n))) => Ok(Command::Load(n)),
        ("j", None) => Ok(Command::Scroll(SCROLL_STEP)),
        ("k", None) => Ok(Command::Scroll(-SCROLL_STEP)),
        ("j", Some(Ok(n))) => Ok(Command::Scroll(rows(n))),
        ("k", Some(Ok(n))) => Ok(Command::Scroll(-rows(n))),
        ("g", None) => Ok(Command::Top),
        ("G", None) => Ok(Command::Bottom),
        ("s" | "l" | "j" | "k", _) => Err(format!("{head} needs a number")),
        _ => Err(format!("unknown command: {}", line.trim())),
    };
    Some(cmd)
}

fn rows(n: u64) -> isize {
    isize::try_from(n).unwrap_or(isize::MAX)
}

const HELP: &str = "commands: r refresh | c clear and refresh | t toggle viewer | s <id> select | l <n> load embed | j/k [rows] scroll | g/G top/bottom | q quit";

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    logging::init(&cfg.log).context("init logging")?;

    let store = storage::Store::open(storage::Options {
        path: cfg.storage.path.clone(),
    })
    .context("open storage")?;

    let client = board::Client::new(board::ClientConfig {
        user_agent: cfg.board.user_agent.clone(),
        api_base: cfg.board.api_base.clone(),
        board: cfg.board.board.clone(),
        keyword: cfg.board.keyword.clone(),
        http_client: None,
    })
    .context("create board client")?;
    let board_service = Arc::new(BoardApiService::new(Arc::new(client)));

    let bus = Arc::new(Bus::new());
    let engine = Arc::new(SyncEngine::new(board_service, store.clone(), bus.clone()));
    let viewer = Viewer::new(store.clone(), render_engine(&cfg, store)?);

    if options.once {
        return run_once(&engine, viewer);
    }
    Interactive::new(cfg, engine, bus, viewer).run()
}

fn render_engine(cfg: &Config, store: storage::Store) -> Result<RenderEngine> {
    let backend = HttpMediaBackend::new(media::HttpConfig {
        user_agent: cfg.board.user_agent.clone(),
        media_timeout: cfg.embeds.media_timeout,
        widget_timeout: cfg.embeds.widget_timeout,
        ..media::HttpConfig::default()
    })
    .context("create media backend")?;
    let lifecycle = EmbedLifecycleManager::new(
        LifecycleConfig {
            proximity_margin: cfg.embeds.proximity_margin,
            media_timeout: cfg.embeds.media_timeout,
            widget_timeout: cfg.embeds.widget_timeout,
            embed_parent: cfg.board.embed_parent.clone(),
        },
        Arc::new(backend),
        cfg.embeds.workers,
    );
    let settings = RenderSettings {
        media_base: cfg.board.media_base.clone(),
        board: cfg.board.board.clone(),
        scroll_attempts: cfg.render.scroll_attempts,
        scroll_retry_delay: cfg.render.scroll_retry_delay,
        settle_delay: cfg.render.settle_delay,
    };
    Ok(RenderEngine::new(store, settings, lifecycle))
}

fn run_once(engine: &SyncEngine, mut viewer: Viewer) -> Result<()> {
    with_spinner("Syncing threads", || engine.sync(SyncMode::Manual)).context("sync")?;
    print_threads(engine);

    let mut surface = FeedSurface::new(VIEWPORT_ROWS);
    let outcome = viewer.show(&mut surface)?;
    info!(rendered = outcome.rendered, "feed rendered");
    print_feed(&surface, &viewer);
    Ok(())
}

fn with_spinner<T>(message: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = work();
    spinner.finish_and_clear();
    result
}

fn print_threads(engine: &SyncEngine) {
    match engine.thread_summaries() {
        Ok(summaries) if summaries.is_empty() => println!("No threads tracked."),
        Ok(summaries) => {
            for line in view::thread_list(&summaries) {
                println!("{line}");
            }
        }
        Err(err) => warn!(error = %format!("{err:#}"), "could not list threads"),
    }
}

fn print_feed(surface: &FeedSurface, viewer: &Viewer) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in view::feed_lines(surface, viewer.engine().lifecycle(), textwrap::termwidth()) {
        let _ = writeln!(out, "{line}");
    }
    let _ = out.flush();
}

fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

struct Interactive {
    cfg: Config,
    engine: Arc<SyncEngine>,
    bus: Arc<Bus>,
    viewer: Viewer,
    surface: FeedSurface,
}

impl Interactive {
    fn new(cfg: Config, engine: Arc<SyncEngine>, bus: Arc<Bus>, viewer: Viewer) -> Self {
        Self {
            cfg,
            engine,
            bus,
            viewer,
            surface: FeedSurface::new(VIEWPORT_ROWS),
        }
    }

    fn run(mut self) -> Result<()> {
        let sub = self.bus.subscribe();
        if self.viewer.restore(&mut self.surface)?.is_some() {
            self.redraw();
        }
        println!("{HELP}");

        let mut refresher =
            BackgroundRefresher::spawn(self.engine.clone(), self.cfg.sync.background_interval);
        let lines = stdin_lines();

        loop {
            select! {
                recv(lines) -> line => {
                    let Ok(line) = line else { break };
                    match parse_command(&line) {
                        None => {}
                        Some(Err(msg)) => println!("{msg}"),
                        Some(Ok(Command::Quit)) => break,
                        Some(Ok(cmd)) => self.command(cmd)?,
                    }
                }
                recv(sub.toggle) -> signal => {
                    if let Ok(signal) = signal {
                        self.apply(signal)?;
                    }
                }
                recv(sub.data) -> signal => {
                    if let Ok(signal) = signal {
                        self.apply(signal)?;
                    }
                }
                default(TICK) => {
                    if self.viewer.tick(&self.surface, Duration::ZERO) {
                        self.redraw();
                    }
                }
            }
        }

        refresher.stop();
        Ok(())
    }

    fn command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Refresh => {
                self.viewer.expect_update(PendingUpdate::Append);
                let engine = self.engine.clone();
                let result = with_spinner("Refreshing", || engine.sync(SyncMode::Manual));
                self.report(result, PendingUpdate::Append)?;
            }
            Command::Clear => {
                self.viewer.expect_update(PendingUpdate::Full);
                let engine = self.engine.clone();
                let result = with_spinner("Clearing and refreshing", || engine.clear_and_refresh());
                self.report(result, PendingUpdate::Full)?;
            }
            Command::Toggle => self.bus.publish(Signal::ToggleViewer),
            Command::Select(id) => {
                let selected = self.viewer.select(&mut self.surface, id)?;
                match selected {
                    Some(id) => println!("selected #{id}"),
                    None => println!("selection cleared"),
                }
                if self.viewer.is_visible() {
                    self.redraw();
                }
            }
            Command::Load(n) => {
                if self.viewer.activate_embed(PlaceholderId(n)) {
                    self.redraw();
                } else {
                    println!("embed {n} cannot be loaded now");
                }
            }
            Command::Scroll(_) | Command::Top | Command::Bottom => {
                if !self.viewer.is_visible() {
                    println!("viewer is hidden");
                    return Ok(());
                }
                match cmd {
                    Command::Scroll(delta) => self.surface.scroll_by(delta),
                    Command::Top => self.surface.scroll_to_top(),
                    _ => self.surface.scroll_to_end(),
                }
                // Proximity follows the viewport right away.
                self.viewer.tick(&self.surface, Duration::ZERO);
                self.redraw();
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
        Ok(())
    }

    fn report(&mut self, result: Result<MergeResult>, pending: PendingUpdate) -> Result<()> {
        match result {
            Ok(merge) => {
                println!(
                    "{} new threads, {} new messages",
                    merge.added_threads, merge.added_messages
                );
                print_threads(&self.engine);
            }
            Err(err) => {
                self.viewer.expect_update(PendingUpdate::Absorb);
                warn!(reason = failure_reason(&err), retryable = failure_is_retryable(&err), error = %format!("{err:#}"), "sync failed");
                println!("sync failed: {err:#}");
                // A failed clear has already emptied the store.
                if pending == PendingUpdate::Full && self.viewer.is_visible() {
                    self.viewer.show(&mut self.surface)?;
                    self.redraw();
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, signal: Signal) -> Result<()> {
        match self.viewer.handle(signal, &mut self.surface)? {
            ViewerEvent::Hidden => println!("viewer hidden"),
            ViewerEvent::Ignored => {}
            ViewerEvent::Appended(outcome) if outcome.added == 0 => {}
            ViewerEvent::Shown(_) | ViewerEvent::Rerendered(_) | ViewerEvent::Appended(_) => {
                self.redraw()
            }
        }
        Ok(())
    }

    fn redraw(&self) {
        let lines = view::viewport_lines(
            &self.surface,
            self.viewer.engine().lifecycle(),
            textwrap::termwidth(),
        );
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        let _ = out.flush();
    }
}
