use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::embed::{self, EmbedSpan, Provider};
use crate::error::Error;
use crate::media::{self, Completion, MediaBackend, Output, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaceholderId(pub u64);

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedContent {
    /// An embeddable player addressed by URL.
    Frame { src: String },
    Video {
        url: String,
        content_type: String,
        size: usize,
    },
    Widget { html: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderState {
    Unloaded,
    Loading,
    Loaded(EmbedContent),
    Error(Error),
}

impl PlaceholderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderState::Unloaded => "unloaded",
            PlaceholderState::Loading => "loading",
            PlaceholderState::Loaded(_) => "loaded",
            PlaceholderState::Error(_) => "error",
        }
    }
}

/// Hands out placeholder ids while a message is being rendered.
pub trait PlaceholderRegistry {
    fn register(&mut self, span: &EmbedSpan) -> PlaceholderId;
}

/// Rows around the viewport within which embeds load: one viewport.
pub const DEFAULT_PROXIMITY_ROWS: u32 = 40;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub proximity_margin: u32,
    pub media_timeout: Duration,
    pub widget_timeout: Duration,
    /// Host the streaming player requires as its embedding parent.
    pub embed_parent: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            proximity_margin: DEFAULT_PROXIMITY_ROWS,
            media_timeout: Duration::from_secs(30),
            widget_timeout: Duration::from_secs(40),
            embed_parent: "boards.4chan.org".into(),
        }
    }
}

struct Slot {
    span: EmbedSpan,
    state: PlaceholderState,
    attempt: u64,
    deadline: Option<(Instant, Duration)>,
    observed: bool,
    in_proximity: bool,
}

/// Per-placeholder load state machines.
///
/// `Unloaded -> Loading -> Loaded | Error`. Leaving proximity returns any
/// state to `Unloaded`; entering proximity or explicit activation starts a
/// fresh attempt from `Unloaded` (activation also from `Error`). Results of
/// superseded attempts are dropped.
pub struct EmbedLifecycleManager {
    cfg: LifecycleConfig,
    slots: BTreeMap<PlaceholderId, Slot>,
    next_id: u64,
    pool: Pool,
}

impl EmbedLifecycleManager {
    pub fn new(cfg: LifecycleConfig, backend: Arc<dyn MediaBackend>, workers: usize) -> Self {
        Self {
            cfg,
            slots: BTreeMap::new(),
            next_id: 1,
            pool: Pool::new(backend, workers),
        }
    }

    pub fn state(&self, id: PlaceholderId) -> Option<&PlaceholderState> {
        self.slots.get(&id).map(|slot| &slot.state)
    }

    pub fn span(&self, id: PlaceholderId) -> Option<&EmbedSpan> {
        self.slots.get(&id).map(|slot| &slot.span)
    }

    pub fn ids(&self) -> Vec<PlaceholderId> {
        self.slots.keys().copied().collect()
    }

    /// Starts watching a placeholder's viewport distance.
    pub fn observe(&mut self, id: PlaceholderId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.observed = true;
        }
    }

    pub fn is_observed(&self, id: PlaceholderId) -> bool {
        self.slots.get(&id).map_or(false, |slot| slot.observed)
    }

    /// Feeds the distance between a placeholder and the visible region.
    pub fn on_viewport_distance(&mut self, id: PlaceholderId, distance: u32) {
        let near = distance <= self.cfg.proximity_margin;
        self.on_intersection(id, near);
    }

    pub fn on_intersection(&mut self, id: PlaceholderId, near: bool) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if !slot.observed || slot.in_proximity == near {
            return;
        }
        slot.in_proximity = near;
        if near {
            if slot.state == PlaceholderState::Unloaded {
                self.start_load(id);
            }
        } else if slot.state != PlaceholderState::Unloaded {
            slot.state = PlaceholderState::Unloaded;
            slot.attempt += 1;
            slot.deadline = None;
            debug!(placeholder = id.0, "embed unloaded");
        }
    }

    /// Explicit user request to load, regardless of proximity.
    pub fn activate(&mut self, id: PlaceholderId) -> bool {
        let startable = matches!(
            self.state(id),
            Some(PlaceholderState::Unloaded) | Some(PlaceholderState::Error(_))
        );
        if startable {
            self.start_load(id);
        }
        startable
    }

    /// Applies finished work and expires overdue loads, waiting up to `wait`
    /// for completions. Returns the placeholders whose state changed.
    pub fn pump(&mut self, wait: Duration) -> Vec<PlaceholderId> {
        let until = Instant::now() + wait;
        let completions = self.pool.completions().clone();
        let mut changed = Vec::new();
        loop {
            while let Ok(done) = completions.try_recv() {
                if let Some(id) = self.apply(done) {
                    changed.push(id);
                }
            }
            let now = Instant::now();
            changed.extend(self.expire(now));
            if now >= until {
                break;
            }
            let next = self
                .slots
                .values()
                .filter_map(|slot| slot.deadline.map(|(at, _)| at))
                .filter(|at| *at > now)
                .min()
                .map_or(until, |at| at.min(until));
            match completions.recv_deadline(next) {
                Ok(done) => {
                    if let Some(id) = self.apply(done) {
                        changed.push(id);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        changed
    }

    /// Drops every placeholder. Late completions for them are ignored.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    fn start_load(&mut self, id: PlaceholderId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        slot.attempt += 1;
        slot.deadline = None;
        let attempt = slot.attempt;
        let span = &slot.span;
        debug!(placeholder = id.0, provider = span.provider.as_str(), attempt, "embed loading");

        let parent = &self.cfg.embed_parent;
        let frame = match span.provider {
            Provider::YouTube => Some(youtube_src(&span.provider_id, span.start)),
            Provider::TwitchClip => Some(format!(
                "https://clips.twitch.tv/embed?clip={}&parent={}&autoplay=false",
                span.provider_id, parent
            )),
            Provider::TwitchVod => {
                let mut src = format!(
                    "https://player.twitch.tv/?video={}&parent={}&autoplay=false",
                    span.provider_id, parent
                );
                if let Some(start) = span.start {
                    src.push_str(&format!("&t={}", embed::twitch_time(start)));
                }
                Some(src)
            }
            _ => None,
        };
        if let Some(src) = frame {
            slot.state = PlaceholderState::Loaded(EmbedContent::Frame { src });
            return;
        }

        let (request, timeout) = match span.provider {
            Provider::Streamable => (
                media::Request::Video {
                    url: streamable_file_url(&span.provider_id),
                },
                self.cfg.media_timeout,
            ),
            Provider::Twitter => (
                media::Request::Widget {
                    post_url: span.matched.clone(),
                },
                self.cfg.widget_timeout,
            ),
            _ => {
                slot.state = PlaceholderState::Error(Error::EmbedLoad {
                    provider: span.provider.as_str(),
                    reason: "not a lazily loaded embed".into(),
                });
                return;
            }
        };
        slot.state = PlaceholderState::Loading;
        slot.deadline = Some((Instant::now() + timeout, timeout));
        self.pool.enqueue(id.0, attempt, request);
    }

    fn apply(&mut self, done: Completion) -> Option<PlaceholderId> {
        let id = PlaceholderId(done.placeholder);
        let slot = self.slots.get_mut(&id)?;
        if slot.attempt != done.attempt || slot.state != PlaceholderState::Loading {
            debug!(placeholder = id.0, attempt = done.attempt, "stale embed result dropped");
            return None;
        }
        slot.deadline = None;
        slot.state = match (done.result, slot.span.provider) {
            (Ok(Output::Video(media)), _) => PlaceholderState::Loaded(EmbedContent::Video {
                url: media.url,
                content_type: media.content_type,
                size: media.bytes.len(),
            }),
            (Ok(Output::Widget(html)), _) => {
                PlaceholderState::Loaded(EmbedContent::Widget { html })
            }
            (Err(err), Provider::Streamable) => {
                debug!(placeholder = id.0, error = %err, "direct video failed, using player");
                PlaceholderState::Loaded(EmbedContent::Frame {
                    src: streamable_frame_src(&slot.span.provider_id),
                })
            }
            (Err(err), provider) => {
                warn!(
                    placeholder = id.0,
                    provider = provider.as_str(),
                    reason = err.reason_code(),
                    error = %err,
                    "embed failed"
                );
                PlaceholderState::Error(err)
            }
        };
        Some(id)
    }

    fn expire(&mut self, now: Instant) -> Vec<PlaceholderId> {
        let mut expired = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            let Some((at, after)) = slot.deadline else {
                continue;
            };
            if at > now || slot.state != PlaceholderState::Loading {
                continue;
            }
            let provider = slot.span.provider.as_str();
            warn!(placeholder = id.0, provider, reason = "timeout", after = ?after, "embed timed out");
            slot.deadline = None;
            slot.state = PlaceholderState::Error(Error::EmbedTimeout { provider, after });
            expired.push(*id);
        }
        expired
    }
}

impl PlaceholderRegistry for EmbedLifecycleManager {
    fn register(&mut self, span: &EmbedSpan) -> PlaceholderId {
        let id = PlaceholderId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                span: span.clone(),
                state: PlaceholderState::Unloaded,
                attempt: 0,
                deadline: None,
                observed: false,
                in_proximity: false,
            },
        );
        id
    }
}

pub fn youtube_src(video_id: &str, start: Option<u32>) -> String {
    match start {
        Some(start) => format!("https://www.youtube.com/embed/{video_id}?start={start}"),
        None => format!("https://www.youtube.com/embed/{video_id}"),
    }
}

pub fn youtube_thumbnail(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{video_id}/mqdefault.jpg")
}

pub fn streamable_file_url(video_id: &str) -> String {
    format!("https://cf-files.streamable.com/temp/{video_id}.mp4")
}

pub fn streamable_frame_src(video_id: &str) -> String {
    format!("https://streamable.com/e/{video_id}?loop=false")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::classify;
    use crate::error;
    use crate::media::FetchedMedia;
    use parking_lot::Mutex;
    use std::thread;

    /// Streamable ids starting with `slow` sleep past any test timeout,
    /// `bad` fails, everything else succeeds.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    impl MediaBackend for Scripted {
        fn fetch_video(&self, url: &str) -> error::Result<FetchedMedia> {
            self.calls.lock().push(url.to_string());
            if url.contains("/slow") {
                thread::sleep(Duration::from_millis(150));
            }
            if url.contains("/bad") {
                return Err(Error::EmbedLoad {
                    provider: "streamable",
                    reason: "status 404".into(),
                });
            }
            Ok(FetchedMedia {
                url: url.to_string(),
                content_type: "video/mp4".into(),
                bytes: vec![1, 2, 3],
            })
        }

        fn create_widget(&self, _post_url: &str) -> error::Result<String> {
            Err(Error::EmbedLoad {
                provider: "twitter",
                reason: "rate limited".into(),
            })
        }
    }

    fn manager(backend: Arc<Scripted>) -> EmbedLifecycleManager {
        EmbedLifecycleManager::new(
            LifecycleConfig {
                media_timeout: Duration::from_millis(40),
                widget_timeout: Duration::from_millis(40),
                ..LifecycleConfig::default()
            },
            backend,
            2,
        )
    }

    fn placeholder(mgr: &mut EmbedLifecycleManager, url: &str) -> PlaceholderId {
        let span = classify(url).remove(0);
        let id = mgr.register(&span);
        mgr.observe(id);
        id
    }

    #[test]
    fn frames_load_on_proximity_and_unload_when_far() {
        let mut mgr = manager(Arc::new(Scripted::default()));
        let id = placeholder(&mut mgr, "https://www.twitch.tv/videos/99?t=65");
        mgr.on_viewport_distance(id, 500);
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Unloaded));

        mgr.on_viewport_distance(id, DEFAULT_PROXIMITY_ROWS);
        assert_eq!(
            mgr.state(id),
            Some(&PlaceholderState::Loaded(EmbedContent::Frame {
                src: "https://player.twitch.tv/?video=99&parent=boards.4chan.org&autoplay=false&t=00h01m05s".into()
            }))
        );

        mgr.on_viewport_distance(id, DEFAULT_PROXIMITY_ROWS + 1);
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Unloaded));
    }

    #[test]
    fn timed_out_video_errors_then_reloads_fresh() {
        let backend = Arc::new(Scripted::default());
        let mut mgr = manager(backend.clone());
        let id = placeholder(&mut mgr, "https://streamable.com/slow1");

        mgr.on_intersection(id, true);
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Loading));
        let changed = mgr.pump(Duration::from_millis(100));
        assert_eq!(changed, vec![id]);
        assert!(matches!(
            mgr.state(id),
            Some(PlaceholderState::Error(Error::EmbedTimeout { provider: "streamable", .. }))
        ));

        // The slow fetch still finishes; its result must not be applied.
        assert!(mgr.pump(Duration::from_millis(150)).is_empty());
        assert!(matches!(mgr.state(id), Some(PlaceholderState::Error(_))));

        mgr.on_intersection(id, false);
        mgr.on_intersection(id, true);
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Loading));
        mgr.pump(Duration::from_millis(20));
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Loading));
        assert_eq!(backend.calls.lock().len(), 2);
    }

    #[test]
    fn failed_direct_video_falls_back_to_player() {
        let mut mgr = manager(Arc::new(Scripted::default()));
        let id = placeholder(&mut mgr, "https://streamable.com/bad2");
        assert!(mgr.activate(id));
        mgr.pump(Duration::from_millis(30));
        assert_eq!(
            mgr.state(id),
            Some(&PlaceholderState::Loaded(EmbedContent::Frame {
                src: "https://streamable.com/e/bad2?loop=false".into()
            }))
        );
    }

    #[test]
    fn activation_ignores_proximity_and_retries_errors() {
        let mut mgr = manager(Arc::new(Scripted::default()));
        let id = placeholder(&mut mgr, "https://x.com/someone/status/123");
        assert!(mgr.activate(id));
        assert!(!mgr.activate(id));
        mgr.pump(Duration::from_millis(30));
        assert!(matches!(
            mgr.state(id),
            Some(PlaceholderState::Error(Error::EmbedLoad { provider: "twitter", .. }))
        ));
        assert!(mgr.activate(id));
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Loading));
    }

    #[test]
    fn duplicate_placeholders_load_independently() {
        let backend = Arc::new(Scripted::default());
        let mut mgr = manager(backend.clone());
        let first = placeholder(&mut mgr, "https://streamable.com/abc");
        let second = placeholder(&mut mgr, "https://streamable.com/abc");
        mgr.activate(first);
        mgr.activate(second);
        mgr.pump(Duration::from_millis(30));
        for id in [first, second] {
            assert!(matches!(
                mgr.state(id),
                Some(PlaceholderState::Loaded(EmbedContent::Video { size: 3, .. }))
            ));
        }
        assert_eq!(backend.calls.lock().len(), 2);
    }

    #[test]
    fn unobserved_placeholders_ignore_proximity() {
        let mut mgr = manager(Arc::new(Scripted::default()));
        let span = classify("https://youtu.be/abc").remove(0);
        let id = mgr.register(&span);
        mgr.on_intersection(id, true);
        assert_eq!(mgr.state(id), Some(&PlaceholderState::Unloaded));
        mgr.reset();
        assert!(mgr.state(id).is_none());
    }
}
