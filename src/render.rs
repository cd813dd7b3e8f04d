use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use crate::lifecycle::{EmbedLifecycleManager, PlaceholderId};
use crate::model::{Message, MessageId};
use crate::quote::{Inline, MediaNode, QuoteResolver, RenderNode, RenderPass};
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Message(RenderNode),
    /// Separator opening an incrementally appended batch.
    Frame { id: String, label: String },
}

/// Where rendered blocks end up. Scrolling is expressed in the surface's own
/// row units.
pub trait Surface {
    fn clear(&mut self);
    fn append(&mut self, block: Block);
    fn contains_message(&self, id: MessageId) -> bool;
    /// Centers a top-level message. Returns false when it is not present.
    fn scroll_to_message(&mut self, id: MessageId) -> bool;
    fn scroll_to_end(&mut self);
    fn mark_selected(&mut self, id: Option<MessageId>);
    /// Distance in rows between each placeholder and the visible region.
    fn placeholder_distances(&self) -> Vec<(PlaceholderId, u32)>;
    /// True when layout is final as soon as blocks are appended, so a
    /// missing message will not appear by waiting.
    fn is_settled(&self) -> bool {
        false
    }
}

/// In-memory surface with a fixed-height viewport.
#[derive(Debug, Clone)]
pub struct FeedSurface {
    blocks: Vec<Block>,
    viewport_rows: usize,
    scroll_top: usize,
    selected: Option<MessageId>,
}

impl FeedSurface {
    pub fn new(viewport_rows: usize) -> Self {
        Self {
            blocks: Vec::new(),
            viewport_rows: viewport_rows.max(1),
            scroll_top: 0,
            selected: None,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn selected(&self) -> Option<MessageId> {
        self.selected
    }

    pub fn scroll_top(&self) -> usize {
        self.scroll_top
    }

    pub fn viewport_rows(&self) -> usize {
        self.viewport_rows
    }

    pub fn total_rows(&self) -> usize {
        self.blocks.iter().map(block_rows).sum()
    }

    pub fn scroll_by(&mut self, rows: isize) {
        let max = self.total_rows().saturating_sub(self.viewport_rows);
        let next = (self.scroll_top as isize).saturating_add(rows);
        self.scroll_top = next.clamp(0, max as isize) as usize;
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_top = 0;
    }

    /// Blocks overlapping the visible rows, in order.
    pub fn visible_blocks(&self) -> Vec<&Block> {
        let top = self.scroll_top;
        let bottom = top + self.viewport_rows;
        self.offsets()
            .filter(|(start, rows, _)| start + rows > top && *start < bottom)
            .map(|(_, _, block)| block)
            .collect()
    }

    fn offsets(&self) -> impl Iterator<Item = (usize, usize, &Block)> {
        self.blocks.iter().scan(0usize, |offset, block| {
            let start = *offset;
            let rows = block_rows(block);
            *offset += rows;
            Some((start, rows, block))
        })
    }
}

impl Surface for FeedSurface {
    fn clear(&mut self) {
        self.blocks.clear();
        self.scroll_top = 0;
        self.selected = None;
    }

    fn append(&mut self, block: Block) {
        self.blocks.push(block);
    }

    fn contains_message(&self, id: MessageId) -> bool {
        self.blocks
            .iter()
            .any(|block| matches!(block, Block::Message(node) if node.message_id() == id))
    }

    fn scroll_to_message(&mut self, id: MessageId) -> bool {
        let found = self.offsets().find_map(|(start, rows, block)| match block {
            Block::Message(node) if node.message_id() == id => Some((start, rows)),
            _ => None,
        });
        let Some((start, rows)) = found else {
            return false;
        };
        let center = start + rows / 2;
        let max = self.total_rows().saturating_sub(self.viewport_rows);
        self.scroll_top = center.saturating_sub(self.viewport_rows / 2).min(max);
        true
    }

    fn scroll_to_end(&mut self) {
        self.scroll_top = self.total_rows().saturating_sub(self.viewport_rows);
    }

    fn mark_selected(&mut self, id: Option<MessageId>) {
        self.selected = id;
    }

    fn is_settled(&self) -> bool {
        true
    }

    fn placeholder_distances(&self) -> Vec<(PlaceholderId, u32)> {
        let top = self.scroll_top;
        let bottom = top + self.viewport_rows;
        let mut out = Vec::new();
        for (start, rows, block) in self.offsets() {
            let Block::Message(node) = block else {
                continue;
            };
            let end = start + rows;
            let distance = if end <= top {
                top - end
            } else if start >= bottom {
                start - bottom
            } else {
                0
            };
            let mut ids = Vec::new();
            collect_placeholders(node, &mut ids);
            out.extend(ids.into_iter().map(|id| (id, distance as u32)));
        }
        out
    }
}

/// Rows a block occupies: a header and media line per message, one row per
/// body line, plus nested quotes.
pub fn block_rows(block: &Block) -> usize {
    match block {
        Block::Frame { .. } => 1,
        Block::Message(node) => node_rows(node),
    }
}

fn node_rows(node: &RenderNode) -> usize {
    node.display_order()
        .into_iter()
        .map(|node| match node {
            RenderNode::CycleMarker { .. } | RenderNode::Truncated { .. } => 1,
            RenderNode::Message(msg) => {
                let body_lines = msg
                    .body
                    .iter()
                    .map(|inline| match inline {
                        Inline::Text(text) => text.matches('\n').count(),
                        _ => 0,
                    })
                    .sum::<usize>()
                    + 1;
                1 + body_lines + usize::from(msg.media.is_some())
            }
        })
        .sum()
}

pub fn collect_placeholders(node: &RenderNode, out: &mut Vec<PlaceholderId>) {
    for node in node.display_order() {
        if let RenderNode::Message(msg) = node {
            out.extend(msg.body.iter().filter_map(|inline| match inline {
                Inline::Embed { placeholder, .. } => Some(*placeholder),
                _ => None,
            }));
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub media_base: String,
    pub board: String,
    pub scroll_attempts: u32,
    pub scroll_retry_delay: Duration,
    pub settle_delay: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            media_base: "https://i.4cdn.org".into(),
            board: "b".into(),
            scroll_attempts: 5,
            scroll_retry_delay: Duration::from_millis(750),
            settle_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollPlacement {
    Selected(MessageId),
    Newest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub rendered: usize,
    pub placeholders: usize,
    pub scroll: ScrollPlacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub frame_id: Option<String>,
    pub added: usize,
    pub placeholders: usize,
}

/// Builds the chronological feed on a [`Surface`].
pub struct RenderEngine {
    store: Store,
    settings: RenderSettings,
    lifecycle: EmbedLifecycleManager,
    rendered: HashSet<MessageId>,
}

impl RenderEngine {
    pub fn new(store: Store, settings: RenderSettings, lifecycle: EmbedLifecycleManager) -> Self {
        Self {
            store,
            settings,
            lifecycle,
            rendered: HashSet::new(),
        }
    }

    pub fn lifecycle(&self) -> &EmbedLifecycleManager {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut EmbedLifecycleManager {
        &mut self.lifecycle
    }

    /// Clears the surface and renders every stored message from a fresh
    /// read, then places the scroll position.
    pub fn full_render(&mut self, surface: &mut dyn Surface) -> Result<RenderOutcome> {
        let snapshot = self.store.snapshot().context("render: read store")?;
        surface.clear();
        self.lifecycle.reset();
        self.rendered.clear();

        let ordered = chronological(&snapshot.active_threads, &snapshot.messages);
        let resolver = QuoteResolver::new(
            &snapshot.messages,
            &snapshot.colors,
            &self.settings.media_base,
            &self.settings.board,
        );
        let mut pass = RenderPass::new(&mut self.lifecycle);
        let top = HashSet::new();
        for message in &ordered {
            let node = resolver.render(message, 0, &top, &mut pass);
            surface.append(Block::Message(node));
            self.rendered.insert(message.id);
        }
        let placeholders = pass.into_placeholders();
        for id in &placeholders {
            self.lifecycle.observe(*id);
        }

        let scroll = self.place_scroll(surface)?;
        info!(
            messages = ordered.len(),
            placeholders = placeholders.len(),
            "full render finished"
        );
        Ok(RenderOutcome {
            rendered: ordered.len(),
            placeholders: placeholders.len(),
            scroll,
        })
    }

    /// Renders only messages not on the surface yet, under a new frame.
    /// Existing blocks and the scroll position are left alone.
    pub fn append_new(&mut self, surface: &mut dyn Surface) -> Result<AppendOutcome> {
        let snapshot = self.store.snapshot().context("render: read store")?;
        let fresh: Vec<&Message> = chronological(&snapshot.active_threads, &snapshot.messages)
            .into_iter()
            .filter(|msg| !self.rendered.contains(&msg.id))
            .collect();
        if fresh.is_empty() {
            debug!("no new messages to append");
            return Ok(AppendOutcome {
                frame_id: None,
                added: 0,
                placeholders: 0,
            });
        }

        let (frame_id, label) = new_frame();
        surface.append(Block::Frame {
            id: frame_id.clone(),
            label,
        });

        let resolver = QuoteResolver::new(
            &snapshot.messages,
            &snapshot.colors,
            &self.settings.media_base,
            &self.settings.board,
        );
        let mut pass = RenderPass::new(&mut self.lifecycle);
        let top = HashSet::new();
        for message in &fresh {
            let node = resolver.render(message, 0, &top, &mut pass);
            surface.append(Block::Message(node));
            self.rendered.insert(message.id);
        }
        let placeholders = pass.into_placeholders();
        for id in &placeholders {
            self.lifecycle.observe(*id);
        }
        info!(frame = %frame_id, added = fresh.len(), "appended new messages");
        Ok(AppendOutcome {
            frame_id: Some(frame_id),
            added: fresh.len(),
            placeholders: placeholders.len(),
        })
    }

    /// Toggles the persisted selection for a top-level message.
    pub fn toggle_selection(
        &mut self,
        surface: &mut dyn Surface,
        id: MessageId,
    ) -> Result<Option<MessageId>> {
        if !surface.contains_message(id) {
            return Ok(self.store.selected_message()?);
        }
        let next = if self.store.selected_message()? == Some(id) {
            None
        } else {
            Some(id)
        };
        self.store
            .set_selected_message(next)
            .context("render: persist selection")?;
        surface.mark_selected(next);
        Ok(next)
    }

    /// Reports viewport distances to the lifecycle manager and applies any
    /// finished loads. Returns true when some placeholder changed state.
    pub fn refresh_embeds(&mut self, surface: &dyn Surface, wait: Duration) -> bool {
        let before: Vec<_> = self
            .lifecycle
            .ids()
            .into_iter()
            .map(|id| (id, self.lifecycle.state(id).map(|s| s.as_str())))
            .collect();
        for (id, distance) in surface.placeholder_distances() {
            self.lifecycle.on_viewport_distance(id, distance);
        }
        let changed = !self.lifecycle.pump(wait).is_empty();
        changed
            || before
                .into_iter()
                .any(|(id, state)| self.lifecycle.state(id).map(|s| s.as_str()) != state)
    }

    pub fn release(&mut self, surface: &mut dyn Surface) {
        surface.clear();
        self.lifecycle.reset();
        self.rendered.clear();
    }

    fn place_scroll(&self, surface: &mut dyn Surface) -> Result<ScrollPlacement> {
        let settled = surface.is_settled();
        if let Some(selected) = self.store.selected_message()? {
            let attempts = if settled {
                1
            } else {
                self.settings.scroll_attempts.max(1)
            };
            for attempt in 1..=attempts {
                if surface.scroll_to_message(selected) {
                    surface.mark_selected(Some(selected));
                    return Ok(ScrollPlacement::Selected(selected));
                }
                if attempt < attempts {
                    thread::sleep(self.settings.scroll_retry_delay);
                }
            }
            debug!(message = selected, attempts, "selected message not found");
        }
        if !settled {
            thread::sleep(self.settings.settle_delay);
        }
        surface.scroll_to_end();
        Ok(ScrollPlacement::Newest)
    }
}

/// All stored messages in time order. Ties keep the active-thread order and
/// each thread's stored order.
pub fn chronological<'a>(
    active: &[u64],
    messages: &'a crate::model::MessagesByThread,
) -> Vec<&'a Message> {
    let mut out: Vec<&Message> = active
        .iter()
        .filter_map(|id| messages.get(id))
        .flatten()
        .collect();
    out.sort_by_key(|msg| msg.time);
    out
}

fn new_frame() -> (String, String) {
    let now = Local::now();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    let id = format!("otk-frame-{}-{}", now.timestamp_millis(), suffix);
    let label = format!("New messages loaded at {}", now.format("%Y-%m-%d %H:%M:%S"));
    (id, label)
}

/// Media summary used by text views.
pub fn media_label(media: &MediaNode) -> String {
    match media {
        MediaNode::FullImage {
            url,
            filename,
            width,
            height,
        } => format!("[image {filename} {width}x{height}] {url}"),
        MediaNode::Thumbnail { url, filename, .. } => format!("[thumbnail {filename}] {url}"),
        MediaNode::Video { url, filename } => format!("[video {filename}] {url}"),
        MediaNode::Unsupported { extension } => format!("[Unsupported file type: {extension}]"),
    }
}
