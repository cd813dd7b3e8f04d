use chrono::{Local, TimeZone};
use textwrap::{wrap, Options as WrapOptions};

use crate::embed::Provider;
use crate::lifecycle::{self, EmbedContent, EmbedLifecycleManager, PlaceholderId, PlaceholderState};
use crate::markup;
use crate::quote::{Inline, MessageNode, RenderNode};
use crate::render::{media_label, Block, FeedSurface};
use crate::sync::ThreadSummary;

/// Nesting shown by indentation; deeper context keeps the last indent.
const MAX_INDENT_LEVELS: usize = 16;

/// `#id date time`, in local time.
pub fn message_header(id: u64, time: i64) -> String {
    match Local.timestamp_opt(time, 0).single() {
        Some(at) => format!("#{} {}", id, at.format("%Y-%m-%d %H:%M:%S")),
        None => format!("#{id}"),
    }
}

pub fn thread_list(summaries: &[ThreadSummary]) -> Vec<String> {
    summaries
        .iter()
        .map(|thread| {
            let since = thread
                .first_time
                .and_then(|time| Local.timestamp_opt(time, 0).single())
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            format!(
                "■ {} {} ({} messages{}{})",
                thread.color,
                thread.title,
                thread.message_count,
                if since.is_empty() { "" } else { ", since " },
                since
            )
        })
        .collect()
}

/// Plain-text rendition of every block on the surface.
pub fn feed_lines(surface: &FeedSurface, embeds: &EmbedLifecycleManager, width: usize) -> Vec<String> {
    block_lines(surface.blocks().iter(), surface, embeds, width)
}

/// The blocks within the viewport, under a position line.
pub fn viewport_lines(
    surface: &FeedSurface,
    embeds: &EmbedLifecycleManager,
    width: usize,
) -> Vec<String> {
    let total = surface.total_rows();
    let first = surface.scroll_top().min(total);
    let last = (surface.scroll_top() + surface.viewport_rows()).min(total);
    let mut lines = vec![format!("── rows {first}-{last} of {total} ──")];
    lines.extend(block_lines(surface.visible_blocks().into_iter(), surface, embeds, width));
    lines
}

fn block_lines<'b>(
    blocks: impl Iterator<Item = &'b Block>,
    surface: &FeedSurface,
    embeds: &EmbedLifecycleManager,
    width: usize,
) -> Vec<String> {
    let width = width.max(20);
    let mut lines = Vec::new();
    for block in blocks {
        match block {
            Block::Frame { label, .. } => lines.push(format!("──── {label} ────")),
            Block::Message(node) => {
                node_lines(node, surface.selected(), embeds, width, &mut lines);
                lines.push(String::new());
            }
        }
    }
    lines
}

fn node_lines(
    node: &RenderNode,
    selected: Option<u64>,
    embeds: &EmbedLifecycleManager,
    width: usize,
    out: &mut Vec<String>,
) {
    for node in node.display_order() {
        let msg = match node {
            RenderNode::CycleMarker { message_id } => {
                out.push(format!("  (circular quote to #{message_id} skipped)"));
                continue;
            }
            RenderNode::Truncated { message_id } => {
                out.push(format!("  (quote context truncated at #{message_id})"));
                continue;
            }
            RenderNode::Message(msg) => msg,
        };
        let prefix = indent(msg);
        let header = message_header(msg.id, msg.time);
        match &msg.color {
            Some(color) => {
                let mark = if selected == Some(msg.id) { '*' } else { ' ' };
                out.push(format!("{mark}■ {color} {header}"));
            }
            None => out.push(format!("{prefix}{header}")),
        }

        let body = body_text(msg, embeds);
        let options = WrapOptions::new(width)
            .initial_indent(&prefix)
            .subsequent_indent(&prefix);
        for paragraph in body.split('\n') {
            if paragraph.is_empty() {
                out.push(prefix.trim_end().to_string());
                continue;
            }
            out.extend(wrap(paragraph, &options).into_iter().map(|line| line.into_owned()));
        }
        if let Some(media) = &msg.media {
            out.push(format!("{prefix}{}", media_label(media)));
        }
    }
}

fn indent(msg: &MessageNode) -> String {
    if msg.depth == 0 {
        return "   ".to_string();
    }
    let bar = if msg.shaded() { "▌ " } else { "│ " };
    let levels = (msg.depth - 1).min(MAX_INDENT_LEVELS);
    format!("{}{}", "  ".repeat(levels), bar)
}

fn body_text(msg: &MessageNode, embeds: &EmbedLifecycleManager) -> String {
    let mut text = String::new();
    for inline in &msg.body {
        match inline {
            Inline::Text(chunk) => text.push_str(chunk),
            Inline::Link { url } => text.push_str(url),
            Inline::QuoteLink { target } => text.push_str(&format!(">>{target}")),
            Inline::LinkCard { url, label } => text.push_str(&format!("[{label}] {url}")),
            Inline::Embed {
                placeholder,
                provider,
                url,
            } => text.push_str(&embed_text(*placeholder, *provider, url, embeds)),
        }
    }
    text
}

pub fn embed_text(
    id: PlaceholderId,
    provider: Provider,
    url: &str,
    embeds: &EmbedLifecycleManager,
) -> String {
    let label = provider.placeholder_label();
    match embeds.state(id) {
        None | Some(PlaceholderState::Unloaded) => match (provider, embeds.span(id)) {
            (Provider::YouTube, Some(span)) => format!(
                "[{id}: {label} {}]",
                lifecycle::youtube_thumbnail(&span.provider_id)
            ),
            _ => format!("[{id}: {label}]"),
        },
        Some(PlaceholderState::Loading) => format!("[{id}: loading {label}]"),
        Some(PlaceholderState::Loaded(EmbedContent::Frame { src })) => format!("[{id}: {src}]"),
        Some(PlaceholderState::Loaded(EmbedContent::Video {
            url,
            content_type,
            size,
        })) => format!("[{id}: video {url} ({content_type}, {size} bytes)]"),
        Some(PlaceholderState::Loaded(EmbedContent::Widget { html })) => {
            let plain = markup::normalize_comment(html);
            format!("[{id}: {}]", markup::decode_entities(plain.trim()))
        }
        Some(PlaceholderState::Error(err)) => {
            format!("[{id}: failed ({}), open {url}]", err.reason_code())
        }
    }
}
