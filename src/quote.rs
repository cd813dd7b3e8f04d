use std::collections::{HashMap, HashSet};

use crate::embed::{self, Provider};
use crate::lifecycle::{PlaceholderId, PlaceholderRegistry};
use crate::markup;
use crate::model::{Attachment, MediaKind, Message, MessageId, MessagesByThread, ThreadColors, ThreadId};
use crate::sync::FALLBACK_COLOR;

/// Quoted nodes expanded for one top-level message before the rest of its
/// context is cut off. Only repeated fan-out reaches it; any chain a single
/// thread can hold stays well below.
pub const MAX_QUOTED_NODES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inline {
    Text(String),
    Link { url: String },
    /// A reference whose target is stored locally.
    QuoteLink { target: MessageId },
    Embed {
        placeholder: PlaceholderId,
        provider: Provider,
        url: String,
    },
    LinkCard { url: String, label: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaNode {
    FullImage {
        url: String,
        filename: String,
        width: u32,
        height: u32,
    },
    Thumbnail {
        url: String,
        full_url: String,
        filename: String,
        width: u32,
        height: u32,
    },
    Video { url: String, filename: String },
    Unsupported { extension: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNode {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub time: i64,
    pub title: String,
    pub depth: usize,
    /// Thread color; only top-level nodes carry one.
    pub color: Option<String>,
    /// Rendered above the body, in reference order.
    pub quoted: Vec<RenderNode>,
    pub body: Vec<Inline>,
    pub media: Option<MediaNode>,
}

// Quote chains can nest thousands of levels; unwind them without recursion.
impl Drop for MessageNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.quoted);
        while let Some(node) = pending.pop() {
            if let RenderNode::Message(mut msg) = node {
                pending.append(&mut msg.quoted);
            }
        }
    }
}

impl MessageNode {
    pub fn selectable(&self) -> bool {
        self.depth == 0
    }

    /// Alternating background for nested context.
    pub fn shaded(&self) -> bool {
        self.depth % 2 == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderNode {
    Message(MessageNode),
    /// A quote branch that would revisit a message already on the path.
    CycleMarker { message_id: MessageId },
    /// A quote branch left out once [`MAX_QUOTED_NODES`] were expanded.
    Truncated { message_id: MessageId },
}

impl RenderNode {
    pub fn message_id(&self) -> MessageId {
        match self {
            RenderNode::Message(node) => node.id,
            RenderNode::CycleMarker { message_id } | RenderNode::Truncated { message_id } => {
                *message_id
            }
        }
    }

    /// Every node of the tree in the order it is shown: quoted context
    /// first, then the message quoting it.
    pub fn display_order(&self) -> Vec<&RenderNode> {
        let mut out = Vec::new();
        let mut stack = vec![(self, false)];
        while let Some((node, expanded)) = stack.pop() {
            match node {
                RenderNode::Message(msg) if !expanded => {
                    stack.push((node, true));
                    stack.extend(msg.quoted.iter().rev().map(|child| (child, false)));
                }
                _ => out.push(node),
            }
        }
        out
    }

    pub fn cycle_markers(&self) -> usize {
        self.display_order()
            .into_iter()
            .filter(|node| matches!(node, RenderNode::CycleMarker { .. }))
            .count()
    }

    pub fn truncated_markers(&self) -> usize {
        self.display_order()
            .into_iter()
            .filter(|node| matches!(node, RenderNode::Truncated { .. }))
            .count()
    }
}

/// State shared by every message rendered in one pass.
pub struct RenderPass<'r> {
    registry: &'r mut dyn PlaceholderRegistry,
    full_size_seen: HashSet<u64>,
    placeholders: Vec<PlaceholderId>,
    /// Quoted nodes expanded under the current top-level message.
    expanded: usize,
}

impl<'r> RenderPass<'r> {
    pub fn new(registry: &'r mut dyn PlaceholderRegistry) -> Self {
        Self {
            registry,
            full_size_seen: HashSet::new(),
            placeholders: Vec::new(),
            expanded: 0,
        }
    }

    /// Placeholders registered so far, in render order.
    pub fn placeholders(&self) -> &[PlaceholderId] {
        &self.placeholders
    }

    pub fn into_placeholders(self) -> Vec<PlaceholderId> {
        self.placeholders
    }
}

/// Renders messages together with the stored messages they quote.
pub struct QuoteResolver<'a> {
    index: HashMap<MessageId, &'a Message>,
    colors: &'a ThreadColors,
    media_base: &'a str,
    board: &'a str,
}

impl<'a> QuoteResolver<'a> {
    pub fn new(
        messages: &'a MessagesByThread,
        colors: &'a ThreadColors,
        media_base: &'a str,
        board: &'a str,
    ) -> Self {
        let index = messages
            .values()
            .flatten()
            .map(|msg| (msg.id, msg))
            .collect();
        Self {
            index,
            colors,
            media_base,
            board,
        }
    }

    pub fn lookup(&self, id: MessageId) -> Option<&'a Message> {
        self.index.get(&id).copied()
    }

    /// Renders `message` at `depth`. Quoted messages found locally are
    /// rendered first at `depth + 1`; a reference back to anything in
    /// `ancestors` becomes a cycle marker instead. Context beyond
    /// [`MAX_QUOTED_NODES`] is replaced by a truncation marker.
    ///
    /// The walk keeps its own stack, so chain length is not bounded by the
    /// thread's call stack.
    pub fn render(
        &self,
        message: &Message,
        depth: usize,
        ancestors: &HashSet<MessageId>,
        pass: &mut RenderPass<'_>,
    ) -> RenderNode {
        let mut path = ancestors.clone();
        let mut root = match self.open(message, depth, &path, pass) {
            Opened::Done(node) => return node,
            Opened::Frame(frame) => frame,
        };
        path.insert(message.id);

        let mut stack: Vec<Frame<'_>> = Vec::new();
        loop {
            let top = stack.last_mut().unwrap_or(&mut root);
            match top.refs.next() {
                Some(target) => {
                    let Some(found) = self.lookup(target) else {
                        continue;
                    };
                    match self.open(found, top.depth + 1, &path, pass) {
                        Opened::Done(node) => top.quoted.push(node),
                        Opened::Frame(frame) => {
                            path.insert(found.id);
                            stack.push(frame);
                        }
                    }
                }
                None => match stack.pop() {
                    Some(frame) => {
                        path.remove(&frame.message.id);
                        let node = self.close(frame, pass);
                        stack.last_mut().unwrap_or(&mut root).quoted.push(node);
                    }
                    None => break,
                },
            }
        }
        self.close(root, pass)
    }

    /// Starts a message, or settles it at once as a marker.
    fn open<'m>(
        &self,
        message: &'m Message,
        depth: usize,
        path: &HashSet<MessageId>,
        pass: &mut RenderPass<'_>,
    ) -> Opened<'m> {
        if path.contains(&message.id) {
            return Opened::Done(RenderNode::CycleMarker {
                message_id: message.id,
            });
        }
        if depth == 0 {
            pass.expanded = 0;
        } else {
            if pass.expanded >= MAX_QUOTED_NODES {
                return Opened::Done(RenderNode::Truncated {
                    message_id: message.id,
                });
            }
            pass.expanded += 1;
        }
        let text = markup::decode_entities(&message.text).into_owned();
        let refs = embed::quote_references(&text).into_iter();
        Opened::Frame(Frame {
            message,
            depth,
            text,
            refs,
            quoted: Vec::new(),
        })
    }

    /// Builds the node once every quoted branch is done. Body and media come
    /// after the quoted context so placeholders register in display order.
    fn close(&self, frame: Frame<'_>, pass: &mut RenderPass<'_>) -> RenderNode {
        let Frame {
            message,
            depth,
            text,
            quoted,
            ..
        } = frame;
        let body = self.body(&text, pass);
        let media = message
            .attachment
            .as_ref()
            .filter(|attach| attach.media_id != 0)
            .map(|attach| self.media(attach, pass));
        let color = (depth == 0).then(|| {
            self.colors
                .get(&message.thread_id)
                .cloned()
                .unwrap_or_else(|| FALLBACK_COLOR.to_string())
        });

        RenderNode::Message(MessageNode {
            id: message.id,
            thread_id: message.thread_id,
            time: message.time,
            title: markup::decode_entities(&message.title).into_owned(),
            depth,
            color,
            quoted,
            body,
            media,
        })
    }

    fn body(&self, text: &str, pass: &mut RenderPass<'_>) -> Vec<Inline> {
        let mut out = Vec::new();
        let mut cursor = 0;
        for span in embed::classify(text) {
            if span.source_range.start > cursor {
                out.push(Inline::Text(text[cursor..span.source_range.start].to_string()));
            }
            cursor = span.source_range.end;
            let inline = match span.provider {
                Provider::Quote => match span.quote_target().filter(|id| self.index.contains_key(id)) {
                    Some(target) => Inline::QuoteLink { target },
                    None => Inline::Text(span.matched.clone()),
                },
                Provider::Link => Inline::Link {
                    url: span.matched.clone(),
                },
                Provider::Rumble => Inline::LinkCard {
                    label: embed::rumble_label(&span.matched, &span.provider_id),
                    url: span.matched.clone(),
                },
                provider => {
                    let placeholder = pass.registry.register(&span);
                    pass.placeholders.push(placeholder);
                    Inline::Embed {
                        placeholder,
                        provider,
                        url: span.matched.clone(),
                    }
                }
            };
            out.push(inline);
        }
        if cursor < text.len() {
            out.push(Inline::Text(text[cursor..].to_string()));
        }
        merge_text(out)
    }

    fn media(&self, attach: &Attachment, pass: &mut RenderPass<'_>) -> MediaNode {
        let full_url = attach.full_url(self.media_base, self.board);
        match attach.kind() {
            MediaKind::Image => {
                if pass.full_size_seen.insert(attach.media_id) {
                    MediaNode::FullImage {
                        url: full_url,
                        filename: attach.filename.clone(),
                        width: attach.width,
                        height: attach.height,
                    }
                } else {
                    MediaNode::Thumbnail {
                        url: attach.thumbnail_url(self.media_base, self.board),
                        full_url,
                        filename: attach.filename.clone(),
                        width: attach.thumb_width,
                        height: attach.thumb_height,
                    }
                }
            }
            MediaKind::Video => MediaNode::Video {
                url: full_url,
                filename: attach.filename.clone(),
            },
            MediaKind::Other => MediaNode::Unsupported {
                extension: attach.extension.clone(),
            },
        }
    }
}

/// A message whose quoted references are still being walked.
struct Frame<'m> {
    message: &'m Message,
    depth: usize,
    text: String,
    refs: std::vec::IntoIter<MessageId>,
    quoted: Vec<RenderNode>,
}

enum Opened<'m> {
    Done(RenderNode),
    Frame(Frame<'m>),
}

fn merge_text(nodes: Vec<Inline>) -> Vec<Inline> {
    let mut out: Vec<Inline> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match (out.last_mut(), node) {
            (Some(Inline::Text(prev)), Inline::Text(next)) => prev.push_str(&next),
            (_, node) => out.push(node),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedSpan;

    #[derive(Default)]
    struct Counter {
        next: u64,
        spans: Vec<EmbedSpan>,
    }

    impl PlaceholderRegistry for Counter {
        fn register(&mut self, span: &EmbedSpan) -> PlaceholderId {
            self.next += 1;
            self.spans.push(span.clone());
            PlaceholderId(self.next)
        }
    }

    fn message(id: MessageId, time: i64, text: &str) -> Message {
        Message {
            id,
            time,
            text: text.into(),
            title: "otk".into(),
            thread_id: 101,
            attachment: None,
        }
    }

    fn store(messages: Vec<Message>) -> MessagesByThread {
        let mut map = MessagesByThread::new();
        map.insert(101, messages);
        map
    }

    fn render_one(messages: &MessagesByThread, id: MessageId) -> RenderNode {
        let colors = ThreadColors::new();
        let resolver = QuoteResolver::new(messages, &colors, "https://i.4cdn.org", "b");
        let mut registry = Counter::default();
        let mut pass = RenderPass::new(&mut registry);
        let target = resolver.lookup(id).unwrap();
        resolver.render(target, 0, &HashSet::new(), &mut pass)
    }

    #[test]
    fn quoted_message_renders_above_reply() {
        let messages = store(vec![message(2, 50, "&gt;&gt;1"), message(1, 100, "hello")]);
        let RenderNode::Message(node) = render_one(&messages, 2) else {
            panic!("expected message node");
        };
        assert_eq!(node.quoted.len(), 1);
        let RenderNode::Message(parent) = &node.quoted[0] else {
            panic!("expected quoted message");
        };
        assert_eq!(parent.id, 1);
        assert_eq!(parent.depth, 1);
        assert!(parent.shaded());
        assert!(parent.color.is_none());
        assert_eq!(node.body, vec![Inline::QuoteLink { target: 1 }]);
        assert_eq!(node.color.as_deref(), Some(FALLBACK_COLOR));
    }

    #[test]
    fn mutual_quotes_terminate_with_one_marker() {
        let messages = store(vec![message(10, 1, ">>11 a"), message(11, 2, ">>10 b")]);
        let node = render_one(&messages, 10);
        assert_eq!(node.cycle_markers(), 1);

        let selfish = store(vec![message(5, 1, ">>5 me")]);
        assert_eq!(render_one(&selfish, 5).cycle_markers(), 1);
    }

    fn chain(len: u64, quotes_per_link: usize) -> MessagesByThread {
        store(
            (1..=len)
                .map(|id| {
                    let text = if id == 1 {
                        "root".to_string()
                    } else {
                        vec![format!(">>{}", id - 1); quotes_per_link].join(" ")
                    };
                    message(id, id as i64, &text)
                })
                .collect(),
        )
    }

    fn messages_in(node: &RenderNode) -> Vec<&MessageNode> {
        node.display_order()
            .into_iter()
            .filter_map(|node| match node {
                RenderNode::Message(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn long_acyclic_chain_renders_fully() {
        let messages = chain(50, 1);
        let node = render_one(&messages, 50);
        let shown = messages_in(&node);
        assert_eq!(shown.len(), 50);
        // Oldest context first, the top-level message last.
        for (i, msg) in shown.iter().enumerate() {
            assert_eq!(msg.id, i as u64 + 1);
            assert_eq!(msg.depth, 49 - i);
        }
    }

    #[test]
    fn chain_thousands_deep_renders_without_recursion() {
        let messages = chain(4_000, 1);
        let node = render_one(&messages, 4_000);
        let shown = messages_in(&node);
        assert_eq!(shown.len(), 4_000);
        assert_eq!(shown[0].id, 1);
        assert_eq!(shown[0].depth, 3_999);
        assert_eq!(node.truncated_markers(), 0);
        assert_eq!(node.cycle_markers(), 0);
        drop(node);
    }

    #[test]
    fn oversized_context_is_cut_at_the_node_budget() {
        let messages = chain(10_000, 1);
        let node = render_one(&messages, 10_000);
        assert_eq!(messages_in(&node).len(), MAX_QUOTED_NODES + 1);
        assert_eq!(node.truncated_markers(), 1);
    }

    #[test]
    fn repeated_quotes_stay_within_the_node_budget() {
        // Each post quotes its predecessor twice: 2^30 paths uncapped.
        let messages = chain(30, 2);
        let colors = ThreadColors::new();
        let resolver = QuoteResolver::new(&messages, &colors, "https://i.4cdn.org", "b");
        let mut registry = Counter::default();
        let mut pass = RenderPass::new(&mut registry);
        // The budget is per top-level message.
        for id in [30, 29] {
            let node = resolver.render(resolver.lookup(id).unwrap(), 0, &HashSet::new(), &mut pass);
            assert_eq!(messages_in(&node).len(), MAX_QUOTED_NODES + 1);
            assert!(node.truncated_markers() > 0);
            assert_eq!(node.cycle_markers(), 0);
        }
    }

    #[test]
    fn unresolved_reference_is_plain_text() {
        let messages = store(vec![message(3, 1, "&gt;&gt;999 where")]);
        let RenderNode::Message(node) = render_one(&messages, 3) else {
            panic!("expected message node");
        };
        assert!(node.quoted.is_empty());
        assert_eq!(node.body, vec![Inline::Text(">>999 where".into())]);
    }

    #[test]
    fn embeds_register_placeholders_and_rumble_is_a_card() {
        let messages = store(vec![message(
            4,
            1,
            "clip https://youtu.be/abc then https://rumble.com/v9xy-best-goal.html",
        )]);
        let colors = ThreadColors::new();
        let resolver = QuoteResolver::new(&messages, &colors, "https://i.4cdn.org", "b");
        let mut registry = Counter::default();
        let mut pass = RenderPass::new(&mut registry);
        let node = resolver.render(resolver.lookup(4).unwrap(), 0, &HashSet::new(), &mut pass);
        assert_eq!(pass.placeholders(), &[PlaceholderId(1)]);
        let RenderNode::Message(node) = node else {
            panic!("expected message node");
        };
        assert_eq!(
            node.body,
            vec![
                Inline::Text("clip ".into()),
                Inline::Embed {
                    placeholder: PlaceholderId(1),
                    provider: Provider::YouTube,
                    url: "https://youtu.be/abc".into()
                },
                Inline::Text(" then ".into()),
                Inline::LinkCard {
                    url: "https://rumble.com/v9xy-best-goal.html".into(),
                    label: "View on Rumble: Best goal".into()
                },
            ]
        );
    }

    #[test]
    fn repeated_image_degrades_to_thumbnail_within_a_pass() {
        let attach = Attachment {
            filename: "pic".into(),
            extension: ".png".into(),
            thumb_width: 125,
            thumb_height: 100,
            media_id: 777,
            width: 1000,
            height: 800,
        };
        let mut first = message(1, 1, "first");
        first.attachment = Some(attach.clone());
        let mut second = message(2, 2, "&gt;&gt;1 again");
        second.attachment = Some(attach);
        let mut video = message(3, 3, "vid");
        video.attachment = Some(Attachment {
            extension: ".webm".into(),
            media_id: 888,
            ..first.attachment.clone().unwrap()
        });
        let messages = store(vec![first, second, video]);
        let colors = ThreadColors::new();
        let resolver = QuoteResolver::new(&messages, &colors, "https://i.4cdn.org", "b");
        let mut registry = Counter::default();
        let mut pass = RenderPass::new(&mut registry);
        let none = HashSet::new();

        let RenderNode::Message(reply) = resolver.render(resolver.lookup(2).unwrap(), 0, &none, &mut pass) else {
            panic!("expected message node");
        };
        let RenderNode::Message(quoted) = &reply.quoted[0] else {
            panic!("expected quoted message");
        };
        assert!(matches!(quoted.media, Some(MediaNode::FullImage { .. })));
        assert_eq!(
            reply.media,
            Some(MediaNode::Thumbnail {
                url: "https://i.4cdn.org/b/777s.jpg".into(),
                full_url: "https://i.4cdn.org/b/777.png".into(),
                filename: "pic".into(),
                width: 125,
                height: 100,
            })
        );

        let RenderNode::Message(clip) = resolver.render(resolver.lookup(3).unwrap(), 0, &none, &mut pass) else {
            panic!("expected message node");
        };
        assert_eq!(
            clip.media,
            Some(MediaNode::Video {
                url: "https://i.4cdn.org/b/888.webm".into(),
                filename: "pic".into()
            })
        );
    }
}
