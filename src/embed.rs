use std::ops::Range;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbedKind {
    Video,
    SocialPost,
    GenericLink,
    QuoteReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    YouTube,
    TwitchClip,
    TwitchVod,
    Streamable,
    Rumble,
    Twitter,
    Link,
    Quote,
}

impl Provider {
    pub fn kind(&self) -> EmbedKind {
        match self {
            Provider::YouTube
            | Provider::TwitchClip
            | Provider::TwitchVod
            | Provider::Streamable
            | Provider::Rumble => EmbedKind::Video,
            Provider::Twitter => EmbedKind::SocialPost,
            Provider::Link => EmbedKind::GenericLink,
            Provider::Quote => EmbedKind::QuoteReference,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::YouTube => "youtube",
            Provider::TwitchClip => "twitch_clip",
            Provider::TwitchVod => "twitch_vod",
            Provider::Streamable => "streamable",
            Provider::Rumble => "rumble",
            Provider::Twitter => "twitter",
            Provider::Link => "link",
            Provider::Quote => "quote",
        }
    }

    /// Text shown on an unloaded placeholder.
    pub fn placeholder_label(&self) -> &'static str {
        match self {
            Provider::YouTube => "YouTube Video",
            Provider::TwitchClip => "Twitch Clip",
            Provider::TwitchVod => "Twitch VOD",
            Provider::Streamable => "Streamable Video",
            Provider::Rumble => "Rumble Video",
            Provider::Twitter => "Loading Tweet...",
            Provider::Link => "Link",
            Provider::Quote => "Quote",
        }
    }
}

/// One classified region of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedSpan {
    pub kind: EmbedKind,
    pub provider: Provider,
    /// Video or status id, the quoted message id, or the URL for plain links.
    pub provider_id: String,
    /// Start offset in seconds, when the URL carried a non-zero one.
    pub start: Option<u32>,
    /// Twitter handle for status URLs.
    pub author: Option<String>,
    pub matched: String,
    pub source_range: Range<usize>,
}

impl EmbedSpan {
    /// Rumble links are never loaded lazily; they render as a link card.
    pub fn is_lazy(&self) -> bool {
        matches!(
            self.provider,
            Provider::YouTube
                | Provider::TwitchClip
                | Provider::TwitchVod
                | Provider::Streamable
                | Provider::Twitter
        )
    }

    pub fn quote_target(&self) -> Option<u64> {
        match self.provider {
            Provider::Quote => self.provider_id.parse().ok(),
            _ => None,
        }
    }
}

fn pattern(raw: &str) -> Regex {
    Regex::new(raw).expect("embed pattern")
}

static YOUTUBE: Lazy<Regex> = Lazy::new(|| {
    pattern(r"https?://(?:www\.youtube\.com/watch\?v=|youtu\.be/)([a-zA-Z0-9_-]+)((?:[?&][a-zA-Z0-9_=&%.:+-]*)*)")
});
static TWITTER: Lazy<Regex> =
    Lazy::new(|| pattern(r"https?://(?:twitter\.com|x\.com)/([a-zA-Z0-9_]+)/status/([0-9]+)"));
static RUMBLE: Lazy<Regex> = Lazy::new(|| {
    pattern(r#"https?://rumble\.com/(?:embed/)?(v[a-zA-Z0-9]+)(?:-[^\s"'>?&.]*)?(?:\.html)?(?:\?[^\s"'>]*)?"#)
});
static TWITCH_CLIP: Lazy<Regex> = Lazy::new(|| {
    pattern(r#"https?://(?:clips\.twitch\.tv/|(?:www\.)?twitch\.tv/[a-zA-Z0-9_]+/clip/)([a-zA-Z0-9_-]+)(?:\?[^\s"'>]*)?"#)
});
static TWITCH_VOD: Lazy<Regex> = Lazy::new(|| {
    pattern(r"https?://(?:www\.)?twitch\.tv/videos/([0-9]+)((?:[?&][a-zA-Z0-9_=&%.:+-]*)*)")
});
static STREAMABLE: Lazy<Regex> =
    Lazy::new(|| pattern(r#"https?://streamable\.com/([a-zA-Z0-9]+)(?:\?[^\s"'>]*)?"#));
static GENERIC_LINK: Lazy<Regex> =
    Lazy::new(|| pattern(r#"https?://[^\s<>"']+[^\s<>"'.?!,:;)]"#));
static QUOTE: Lazy<Regex> = Lazy::new(|| pattern(r">>(\d+)"));

static TIME_PARAM: Lazy<Regex> = Lazy::new(|| pattern(r"[?&](?:t|start)=([^&]+)"));
static HOURS: Lazy<Regex> = Lazy::new(|| pattern(r"(\d+)h"));
static MINUTES: Lazy<Regex> = Lazy::new(|| pattern(r"(\d+)m"));
static SECONDS: Lazy<Regex> = Lazy::new(|| pattern(r"(\d+)s"));
static RUMBLE_SLUG: Lazy<Regex> = Lazy::new(|| {
    pattern(r"rumble\.com/(?:v[a-zA-Z0-9]+-)?([a-zA-Z0-9_-]+)(?:\.html|$|\?)")
});

type Extractor = fn(&Captures<'_>) -> (String, Option<u32>, Option<String>);

fn id_only(caps: &Captures<'_>) -> (String, Option<u32>, Option<String>) {
    (caps[1].to_string(), None, None)
}

fn id_with_offset(caps: &Captures<'_>) -> (String, Option<u32>, Option<String>) {
    let start = caps.get(2).and_then(|params| start_offset(params.as_str()));
    (caps[1].to_string(), start, None)
}

fn status(caps: &Captures<'_>) -> (String, Option<u32>, Option<String>) {
    (caps[2].to_string(), None, Some(caps[1].to_string()))
}

fn whole_match(caps: &Captures<'_>) -> (String, Option<u32>, Option<String>) {
    (caps[0].to_string(), None, None)
}

/// Priority order. A region claimed by an earlier pattern is masked before
/// later patterns run.
fn rules() -> [(&'static Lazy<Regex>, Provider, Extractor); 8] {
    [
        (&YOUTUBE, Provider::YouTube, id_with_offset),
        (&TWITTER, Provider::Twitter, status),
        (&RUMBLE, Provider::Rumble, id_only),
        (&TWITCH_CLIP, Provider::TwitchClip, id_only),
        (&TWITCH_VOD, Provider::TwitchVod, id_with_offset),
        (&STREAMABLE, Provider::Streamable, id_only),
        (&GENERIC_LINK, Provider::Link, whole_match),
        (&QUOTE, Provider::Quote, id_only),
    ]
}

/// Classifies entity-decoded message text into embed spans ordered by
/// position. Pure and deterministic.
pub fn classify(text: &str) -> Vec<EmbedSpan> {
    let mut masked = text.to_string();
    let mut spans = Vec::new();

    for (regex, provider, extract) in rules() {
        let mut claimed = Vec::new();
        for caps in regex.captures_iter(&masked) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let (provider_id, start, author) = extract(&caps);
            spans.push(EmbedSpan {
                kind: provider.kind(),
                provider,
                provider_id,
                start,
                author,
                matched: text[whole.range()].to_string(),
                source_range: whole.range(),
            });
            claimed.push(whole.range());
        }
        for range in claimed {
            mask(&mut masked, range);
        }
    }

    spans.sort_by_key(|span| span.source_range.start);
    spans
}

/// Ids referenced by `>>id` markers, in order of appearance.
pub fn quote_references(text: &str) -> Vec<u64> {
    QUOTE
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

fn mask(text: &mut String, range: Range<usize>) {
    // Ranges come from regex matches, so they sit on char boundaries and
    // an all-space replacement keeps byte offsets stable.
    let blank = " ".repeat(range.len());
    text.replace_range(range, &blank);
}

/// Seconds from `t=` or `start=` in a URL parameter string. Zero means none.
pub fn start_offset(params: &str) -> Option<u32> {
    let caps = TIME_PARAM.captures(params)?;
    parse_time(&caps[1])
}

/// Accepts `90` or `1h2m3s` style values.
pub fn parse_time(value: &str) -> Option<u32> {
    if value.is_empty() {
        return None;
    }
    let total = if value.bytes().all(|b| b.is_ascii_digit()) {
        value.parse::<u32>().ok()?
    } else {
        let part = |regex: &Regex| -> u32 {
            regex
                .captures(value)
                .and_then(|caps| caps[1].parse::<u32>().ok())
                .unwrap_or(0)
        };
        part(&HOURS)
            .saturating_mul(3600)
            .saturating_add(part(&MINUTES).saturating_mul(60))
            .saturating_add(part(&SECONDS))
    };
    (total > 0).then_some(total)
}

/// `00h01m05s` style offset for the Twitch player.
pub fn twitch_time(seconds: u32) -> String {
    format!(
        "{:02}h{:02}m{:02}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Label for a Rumble link card, derived from the URL slug when it has one.
pub fn rumble_label(url: &str, clip_id: &str) -> String {
    let slug = RUMBLE_SLUG
        .captures(url)
        .map(|caps| caps[1].to_string())
        .filter(|slug| !slug.eq_ignore_ascii_case("embed"));
    match slug {
        Some(slug) => {
            let spaced = slug.replace(|c: char| c == '-' || c == '_', " ");
            let mut chars = spaced.chars();
            let title = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            };
            format!("View on Rumble: {title}")
        }
        None => format!("View on Rumble (Clip ID: {clip_id})"),
    }
}
