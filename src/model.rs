use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ThreadId = u64;
pub type MessageId = u64;

pub type MessagesByThread = BTreeMap<ThreadId, Vec<Message>>;
pub type ThreadColors = BTreeMap<ThreadId, String>;

pub const UNTITLED: &str = "Untitled";

/// A single post, normalized and stored once merged. Never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub time: i64,
    pub text: String,
    pub title: String,
    #[serde(rename = "threadId")]
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(rename = "ext")]
    pub extension: String,
    #[serde(rename = "tn_w", default)]
    pub thumb_width: u32,
    #[serde(rename = "tn_h", default)]
    pub thumb_height: u32,
    #[serde(rename = "tim")]
    pub media_id: u64,
    #[serde(rename = "w", default)]
    pub width: u32,
    #[serde(rename = "h", default)]
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl Attachment {
    pub fn kind(&self) -> MediaKind {
        match self.extension.to_ascii_lowercase().as_str() {
            ".jpg" | ".jpeg" | ".png" | ".gif" => MediaKind::Image,
            ".webm" | ".mp4" => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }

    pub fn thumbnail_url(&self, media_base: &str, board: &str) -> String {
        format!(
            "{}/{}/{}s.jpg",
            media_base.trim_end_matches('/'),
            board,
            self.media_id
        )
    }

    pub fn full_url(&self, media_base: &str, board: &str) -> String {
        format!(
            "{}/{}/{}{}",
            media_base.trim_end_matches('/'),
            board,
            self.media_id,
            self.extension
        )
    }
}

/// A catalog entry that passed the keyword predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCandidate {
    pub id: ThreadId,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub threads: Vec<CatalogThread>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogThread {
    pub no: ThreadId,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub com: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadResponse {
    #[serde(default)]
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub no: MessageId,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub com: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub tn_w: Option<u32>,
    #[serde(default)]
    pub tn_h: Option<u32>,
    #[serde(default)]
    pub tim: Option<u64>,
    #[serde(default)]
    pub w: Option<u32>,
    #[serde(default)]
    pub h: Option<u32>,
}

impl Post {
    /// Attachment metadata exists only when the post names a file.
    pub fn attachment(&self) -> Option<Attachment> {
        let filename = self.filename.clone()?;
        Some(Attachment {
            filename,
            extension: self.ext.clone().unwrap_or_default(),
            thumb_width: self.tn_w.unwrap_or_default(),
            thumb_height: self.tn_h.unwrap_or_default(),
            media_id: self.tim.unwrap_or_default(),
            width: self.w.unwrap_or_default(),
            height: self.h.unwrap_or_default(),
        })
    }
}
