use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::{self, Error};
use crate::markup;
use crate::model::{CatalogPage, Message, ThreadCandidate, ThreadId, ThreadResponse, UNTITLED};

pub const DEFAULT_API_BASE: &str = "https://boards.4chan.org";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Falls back to [`DEFAULT_API_BASE`] when empty.
    pub api_base: String,
    pub board: String,
    pub keyword: String,
    pub http_client: Option<HttpClient>,
}

/// Read-only client for the board's JSON API: one catalog scan, one thread
/// fetch at a time.
pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: String,
    board: String,
    keyword: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("board client user agent required");
        }
        if config.board.trim().is_empty() {
            bail!("board client board name required");
        }

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        let base_url = if config.api_base.trim().is_empty() {
            DEFAULT_API_BASE.to_string()
        } else {
            config.api_base.trim_end_matches('/').to_string()
        };
        let parsed = Url::parse(&base_url)
            .with_context(|| format!("board client: invalid api base {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("board client: unsupported scheme {}", parsed.scheme());
        }

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            board: config.board,
            keyword: config.keyword.to_lowercase(),
        })
    }

    pub fn catalog_url(&self) -> String {
        format!("{}/{}/catalog.json", self.base_url, self.board)
    }

    pub fn thread_url(&self, id: ThreadId) -> String {
        format!("{}/{}/thread/{}.json", self.base_url, self.board, id)
    }

    /// Every catalog thread whose subject or body mentions the keyword.
    pub fn scan_catalog(&self) -> error::Result<Vec<ThreadCandidate>> {
        let url = self.catalog_url();
        let response = self.get(&url)?;
        if !response.status().is_success() {
            return Err(Error::network(
                &url,
                format!("unexpected status {}", response.status()),
            ));
        }
        let pages: Vec<CatalogPage> = read_json(&url, response)?;

        let mut found = Vec::new();
        for thread in pages.into_iter().flat_map(|page| page.threads) {
            let subject = thread.sub.unwrap_or_default();
            let body = thread.com.unwrap_or_default();
            if !self.matches_keyword(&subject, &body) {
                continue;
            }
            let title = if subject.is_empty() {
                UNTITLED.to_string()
            } else {
                subject
            };
            found.push(ThreadCandidate {
                id: thread.no,
                title,
            });
        }
        debug!(url = %url, matched = found.len(), "catalog scanned");
        Ok(found)
    }

    /// All posts of one thread, normalized. A thread the board no longer
    /// serves yields an empty list rather than an error.
    pub fn fetch_thread_messages(&self, id: ThreadId) -> error::Result<Vec<Message>> {
        let url = self.thread_url(id);
        let response = self.get(&url)?;
        if !response.status().is_success() {
            debug!(thread = id, status = %response.status(), "thread unavailable");
            return Ok(Vec::new());
        }
        let thread: ThreadResponse = read_json(&url, response)?;
        Ok(normalize_thread(id, thread))
    }

    fn matches_keyword(&self, subject: &str, body: &str) -> bool {
        if self.keyword.is_empty() {
            return true;
        }
        let mut haystack = String::with_capacity(subject.len() + body.len());
        haystack.push_str(subject);
        haystack.push_str(body);
        haystack.to_lowercase().contains(&self.keyword)
    }

    fn get(&self, url: &str) -> error::Result<reqwest::blocking::Response> {
        self.http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(|err| Error::network(url, err))
    }
}

fn read_json<T: DeserializeOwned>(url: &str, response: reqwest::blocking::Response) -> error::Result<T> {
    let body = response.text().map_err(|err| Error::network(url, err))?;
    serde_json::from_str(&body).map_err(|err| Error::parse(url, err))
}

/// Maps raw posts to stored messages. Every message carries the opening
/// post's subject as its title.
pub fn normalize_thread(thread_id: ThreadId, thread: ThreadResponse) -> Vec<Message> {
    let title = thread
        .posts
        .first()
        .and_then(|op| op.sub.clone())
        .filter(|sub| !sub.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    thread
        .posts
        .into_iter()
        .map(|post| Message {
            id: post.no,
            time: post.time,
            text: post
                .com
                .as_deref()
                .map(markup::normalize_comment)
                .unwrap_or_default(),
            title: title.clone(),
            thread_id,
            attachment: post.attachment(),
        })
        .collect()
}
