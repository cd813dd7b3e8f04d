use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::error::{self, Error};

pub const TWITTER_OEMBED_URL: &str = "https://publish.twitter.com/oembed";

/// A directly fetched video body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub url: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Network side of the slower embed providers.
pub trait MediaBackend: Send + Sync {
    /// Fetches a video file; anything that is not `video/*` is an error.
    fn fetch_video(&self, url: &str) -> error::Result<FetchedMedia>;
    /// Builds widget markup for a social post URL.
    fn create_widget(&self, post_url: &str) -> error::Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub media_timeout: Duration,
    pub widget_timeout: Duration,
    pub oembed_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("thread-tracker/{}", crate::VERSION),
            media_timeout: Duration::from_secs(30),
            widget_timeout: Duration::from_secs(40),
            oembed_url: TWITTER_OEMBED_URL.to_string(),
        }
    }
}

pub struct HttpMediaBackend {
    client: Client,
    cfg: HttpConfig,
}

#[derive(Debug, Deserialize)]
struct OEmbed {
    #[serde(default)]
    html: String,
}

impl HttpMediaBackend {
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        let timeout = cfg.media_timeout.max(cfg.widget_timeout);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("media: build http client")?;
        Ok(Self { client, cfg })
    }
}

impl MediaBackend for HttpMediaBackend {
    fn fetch_video(&self, url: &str) -> error::Result<FetchedMedia> {
        let load_err = |reason: String| Error::EmbedLoad {
            provider: "streamable",
            reason,
        };
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.cfg.user_agent)
            .timeout(self.cfg.media_timeout)
            .send()
            .map_err(|err| load_err(err.to_string()))?;
        if !response.status().is_success() {
            return Err(load_err(format!("status {}", response.status())));
        }
        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response
            .bytes()
            .map_err(|err| load_err(err.to_string()))?
            .to_vec();
        let content_type = header_type.unwrap_or_else(|| detect_mime(&bytes));
        if !content_type.starts_with("video/") {
            return Err(load_err(format!("unexpected content type {content_type}")));
        }
        debug!(url, bytes = bytes.len(), "video fetched");
        Ok(FetchedMedia {
            url: url.to_string(),
            content_type,
            bytes,
        })
    }

    fn create_widget(&self, post_url: &str) -> error::Result<String> {
        let load_err = |reason: String| Error::EmbedLoad {
            provider: "twitter",
            reason,
        };
        let response = self
            .client
            .get(&self.cfg.oembed_url)
            .query(&[("url", post_url), ("omit_script", "true")])
            .header(USER_AGENT, &self.cfg.user_agent)
            .timeout(self.cfg.widget_timeout)
            .send()
            .map_err(|err| load_err(err.to_string()))?;
        if !response.status().is_success() {
            return Err(load_err(format!("status {}", response.status())));
        }
        let embed: OEmbed = response.json().map_err(|err| load_err(err.to_string()))?;
        if embed.html.trim().is_empty() {
            return Err(load_err("empty widget".into()));
        }
        Ok(embed.html)
    }
}

fn detect_mime(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(512)];
    tree_magic_mini::from_u8(head).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Video { url: String },
    Widget { post_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Video(FetchedMedia),
    Widget(String),
}

/// Result of one job, tagged with the placeholder attempt that asked for it.
#[derive(Debug)]
pub struct Completion {
    pub placeholder: u64,
    pub attempt: u64,
    pub result: error::Result<Output>,
}

struct Job {
    placeholder: u64,
    attempt: u64,
    request: Request,
}

struct Inner {
    backend: Arc<dyn MediaBackend>,
    done: Sender<Completion>,
}

/// Fixed set of worker threads running backend calls off the caller's
/// thread. Completions arrive on [`Pool::completions`].
pub struct Pool {
    jobs: Sender<Job>,
    stop: Sender<()>,
    completions: Receiver<Completion>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    pub fn new(backend: Arc<dyn MediaBackend>, workers: usize) -> Self {
        let workers = if workers == 0 { 2 } else { workers };
        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();

        let inner = Arc::new(Inner {
            backend,
            done: done_tx,
        });

        let mut handles = Vec::new();
        for _ in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            handles.push(thread::spawn(move || worker_inner.worker(rx_jobs, rx_stop)));
        }

        Self {
            jobs: job_tx,
            stop: stop_tx,
            completions: done_rx,
            handles,
        }
    }

    pub fn enqueue(&self, placeholder: u64, attempt: u64, request: Request) {
        let _ = self.jobs.send(Job {
            placeholder,
            attempt,
            request,
        });
    }

    pub fn completions(&self) -> &Receiver<Completion> {
        &self.completions
    }

    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(job) => self.process(job),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, job: Job) {
        let result = match &job.request {
            Request::Video { url } => self.backend.fetch_video(url).map(Output::Video),
            Request::Widget { post_url } => {
                self.backend.create_widget(post_url).map(Output::Widget)
            }
        };
        let _ = self.done.send(Completion {
            placeholder: job.placeholder,
            attempt: job.attempt,
            result,
        });
    }
}
