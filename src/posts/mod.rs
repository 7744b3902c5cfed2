//! Post-metadata harvesting: list the post IDs of one subreddit-month
//! through the listing API, then resolve them in batches against the
//! official info API.
//!
//! The two-step approach mirrors the platform's API split: the listing API
//! supports time-based search but carries stale scores, while the info API
//! has accurate scores but no time filtering.

pub mod caption;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::annotations::{AnnotationFile, AnnotationInfo, AnnotationRecord};
use crate::config::Credentials;
use crate::net::{DownloadOutcome, Fetcher, Host};

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("listing API error: {0}")]
    Listing(String),

    #[error("info API error: {0}")]
    Info(String),

    #[error("invalid time window: {0} hours (must be in (0, 24])")]
    Window(f64),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

/// A calendar month given as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Month {
    first: NaiveDate,
}

impl Month {
    pub fn first_day(&self) -> NaiveDate {
        self.first
    }

    pub fn last_day(&self) -> NaiveDate {
        self.first
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(self.first)
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let last = self.last_day();
        let mut day = self.first;
        while day <= last {
            days.push(day);
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        days
    }
}

impl FromStr for Month {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("'{s}' is not a YYYY-MM month"))?;
        let year: i32 = year.parse().map_err(|_| format!("'{s}' has an invalid year"))?;
        let month: u32 = month.parse().map_err(|_| format!("'{s}' has an invalid month"))?;
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| format!("'{s}' is not a valid month"))?;
        Ok(Month { first })
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first.format("%Y-%m"))
    }
}

/// API surface the harvester talks to. Overridable so tests can point at a
/// local server.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub listing: String,
    pub token: String,
    pub info: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            listing: "https://api.pushshift.io/reddit/submission/search".to_string(),
            token: "https://www.reddit.com/api/v1/access_token".to_string(),
            info: "https://oauth.reddit.com/api/info".to_string(),
        }
    }
}

/// The listing API caps every response at this many IDs; a full page means
/// the queried window has to be split further.
const LISTING_PAGE_LIMIT: usize = 100;

/// Minimum score for a post to be worth keeping.
const MIN_SCORE: i64 = 2;

/// IDs per info API request.
const INFO_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    data: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    data: InfoListing,
}

#[derive(Debug, Deserialize)]
struct InfoListing {
    #[serde(default)]
    children: Vec<InfoChild>,
}

#[derive(Debug, Deserialize)]
struct InfoChild {
    data: RawPost,
}

#[derive(Debug, Deserialize)]
struct RawPost {
    id: String,
    subreddit: String,
    #[serde(default)]
    author: String,
    title: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    over_18: bool,
    #[serde(default)]
    removed_by_category: Option<String>,
    created_utc: f64,
    #[serde(default)]
    permalink: String,
    url: String,
    #[serde(default)]
    gallery_data: Option<GalleryData>,
}

#[derive(Debug, Deserialize)]
struct GalleryData {
    #[serde(default)]
    items: Vec<GalleryItem>,
}

#[derive(Debug, Deserialize)]
struct GalleryItem {
    media_id: String,
}

/// Harvests one subreddit-month of post metadata into an annotation file.
pub struct PostFetcher {
    client: Client,
    fetcher: Arc<Fetcher>,
    credentials: Credentials,
    endpoints: ApiEndpoints,
}

impl PostFetcher {
    pub fn new(client: Client, fetcher: Arc<Fetcher>, credentials: Credentials) -> Self {
        Self {
            client,
            fetcher,
            credentials,
            endpoints: ApiEndpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: ApiEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Harvest the month. `time_window_hours` bounds the listing query
    /// granularity; busy subreddits are split further automatically.
    pub async fn harvest(
        &self,
        subreddit: &str,
        month: Month,
        time_window_hours: f64,
    ) -> HarvestResult<AnnotationFile> {
        if !(time_window_hours > 0.0 && time_window_hours <= 24.0) {
            return Err(HarvestError::Window(time_window_hours));
        }
        if !self.credentials.has_valid_reddit() {
            return Err(HarvestError::Credential(
                "reddit credentials are missing or placeholders".to_string(),
            ));
        }

        let mut ids: Vec<String> = Vec::new();
        for day in month.days() {
            ids.extend(self.list_ids_for_day(subreddit, day, time_window_hours).await?);
        }
        ids.sort();
        ids.dedup();
        info!(subreddit, %month, ids = ids.len(), "listing complete");

        let token = self.access_token().await?;
        let annotations = self.resolve_info(&ids, &token).await?;

        let ignored = ids.len() - annotations.len();
        info!(
            kept = annotations.len(),
            ignored, "info resolution complete; ignored posts were removed, marked NSFW, or low-scored"
        );

        Ok(AnnotationFile {
            info: AnnotationInfo::new(subreddit.to_lowercase(), month.first_day(), month.last_day()),
            annotations,
        })
    }

    /// List post IDs created on `day`, splitting any window whose page comes
    /// back full. The work list is explicit so splits do not recurse.
    async fn list_ids_for_day(
        &self,
        subreddit: &str,
        day: NaiveDate,
        window_hours: f64,
    ) -> HarvestResult<Vec<String>> {
        let day_start = day
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .ok_or_else(|| HarvestError::Listing(format!("invalid day {day}")))?;

        let mut windows: Vec<(DateTime<Utc>, f64)> = Vec::new();
        let mut cursor = day_start;
        let day_end = day_start + ChronoDuration::hours(24);
        while cursor < day_end {
            windows.push((cursor, window_hours));
            cursor += ChronoDuration::milliseconds((window_hours * 3_600_000.0) as i64);
        }

        let mut ids = Vec::new();
        while let Some((start, hours)) = windows.pop() {
            let end = start + ChronoDuration::milliseconds((hours * 3_600_000.0) as i64 - 1_000);
            let url = format!(
                "{}?subreddit={}&after={}&before={}&size={}&fields=id",
                self.endpoints.listing,
                subreddit,
                start.timestamp(),
                end.timestamp(),
                LISTING_PAGE_LIMIT,
            );

            let batch = self.list_window(&url).await?;
            if batch.len() >= LISTING_PAGE_LIMIT && hours > 0.01 {
                // A full page hides posts beyond the cap; requery both halves.
                let half = hours / 2.0;
                let mid = start + ChronoDuration::milliseconds((half * 3_600_000.0) as i64);
                windows.push((start, half));
                windows.push((mid, half));
            } else {
                debug!(day = %day, window_start = %start, count = batch.len(), "listed post IDs");
                ids.extend(batch);
            }
        }

        Ok(ids)
    }

    async fn list_window(&self, url: &str) -> HarvestResult<Vec<String>> {
        let host = Host::of_url(&self.endpoints.listing);
        match self.fetcher.fetch(url, host).await {
            DownloadOutcome::Success { bytes, .. } => {
                let response: ListingResponse = serde_json::from_slice(&bytes)?;
                Ok(response.data.into_iter().map(|entry| entry.id).collect())
            }
            other => Err(HarvestError::Listing(format!(
                "listing request failed: {}",
                other.label()
            ))),
        }
    }

    /// App-only OAuth token for the info API.
    async fn access_token(&self) -> HarvestResult<String> {
        let response = self
            .client
            .post(&self.endpoints.token)
            .basic_auth(
                &self.credentials.reddit.client_id,
                Some(&self.credentials.reddit.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(HarvestError::Credential(
                "the info API rejected the configured credentials".to_string(),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| HarvestError::Credential(format!("malformed token response: {e}")))?;
        Ok(body.access_token)
    }

    /// Resolve IDs against the info API in batches, keeping only live,
    /// SFW-marked, sufficiently upvoted image posts.
    async fn resolve_info(
        &self,
        ids: &[String],
        token: &str,
    ) -> HarvestResult<Vec<AnnotationRecord>> {
        let authorization = format!("Bearer {token}");
        let host = Host::of_url(&self.endpoints.info);
        let mut records = Vec::new();

        for chunk in ids.chunks(INFO_BATCH) {
            let fullnames: Vec<String> = chunk.iter().map(|id| format!("t3_{id}")).collect();
            let url = format!(
                "{}?id={}&raw_json=1",
                self.endpoints.info,
                fullnames.join(",")
            );

            let bytes = match self.fetcher.fetch_with_auth(&url, host, Some(&authorization)).await {
                DownloadOutcome::Success { bytes, .. } => bytes,
                other => {
                    return Err(HarvestError::Info(format!(
                        "info request failed: {}",
                        other.label()
                    )));
                }
            };

            let response: InfoResponse = serde_json::from_slice(&bytes)?;
            for child in response.data.children {
                if let Some(record) = Self::build_record(child.data) {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }

    fn build_record(post: RawPost) -> Option<AnnotationRecord> {
        // Posts deleted by the author, moderators, or platform bots must
        // never enter the dataset, nor source-flagged NSFW or low-score ones.
        if post.removed_by_category.is_some() || post.over_18 || post.score < MIN_SCORE {
            return None;
        }

        let url = Self::normalize_url(&post)?;
        let cleaned = caption::sanitize(&post.title);
        if cleaned.is_empty() {
            warn!(id = %post.id, "caption empty after sanitation, skipping post");
            return None;
        }

        Some(AnnotationRecord {
            id: post.id,
            subreddit: post.subreddit.to_lowercase(),
            author: post.author,
            created_utc: post.created_utc as i64,
            caption: cleaned,
            raw_caption: Some(post.title),
            score: Some(post.score),
            permalink: Some(post.permalink),
            url,
            image_path: None,
        })
    }

    /// Rewrite gallery URLs to the first gallery image. Imgur URLs are left
    /// untouched here; the download worker resolves them when it needs the
    /// bytes.
    fn normalize_url(post: &RawPost) -> Option<String> {
        if post.url.contains("reddit.com") && post.url.contains("gallery") {
            let media_id = post.gallery_data.as_ref()?.items.first()?.media_id.clone();
            return Some(format!("https://i.redd.it/{media_id}.jpg"));
        }
        Some(post.url.clone())
    }
}
