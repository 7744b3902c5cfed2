//! Annotation file model and store operations.
//!
//! One annotation file holds the harvest of a single subreddit over a
//! stated time window: an `info` descriptor plus an ordered list of records.
//! Files are rewritten at every stage boundary (download, each filter), so
//! saves go through a temp-file-plus-rename to keep a crash from truncating
//! prior progress.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("nothing to merge: provided less than two file paths")]
    NothingToMerge,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One harvested post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationRecord {
    /// Source-platform identifier; primary key within a file.
    pub id: String,
    pub subreddit: String,
    pub author: String,
    pub created_utc: i64,
    /// Sanitized caption derived from the post title.
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    /// Original (possibly indirect) image URL.
    pub url: String,
    /// On-disk path once downloaded. Present iff the file exists and has
    /// passed every filter stage run so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

/// Record of one completed filter stage, stamped into `info` so the stage
/// cannot run twice on the same file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterMarker {
    pub num_removed: usize,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Source descriptor: which subreddit, over which window, and which filter
/// stages have already run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationInfo {
    pub subreddit: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_filter: Option<FilterMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw_filter: Option<FilterMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_filter: Option<FilterMarker>,
}

impl AnnotationInfo {
    pub fn new(subreddit: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            subreddit: subreddit.into(),
            start_date,
            end_date,
            word_filter: None,
            nsfw_filter: None,
            face_filter: None,
        }
    }

    /// Whether any filter stage has already run on this file.
    pub fn is_filtered(&self) -> bool {
        self.word_filter.is_some() || self.nsfw_filter.is_some() || self.face_filter.is_some()
    }
}

/// An annotation file: descriptor plus ordered records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotationFile {
    pub info: AnnotationInfo,
    pub annotations: Vec<AnnotationRecord>,
}

/// A single failed invariant found by [`AnnotationFile::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    DuplicateId { id: String },
    MissingImage { id: String, path: PathBuf },
    EmptyCaption { id: String },
    OutsideWindow { id: String, created_utc: i64 },
    SubredditMismatch { id: String, subreddit: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::DuplicateId { id } => write!(f, "duplicate id '{id}'"),
            ValidationError::MissingImage { id, path } => {
                write!(f, "record '{id}' references missing image {}", path.display())
            }
            ValidationError::EmptyCaption { id } => write!(f, "record '{id}' has an empty caption"),
            ValidationError::OutsideWindow { id, created_utc } => {
                write!(f, "record '{id}' created at {created_utc} is outside the stated window")
            }
            ValidationError::SubredditMismatch { id, subreddit } => {
                write!(f, "record '{id}' belongs to '{subreddit}', not the file's subreddit")
            }
        }
    }
}

impl AnnotationFile {
    pub fn new(info: AnnotationInfo) -> Self {
        Self {
            info,
            annotations: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomic save: write a sibling temp file, then rename over the target.
    /// A crash mid-write leaves the previous file intact.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Check the file's invariants. Image paths are checked for existence
    /// as stored; no file content is read.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.annotations.len());

        let window_start = self
            .info
            .start_date
            .and_hms_opt(0, 0, 0)
            .map_or(i64::MIN, |t| t.and_utc().timestamp());
        let window_end = self
            .info
            .end_date
            .and_hms_opt(23, 59, 59)
            .map_or(i64::MAX, |t| t.and_utc().timestamp());

        for record in &self.annotations {
            if !seen.insert(record.id.as_str()) {
                errors.push(ValidationError::DuplicateId {
                    id: record.id.clone(),
                });
            }
            if record.subreddit != self.info.subreddit {
                errors.push(ValidationError::SubredditMismatch {
                    id: record.id.clone(),
                    subreddit: record.subreddit.clone(),
                });
            }
            if record.caption.trim().is_empty() {
                errors.push(ValidationError::EmptyCaption {
                    id: record.id.clone(),
                });
            }
            if record.created_utc < window_start || record.created_utc > window_end {
                errors.push(ValidationError::OutsideWindow {
                    id: record.id.clone(),
                    created_utc: record.created_utc,
                });
            }
            if let Some(image_path) = &record.image_path {
                let path = Path::new(image_path);
                if !path.exists() {
                    errors.push(ValidationError::MissingImage {
                        id: record.id.clone(),
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        errors
    }
}

/// Result of [`merge`]: the merged file plus how many inputs already carried
/// filter markers (their per-stage counts are not representable in the
/// merged file and will be dropped).
#[derive(Debug)]
pub struct MergeOutcome {
    pub file: AnnotationFile,
    pub inputs_filtered: usize,
}

/// Merge annotation files that share a subreddit. Records keep their
/// input-file order and duplicate ids keep the first occurrence; the merged
/// window is the union of the input windows. A subreddit mismatch fails the
/// whole merge and nothing is written.
pub fn merge(paths: &[PathBuf]) -> StoreResult<MergeOutcome> {
    if paths.len() < 2 {
        return Err(StoreError::NothingToMerge);
    }

    let mut iter = paths.iter();
    let first_path = iter.next().ok_or(StoreError::NothingToMerge)?;

    let mut merged = AnnotationFile::load(first_path)?;
    let mut inputs_filtered = usize::from(merged.info.is_filtered());

    let mut seen: HashSet<String> = HashSet::new();
    merged.annotations.retain(|record| seen.insert(record.id.clone()));

    for path in iter {
        let file = AnnotationFile::load(path)?;

        if file.info.subreddit != merged.info.subreddit {
            return Err(StoreError::Validation(format!(
                "subreddit mismatch: {} holds '{}', expected '{}'",
                path.display(),
                file.info.subreddit,
                merged.info.subreddit
            )));
        }

        inputs_filtered += usize::from(file.info.is_filtered());
        merged.info.start_date = merged.info.start_date.min(file.info.start_date);
        merged.info.end_date = merged.info.end_date.max(file.info.end_date);

        for record in file.annotations {
            if seen.insert(record.id.clone()) {
                merged.annotations.push(record);
            }
        }
    }

    // Per-stage counts from the inputs cannot be carried over; the merged
    // file starts unfiltered.
    merged.info.word_filter = None;
    merged.info.nsfw_filter = None;
    merged.info.face_filter = None;

    info!(
        records = merged.annotations.len(),
        subreddit = %merged.info.subreddit,
        "merged {} annotation files",
        paths.len()
    );
    Ok(MergeOutcome {
        file: merged,
        inputs_filtered,
    })
}
