//! Safety filtering stages and the orchestrator that applies them.
//!
//! Each stage is pure per record: it consumes a record (and the image
//! bytes, if it needs them) and emits an accept/reject decision. All disk
//! mutation — removing the record from the store and unlinking its image —
//! is applied by the orchestrator after each record, before the next one is
//! evaluated, so no stage implementation ever touches the store or the
//! image directory itself.

pub mod faces;
pub mod nsfw;
pub mod words;

pub use faces::{CommandDetector, FaceBox, FaceDetector, FaceFilter};
pub use nsfw::{CommandScorer, NsfwFilter, NsfwScorer, NsfwScores};
pub use words::WordFilter;

use std::fs;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use indicatif::ProgressBar;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::annotations::{AnnotationFile, AnnotationInfo, AnnotationRecord, FilterMarker, StoreError};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("blocklist error: {0}")]
    Blocklist(String),
}

pub type FilterResult<T> = Result<T, FilterError>;

/// Stage verdict for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(String),
}

/// One filtering stage.
#[async_trait]
pub trait FilterStage: Send + Sync {
    /// Stable stage name for logging.
    fn name(&self) -> &'static str;

    /// Identifier of the model or list backing this stage, recorded in the
    /// file's filter marker.
    fn model(&self) -> String;

    fn threshold(&self) -> Option<f64> {
        None
    }

    /// Whether the stage needs the image bytes. Stages that work on the
    /// caption alone do no I/O at all.
    fn needs_image(&self) -> bool;

    async fn evaluate(
        &self,
        record: &AnnotationRecord,
        image: Option<&[u8]>,
    ) -> FilterResult<Decision>;

    /// The marker slot this stage owns in the file's `info`, so the
    /// orchestrator can refuse to run a stage twice.
    fn marker<'a>(&self, info: &'a AnnotationInfo) -> Option<&'a FilterMarker>;

    fn set_marker(&self, info: &mut AnnotationInfo, marker: FilterMarker);
}

/// Totals from one filter sweep.
#[derive(Debug, Default, Clone)]
pub struct FilterOutcome {
    pub examined: usize,
    pub removed: usize,
    /// The file already carried this stage's marker; nothing was changed.
    pub already_filtered: bool,
}

/// Run `stage` over the annotation file at `annotations_path` in place.
/// Rejected records are removed and their images deleted before the next
/// record is evaluated; the stage marker is stamped and the file saved
/// atomically at the end. A classifier error aborts without saving.
pub async fn run_stage(
    annotations_path: &Path,
    images_dir: &Path,
    stage: &dyn FilterStage,
) -> FilterResult<FilterOutcome> {
    let mut file = AnnotationFile::load(annotations_path)?;

    if stage.marker(&file.info).is_some() {
        info!(stage = stage.name(), "file already carries this stage's marker");
        return Ok(FilterOutcome {
            already_filtered: true,
            ..FilterOutcome::default()
        });
    }

    let records = std::mem::take(&mut file.annotations);
    let bar = ProgressBar::new(records.len() as u64);
    let mut kept = Vec::with_capacity(records.len());
    let mut outcome = FilterOutcome::default();

    for record in records {
        bar.inc(1);
        let image_path = images_dir
            .join(&record.subreddit)
            .join(format!("{}.jpg", record.id));

        let image = if stage.needs_image() {
            if !image_path.exists() {
                // No image on disk yet; image stages only judge downloaded
                // records.
                kept.push(record);
                continue;
            }
            Some(fs::read(&image_path)?)
        } else {
            None
        };

        outcome.examined += 1;
        match stage.evaluate(&record, image.as_deref()).await? {
            Decision::Accept => kept.push(record),
            Decision::Reject(reason) => {
                info!(id = %record.id, stage = stage.name(), reason, "record rejected");
                outcome.removed += 1;
                if image_path.exists() {
                    fs::remove_file(&image_path)?;
                }
            }
        }
    }
    bar.finish_and_clear();

    file.annotations = kept;
    stage.set_marker(
        &mut file.info,
        FilterMarker {
            num_removed: outcome.removed,
            model: stage.model(),
            threshold: stage.threshold(),
        },
    );
    file.save(annotations_path)?;

    info!(
        stage = stage.name(),
        examined = outcome.examined,
        removed = outcome.removed,
        "filter sweep complete"
    );
    Ok(outcome)
}

/// Invoke an external classifier command: image bytes on stdin, one JSON
/// object on stdout. Any failure — spawn, non-zero exit, unreadable output —
/// is an error rather than a default verdict: guessing either way could
/// silently corrupt the dataset's safety guarantees.
pub(crate) async fn invoke_classifier(
    mut command: Command,
    image: &[u8],
) -> FilterResult<Vec<u8>> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| FilterError::Classifier(format!("failed to spawn classifier: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| FilterError::Classifier("classifier stdin unavailable".to_string()))?;
    stdin
        .write_all(image)
        .await
        .map_err(|e| FilterError::Classifier(format!("failed to feed classifier: {e}")))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| FilterError::Classifier(format!("classifier did not finish: {e}")))?;

    if !output.status.success() {
        return Err(FilterError::Classifier(format!(
            "classifier exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classifier_command_round_trip() {
        let mut command = Command::new("sh");
        command.arg("-c").arg(r#"cat >/dev/null; printf '{"porn":0.2}'"#);

        let stdout = invoke_classifier(command, b"image bytes").await.expect("run");
        assert_eq!(stdout, br#"{"porn":0.2}"#);
    }

    #[tokio::test]
    async fn classifier_failure_exit_is_an_error() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 3");

        let result = invoke_classifier(command, b"image bytes").await;
        assert!(matches!(result, Err(FilterError::Classifier(_))));
    }

    #[tokio::test]
    async fn missing_classifier_binary_is_an_error() {
        let command = Command::new("definitely-not-a-real-classifier-binary");
        let result = invoke_classifier(command, b"image bytes").await;
        assert!(matches!(result, Err(FilterError::Classifier(_))));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::annotations::AnnotationRecord;
    use chrono::NaiveDate;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;
    use std::path::PathBuf;

    pub fn record(id: &str, caption: &str) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            subreddit: "roses".to_string(),
            author: "gardener".to_string(),
            created_utc: 1_610_000_000,
            caption: caption.to_string(),
            raw_caption: None,
            score: Some(10),
            permalink: None,
            url: format!("https://i.redd.it/{id}.jpg"),
            image_path: None,
        }
    }

    pub fn annotation_file(records: Vec<AnnotationRecord>) -> AnnotationFile {
        AnnotationFile {
            info: AnnotationInfo::new(
                "roses",
                NaiveDate::from_ymd_opt(2021, 1, 1).expect("date"),
                NaiveDate::from_ymd_opt(2021, 1, 31).expect("date"),
            ),
            annotations: records,
        }
    }

    /// Write a small JPEG for `record` under `images_dir`, mirroring the
    /// layout the download worker produces.
    pub fn write_image_for(images_dir: &Path, record: &AnnotationRecord) -> PathBuf {
        let dir = images_dir.join(&record.subreddit);
        std::fs::create_dir_all(&dir).expect("create image dir");
        let path = dir.join(format!("{}.jpg", record.id));

        let image = DynamicImage::new_rgb8(8, 8);
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
            .expect("encode jpeg");
        std::fs::write(&path, buffer).expect("write image");
        path
    }
}
