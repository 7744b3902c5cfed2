//! Blocklist word filtering over captions. No image I/O: the decision is a
//! function of the caption alone.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::annotations::{AnnotationInfo, AnnotationRecord, FilterMarker};

use super::{Decision, FilterError, FilterResult, FilterStage};

/// Canonical English blocklist used when no local word list is given.
pub const DEFAULT_WORDLIST_URL: &str =
    "https://raw.githubusercontent.com/LDNOOBW/List-of-Dirty-Naughty-Obscene-and-Otherwise-Bad-Words/master/en";

const LIST_NAME: &str = "LDNOOBW/List-of-Dirty-Naughty-Obscene-and-Otherwise-Bad-Words";

pub struct WordFilter {
    blockwords: Vec<String>,
}

impl WordFilter {
    pub fn new(blockwords: impl IntoIterator<Item = String>) -> Self {
        let blockwords: Vec<String> = blockwords
            .into_iter()
            .map(|word| word.trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();
        Self { blockwords }
    }

    pub fn from_file(path: &Path) -> FilterResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            FilterError::Blocklist(format!("cannot read word list {}: {e}", path.display()))
        })?;
        let filter = Self::new(content.lines().map(str::to_string));
        info!(words = filter.blockwords.len(), "loaded word list from {}", path.display());
        Ok(filter)
    }

    /// Fetch the canonical blocklist.
    pub async fn fetch_default(client: &reqwest::Client) -> FilterResult<Self> {
        Self::fetch_from(client, DEFAULT_WORDLIST_URL).await
    }

    pub async fn fetch_from(client: &reqwest::Client, url: &str) -> FilterResult<Self> {
        let response = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| FilterError::Blocklist(format!("cannot fetch word list: {e}")))?;
        let body = response
            .text()
            .await
            .map_err(|e| FilterError::Blocklist(format!("cannot read word list: {e}")))?;

        let filter = Self::new(body.lines().map(str::to_string));
        if filter.blockwords.is_empty() {
            return Err(FilterError::Blocklist("fetched word list is empty".to_string()));
        }
        info!(words = filter.blockwords.len(), "fetched word list");
        Ok(filter)
    }

    /// Whitespace-padded exact match: "ass" must not fire inside "class".
    fn first_match(&self, caption: &str) -> Option<&str> {
        let padded = format!(" {} ", caption.to_lowercase());
        self.blockwords
            .iter()
            .find(|word| padded.contains(&format!(" {word} ")))
            .map(String::as_str)
    }
}

#[async_trait]
impl FilterStage for WordFilter {
    fn name(&self) -> &'static str {
        "words"
    }

    fn model(&self) -> String {
        LIST_NAME.to_string()
    }

    fn needs_image(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        record: &AnnotationRecord,
        _image: Option<&[u8]>,
    ) -> FilterResult<Decision> {
        Ok(match self.first_match(&record.caption) {
            Some(word) => Decision::Reject(format!("caption contains '{word}'")),
            None => Decision::Accept,
        })
    }

    fn marker<'a>(&self, info: &'a AnnotationInfo) -> Option<&'a FilterMarker> {
        info.word_filter.as_ref()
    }

    fn set_marker(&self, info: &mut AnnotationInfo, marker: FilterMarker) {
        info.word_filter = Some(marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{annotation_file, record};
    use crate::filter::run_stage;

    fn blocklist() -> WordFilter {
        WordFilter::new(["gun".to_string(), "blood".to_string()])
    }

    #[tokio::test]
    async fn matches_whole_words_only() {
        let filter = blocklist();

        let flagged = record("aaa", "a gun on the table");
        assert!(matches!(
            filter.evaluate(&flagged, None).await.expect("evaluate"),
            Decision::Reject(_)
        ));

        // Substrings inside larger words must not fire.
        let begun = record("bbb", "the show has begun");
        assert_eq!(filter.evaluate(&begun, None).await.expect("evaluate"), Decision::Accept);
    }

    #[tokio::test]
    async fn sweep_removes_records_and_stamps_the_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        let flagged = record("bad1", "a gun on the table");
        let clean = record("ok1", "a rose on the table");
        let flagged_image =
            crate::filter::test_support::write_image_for(&images_dir, &flagged);
        annotation_file(vec![flagged.clone(), clean])
            .save(&annotations_path)
            .expect("save");

        let outcome = run_stage(&annotations_path, &images_dir, &blocklist())
            .await
            .expect("run stage");

        assert_eq!(outcome.removed, 1);
        assert!(!flagged_image.exists());

        let reloaded = crate::annotations::AnnotationFile::load(&annotations_path).expect("load");
        assert_eq!(reloaded.annotations.len(), 1);
        assert_eq!(reloaded.annotations[0].id, "ok1");
        let marker = reloaded.info.word_filter.expect("marker");
        assert_eq!(marker.num_removed, 1);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let annotations_path = dir.path().join("roses.json");
        let images_dir = dir.path().join("images");

        annotation_file(vec![record("ok1", "a rose")])
            .save(&annotations_path)
            .expect("save");

        let first = run_stage(&annotations_path, &images_dir, &blocklist())
            .await
            .expect("first sweep");
        assert!(!first.already_filtered);

        let second = run_stage(&annotations_path, &images_dir, &blocklist())
            .await
            .expect("second sweep");
        assert!(second.already_filtered);
        assert_eq!(second.removed, 0);
    }
}
