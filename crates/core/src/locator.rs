//! Finds finished artifacts in the date-partitioned output directory.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{Days, Local, NaiveDate};
use serde::Serialize;
use tokio::fs;
use tracing::warn;

use crate::fingerprint::RequestId;
use crate::job::MediaKind;

/// Suffix of the extracted last video frame. Never reported as an image result.
pub const LAST_FRAME_SUFFIX: &str = "_[-1].png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedOutput {
    pub kind: MediaKind,
    /// Matching files, sorted by name. Never empty.
    pub files: Vec<PathBuf>,
}

impl LocatedOutput {
    pub fn primary(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }

    pub fn primary_name(&self) -> String {
        self.primary()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total_images: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct OutputLocator {
    root: PathBuf,
    lookback_days: u32,
}

impl OutputLocator {
    pub fn new(root: PathBuf, lookback_days: u32) -> Self {
        Self {
            root,
            lookback_days,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    pub fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    pub fn today_dir(&self) -> PathBuf {
        self.partition_dir(self.today())
    }

    pub async fn find(&self, request_id: &RequestId) -> Option<LocatedOutput> {
        self.find_from(request_id, self.today()).await
    }

    /// Search `today` and the `lookback_days` partitions before it. Images win over videos.
    pub async fn find_from(&self, request_id: &RequestId, today: NaiveDate) -> Option<LocatedOutput> {
        let dirs = self.searched_partitions(today).await;
        for kind in [MediaKind::Image, MediaKind::Video] {
            for dir in &dirs {
                let files = matching_files(dir, |name| matches_request(name, request_id, kind)).await;
                if !files.is_empty() {
                    return Some(LocatedOutput { kind, files });
                }
            }
        }
        None
    }

    /// An artifact already relocated for this request and output sequence, whatever its timestamp.
    pub async fn find_sequence(
        &self,
        request_id: &RequestId,
        sequence: usize,
        kind: MediaKind,
    ) -> Option<PathBuf> {
        let suffix = format!("_{request_id}_{sequence:05}.{}", kind.extension());
        for dir in self.searched_partitions(self.today()).await {
            let files = matching_files(&dir, |name| name.ends_with(&suffix)).await;
            if let Some(found) = files.into_iter().next() {
                return Some(found);
            }
        }
        None
    }

    pub async fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        if let Err(err) = accumulate_images(&self.root, &mut stats).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(root = %self.root.display(), error = %err, "Failed to scan output directory");
            }
        }
        stats
    }

    async fn searched_partitions(&self, today: NaiveDate) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for back in 0..=u64::from(self.lookback_days) {
            let Some(date) = today.checked_sub_days(Days::new(back)) else {
                break;
            };
            let dir = self.partition_dir(date);
            if fs::metadata(&dir).await.is_ok_and(|meta| meta.is_dir()) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

pub fn matches_request(file_name: &str, request_id: &RequestId, kind: MediaKind) -> bool {
    let marker = format!("_{request_id}_");
    if !file_name.contains(&marker) {
        return false;
    }
    match kind {
        MediaKind::Image => file_name.ends_with(".png") && !file_name.ends_with(LAST_FRAME_SUFFIX),
        MediaKind::Video => file_name.ends_with(".mp4"),
    }
}

async fn matching_files(dir: &Path, accept: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to read output partition");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Failed to read output partition entry");
                break;
            }
        };
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        if is_file && accept(&entry.file_name().to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    files
}

async fn accumulate_images(root: &Path, stats: &mut StorageStats) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .to_ascii_lowercase()
                    .ends_with(".png")
            {
                stats.total_images += 1;
                stats.total_bytes += entry.metadata().await?.len();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn touch(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, bytes).expect("write");
    }

    #[test]
    fn image_match_skips_last_frame_sidecar() {
        let rid = RequestId::from_prompt_id("abcd1234ffff");
        assert!(matches_request("20250101120000_42_abcd1234_00001.png", &rid, MediaKind::Image));
        assert!(!matches_request("20250101120000_42_abcd1234_00001_[-1].png", &rid, MediaKind::Image));
        assert!(!matches_request("20250101120000_42_abcd1234_00001.mp4", &rid, MediaKind::Image));
        assert!(matches_request("20250101120000_42_abcd1234_00001.mp4", &rid, MediaKind::Video));
        assert!(!matches_request("20250101120000_42_abcd12345_00001.png", &rid, MediaKind::Image));
    }

    #[tokio::test]
    async fn finds_image_in_today_partition() {
        let root = tempdir().expect("tempdir");
        let locator = OutputLocator::new(root.path().to_path_buf(), 0);
        let today = date(2025, 3, 9);
        let rid = RequestId::from_prompt_id("deadbeef");
        let dir = locator.partition_dir(today);
        touch(&dir.join("20250309101010_1_deadbeef_00002.png"), b"b");
        touch(&dir.join("20250309101010_1_deadbeef_00001.png"), b"a");
        touch(&dir.join("20250309101010_1_cafebabe_00001.png"), b"c");

        let found = locator.find_from(&rid, today).await.expect("found");
        assert_eq!(found.kind, MediaKind::Image);
        assert_eq!(found.files.len(), 2);
        assert_eq!(found.primary_name(), "20250309101010_1_deadbeef_00001.png");
    }

    #[tokio::test]
    async fn lookback_controls_earlier_partitions() {
        let root = tempdir().expect("tempdir");
        let today = date(2025, 3, 1);
        let rid = RequestId::from_prompt_id("deadbeef");
        let yesterday = OutputLocator::new(root.path().to_path_buf(), 0).partition_dir(date(2025, 2, 28));
        touch(&yesterday.join("20250228235959_0_deadbeef_00001.mp4"), b"v");

        let strict = OutputLocator::new(root.path().to_path_buf(), 0);
        assert!(strict.find_from(&rid, today).await.is_none());

        let lenient = OutputLocator::new(root.path().to_path_buf(), 1);
        let found = lenient.find_from(&rid, today).await.expect("found");
        assert_eq!(found.kind, MediaKind::Video);
    }

    #[tokio::test]
    async fn lookup_never_creates_directories() {
        let root = tempdir().expect("tempdir");
        let output = root.path().join("output");
        let locator = OutputLocator::new(output.clone(), 3);

        assert!(locator.find(&RequestId::from_prompt_id("deadbeef")).await.is_none());
        assert!(!output.exists());
        assert_eq!(locator.stats().await, StorageStats::default());
    }

    #[tokio::test]
    async fn stats_count_pngs_recursively() {
        let root = tempdir().expect("tempdir");
        touch(&root.path().join("2025-01-01/a.png"), &[0; 10]);
        touch(&root.path().join("2025-01-02/b.PNG"), &[0; 5]);
        touch(&root.path().join("2025-01-02/c.mp4"), &[0; 100]);

        let stats = OutputLocator::new(root.path().to_path_buf(), 0).stats().await;
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.total_bytes, 15);
    }

    #[tokio::test]
    async fn sequence_lookup_ignores_timestamp_and_sidecars() {
        let root = tempdir().expect("tempdir");
        let locator = OutputLocator::new(root.path().to_path_buf(), 0);
        let rid = RequestId::from_prompt_id("deadbeef");
        let dir = locator.today_dir();
        touch(&dir.join("20250309101010_0_deadbeef_00001.png"), b"a");
        touch(&dir.join("20250309101010_0_deadbeef_00000_[-1].png"), b"last");

        let found = locator
            .find_sequence(&rid, 1, MediaKind::Image)
            .await
            .expect("found");
        assert!(found.ends_with("20250309101010_0_deadbeef_00001.png"));
        assert!(locator.find_sequence(&rid, 0, MediaKind::Image).await.is_none());
        assert!(locator.find_sequence(&rid, 1, MediaKind::Video).await.is_none());
    }
}
