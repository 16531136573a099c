//! Moves finished artifacts out of the host's working folders into the output area.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::fs;
use tracing::debug;

use crate::fingerprint::RequestId;
use crate::job::MediaKind;
use crate::locator::LAST_FRAME_SUFFIX;

/// `<YYYYmmddHHMMSS>_<seed>_<rid>_<seq:05>.<ext>`
pub fn artifact_name(
    timestamp: DateTime<Local>,
    seed: Option<i64>,
    request_id: &RequestId,
    sequence: usize,
    kind: MediaKind,
) -> String {
    format!(
        "{}_{}_{}_{:05}.{}",
        timestamp.format("%Y%m%d%H%M%S"),
        seed.unwrap_or(0),
        request_id,
        sequence,
        kind.extension()
    )
}

/// Move `src` to `dest`, copying when a plain rename is not possible.
pub async fn relocate_file(src: &Path, dest: &Path) -> Result<()> {
    ensure_parent(dest).await?;
    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(src = %src.display(), error = %rename_err, "Rename failed, copying instead");
            fs::copy(src, dest).await.with_context(|| {
                format!("failed to copy {} to {}", src.display(), dest.display())
            })?;
            fs::remove_file(src)
                .await
                .with_context(|| format!("failed to remove {}", src.display()))
        }
    }
}

pub async fn write_artifact(dest: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(dest).await?;
    fs::write(dest, bytes)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))
}

/// Move `<stem>_.png` next to the source video to `<new stem>_[-1].png`.
/// Returns whether a sidecar was present.
pub async fn relocate_last_frame(src_video: &Path, dest_video: &Path) -> Result<bool> {
    let src = sibling_png(src_video, "_");
    if !fs::try_exists(&src).await.unwrap_or(false) {
        return Ok(false);
    }
    let stem = file_stem(dest_video);
    let dest = dest_video.with_file_name(format!("{stem}{LAST_FRAME_SUFFIX}"));
    relocate_file(&src, &dest).await?;
    Ok(true)
}

/// Delete the host's auto-generated `<stem>.png` first frame. Returns whether one was removed.
pub async fn remove_first_frame(src_video: &Path) -> Result<bool> {
    let path = sibling_png(src_video, "");
    match fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn sibling_png(video: &Path, suffix: &str) -> PathBuf {
    let stem = file_stem(video);
    video.with_file_name(format!("{stem}{suffix}.png"))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn artifact_name_pads_sequence_and_defaults_seed() {
        let ts = Local
            .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
            .single()
            .expect("unambiguous time");
        let rid = RequestId::from_prompt_id("deadbeefcafe");

        assert_eq!(
            artifact_name(ts, Some(42), &rid, 0, MediaKind::Image),
            "20250102030405_42_deadbeef_00000.png"
        );
        assert_eq!(
            artifact_name(ts, None, &rid, 12, MediaKind::Video),
            "20250102030405_0_deadbeef_00012.mp4"
        );
    }

    #[tokio::test]
    async fn relocate_creates_partition_and_moves() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("work/out_00001_.png");
        std::fs::create_dir_all(src.parent().expect("parent")).expect("mkdir");
        std::fs::write(&src, b"png").expect("write");
        let dest = dir.path().join("output/2025-01-02/a.png");

        relocate_file(&src, &dest).await.expect("relocate");
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).expect("read"), b"png");
    }

    #[tokio::test]
    async fn video_sidecars_are_handled() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("clip_00001.mp4");
        std::fs::write(&src, b"mp4").expect("write");
        std::fs::write(dir.path().join("clip_00001_.png"), b"last").expect("write");
        std::fs::write(dir.path().join("clip_00001.png"), b"first").expect("write");
        let dest = dir.path().join("out/20250102030405_0_deadbeef_00000.mp4");

        assert!(relocate_last_frame(&src, &dest).await.expect("last frame"));
        assert!(remove_first_frame(&src).await.expect("first frame"));

        let last = dir.path().join("out/20250102030405_0_deadbeef_00000_[-1].png");
        assert_eq!(std::fs::read(last).expect("read"), b"last");
        assert!(!dir.path().join("clip_00001.png").exists());
    }

    #[tokio::test]
    async fn missing_sidecars_are_not_errors() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("clip_00001.mp4");
        let dest = dir.path().join("out/x.mp4");

        assert!(!relocate_last_frame(&src, &dest).await.expect("last frame"));
        assert!(!remove_first_frame(&src).await.expect("first frame"));
    }
}
