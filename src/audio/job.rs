//! # Per-Request Audio Job
//!
//! Every request owns its scratch files through `tempfile::TempPath`, which
//! deletes the file when dropped. Success paths call `cleanup()` to close the
//! files explicitly and log any deletion error; every other path (errors,
//! cancelled futures, panics unwinding through the handler) relies on `Drop`.
//! Either way each file is removed exactly once.
//!
//! Files are only ever written through a handle owned by the worker that
//! created them, never reopened by path, so a dropped request cannot bring
//! back a file its `TempPath` already removed.

use crate::error::PipelineError;
use std::io::Write;
use std::path::Path;
use tempfile::TempPath;
use tracing::{debug, warn};
use uuid::Uuid;

/// Create an empty scratch file in `work_dir` that is deleted on drop.
pub fn scratch_file(work_dir: &Path, prefix: &str, suffix: &str) -> Result<TempPath, PipelineError> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(work_dir)?;
    Ok(file.into_temp_path())
}

/// Extension to keep on the staged upload so the transcoder can sniff it.
fn upload_suffix(filename: Option<&str>) -> String {
    let ext = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());
    format!(".{}", ext)
}

/// Lifecycle of one uploaded clip.
#[derive(Debug)]
pub struct AudioJob {
    pub id: Uuid,
    input: Option<TempPath>,
    denoised: Option<TempPath>,
    pub sample_rate: u32,
    pub region_hint: Option<String>,
}

impl AudioJob {
    /// Persist the uploaded bytes to a fresh scratch file.
    ///
    /// The file is created and written on a blocking worker that owns the
    /// handle. If the request is dropped first, the worker's `TempPath` is
    /// dropped with its unread output and the file goes with it.
    ///
    /// ## Parameters:
    /// - **id**: request id, used in file names and log fields
    /// - **bytes**: raw upload, any container
    /// - **filename**: client-supplied name, only its extension is used
    /// - **work_dir**: directory that receives the scratch files
    /// - **sample_rate**: canonical rate the denoiser will produce
    /// - **region_hint**: region key from the form, if any
    pub async fn stage(
        id: Uuid,
        bytes: &[u8],
        filename: Option<&str>,
        work_dir: &Path,
        sample_rate: u32,
        region_hint: Option<String>,
    ) -> Result<Self, PipelineError> {
        let prefix = format!("{}-upload-", id);
        let suffix = upload_suffix(filename);
        let dir = work_dir.to_path_buf();
        let contents = bytes.to_vec();

        let input = tokio::task::spawn_blocking(move || -> Result<TempPath, PipelineError> {
            let mut file = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(&suffix)
                .tempfile_in(&dir)?;
            file.as_file_mut().write_all(&contents)?;
            file.as_file_mut().flush()?;
            Ok(file.into_temp_path())
        })
        .await??;

        debug!(job_id = %id, bytes = bytes.len(), path = %input.display(), "Upload staged");

        Ok(Self {
            id,
            input: Some(input),
            denoised: None,
            sample_rate,
            region_hint,
        })
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn denoised_path(&self) -> Option<&Path> {
        self.denoised.as_deref()
    }

    /// Take ownership of the denoised clip. Replacing an earlier one drops it.
    pub fn attach_denoised(&mut self, output: TempPath) {
        self.denoised = Some(output);
    }

    /// Release the staged upload early; the denoised clip is all later stages need.
    pub fn release_input(&mut self) {
        if let Some(input) = self.input.take() {
            close(input, self.id, "upload");
        }
    }

    /// Delete every scratch file this job still owns.
    pub fn cleanup(mut self) {
        self.release_input();
        if let Some(denoised) = self.denoised.take() {
            close(denoised, self.id, "denoised");
        }
    }
}

fn close(path: TempPath, job_id: Uuid, kind: &str) {
    let shown = path.display().to_string();
    if let Err(e) = path.close() {
        warn!(job_id = %job_id, path = %shown, error = %e, "Failed to remove {} scratch file", kind);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{file_count, wait_until_empty};
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_upload_suffix() {
        assert_eq!(upload_suffix(Some("clip.WEBM")), ".webm");
        assert_eq!(upload_suffix(Some("voice.note.m4a")), ".m4a");
        assert_eq!(upload_suffix(Some("noext")), ".bin");
        assert_eq!(upload_suffix(Some("evil.$(rm)")), ".bin");
        assert_eq!(upload_suffix(None), ".bin");
    }

    #[tokio::test]
    async fn test_stage_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = AudioJob::stage(Uuid::new_v4(), b"RIFFdata", Some("a.wav"), dir.path(), 48_000, None)
            .await
            .unwrap();

        let input = job.input_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&input).unwrap(), b"RIFFdata");
        assert!(input.to_string_lossy().ends_with(".wav"));

        job.attach_denoised(scratch_file(dir.path(), "d-", ".wav").unwrap());
        assert_eq!(file_count(dir.path()), 2);

        job.cleanup();
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_drop_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut job = AudioJob::stage(Uuid::new_v4(), b"x", None, dir.path(), 48_000, Some("Malaysia".into()))
                .await
                .unwrap();
            job.attach_denoised(scratch_file(dir.path(), "d-", ".wav").unwrap());
            assert_eq!(job.region_hint.as_deref(), Some("Malaysia"));
        }
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_release_input_keeps_denoised() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = AudioJob::stage(Uuid::new_v4(), b"x", None, dir.path(), 48_000, None).await.unwrap();
        job.attach_denoised(scratch_file(dir.path(), "d-", ".wav").unwrap());

        job.release_input();
        assert!(job.input_path().is_none());
        assert!(job.denoised_path().unwrap().exists());
        assert_eq!(file_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_stage_names_files_after_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let job = AudioJob::stage(id, b"x", Some("a.ogg"), dir.path(), 48_000, None).await.unwrap();

        assert_eq!(job.id, id);
        let name = job.input_path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&id.to_string()));
        assert!(name.ends_with(".ogg"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_stage_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let upload = vec![7u8; 256 * 1024];

        for _ in 0..200 {
            let mut staging = Box::pin(AudioJob::stage(
                Uuid::new_v4(),
                &upload,
                Some("clip.wav"),
                dir.path(),
                48_000,
                None,
            ));
            // One poll starts the blocking write, then the caller goes away.
            assert!(staging.as_mut().now_or_never().is_none());
            drop(staging);
        }

        // Detached workers finish and drop their outputs.
        assert_eq!(wait_until_empty(dir.path()).await, 0);
    }
}
