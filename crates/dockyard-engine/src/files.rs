//! File CRUD inside a container's per-user home directory.
//!
//! The engine API has no random-access file I/O, so reads and writes go
//! through single-entry tar archives (get-archive / put-archive) and the
//! remaining operations are one-shot in-container commands. Paths are
//! joined under `/home/{user}` without canonicalization; traversal
//! sequences are not rejected here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bollard::container::{DownloadFromContainerOptions, UploadToContainerOptions};
use bollard::errors::Error as BollardError;
use dockyard_common::{Error, FileContent, FileDownload, Result};
use futures::StreamExt;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::manager::{engine_error, summary_id, SandboxManager};

pub(crate) fn home_dir(user: &str) -> String {
    format!("/home/{user}")
}

impl SandboxManager {
    /// Raw `ls -p` lines from the user's home directory; trailing `/`
    /// marks directories. Blank lines are dropped.
    #[instrument(skip(self))]
    pub async fn list_files(&self, user: &str, name: &str) -> Result<Vec<String>> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        let outcome = self
            .exec_collect(
                id,
                vec!["ls".to_string(), "-p".to_string(), home_dir(user)],
                Some(user),
                None,
            )
            .await?;
        Ok(String::from_utf8_lossy(&outcome.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn read_file(&self, user: &str, name: &str, path: &str) -> Result<FileContent> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;

        let mut stream = self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: format!("{}/{path}", home_dir(user)),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                // The engine 404s the whole transfer when the path does not
                // exist; that is a missing file, not an engine fault.
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(Error::NotFound(format!(
                        "'{path}' not found in container"
                    )))
                }
                Err(err) => return Err(engine_error(err)),
            }
        }

        let bytes = extract_member(&archive, path)?;
        debug!(%path, size = bytes.len(), "read file from container");
        Ok(FileContent {
            path: path.to_string(),
            mime_type: sniff_mime(&bytes),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Uploads `content` as a single-entry archive rooted at the user's
    /// home directory; the engine creates or overwrites the target.
    #[instrument(skip(self, content))]
    pub async fn write_file(&self, user: &str, name: &str, path: &str, content: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;

        let archive = pack_single_file(path, content.as_bytes())?;
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions::<String> {
                    path: home_dir(user),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(engine_error)?;
        info!(%user, %name, %path, bytes = content.len(), "wrote file into container");
        Ok(())
    }

    /// Recursive remove with the user's home as working directory. A
    /// missing path fails; the command's stderr becomes the error message.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, user: &str, name: &str, path: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        let outcome = self
            .exec_collect(
                id,
                vec!["rm".to_string(), "-r".to_string(), "--".to_string(), path.to_string()],
                None,
                Some(home_dir(user)),
            )
            .await?;
        if outcome.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&outcome.stderr);
            let message = stderr.trim();
            return Err(Error::EngineApplication(if message.is_empty() {
                format!("failed to remove '{path}'")
            } else {
                message.to_string()
            }));
        }
        info!(%user, %name, %path, "removed path in container");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_folder(&self, user: &str, name: &str, path: &str) -> Result<()> {
        let summary = self.resolve(user, name).await?;
        let id = summary_id(&summary)?;
        let outcome = self
            .exec_collect(
                id,
                vec![
                    "mkdir".to_string(),
                    "-p".to_string(),
                    format!("{}/{path}", home_dir(user)),
                ],
                None,
                None,
            )
            .await?;
        if outcome.exit_code != 0 {
            let stderr = String::from_utf8_lossy(&outcome.stderr);
            return Err(Error::EngineApplication(format!(
                "failed to create folder '{path}': {}",
                stderr.trim()
            )));
        }
        info!(%user, %name, %path, "created folder in container");
        Ok(())
    }

    /// Read plus base64 encoding, for transports that cannot carry raw
    /// bytes. The filename is the final path segment.
    #[instrument(skip(self))]
    pub async fn download_file(&self, user: &str, name: &str, path: &str) -> Result<FileDownload> {
        let file = self.read_file(user, name, path).await?;
        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(FileDownload {
            path: file.path,
            filename,
            content_base64: BASE64.encode(file.content.as_bytes()),
        })
    }
}

/// Pulls the transferred file out of a get-archive tarball. The archive is
/// rooted at the requested path's final segment, so members are matched by
/// file name; anything else in the stream (directory headers, pax
/// extensions) is skipped.
fn extract_member(archive: &[u8], path: &str) -> Result<Vec<u8>> {
    let wanted = Path::new(path)
        .file_name()
        .ok_or_else(|| Error::Validation(format!("'{path}' has no file name")))?;

    let mut tar = tar::Archive::new(archive);
    for entry in tar.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .map_err(archive_error)?
            .file_name()
            .map(|member| member == wanted)
            .unwrap_or(false);
        if matches {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes).map_err(archive_error)?;
            return Ok(bytes);
        }
    }
    Err(Error::NotFound(format!(
        "'{path}' missing from transferred archive"
    )))
}

/// Single-entry tar archive holding `data` at `path`, built in memory.
fn pack_single_file(path: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, path, data)
        .map_err(archive_error)?;
    builder.into_inner().map_err(archive_error)
}

fn sniff_mime(bytes: &[u8]) -> String {
    match infer::get(bytes) {
        Some(kind) => kind.mime_type().to_string(),
        None if std::str::from_utf8(bytes).is_ok() => "text/plain".to_string(),
        None => "application/octet-stream".to_string(),
    }
}

fn archive_error(err: std::io::Error) -> Error {
    Error::Internal(format!("archive processing failed: {err}"))
}
