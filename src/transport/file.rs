use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;

use super::{SentMessage, Transport};
use crate::errors::{MailerError, MailerResult};
use crate::mime::MimeMessage;

/// Writes each message to its own `.eml` file.
///
/// Files are named `message_<timestamp>_<8 hex digits>.eml`; the timestamp
/// uses the ISO 8601 basic format so names stay valid on every platform.
#[derive(Debug, Clone)]
pub struct FileTransport {
    directory: PathBuf,
}

impl FileTransport {
    /// Creates a transport writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> MailerResult<Self> {
        let directory = directory.into();
        if directory.as_os_str().is_empty() {
            return Err(MailerError::configuration(
                "File transport requires a target directory.",
            ));
        }
        Ok(Self { directory })
    }

    /// Returns the target directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Generates a fresh file path for one message.
    pub fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%dT%H%M%S%.6f");
        let suffix: u32 = rand::random();
        self.directory
            .join(format!("message_{}_{:08x}.eml", stamp, suffix))
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, message: &MimeMessage) -> MailerResult<SentMessage> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.next_path();
        tokio::fs::write(&path, message.to_bytes()).await?;
        tracing::debug!(path = %path.display(), "Wrote message file");
        Ok(SentMessage::success(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_directory_rejected() {
        let err = FileTransport::new("").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_paths_do_not_collide() {
        let transport = FileTransport::new("/tmp/mails").unwrap();
        let first = transport.next_path();
        let second = transport.next_path();
        assert_ne!(first, second);

        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("message_"));
        assert!(name.ends_with(".eml"));
    }

    #[tokio::test]
    async fn test_writes_one_file_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path()).unwrap();
        let message = MimeMessage::text("plain", "Hello", "utf-8").unwrap();

        transport.send(&message).await.unwrap();
        transport.send(&message).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        let path = files[0].as_ref().unwrap().path();
        assert_eq!(std::fs::read(path).unwrap(), message.to_bytes());
    }
}
