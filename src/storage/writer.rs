//! Streaming writer for a single page file.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::StorageError;

/// Suffix of a page that is still being written.
pub(crate) const PART_SUFFIX: &str = "part";

/// Writes one page to `<index>.part` and renames it to `<index>` on commit.
///
/// Until [`PageWriter::commit`] succeeds the final path does not exist, so an
/// interrupted write is never mistaken for a stored page. Dropping the writer
/// without committing leaves the `.part` file behind; the next attempt
/// truncates it.
#[derive(Debug)]
pub struct PageWriter {
    part_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl PageWriter {
    pub(crate) async fn create(final_path: PathBuf) -> Result<Self, StorageError> {
        let part_path = part_path_for(&final_path);
        let file = File::create(&part_path)
            .await
            .map_err(|e| StorageError::io(part_path.clone(), e))?;
        Ok(Self {
            part_path,
            final_path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Appends a chunk of page bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the write fails.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| StorageError::io(self.part_path.clone(), e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes the page and moves it into place.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if flushing or renaming fails.
    pub async fn commit(mut self) -> Result<PathBuf, StorageError> {
        self.writer
            .flush()
            .await
            .map_err(|e| StorageError::io(self.part_path.clone(), e))?;
        self.writer
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| StorageError::io(self.part_path.clone(), e))?;
        drop(self.writer);

        tokio::fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| StorageError::io(self.final_path.clone(), e))?;
        debug!(path = %self.final_path.display(), bytes = self.written, "page committed");
        Ok(self.final_path)
    }
}

pub(crate) fn part_path_for(final_path: &Path) -> PathBuf {
    final_path.with_extension(PART_SUFFIX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_renames_part_file() {
        let temp = TempDir::new().unwrap();
        let final_path = temp.path().join("0");

        let mut writer = PageWriter::create(final_path.clone()).await.unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        writer.write_chunk(b"def").await.unwrap();
        assert_eq!(writer.written(), 6);
        assert!(!final_path.exists());
        assert!(temp.path().join("0.part").exists());

        let path = writer.commit().await.unwrap();
        assert_eq!(path, final_path);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"abcdef");
        assert!(!temp.path().join("0.part").exists());
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_no_final_file() {
        let temp = TempDir::new().unwrap();
        let final_path = temp.path().join("3");
        {
            let mut writer = PageWriter::create(final_path.clone()).await.unwrap();
            writer.write_chunk(b"partial").await.unwrap();
        }
        assert!(!final_path.exists());
    }

    #[test]
    fn test_part_path_for_appends_suffix() {
        assert_eq!(
            part_path_for(Path::new("/x/12")),
            PathBuf::from("/x/12.part")
        );
    }
}
