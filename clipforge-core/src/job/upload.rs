use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead, AsyncWriteExt, BufWriter};

/// Inbound media stream with the metadata the caller declared for it.
pub struct UploadRequest<R> {
    pub filename: String,
    pub content_type: String,
    pub reader: R,
}

impl<R> UploadRequest<R> {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, reader: R) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            reader,
        }
    }
}

/// Splits a declared filename into its logical name and extension. Any
/// directory part the client sent is dropped.
pub(crate) fn split_filename(filename: &str) -> Option<(String, String)> {
    let name = Path::new(filename.trim()).file_name()?.to_str()?;
    let (stem, extension) = name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some((stem.to_string(), extension.to_string()))
}

/// Streams `reader` into `destination`. Bytes land in a `.part` sibling
/// first so a torn upload never appears at the final path.
pub(crate) async fn receive<R>(reader: &mut R, destination: &Path) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(destination);
    let written = match copy_into(reader, &partial).await {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }
    };
    fs::rename(&partial, destination).await?;
    Ok(written)
}

async fn copy_into<R>(reader: &mut R, path: &Path) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let file = File::create(path).await?;
    let mut writer = BufWriter::new(file);
    let written = io::copy(reader, &mut writer).await?;
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(written)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn filenames_split_into_stem_and_extension() {
        assert_eq!(
            split_filename("holiday.clip.mp4"),
            Some(("holiday.clip".to_string(), "mp4".to_string()))
        );
        assert_eq!(
            split_filename("../../etc/intro.MP4"),
            Some(("intro".to_string(), "MP4".to_string()))
        );
        assert_eq!(split_filename("noextension"), None);
        assert_eq!(split_filename(".mp4"), None);
        assert_eq!(split_filename("trailing."), None);
    }

    #[tokio::test]
    async fn receive_writes_complete_file() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("videos/a1.mp4");
        let mut reader: &[u8] = b"not really a video";
        let written = receive(&mut reader, &destination).await.unwrap();
        assert_eq!(written, 18);
        assert_eq!(std::fs::read(&destination).unwrap(), b"not really a video");
        assert!(!partial_path(&destination).exists());
    }
}
