// restore/archive.rs
//
// Directory downloads. Archives are produced incrementally: the writer
// side pushes bounded chunks while the response body is consumed, so no
// archive is ever materialized on disk or held whole in memory. The tar.gz
// path bridges the synchronous tar/gzip writers over a bounded channel;
// the zip path writes through an in-process duplex pipe.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Chunk granularity of the stream; also bounds the duplex pipe buffer.
const CHUNK_SIZE: usize = 64 * 1024;

/// In-flight chunks the tar.gz writer may run ahead of the client.
const CHANNEL_CHUNKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "zip" => Some(Self::Zip),
            "tar.gz" | "tgz" => Some(Self::TarGz),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::TarGz => "application/gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Bytes a response can stream while the archive is still being written.
pub type ArchiveStream = Box<dyn AsyncRead + Send + Unpin>;

/// Start archiving `root` (rooted at `archive_root` inside the archive) and
/// return the readable side immediately. Symlinks are not followed. A
/// writer failure mid-stream truncates the body; the cause is logged.
pub fn stream_archive(root: PathBuf, archive_root: String, format: ArchiveFormat) -> ArchiveStream {
    match format {
        ArchiveFormat::TarGz => Box::new(stream_tar_gz(root, archive_root)),
        ArchiveFormat::Zip => Box::new(stream_zip(root, archive_root)),
    }
}

/// `std::io::Write` half of the channel bridge: buffers into fixed chunks
/// and blocking-sends them to the async reader. Backpressure comes from the
/// bounded channel.
struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<std::io::Result<Vec<u8>>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_chunk(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| std::io::Error::other("download aborted by client"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_chunk()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_chunk()
    }
}

/// `AsyncRead` half of the channel bridge.
pub struct ChannelReader {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.current.len() {
                let n = (this.current.len() - this.pos).min(out.remaining());
                out.put_slice(&this.current[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.current = chunk;
                    this.pos = 0;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn stream_tar_gz(root: PathBuf, archive_root: String) -> ChannelReader {
    let (tx, rx) = mpsc::channel(CHANNEL_CHUNKS);

    tokio::task::spawn_blocking(move || {
        let writer = ChannelWriter::new(tx.clone());
        if let Err(e) = write_tar_gz(&root, &archive_root, writer) {
            warn!("tar.gz stream of {} aborted: {}", root.display(), e);
            let _ = tx.blocking_send(Err(e));
        }
    });

    ChannelReader {
        rx,
        current: Vec::new(),
        pos: 0,
    }
}

fn write_tar_gz(root: &Path, archive_root: &str, writer: ChannelWriter) -> std::io::Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let name = Path::new(archive_root).join(relative);
        if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(entry.path(), &name)?;
        }
        // symlinks are skipped: their targets may escape the mount
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()
}

fn stream_zip(root: PathBuf, archive_root: String) -> DuplexStream {
    let (reader, writer) = tokio::io::duplex(CHUNK_SIZE);

    tokio::spawn(async move {
        if let Err(e) = write_zip(&root, &archive_root, writer).await {
            warn!("zip stream of {} aborted: {}", root.display(), e);
        }
    });

    reader
}

async fn write_zip(
    root: &Path,
    archive_root: &str,
    writer: DuplexStream,
) -> std::io::Result<()> {
    use async_zip::base::write::ZipFileWriter;
    use async_zip::{Compression as ZipCompression, ZipEntryBuilder};
    use futures::AsyncWriteExt;

    // enumerate off the runtime; file contents stream entry by entry below
    let walk_root = root.to_path_buf();
    let (dirs, files) = tokio::task::spawn_blocking(move || {
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&walk_root).follow_links(false) {
            let entry = entry.map_err(std::io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(&walk_root)
                .map_err(std::io::Error::other)?
                .to_path_buf();
            if relative.as_os_str().is_empty() {
                continue;
            }
            if entry.file_type().is_dir() {
                dirs.push(relative);
            } else if entry.file_type().is_file() {
                files.push((relative, entry.path().to_path_buf()));
            }
        }
        Ok::<_, std::io::Error>((dirs, files))
    })
    .await
    .map_err(std::io::Error::other)??;

    let mut zip = ZipFileWriter::with_tokio(writer);

    for relative in dirs {
        let name = format!(
            "{}/",
            Path::new(archive_root).join(&relative).to_string_lossy()
        );
        let entry = ZipEntryBuilder::new(name.into(), ZipCompression::Stored);
        zip.write_entry_whole(entry, &[])
            .await
            .map_err(std::io::Error::other)?;
    }

    for (relative, path) in files {
        let name = Path::new(archive_root)
            .join(&relative)
            .to_string_lossy()
            .to_string();
        let entry = ZipEntryBuilder::new(name.into(), ZipCompression::Deflate);
        let mut entry_writer = zip
            .write_entry_stream(entry)
            .await
            .map_err(std::io::Error::other)?;

        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            entry_writer.write_all(&buf[..read]).await?;
        }
        entry_writer.close().await.map_err(std::io::Error::other)?;
    }

    zip.close().await.map_err(std::io::Error::other)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top-level").unwrap();
        std::fs::write(dir.path().join("sub/nested.txt"), b"nested-content").unwrap();
        dir
    }

    async fn collect(mut stream: ArchiveStream) -> Vec<u8> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn tar_gz_round_trip() {
        let dir = sample_tree();
        let bytes = collect(stream_archive(
            dir.path().to_path_buf(),
            "export".to_string(),
            ArchiveFormat::TarGz,
        ))
        .await;

        let decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut contents = std::collections::HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            contents.insert(path, body);
        }

        assert_eq!(contents.get("export/top.txt").map(String::as_str), Some("top-level"));
        assert_eq!(
            contents.get("export/sub/nested.txt").map(String::as_str),
            Some("nested-content")
        );
    }

    #[tokio::test]
    async fn zip_round_trip() {
        let dir = sample_tree();
        let bytes = collect(stream_archive(
            dir.path().to_path_buf(),
            "export".to_string(),
            ArchiveFormat::Zip,
        ))
        .await;

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name("export/sub/nested.txt").unwrap();
        let mut body = String::new();
        file.read_to_string(&mut body).unwrap();
        assert_eq!(body, "nested-content");
    }

    #[tokio::test]
    async fn stream_stays_chunked_for_large_content() {
        let dir = tempfile::tempdir().unwrap();
        // several channel buffers worth of incompressible-ish data
        let payload: Vec<u8> = (0..(CHUNK_SIZE * CHANNEL_CHUNKS * 3))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(dir.path().join("blob.bin"), &payload).unwrap();

        let bytes = collect(stream_archive(
            dir.path().to_path_buf(),
            "export".to_string(),
            ArchiveFormat::TarGz,
        ))
        .await;

        let decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert_eq!(body, payload);
    }

    #[test]
    fn format_parsing() {
        assert_eq!(ArchiveFormat::parse("zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::parse("tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::parse("rar"), None);
    }
}
