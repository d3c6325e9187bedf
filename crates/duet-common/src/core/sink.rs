//! Receive sinks: where incoming file bytes go.
//!
//! A sink is picked once per transfer when `meta` arrives and is closed
//! exactly once, by `commit` or `abort`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::transfer::{FileMeta, TransferError};

/// Cap on the up-front allocation for in-memory transfers
const MEMORY_PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Name used when the announced name has nothing usable left after sanitizing
const FALLBACK_FILE_NAME: &str = "received.bin";

/// A place the receiver is allowed to write files to.
#[async_trait]
pub trait DiskTarget: Send + Sync {
    async fn open_writer(&self, meta: &FileMeta) -> Result<Box<dyn ProgressiveWriter>>;
}

/// Incremental writer for one file.
#[async_trait]
pub trait ProgressiveWriter: Send + Sync {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the file and return where it ended up
    async fn commit(self: Box<Self>) -> Result<PathBuf>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// A completed incoming file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedFile {
    Saved {
        meta: FileMeta,
        path: PathBuf,
    },
    InMemory {
        meta: FileMeta,
        mime_type: String,
        data: Bytes,
    },
}

impl ReceivedFile {
    pub fn meta(&self) -> &FileMeta {
        match self {
            ReceivedFile::Saved { meta, .. } | ReceivedFile::InMemory { meta, .. } => meta,
        }
    }

    /// Make sure the file exists on disk, writing in-memory data into `dir`.
    pub async fn persist(self, dir: &Path) -> Result<PathBuf> {
        match self {
            ReceivedFile::Saved { path, .. } => Ok(path),
            ReceivedFile::InMemory { meta, data, .. } => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                let path = find_available_filename(&dir.join(sanitize_file_name(&meta.name)));
                tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                Ok(path)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Memory,
    Disk,
}

/// Buffers the whole file in memory
#[derive(Debug, Default)]
pub struct MemoryAccumulator {
    buf: BytesMut,
}

impl MemoryAccumulator {
    pub fn new(meta: &FileMeta) -> Self {
        Self {
            buf: BytesMut::with_capacity(meta.total_size.min(MEMORY_PREALLOC_LIMIT) as usize),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Destination for one incoming transfer
pub enum ReceiveSink {
    Memory(MemoryAccumulator),
    Disk(Box<dyn ProgressiveWriter>),
}

impl ReceiveSink {
    pub fn kind(&self) -> SinkKind {
        match self {
            ReceiveSink::Memory(_) => SinkKind::Memory,
            ReceiveSink::Disk(_) => SinkKind::Disk,
        }
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        match self {
            ReceiveSink::Memory(acc) => {
                acc.buf.extend_from_slice(data);
                Ok(())
            }
            ReceiveSink::Disk(writer) => writer
                .write(data)
                .await
                .map_err(|e| TransferError::Disk(format!("{:#}", e))),
        }
    }

    pub async fn commit(self, meta: FileMeta) -> Result<ReceivedFile, TransferError> {
        match self {
            ReceiveSink::Memory(acc) => Ok(ReceivedFile::InMemory {
                mime_type: meta.mime_type.clone(),
                meta,
                data: acc.buf.freeze(),
            }),
            ReceiveSink::Disk(writer) => {
                let path = writer
                    .commit()
                    .await
                    .map_err(|e| TransferError::Disk(format!("{:#}", e)))?;
                Ok(ReceivedFile::Saved { meta, path })
            }
        }
    }

    /// Drop partial data. Failures are logged, not returned.
    pub async fn abort(self) {
        if let ReceiveSink::Disk(writer) = self {
            if let Err(e) = writer.abort().await {
                log::warn!("Failed to discard partial file: {:#}", e);
            }
        }
    }
}

impl std::fmt::Debug for ReceiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveSink::Memory(acc) => f.debug_tuple("Memory").field(&acc.len()).finish(),
            ReceiveSink::Disk(_) => f.write_str("Disk"),
        }
    }
}

/// Disk target backed by a directory the user granted up front
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    dir: PathBuf,
}

impl DirectoryTarget {
    /// Create `dir` if needed and check that it is writable
    pub async fn acquire(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

        let suffix: u32 = rand::thread_rng().gen();
        let probe = dir.join(format!(".duet-probe-{:08x}", suffix));
        tokio::fs::write(&probe, b"")
            .await
            .with_context(|| format!("Output directory {} is not writable", dir.display()))?;
        let _ = tokio::fs::remove_file(&probe).await;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl DiskTarget for DirectoryTarget {
    async fn open_writer(&self, meta: &FileMeta) -> Result<Box<dyn ProgressiveWriter>> {
        let final_path = self.dir.join(sanitize_file_name(&meta.name));
        let part_path = part_file_path(&final_path);
        let file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("Failed to create {}", part_path.display()))?;

        log::debug!("Writing {} via {}", meta.name, part_path.display());
        Ok(Box::new(PartFileWriter {
            file,
            part_path,
            final_path,
        }))
    }
}

/// Writes into `<final>.part`, renamed into place on commit
struct PartFileWriter {
    file: tokio::fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
}

#[async_trait]
impl ProgressiveWriter for PartFileWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .with_context(|| format!("Failed to write {}", self.part_path.display()))
    }

    async fn commit(self: Box<Self>) -> Result<PathBuf> {
        let PartFileWriter {
            mut file,
            part_path,
            final_path,
        } = *self;
        file.flush().await.context("Failed to flush partial file")?;
        file.sync_all().await.context("Failed to sync partial file")?;
        drop(file);

        let target = find_available_filename(&final_path);
        tokio::fs::rename(&part_path, &target)
            .await
            .with_context(|| format!("Failed to move file into place at {}", target.display()))?;
        Ok(target)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let PartFileWriter {
            file, part_path, ..
        } = *self;
        drop(file);
        match tokio::fs::remove_file(&part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", part_path.display())),
        }
    }
}

/// Partial-data path for a given final output path.
/// Format: `<final_path>.part`
pub fn part_file_path(final_path: &Path) -> PathBuf {
    let mut part = final_path.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_start_matches('.')
        .to_string();

    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

/// Find next available filename by appending _2, _3, etc.
/// Example: file.txt -> file_2.txt -> file_3.txt
pub fn find_available_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 2..=999 {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
    }

    // 999 collisions: fall back to a timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    parent.join(format!("{}_{}{}", stem, timestamp, ext))
}
