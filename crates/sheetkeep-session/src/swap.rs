//! Disk swap for checkpoints evicted from memory.
//!
//! Each checkpoint owns at most one [`SwapFile`], named with the store's
//! per-instance prefix plus a v4 UUID so concurrent sessions never share a
//! file. Files carry a short header (magic, version, sheet kind tag)
//! followed by a gzip stream of the serialized sheet.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sheet::SheetKind;

const MAGIC: &[u8; 4] = b"SKSW";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 6;

/// Owns the swap directory and the write-in-progress flag.
#[derive(Clone)]
pub struct SwapStore {
    inner: Arc<SwapStoreInner>,
}

struct SwapStoreInner {
    dir: PathBuf,
    prefix: String,
    delete_retry: Duration,
    writes_in_flight: AtomicUsize,
}

impl SwapStore {
    /// Open (creating if needed) a swap store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, delete_retry: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let prefix = format!("ckpt-{}", &Uuid::new_v4().simple().to_string()[..8]);
        debug!(dir = %dir.display(), prefix = %prefix, "Swap store opened");
        Ok(Self {
            inner: Arc::new(SwapStoreInner {
                dir,
                prefix,
                delete_retry,
                writes_in_flight: AtomicUsize::new(0),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Whether any swap file is currently being written.
    pub fn is_writing(&self) -> bool {
        self.inner.writes_in_flight.load(Ordering::Acquire) > 0
    }

    /// Reserve a unique, not yet written swap file.
    pub fn allocate(&self) -> SwapFile {
        let name = format!("{}-{}.swap", self.inner.prefix, Uuid::new_v4().simple());
        SwapFile {
            path: self.inner.dir.join(name),
            store: Arc::clone(&self.inner),
        }
    }
}

impl SwapStoreInner {
    fn begin_write(&self) -> WriteGuard<'_> {
        self.writes_in_flight.fetch_add(1, Ordering::AcqRel);
        WriteGuard { inner: self }
    }
}

impl std::fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapStore")
            .field("dir", &self.inner.dir)
            .field("prefix", &self.inner.prefix)
            .finish()
    }
}

/// Clears the write-in-progress flag when dropped, on success or failure.
struct WriteGuard<'a> {
    inner: &'a SwapStoreInner,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.inner.writes_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A checkpoint's swap file. Dropping it deletes the file.
pub struct SwapFile {
    path: PathBuf,
    store: Arc<SwapStoreInner>,
}

impl SwapFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write `payload` unless the file already exists.
    ///
    /// Returns `false` when an existing file was kept.
    pub fn write(&self, kind: SheetKind, payload: &[u8]) -> Result<bool> {
        let _guard = self.store.begin_write();

        let file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                trace!(path = %self.path.display(), "Swap file already written, skipping");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = write_body(file, kind, payload) {
            // Never leave a truncated file behind for a later skip.
            let _ = fs::remove_file(&self.path);
            return Err(e.into());
        }

        trace!(path = %self.path.display(), bytes = payload.len(), "Swap file written");
        Ok(true)
    }

    /// Read back the sheet kind and decompressed payload.
    pub fn read(&self) -> Result<(SheetKind, Vec<u8>)> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        if &header[..4] != MAGIC || header[4] != VERSION {
            return Err(Error::CorruptSwap(self.path.display().to_string()));
        }
        let kind = SheetKind::from_tag(header[5])
            .ok_or_else(|| Error::CorruptSwap(self.path.display().to_string()))?;

        let mut payload = Vec::new();
        GzDecoder::new(reader).read_to_end(&mut payload)?;
        Ok((kind, payload))
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        delete_with_retry(self.path.clone(), self.store.delete_retry);
    }
}

impl std::fmt::Debug for SwapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SwapFile").field(&self.path).finish()
    }
}

fn write_body(file: File, kind: SheetKind, payload: &[u8]) -> io::Result<()> {
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION, kind.tag()])?;

    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder.write_all(payload)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_data()
}

/// Delete `path`, retrying once on a background thread if the first
/// attempt fails (e.g. the file is still held open elsewhere).
pub(crate) fn delete_with_retry(path: PathBuf, delay: Duration) {
    match fs::remove_file(&path) {
        Ok(()) => trace!(path = %path.display(), "Swap file deleted"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Swap file delete failed, scheduling retry");
            let spawned = std::thread::Builder::new()
                .name("sheetkeep-swap-delete".to_string())
                .spawn(move || {
                    std::thread::sleep(delay);
                    match fs::remove_file(&path) {
                        Ok(()) => debug!(path = %path.display(), "Swap file deleted on retry"),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Swap file delete retry failed")
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!(error = %e, "Could not schedule swap file delete retry");
            }
        }
    }
}
