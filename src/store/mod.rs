//! Local response store: one directory per cached response, addressed by
//! the SHA-1 of its key, holding `head`, `body` and `sigs` files. Entries
//! are committed atomically by renaming a temporary directory.

pub mod entry;
pub mod hash_list;
pub mod reader;

pub use entry::write_entry;
pub use hash_list::{load_hash_list, HashList};
pub use reader::{EntryReader, HeadReader};

use crate::error::{Error, Result};
use crate::httpmsg::PartStream;
use sha1::{Digest, Sha1};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entries younger than this may still be written to and are left alone
/// by maintenance.
const RECENTLY_UPDATED: Duration = Duration::from_secs(10 * 60);

const TEMP_PREFIX: &str = "tmp.";

/// Key to entry directory: `HEX(SHA1(key))[..2]/HEX(SHA1(key))[2..]`.
pub fn path_from_key(root: &Path, key: &str) -> PathBuf {
    let digest = Sha1::digest(key.as_bytes());
    let hex = hex::encode(digest);
    root.join(&hex[..2]).join(&hex[2..])
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        path_from_key(&self.root, key)
    }

    /// Drain `reader` into a fresh entry for `key`, replacing any
    /// previous one. The entry is staged in a temporary directory and
    /// committed by rename; a failed write leaves no trace.
    pub async fn store<S: PartStream + Send>(
        &self,
        key: &str,
        reader: &mut S,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let entry_dir = self.entry_path(key);
        let parent = entry_dir.parent().expect("entry dirs have parents");
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!("{TEMP_PREFIX}{:08x}", rand::random::<u32>()));
        fs::create_dir(&temp).await?;

        let written = write_entry(reader, &temp, cancel).await;
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&temp).await;
            return Err(e);
        }

        if fs::metadata(&entry_dir).await.is_ok() {
            fs::remove_dir_all(&entry_dir).await?;
        }
        fs::rename(&temp, &entry_dir).await?;
        debug!(%key, path = %entry_dir.display(), "stored response");
        Ok(())
    }

    pub async fn reader(&self, key: &str) -> Result<EntryReader> {
        EntryReader::open(&self.entry_path(key)).await
    }

    pub async fn range_reader(&self, key: &str, first: u64, last: u64) -> Result<EntryReader> {
        EntryReader::open_range(&self.entry_path(key), first, last).await
    }

    pub async fn head_reader(&self, key: &str) -> Result<HeadReader> {
        HeadReader::open(&self.entry_path(key)).await
    }

    pub async fn hash_list(&self, key: &str) -> Result<HashList> {
        load_hash_list(&self.entry_path(key)).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let dir = self.entry_path(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Visit every entry; when `keep` says no (or the entry cannot even
    /// be opened), it is removed. Stale temporaries are cleaned up on the
    /// way.
    pub async fn for_each<F, Fut>(&self, mut keep: F, cancel: &CancellationToken) -> Result<()>
    where
        F: FnMut(EntryReader) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut top = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(parent) = top.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let parent_name = parent.file_name();
            let parent_name = parent_name.to_string_lossy();
            if !parent.file_type().await?.is_dir() || !is_hex_of_len(&parent_name, 2) {
                warn!(name = %parent_name, "unexpected item in store root");
                continue;
            }

            let mut inner = fs::read_dir(parent.path()).await?;
            while let Some(item) = inner.next_entry().await? {
                if cancel.is_cancelled() {
                    return Err(Error::Aborted);
                }

                let name = item.file_name();
                let name = name.to_string_lossy().into_owned();
                let path = item.path();

                if !item.file_type().await?.is_dir() {
                    warn!(%name, "unexpected non-directory in store");
                    continue;
                }

                if name.starts_with(TEMP_PREFIX) {
                    if !recently_updated(&path).await {
                        debug!(%name, "removing stale temporary entry");
                        try_remove(&path).await;
                    }
                    continue;
                }

                if !is_hex_of_len(&name, 38) {
                    warn!(%name, "unknown directory in store");
                    continue;
                }

                let entry = match EntryReader::open(&path).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(%name, ?e, "removing unreadable entry");
                        try_remove(&path).await;
                        continue;
                    }
                };

                match keep(entry).await {
                    Ok(true) => {}
                    Ok(false) => try_remove(&path).await,
                    Err(Error::Aborted) => return Err(Error::Aborted),
                    Err(e) => {
                        warn!(%name, ?e, "entry check failed, removing");
                        try_remove(&path).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Total size of stored files.
    pub async fn size(&self) -> Result<u64> {
        let mut total = 0;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(item) = rd.next_entry().await? {
                let ft = item.file_type().await?;
                if ft.is_dir() {
                    stack.push(item.path());
                } else if ft.is_file() {
                    total += item.metadata().await?.len();
                }
            }
        }
        Ok(total)
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

async fn recently_updated(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age <= RECENTLY_UPDATED)
        .unwrap_or(true)
}

async fn try_remove(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path).await {
        warn!(path = %path.display(), ?e, "failed to remove entry");
    }
}
