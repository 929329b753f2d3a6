use std::fs::{self, File};
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::path::{Path, PathBuf};

use relative_path::RelativePathBuf;

use crate::*;

const MAGIC: &[u8; 4] = b"TXC1";
const HEADER_LEN: usize = 8;

/// A [DiskCache] which keeps one file per asset under a root directory.
///
/// Files live at `<root>/<first two hex digits>/<id>.tex` so that no single directory grows too large. Each file is
/// a short header recording the discard level the bytes decode down to, followed by the compressed bytes. Writes go
/// to a temporary file which is then renamed into place, so readers never see half a file.
#[derive(Debug)]
pub struct FilesystemTextureCache {
    root_path: PathBuf,
}

impl FilesystemTextureCache {
    pub fn new(root_path: &Path) -> Result<FilesystemTextureCache> {
        fs::create_dir_all(root_path)?;
        Ok(FilesystemTextureCache {
            root_path: root_path.to_path_buf(),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Where the entry for `id` is stored.
    pub fn entry_path(&self, id: AssetId) -> Result<PathBuf> {
        let simple = id.to_simple_string();
        let relative = RelativePathBuf::from(format!("{}/{}.tex", &simple[..2], simple));
        let absolute = relative.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) {
            return Err(Error::new(
                ErrorKind::Other,
                "path is outside the cache root directory",
            ));
        }
        Ok(absolute)
    }

    fn read_entry(&self, id: AssetId) -> Result<CachedTexture> {
        let mut file = File::open(self.entry_path(id)?)?;
        let mut contents = Vec::with_capacity(file.metadata()?.len() as usize);
        file.read_to_end(&mut contents)?;
        if contents.len() < HEADER_LEN || &contents[..4] != MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "bad cache entry header"));
        }
        let mut discard = [0u8; 4];
        discard.copy_from_slice(&contents[4..HEADER_LEN]);
        let discard = i32::from_le_bytes(discard);
        contents.drain(..HEADER_LEN);
        Ok(CachedTexture {
            bytes: contents,
            discard,
        })
    }
}

impl DiskCache for FilesystemTextureCache {
    fn read(&self, id: AssetId, _discard_hint: i32) -> Option<CachedTexture> {
        match self.read_entry(id) {
            Ok(entry) => Some(entry),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(%id, error = %e, "unreadable texture cache entry");
                None
            }
        }
    }

    fn write(&self, id: AssetId, bytes: &[u8], discard: i32) -> Result<()> {
        let path = self.entry_path(id)?;
        let parent = path.parent().unwrap_or(&self.root_path);
        fs::create_dir_all(parent)?;
        // Each write gets its own temporary file, so concurrent writers of one id never share one.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&discard.to_le_bytes())?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, id: AssetId) {
        if let Ok(path) = self.entry_path(id) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(%id, error = %e, "failed to remove texture cache entry");
                }
            }
        }
    }
}
