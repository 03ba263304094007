//! Backing storage for transferred files.
//!
//! The processor only ever sees [`FileStore`] and [`StoredFile`], so tests can swap in their own
//! store. [`TokioFileStore`] is the real one: a directory on the local filesystem, accessed with
//! `tokio::fs`.

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// How a request wants the file opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only.
    Read,
    /// Created if missing, write only.
    Create,
}

/// Something the server can open files in.
#[allow(async_fn_in_trait)]
pub trait FileStore {
    type File: StoredFile;

    async fn open(&self, name: &str, mode: OpenMode) -> io::Result<Self::File>;
}

/// An open file. Dropping it closes it.
#[allow(async_fn_in_trait)]
pub trait StoredFile {
    /// Fills as much of `buf` as the file allows. Returns fewer bytes than `buf.len()` only at
    /// end of file.
    async fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Appends all of `data` and makes sure it reached the file.
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Serves files out of a single root directory.
#[derive(Debug, Clone)]
pub struct TokioFileStore {
    root: PathBuf,
    read_only: bool,
    overwrite: bool,
}

impl TokioFileStore {
    pub fn new(root: impl Into<PathBuf>) -> TokioFileStore {
        TokioFileStore {
            root: root.into(),
            read_only: false,
            overwrite: true,
        }
    }

    /// Refuse every write request.
    pub fn read_only(mut self, read_only: bool) -> TokioFileStore {
        self.read_only = read_only;
        self
    }

    /// When false, a write request for an existing file fails instead of truncating it.
    pub fn overwrite(mut self, overwrite: bool) -> TokioFileStore {
        self.overwrite = overwrite;
        self
    }

    /// Maps a requested name onto a path below the root.
    ///
    /// A leading `/` is ignored. Anything that could climb out of the root is refused.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "empty file name"));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("'{name}' escapes the served directory"),
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

impl FileStore for TokioFileStore {
    type File = File;

    async fn open(&self, name: &str, mode: OpenMode) -> io::Result<File> {
        let path = self.resolve(name)?;
        match mode {
            OpenMode::Read => File::open(&path).await,
            OpenMode::Create => {
                if self.read_only {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "server is read only",
                    ));
                }
                log::info!("Writing to {:?}", path);
                let mut options = OpenOptions::new();
                options.write(true);
                if self.overwrite {
                    options.create(true).truncate(true);
                } else {
                    options.create_new(true);
                }
                options.open(&path).await
            }
        }
    }
}

impl StoredFile for File {
    async fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // A single read may come back short without being at end of file, so keep going until
        // the buffer is full or the file has nothing left.
        let mut cursor = 0;
        while cursor < buf.len() {
            match self.read(&mut buf[cursor..]).await? {
                0 => break,
                n => cursor += n,
            }
        }
        Ok(cursor)
    }

    async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }
}
