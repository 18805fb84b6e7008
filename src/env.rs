//! File-system abstraction the engine is written against. All I/O is
//! synchronous and blocking; durability is only promised after `sync`.

use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Sequential read access, as used by the WAL reader.
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes; a short count signals end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn skip(&mut self, n: u64) -> Result<()>;
}

/// Positional read access, as used by the table reader.
pub trait RandomAccessFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes at `offset`, or fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Append-only write access, as used by the WAL and table writers.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Hands buffered bytes to the OS without forcing them to stable storage.
    fn flush(&mut self) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Factory for the three file kinds plus the small set of file-system
/// operations the engine needs.
pub trait Env: Send + Sync {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    fn file_exists(&self, path: &Path) -> bool;

    fn get_file_size(&self, path: &Path) -> Result<u64>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Advisory whole-file lock; a second lock on the same path fails until
    /// the first is released.
    fn lock_file(&self, path: &Path) -> Result<()>;

    fn unlock_file(&self, path: &Path) -> Result<()>;
}

/// `std::fs`-backed environment.
pub struct StdEnv {
    locked: Mutex<Vec<PathBuf>>,
}

impl StdEnv {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(Vec::new()),
        }
    }
}

impl Default for StdEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-lifetime default environment.
pub fn std_env() -> Arc<dyn Env> {
    static ONCE: std::sync::OnceLock<Arc<StdEnv>> = std::sync::OnceLock::new();
    ONCE.get_or_init(|| Arc::new(StdEnv::new())).clone()
}

impl Env for StdEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = fs::File::open(path)?;
        Ok(Box::new(StdSequentialFile { file }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = fs::File::open(path)?;
        Ok(Box::new(StdRandomAccessFile { file }))
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(StdWritableFile {
            file: Some(std::io::BufWriter::new(file)),
        }))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> Result<()> {
        let mut locked = self.locked.lock();
        if locked.iter().any(|p| p == path) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("lock already held: {}", path.display()),
            )));
        }
        fs::OpenOptions::new().write(true).create(true).open(path)?;
        locked.push(path.to_path_buf());
        Ok(())
    }

    fn unlock_file(&self, path: &Path) -> Result<()> {
        let mut locked = self.locked.lock();
        match locked.iter().position(|p| p == path) {
            Some(i) => {
                locked.swap_remove(i);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!(
                "not locked: {}",
                path.display()
            ))),
        }
    }
}

struct StdSequentialFile {
    file: fs::File,
}

impl SequentialFile for StdSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        // Loop so a short read from the OS is not mistaken for EOF.
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.file.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct StdRandomAccessFile {
    file: fs::File,
}

impl RandomAccessFile for StdRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            use std::os::windows::fs::FileExt;
            let mut total = 0;
            while total < buf.len() {
                let n = self.file.seek_read(&mut buf[total..], offset + total as u64)?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "short positional read",
                    )));
                }
                total += n;
            }
            Ok(())
        }
    }
}

struct StdWritableFile {
    file: Option<std::io::BufWriter<fs::File>>,
}

impl StdWritableFile {
    fn writer(&mut self) -> Result<&mut std::io::BufWriter<fs::File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("file already closed".into()))
    }
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer()?.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.file.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
