use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;
use thiserror::Error;

use crate::backend::{self, retry_interrupted, Backend, BackendKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown open mode {0:?} (expected r, w, a, r+, w+ or a+)")]
pub struct ParseModeError(String);

/// Access mode of a file stream, in `fopen` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// `r`: read an existing file.
    Read,
    /// `w`: create or truncate, write only.
    Write,
    /// `a`: create if missing, every write appends.
    Append,
    /// `r+`: read and write an existing file.
    ReadWrite,
    /// `w+`: create or truncate, read and write.
    ReadWriteTruncate,
    /// `a+`: create if missing, read anywhere, append on write.
    ReadAppend,
}

impl OpenMode {
    pub fn readable(self) -> bool {
        !matches!(self, OpenMode::Write | OpenMode::Append)
    }

    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::Write => "w",
            OpenMode::Append => "a",
            OpenMode::ReadWrite => "r+",
            OpenMode::ReadWriteTruncate => "w+",
            OpenMode::ReadAppend => "a+",
        }
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::ReadWriteTruncate => options.read(true).write(true).create(true).truncate(true),
            OpenMode::ReadAppend => options.read(true).append(true).create(true),
        };
        options
    }
}

impl FromStr for OpenMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A trailing `b` is accepted and ignored, as with fopen.
        let mode = s.strip_suffix('b').unwrap_or(s);
        match mode {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadWrite),
            "w+" => Ok(OpenMode::ReadWriteTruncate),
            "a+" => Ok(OpenMode::ReadAppend),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Portable file backend.
#[derive(Debug)]
pub struct FileBackend {
    file: Option<File>,
    path: PathBuf,
    mode: OpenMode,
}

impl FileBackend {
    /// Opens `path` with the given mode.
    ///
    /// # Errors
    /// Returns the OS error if the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = mode.options().open(&path)?;
        info!("File opened at {} (mode: {})", path.display(), mode);
        Ok(Self {
            file: Some(file),
            path,
            mode,
        })
    }

    fn file_mut(&mut self, op: &str) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| backend::closed(op))
    }
}

impl Backend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file_mut("read")?;
        retry_interrupted(|| file.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file_mut("write")?;
        retry_interrupted(|| file.write(buf))
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let file = self.file_mut("seek")?;
        retry_interrupted(|| file.seek(pos))
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut("flush")?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                info!("File closed at {} (mode: {})", self.path.display(), self.mode);
                Ok(())
            }
            None => Err(backend::closed("close")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fopen_modes() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("wb".parse::<OpenMode>().unwrap(), OpenMode::Write);
        assert_eq!("a+".parse::<OpenMode>().unwrap(), OpenMode::ReadAppend);
        assert!("rw".parse::<OpenMode>().is_err());
        assert!(OpenMode::ReadWrite.readable() && OpenMode::ReadWrite.writable());
        assert!(!OpenMode::Append.readable());
        assert!(!OpenMode::Read.writable());
    }

    #[test]
    fn write_seek_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let mut file = FileBackend::open(&path, OpenMode::ReadWriteTruncate).unwrap();
        file.write_all(b"conduit").unwrap();
        assert_eq!(file.seek(SeekFrom::Start(3)).unwrap(), 3);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"duit");
        file.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"conduit");
    }

    #[test]
    fn closed_file_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = FileBackend::open(dir.path().join("x"), OpenMode::Write).unwrap();
        file.close().unwrap();
        assert_eq!(file.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(file.close().is_err());
    }

    #[test]
    fn missing_file_fails_for_read() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBackend::open(dir.path().join("missing"), OpenMode::Read).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
