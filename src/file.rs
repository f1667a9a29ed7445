// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The file handle interface this core consumes (spec.md §6). The file
//! system and block-device layer are out of scope (spec.md §1); this
//! crate only needs read-at/write-at/length/reopen/close against whatever
//! concrete file type the surrounding OS has open.

use std::io;

pub trait FileHandle: Send {
    fn length(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read (short reads are legal and are
    /// zero-padded by the caller, matching `pintos/vm/file.c`).
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `buf` at `offset`. Returns the number of bytes written.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Open an independent handle to the same underlying file, so its
    /// lifetime does not depend on the handle that produced it (spec.md
    /// §4.9: the mmap region owns a fresh reopen).
    fn reopen(&self) -> io::Result<Box<dyn FileHandle>>;

    fn close(self: Box<Self>) {}
}

/// Production implementation backed by a real file on disk.
pub struct StdFileHandle {
    path: std::path::PathBuf,
    file: std::fs::File,
}

impl StdFileHandle {
    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(StdFileHandle { path, file })
    }
}

impl FileHandle for StdFileHandle {
    fn length(&self) -> u64 { self.file.metadata().map(|m| m.len()).unwrap_or(0) }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(offset))?;
        // A short read is not an error: the caller (file.rs page logic)
        // zero-pads whatever wasn't filled.
        let mut total = 0;
        loop {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if total == buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::io::{Seek, SeekFrom, Write};
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn reopen(&self) -> io::Result<Box<dyn FileHandle>> { Ok(Box::new(StdFileHandle::open(&self.path)?)) }
}
