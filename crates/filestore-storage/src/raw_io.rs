//! Random-access binary I/O
//!
//! [`RandomAccessIo`] is the contract every persisted structure is read and
//! written through: a cursor (`seek`/`position`), `length`/`set_length`, raw
//! byte transfer, and typed primitives built on top of it. Typed values are
//! little-endian, like every other on-disk structure in the store; strings
//! are a `u16` byte length followed by UTF-8.
//!
//! Implementations:
//! - [`RandomAccessFile`]: a file on disk
//! - [`MemoryIo`]: a growable in-memory buffer
//! - [`IgnoreClose`]: a borrowed handle whose `close` does nothing, so a
//!   handle can be lent to a consumer without giving up ownership
//!
//! [`PositionalIo`] extends the contract with cursor-free access through a
//! shared reference, for handles that several writers fill at disjoint
//! offsets. File handles use unix positional reads and writes (`pread` and
//! `pwrite` through [`FileExt`]), so the crate targets unix platforms.

use filestore_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Uniform random-access I/O
pub trait RandomAccessIo: Send {
    /// Move the cursor to an absolute position
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Current cursor position
    fn position(&self) -> u64;

    /// Current length in bytes
    fn length(&self) -> Result<u64>;

    /// Truncate or zero-extend. The cursor is clamped to the new length.
    fn set_length(&mut self, len: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes at the cursor, returning 0 at the end
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at the cursor, extending the length if needed
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush written data to stable storage
    fn sync(&mut self) -> Result<()>;

    /// Release the handle. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Fill `buf` completely or fail with `UnexpectedEof`
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("needed {} bytes, got {filled}", buf.len()),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Seek then [`read_fully`](Self::read_fully)
    fn read_fully_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(pos)?;
        self.read_fully(buf)
    }

    /// Seek then [`write_bytes`](Self::write_bytes)
    fn write_bytes_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.seek(pos)?;
        self.write_bytes(buf)
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_fully(&mut b)?;
        Ok(b[0])
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes([self.read_u8()?]))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_fully(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()?.cast_signed())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_fully(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()?.cast_signed())
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_fully(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()?.cast_signed())
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()?;
        let mut buf = vec![0u8; usize::from(len)];
        self.read_fully(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::storage(format!("invalid UTF-8 string: {e}")))
    }

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(u8::from(v))
    }

    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    fn write_i8(&mut self, v: i8) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_u32(v.to_bits())
    }

    fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_u64(v.to_bits())
    }

    fn write_utf(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| Error::invalid_argument(format!("string of {} bytes too long", s.len())))?;
        self.write_u16(len)?;
        self.write_bytes(s.as_bytes())
    }
}

impl<T: RandomAccessIo + ?Sized> RandomAccessIo for Box<T> {
    fn seek(&mut self, pos: u64) -> Result<()> {
        (**self).seek(pos)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn length(&self) -> Result<u64> {
        (**self).length()
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        (**self).set_length(len)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_some(buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_bytes(buf)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Cursor-free access through a shared reference
///
/// Callers coordinate which ranges they touch; the handle itself does not
/// order concurrent writes to overlapping ranges.
pub trait PositionalIo: RandomAccessIo + Sync {
    /// Read exactly `buf.len()` bytes at `pos`
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `pos`, extending the length if needed
    fn write_all_at(&self, pos: u64, buf: &[u8]) -> Result<()>;

    /// Truncate or zero-extend without touching any cursor
    fn resize(&self, len: u64) -> Result<()>;

    /// Flush written data to stable storage
    fn sync_shared(&self) -> Result<()>;
}

/// How to open a [`RandomAccessFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    /// Read and write, creating the file if missing
    ReadWrite,
}

/// A file on disk behind the [`RandomAccessIo`] contract
#[derive(Debug)]
pub struct RandomAccessFile {
    file: Option<File>,
    path: PathBuf,
    pos: u64,
    mode: AccessMode,
}

impl RandomAccessFile {
    /// Open a file, creating it in [`AccessMode::ReadWrite`]
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == AccessMode::ReadWrite {
            options.write(true).create(true).truncate(false);
        }
        let file = options.open(path)?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            pos: 0,
            mode,
        })
    }

    /// Create or truncate a file for writing
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            pos: 0,
            mode: AccessMode::ReadWrite,
        })
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open file, for APIs that need it directly (memory mapping)
    pub fn as_file(&self) -> Result<&File> {
        self.file()
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::Closed(self.path.display().to_string()))
    }

    fn writable_file(&self) -> Result<&File> {
        if self.mode == AccessMode::Read {
            return Err(Error::storage(format!(
                "{} is open read-only",
                self.path.display()
            )));
        }
        self.file()
    }
}

impl RandomAccessIo for RandomAccessFile {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.file()?;
        self.pos = pos;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        self.writable_file()?.set_len(len)?;
        self.pos = self.pos.min(len);
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = loop {
            match self.file()?.read_at(buf, self.pos) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        self.pos += n as u64;
        Ok(n)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.writable_file()?.write_all_at(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file()?.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl PositionalIo for RandomAccessFile {
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.file()?.read_exact_at(buf, pos)?;
        Ok(())
    }

    fn write_all_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        self.writable_file()?.write_all_at(buf, pos)?;
        Ok(())
    }

    fn resize(&self, len: u64) -> Result<()> {
        self.writable_file()?.set_len(len)?;
        Ok(())
    }

    fn sync_shared(&self) -> Result<()> {
        self.file()?.sync_data()?;
        Ok(())
    }
}

/// An in-memory [`RandomAccessIo`]
#[derive(Debug, Default, Clone)]
pub struct MemoryIo {
    data: Vec<u8>,
    pos: u64,
    closed: bool,
}

impl MemoryIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            closed: false,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("memory buffer".into()));
        }
        Ok(())
    }

    fn offset(pos: u64) -> Result<usize> {
        usize::try_from(pos).map_err(|_| Error::invalid_argument(format!("offset {pos} too large")))
    }
}

impl RandomAccessIo for MemoryIo {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.check_open()?;
        self.pos = pos;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.data.len() as u64)
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        self.check_open()?;
        self.data.resize(Self::offset(len)?, 0);
        self.pos = self.pos.min(len);
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let start = Self::offset(self.pos)?.min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        let start = Self::offset(self.pos)?;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A borrowed handle whose `close` is a no-op.
///
/// The lender keeps ownership and stays responsible for closing the
/// underlying handle; everything else is forwarded.
pub struct IgnoreClose<'a, T: RandomAccessIo + ?Sized> {
    inner: &'a mut T,
}

impl<'a, T: RandomAccessIo + ?Sized> IgnoreClose<'a, T> {
    pub const fn new(inner: &'a mut T) -> Self {
        Self { inner }
    }
}

impl<T: RandomAccessIo + ?Sized> RandomAccessIo for IgnoreClose<'_, T> {
    fn seek(&mut self, pos: u64) -> Result<()> {
        self.inner.seek(pos)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn length(&self) -> Result<u64> {
        self.inner.length()
    }

    fn set_length(&mut self, len: u64) -> Result<()> {
        self.inner.set_length(len)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_some(buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_bytes(buf)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_primitives(io: &mut dyn RandomAccessIo) {
        io.write_bool(true).unwrap();
        io.write_i8(-5).unwrap();
        io.write_u16(0xBEEF).unwrap();
        io.write_i32(-123_456).unwrap();
        io.write_u64(u64::MAX - 1).unwrap();
        io.write_f32(1.5).unwrap();
        io.write_f64(-2.25).unwrap();
        io.write_utf("kplr/flux").unwrap();
    }

    fn check_primitives(io: &mut dyn RandomAccessIo) {
        io.seek(0).unwrap();
        assert!(io.read_bool().unwrap());
        assert_eq!(io.read_i8().unwrap(), -5);
        assert_eq!(io.read_u16().unwrap(), 0xBEEF);
        assert_eq!(io.read_i32().unwrap(), -123_456);
        assert_eq!(io.read_u64().unwrap(), u64::MAX - 1);
        assert!((io.read_f32().unwrap() - 1.5).abs() < f32::EPSILON);
        assert!((io.read_f64().unwrap() + 2.25).abs() < f64::EPSILON);
        assert_eq!(io.read_utf().unwrap(), "kplr/flux");
        assert!(matches!(io.read_u8(), Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_file_primitives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut file = RandomAccessFile::create(&path).unwrap();
        write_primitives(&mut file);
        file.sync().unwrap();
        check_primitives(&mut file);
        file.close().unwrap();

        let mut reopened = RandomAccessFile::open(&path, AccessMode::Read).unwrap();
        check_primitives(&mut reopened);
        assert!(reopened.write_u8(1).is_err());
    }

    #[test]
    fn test_memory_primitives() {
        let mut mem = MemoryIo::new();
        write_primitives(&mut mem);
        check_primitives(&mut mem);
    }

    #[test]
    fn test_set_length() {
        let dir = tempdir().unwrap();
        let mut file = RandomAccessFile::create(dir.path().join("len.bin")).unwrap();
        file.write_bytes(&[7u8; 100]).unwrap();
        file.set_length(10).unwrap();
        assert_eq!(file.length().unwrap(), 10);
        assert_eq!(file.position(), 10);

        file.set_length(20).unwrap();
        let mut buf = [1u8; 20];
        file.read_fully_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[7u8; 10]);
        assert_eq!(&buf[10..], &[0u8; 10]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut file = RandomAccessFile::create(dir.path().join("c.bin")).unwrap();
        file.close().unwrap();
        file.close().unwrap();
        assert!(file.is_closed());
        assert!(matches!(file.write_u8(1), Err(Error::Closed(_))));
    }

    #[test]
    fn test_ignore_close_keeps_handle_open() {
        let mut mem = MemoryIo::new();
        {
            let mut borrowed = IgnoreClose::new(&mut mem);
            borrowed.write_utf("lent").unwrap();
            borrowed.close().unwrap();
            assert!(!borrowed.is_closed());
        }
        assert!(!mem.is_closed());
        mem.seek(0).unwrap();
        assert_eq!(mem.read_utf().unwrap(), "lent");
    }

    #[test]
    fn test_positional_writes_from_threads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        let file = std::sync::Arc::new(RandomAccessFile::create(&path).unwrap());
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let file = std::sync::Arc::clone(&file);
                std::thread::spawn(move || {
                    file.write_all_at(u64::from(t) * 100, &[t + 1; 100]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        file.sync_shared().unwrap();
        assert_eq!(file.length().unwrap(), 400);

        let mut buf = [0u8; 100];
        for t in 0..4u8 {
            file.read_exact_at(u64::from(t) * 100, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == t + 1));
        }
        file.resize(150).unwrap();
        assert_eq!(file.length().unwrap(), 150);
        assert_eq!(file.position(), 0);
    }

    #[test]
    fn test_boxed_dyn_handle() {
        let mut boxed: Box<dyn RandomAccessIo> = Box::new(MemoryIo::new());
        boxed.write_u32(42).unwrap();
        boxed.seek(0).unwrap();
        assert_eq!(boxed.read_u32().unwrap(), 42);
    }
}
