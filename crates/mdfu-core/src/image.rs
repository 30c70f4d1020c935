//! Firmware image sources.

use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;

use tracing::debug;

/// Stream of firmware image bytes consumed by the update workflow.
///
/// A call fills the whole buffer unless the image is exhausted; a short or
/// zero read signals the end of the image.
pub trait ImageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Image reader over a file on disk.
pub struct FileImageReader {
    file: File,
}

impl FileImageReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        debug!(path = %path.as_ref().display(), "opening firmware image");
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// Total image size in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl ImageReader for FileImageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Plain File::read may return short before EOF; keep filling so a
        // short read reliably means end of image.
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// Image reader over an in-memory byte buffer.
pub struct MemoryImageReader {
    data: Vec<u8>,
    position: usize,
}

impl MemoryImageReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

impl ImageReader for MemoryImageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_reader_yields_chunks_then_eof() {
        let mut reader = MemoryImageReader::new(vec![0x00, 0x01, 0x02, 0x03, 0x04]);
        let mut buf = [0u8; 2];

        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x00, 0x01]);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x02, 0x03]);
        // Final short read carries the tail.
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x04);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn file_reader_reads_whole_chunks() {
        let path = std::env::temp_dir().join("mdfu-image-reader-test.bin");
        std::fs::write(&path, [0x11u8; 300]).unwrap();

        let mut reader = FileImageReader::open(&path).unwrap();
        assert_eq!(reader.len().unwrap(), 300);

        let mut buf = [0u8; 128];
        assert_eq!(reader.read(&mut buf).unwrap(), 128);
        assert_eq!(reader.read(&mut buf).unwrap(), 128);
        assert_eq!(reader.read(&mut buf).unwrap(), 44);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        std::fs::remove_file(&path).ok();
    }
}
