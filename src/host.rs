use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

// Zero-fill is chunked so that growing the file by many clusters does not
// degenerate into one syscall per cluster.
const ZERO_FILL_BLOCK: usize = 64 * 1024;

/// Thin seek/read/write/flush wrapper over the backing file.
///
/// All offsets are absolute byte positions; callers are responsible for
/// translating cluster indices.
pub(crate) struct HostFile {
    file: File,
}

impl HostFile {
    /// Creates the backing file, truncating any existing content.
    pub(crate) fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        Ok(HostFile { file })
    }

    /// Opens an existing backing file for read/write access.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(HostFile { file })
    }

    pub(crate) fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub(crate) fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    pub(crate) fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    /// Writes zeros from `from` until the file reaches `to`, then flushes.
    pub(crate) fn zero_extend(&mut self, from: u64, to: u64) -> io::Result<()> {
        debug_assert!(from <= to);
        self.file.seek(SeekFrom::Start(from))?;
        let block = [0_u8; ZERO_FILL_BLOCK];
        let mut remaining = to - from;
        while remaining >= ZERO_FILL_BLOCK as u64 {
            self.file.write_all(&block)?;
            remaining -= ZERO_FILL_BLOCK as u64;
        }
        if remaining > 0 {
            self.file.write_all(&block[..remaining as usize])?;
        }
        self.file.flush()
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

pub(crate) trait ReadLeExt {
    fn read_u32_le(&mut self) -> io::Result<u32>;
}

impl<T: Read> ReadLeExt for T {
    fn read_u32_le(&mut self) -> io::Result<u32> {
        let mut buf = [0_u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

pub(crate) trait WriteLeExt {
    fn write_u32_le(&mut self, n: u32) -> io::Result<()>;
}

impl<T: Write> WriteLeExt for T {
    fn write_u32_le(&mut self, n: u32) -> io::Result<()> {
        self.write_all(&n.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extend_grows_to_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let mut host = HostFile::create(&path).unwrap();
        host.write_all_at(0, &[0xAA; 128]).unwrap();
        host.zero_extend(128, 200_000).unwrap();
        assert_eq!(host.size().unwrap(), 200_000);
        let mut probe = [0xFF_u8; 16];
        host.read_exact_at(199_984, &mut probe).unwrap();
        assert_eq!(probe, [0; 16]);
        let mut head = [0_u8; 4];
        host.read_exact_at(0, &mut head).unwrap();
        assert_eq!(head, [0xAA; 4]);
    }

    #[test]
    fn le_ext_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32_le(0xDEAD_BEEF).unwrap();
        assert_eq!(buf, [0xEF, 0xBE, 0xAD, 0xDE]);
        let mut rdr = io::Cursor::new(buf);
        assert_eq!(rdr.read_u32_le().unwrap(), 0xDEAD_BEEF);
    }
}
