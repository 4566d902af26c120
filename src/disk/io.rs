use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

const COPY_CHUNK: usize = 64 * 1024;

/// A bounded byte window `[start, start + len)` inside an image file.
pub struct PartitionIo {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl PartitionIo {
    pub fn new(file: File, start: u64, len: u64) -> Self {
        Self {
            file,
            start,
            len,
            pos: 0,
        }
    }

    /// Open `image` read-write and window it.
    pub fn open(image: &Path, start: u64, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(image)?;
        let total = file.metadata()?.len();
        let end = start
            .checked_add(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "window overflows"))?;
        if end > total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("window {start}..{end} is beyond image end {total}"),
            ));
        }
        Ok(Self::new(file, start, len))
    }

    fn clamp_pos(&self, pos: i128) -> io::Result<u64> {
        if pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid seek"));
        }
        let pos = pos as u64;
        if pos > self.len {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"));
        }
        Ok(pos)
    }
}

impl Read for PartitionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remain = self.len - self.pos;
        let to_read = remain.min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for PartitionIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.len {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "no space"));
        }
        let remain = self.len - self.pos;
        let to_write = remain.min(buf.len() as u64) as usize;
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.write(&buf[..to_write])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PartitionIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => self.clamp_pos(off as i128)?,
            SeekFrom::End(off) => self.clamp_pos(self.len as i128 + off as i128)?,
            SeekFrom::Current(off) => self.clamp_pos(self.pos as i128 + off as i128)?,
        };
        self.pos = new_pos;
        Ok(self.pos)
    }
}

/// Copy everything from `src` into `dst`, seeking over all-zero chunks so
/// holes in a freshly allocated image stay holes. Returns bytes consumed.
pub fn sparse_copy<R: Read, W: Write + Seek>(src: &mut R, dst: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if chunk.iter().all(|b| *b == 0) {
            dst.seek(SeekFrom::Current(n as i64))?;
        } else {
            dst.write_all(chunk)?;
        }
        total += n as u64;
    }
    dst.flush()?;
    Ok(total)
}

fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write `bytes` at absolute `offset` in `image`.
pub fn write_at(image: &Path, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut window = PartitionIo::open(image, offset, bytes.len() as u64)?;
    window.write_all(bytes)?;
    window.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn image(len: u64) -> NamedTempFile {
        let f = NamedTempFile::new().unwrap();
        f.as_file().set_len(len).unwrap();
        f
    }

    #[test]
    fn window_is_bounded() {
        let img = image(1024);
        let mut w = PartitionIo::open(img.path(), 512, 16).unwrap();
        w.write_all(&[0xAB; 16]).unwrap();
        assert!(w.write_all(&[1]).is_err());
        assert!(w.seek(SeekFrom::Start(17)).is_err());

        let data = std::fs::read(img.path()).unwrap();
        assert!(data[..512].iter().all(|b| *b == 0));
        assert!(data[512..528].iter().all(|b| *b == 0xAB));
        assert!(data[528..].iter().all(|b| *b == 0));
    }

    #[test]
    fn open_rejects_window_past_end() {
        let img = image(1024);
        assert!(PartitionIo::open(img.path(), 1000, 100).is_err());
    }

    #[test]
    fn sparse_copy_preserves_content() {
        let img = image(4 * COPY_CHUNK as u64);
        let mut src = vec![0u8; 2 * COPY_CHUNK + 10];
        src[COPY_CHUNK + 5] = 7;
        src[2 * COPY_CHUNK + 9] = 9;

        let mut w = PartitionIo::open(img.path(), 100, 3 * COPY_CHUNK as u64).unwrap();
        let copied = sparse_copy(&mut src.as_slice(), &mut w).unwrap();
        assert_eq!(copied, src.len() as u64);

        let data = std::fs::read(img.path()).unwrap();
        assert_eq!(&data[100..100 + src.len()], src.as_slice());
    }

    #[test]
    fn write_at_places_bytes() {
        let img = image(64);
        write_at(img.path(), 60, &4104u32.to_le_bytes()).unwrap();
        let data = std::fs::read(img.path()).unwrap();
        assert_eq!(u32::from_le_bytes(data[60..64].try_into().unwrap()), 4104);
        assert!(write_at(img.path(), 62, &[0; 4]).is_err());
    }
}
