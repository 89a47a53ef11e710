//! ROM image file helpers: trailing padding trim and exact-size fitting.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Value of an erased (or never programmed) flash cell.
pub const ERASED_BYTE: u8 = 0xff;

const TRIM_BLOCK_SIZE: usize = 4096;

/// Length of `image` once trailing `0xFF` bytes are dropped.
///
/// Scans backwards in fixed blocks so huge dumps are never loaded whole.
pub fn trimmed_len<R: Read + Seek>(image: &mut R) -> io::Result<u64> {
    let mut pos = image.seek(SeekFrom::End(0))?;
    let mut block = [0u8; TRIM_BLOCK_SIZE];

    while pos > 0 {
        let start = pos.saturating_sub(TRIM_BLOCK_SIZE as u64);
        let len = (pos - start) as usize;
        image.seek(SeekFrom::Start(start))?;
        image.read_exact(&mut block[..len])?;

        if let Some(i) = block[..len].iter().rposition(|&b| b != ERASED_BYTE) {
            return Ok(start + i as u64 + 1);
        }
        pos = start;
    }
    Ok(0)
}

/// Truncates the file at `path` after its last non-`0xFF` byte.
///
/// Opens the file afresh, so it must be called after the writer was flushed
/// and closed. Returns the new length.
pub fn trim_file<P: AsRef<Path>>(path: P) -> io::Result<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let original = file.metadata()?.len();
    let len = trimmed_len(&mut file)?;
    if len < original {
        file.set_len(len)?;
        file.sync_all()?;
    }
    Ok(len)
}

/// Pads with `0xFF` or truncates so the file is exactly `len` bytes.
pub fn fit_to_len(file: &mut File, len: u64) -> io::Result<()> {
    let current = file.seek(SeekFrom::End(0))?;
    if current < len {
        let mut missing = len - current;
        let pad = [ERASED_BYTE; TRIM_BLOCK_SIZE];
        while missing > 0 {
            let n = missing.min(pad.len() as u64) as usize;
            file.write_all(&pad[..n])?;
            missing -= n as u64;
        }
    } else if current > len {
        file.set_len(len)?;
        file.seek(SeekFrom::Start(len))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("mdflasher_image_{tag}_{stamp}.bin"))
    }

    #[test]
    fn all_erased_trims_to_zero() {
        let mut image = Cursor::new(vec![0xff; 10_000]);
        assert_eq!(trimmed_len(&mut image).unwrap(), 0);
    }

    #[test]
    fn empty_image_stays_empty() {
        let mut image = Cursor::new(Vec::new());
        assert_eq!(trimmed_len(&mut image).unwrap(), 0);
    }

    #[test]
    fn non_erased_last_byte_is_unchanged() {
        let mut data = vec![0xff; 9000];
        data[8999] = 0x00;
        let mut image = Cursor::new(data);
        assert_eq!(trimmed_len(&mut image).unwrap(), 9000);
    }

    #[test]
    fn padding_across_block_boundary() {
        let mut data = vec![0u8; 5000];
        data.extend(std::iter::repeat_n(0xff, 3 * TRIM_BLOCK_SIZE + 17));
        let mut image = Cursor::new(data);
        assert_eq!(trimmed_len(&mut image).unwrap(), 5000);
    }

    #[test]
    fn trim_file_is_idempotent() {
        let path = temp_path("idem");
        let mut data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        data[2999] = 0x12;
        data.extend([0xff; 6000]);
        std::fs::write(&path, &data).unwrap();

        let first = trim_file(&path).unwrap();
        let second = trim_file(&path).unwrap();
        assert_eq!(first, 3000);
        assert_eq!(second, first);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3000);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn fit_pads_and_truncates() {
        let path = temp_path("fit");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        fit_to_len(&mut file, 6000).unwrap();
        drop(file);
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 6000);
        assert_eq!(&data[..3], &[1, 2, 3]);
        assert!(data[3..].iter().all(|&b| b == 0xff));

        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        fit_to_len(&mut file, 2).unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2]);
        std::fs::remove_file(&path).unwrap();
    }
}
