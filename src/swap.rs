//! Disk overflow target for record stores.
//!
//! A `SwapFile` is a growable byte region addressed by absolute offset,
//! backed by a memory-mapped window. The file is sized to the next multiple
//! of the window; accesses outside the mapped window flush dirty pages and
//! remap, and accesses crossing a window boundary split into two copies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::Result;

pub struct SwapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
    window: u64,
    start: u64,
    end: u64,
}

impl SwapFile {
    /// Create (or truncate up) a swap file covering at least `size` bytes,
    /// mapped in `window`-byte views. `window` must be a multiple of the
    /// page size.
    pub fn create(path: &Path, size: u64, window: u64) -> Result<Self> {
        let end = size.max(1).div_ceil(window) * window;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // Never shrink a file that already holds swapped data.
        let end = end.max(file.metadata()?.len().div_ceil(window) * window);
        file.set_len(end)?;

        // Safety: the mapping is private to this struct and the file stays
        // open for its lifetime.
        let map = unsafe { MmapOptions::new().len(window as usize).map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            window,
            start: 0,
            end,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the addressable region.
    pub fn len(&self) -> u64 {
        self.end
    }

    /// Whether `len` bytes at `pos` fall inside the addressable region.
    pub fn probe(&self, pos: u64, len: u64) -> bool {
        pos.checked_add(len).is_some_and(|e| e <= self.end)
    }

    /// Copy `data` to absolute offset `pos`.
    pub fn write(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.access(pos, data.len() as u64, |map, map_off, buf_off, n| {
            map[map_off..map_off + n].copy_from_slice(&data[buf_off..buf_off + n]);
        })
    }

    /// Fill `buf` from absolute offset `pos`. Returns false without touching
    /// `buf` when the range falls outside the region.
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<bool> {
        if !self.probe(pos, buf.len() as u64) {
            return Ok(false);
        }
        self.access(pos, buf.len() as u64, |map, map_off, buf_off, n| {
            buf[buf_off..buf_off + n].copy_from_slice(&map[map_off..map_off + n]);
        })?;
        Ok(true)
    }

    /// Flush the current window to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Run `op` over the mapped window(s) covering `[pos, pos + len)`,
    /// remapping as needed. `op(map, map_offset, buf_offset, n)`.
    fn access<F>(&mut self, mut pos: u64, len: u64, mut op: F) -> Result<()>
    where
        F: FnMut(&mut [u8], usize, usize, usize),
    {
        if !self.probe(pos, len) {
            return Err(crate::error::Error::Io(format!(
                "swap access [{}, {}) beyond region end {}",
                pos,
                pos + len,
                self.end
            )));
        }

        let mut done = 0u64;
        while done < len {
            if pos < self.start || pos >= self.start + self.window {
                self.remap(pos / self.window * self.window)?;
            }
            let map_off = (pos - self.start) as usize;
            let n = ((len - done).min(self.start + self.window - pos)) as usize;
            op(&mut self.map, map_off, done as usize, n);
            pos += n as u64;
            done += n as u64;
        }
        Ok(())
    }

    fn remap(&mut self, start: u64) -> Result<()> {
        self.map.flush()?;
        // Safety: same mapping discipline as in `create`.
        self.map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(self.window as usize)
                .map_mut(&self.file)?
        };
        self.start = start;
        Ok(())
    }
}

impl std::fmt::Debug for SwapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapFile")
            .field("path", &self.path)
            .field("window", &self.window)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WINDOW: u64 = 4096;

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut swap = SwapFile::create(&dir.path().join("swap.dat"), 10_000, WINDOW).unwrap();
        assert_eq!(swap.len(), 3 * WINDOW);

        let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        swap.write(100, &data).unwrap();

        let mut out = vec![0u8; 512];
        assert!(swap.read(100, &mut out).unwrap());
        assert_eq!(out, data);
    }

    #[test]
    fn test_window_crossing_access() {
        let dir = TempDir::new().unwrap();
        let mut swap = SwapFile::create(&dir.path().join("swap.dat"), 3 * WINDOW, WINDOW).unwrap();

        // Straddle the boundary between window 0 and window 1.
        let data: Vec<u8> = (0..1000).map(|i| (i % 97) as u8).collect();
        let pos = WINDOW - 300;
        swap.write(pos, &data).unwrap();

        let mut out = vec![0u8; 1000];
        assert!(swap.read(pos, &mut out).unwrap());
        assert_eq!(out, data);

        // A later read far away remaps, then the original range still holds.
        swap.write(2 * WINDOW + 8, b"far").unwrap();
        assert!(swap.read(pos, &mut out).unwrap());
        assert_eq!(out, data);
    }

    #[test]
    fn test_probe_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut swap = SwapFile::create(&dir.path().join("swap.dat"), WINDOW, WINDOW).unwrap();

        assert!(swap.probe(0, WINDOW));
        assert!(!swap.probe(1, WINDOW));

        let mut buf = vec![0u8; 16];
        assert!(!swap.read(WINDOW - 8, &mut buf).unwrap());
        assert!(swap.write(WINDOW - 8, &buf).is_err());
    }
}
