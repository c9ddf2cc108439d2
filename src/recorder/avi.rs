//! Motion-JPEG AVI segment writer
//!
//! Writes a RIFF/AVI 1.0 file with a single `MJPG` video stream. The header is
//! written up front with zeroed counters; `finish` appends the `idx1` index
//! and patches sizes and frame counts in place.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

/// Size of everything before the first `00dc` chunk
pub const HEADER_LEN: u64 = 224;

const RIFF_SIZE_OFFSET: u64 = 4;
const AVIH_TOTAL_FRAMES_OFFSET: u64 = 48;
const AVIH_BUFFER_SIZE_OFFSET: u64 = 60;
const STRH_LENGTH_OFFSET: u64 = 140;
const STRH_BUFFER_SIZE_OFFSET: u64 = 144;
const MOVI_SIZE_OFFSET: u64 = 216;
/// Position of the `movi` fourcc; `idx1` offsets are relative to it
const MOVI_FOURCC_OFFSET: u64 = 220;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

pub struct AviWriter {
    file: BufWriter<File>,
    path: PathBuf,
    /// (offset from `movi`, payload size) per chunk
    index: Vec<(u32, u32)>,
    /// Bytes written after the `movi` fourcc
    movi_len: u64,
    max_chunk: u32,
    finished: bool,
}

impl AviWriter {
    pub fn create(path: impl AsRef<Path>, width: u32, height: u32, fps: f64) -> io::Result<Self> {
        if width == 0 || height == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid frame size {width}x{height}"),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(&header(width, height, fps))?;
        debug!(path = %path.display(), width, height, fps, "Segment opened");
        Ok(Self {
            file,
            path,
            index: Vec::new(),
            movi_len: 0,
            max_chunk: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.index.len() as u64
    }

    /// Append one JPEG-encoded frame
    pub fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        let size = u32::try_from(jpeg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame larger than 4 GiB"))?;
        let offset = u32::try_from(self.movi_len + 4)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "segment exceeds AVI 1.0 size"))?;

        self.file.write_all(b"00dc")?;
        self.file.write_all(&size.to_le_bytes())?;
        self.file.write_all(jpeg)?;
        let mut written = 8 + jpeg.len() as u64;
        if jpeg.len() % 2 == 1 {
            self.file.write_all(&[0])?;
            written += 1;
        }

        self.index.push((offset, size));
        self.movi_len += written;
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    /// Write the index and patch the header. Idempotent.
    pub fn finish(&mut self) -> io::Result<u64> {
        if self.finished {
            return Ok(self.frames());
        }
        self.finished = true;

        let mut idx = BytesMut::with_capacity(8 + self.index.len() * 16);
        idx.put_slice(b"idx1");
        idx.put_u32_le((self.index.len() * 16) as u32);
        for &(offset, size) in &self.index {
            idx.put_slice(b"00dc");
            idx.put_u32_le(AVIIF_KEYFRAME);
            idx.put_u32_le(offset);
            idx.put_u32_le(size);
        }
        self.file.write_all(&idx)?;

        let total = HEADER_LEN + self.movi_len + idx.len() as u64;
        let frames = self.index.len() as u32;
        let buffer = self.max_chunk + 8;
        self.patch(RIFF_SIZE_OFFSET, (total - 8) as u32)?;
        self.patch(AVIH_TOTAL_FRAMES_OFFSET, frames)?;
        self.patch(AVIH_BUFFER_SIZE_OFFSET, buffer)?;
        self.patch(STRH_LENGTH_OFFSET, frames)?;
        self.patch(STRH_BUFFER_SIZE_OFFSET, buffer)?;
        self.patch(MOVI_SIZE_OFFSET, (self.movi_len + 4) as u32)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;

        debug!(path = %self.path.display(), frames, "Segment closed");
        Ok(frames as u64)
    }

    fn patch(&mut self, at: u64, value: u32) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(&value.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

impl Drop for AviWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "Failed to finalize segment");
        }
    }
}

fn header(width: u32, height: u32, fps: f64) -> BytesMut {
    let fps = if fps > 0.0 { fps } else { 1.0 };
    let mut h = BytesMut::with_capacity(HEADER_LEN as usize);

    h.put_slice(b"RIFF");
    h.put_u32_le(0); // patched
    h.put_slice(b"AVI ");

    h.put_slice(b"LIST");
    h.put_u32_le(192);
    h.put_slice(b"hdrl");

    h.put_slice(b"avih");
    h.put_u32_le(56);
    h.put_u32_le((1_000_000.0 / fps).round() as u32);
    h.put_u32_le(0); // max bytes per second
    h.put_u32_le(0); // padding granularity
    h.put_u32_le(AVIF_HASINDEX);
    h.put_u32_le(0); // total frames, patched
    h.put_u32_le(0); // initial frames
    h.put_u32_le(1); // streams
    h.put_u32_le(0); // suggested buffer, patched
    h.put_u32_le(width);
    h.put_u32_le(height);
    h.put_bytes(0, 16);

    h.put_slice(b"LIST");
    h.put_u32_le(116);
    h.put_slice(b"strl");

    h.put_slice(b"strh");
    h.put_u32_le(56);
    h.put_slice(b"vids");
    h.put_slice(b"MJPG");
    h.put_u32_le(0); // flags
    h.put_u16_le(0); // priority
    h.put_u16_le(0); // language
    h.put_u32_le(0); // initial frames
    h.put_u32_le(1000); // scale
    h.put_u32_le((fps * 1000.0).round() as u32); // rate
    h.put_u32_le(0); // start
    h.put_u32_le(0); // length, patched
    h.put_u32_le(0); // suggested buffer, patched
    h.put_u32_le(u32::MAX); // quality: driver default
    h.put_u32_le(0); // sample size
    h.put_i16_le(0);
    h.put_i16_le(0);
    h.put_i16_le(width.min(i16::MAX as u32) as i16);
    h.put_i16_le(height.min(i16::MAX as u32) as i16);

    h.put_slice(b"strf");
    h.put_u32_le(40);
    h.put_u32_le(40);
    h.put_i32_le(width as i32);
    h.put_i32_le(height as i32);
    h.put_u16_le(1); // planes
    h.put_u16_le(24); // bit count
    h.put_slice(b"MJPG");
    h.put_u32_le(width * height * 3);
    h.put_bytes(0, 16);

    h.put_slice(b"LIST");
    h.put_u32_le(4); // patched
    h.put_slice(b"movi");

    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{encode_jpeg, test_frame};

    fn u32_at(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    #[test]
    fn test_header_layout() {
        let h = header(640, 480, 20.0);
        assert_eq!(h.len() as u64, HEADER_LEN);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[8..12], b"AVI ");
        assert_eq!(&h[112..116], b"MJPG");
        assert_eq!(u32_at(&h, 32), 50_000);
        assert_eq!(u32_at(&h, 64), 640);
        assert_eq!(u32_at(&h, 132), 20_000);
        assert_eq!(&h[MOVI_FOURCC_OFFSET as usize..][..4], b"movi");
    }

    #[test]
    fn test_finished_file_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.avi");
        let jpegs: Vec<_> = (1..=3)
            .map(|seq| encode_jpeg(&test_frame(seq, 32, 24).image, 80).unwrap())
            .collect();

        let mut writer = AviWriter::create(&path, 32, 24, 20.0).unwrap();
        for jpeg in &jpegs {
            writer.write_frame(jpeg).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);
        // second finish is a no-op
        assert_eq!(writer.finish().unwrap(), 3);
        drop(writer);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(u32_at(&data, 4) as usize, data.len() - 8);
        assert_eq!(u32_at(&data, AVIH_TOTAL_FRAMES_OFFSET as usize), 3);
        assert_eq!(u32_at(&data, STRH_LENGTH_OFFSET as usize), 3);

        let movi_size = u32_at(&data, MOVI_SIZE_OFFSET as usize) as usize;
        let idx_at = MOVI_FOURCC_OFFSET as usize + movi_size;
        assert_eq!(&data[idx_at..idx_at + 4], b"idx1");
        assert_eq!(u32_at(&data, idx_at + 4), 3 * 16);

        // every index entry points at a decodable chunk
        for (i, jpeg) in jpegs.iter().enumerate() {
            let entry = idx_at + 8 + i * 16;
            let chunk = MOVI_FOURCC_OFFSET as usize + u32_at(&data, entry + 8) as usize;
            assert_eq!(&data[chunk..chunk + 4], b"00dc");
            let size = u32_at(&data, chunk + 4) as usize;
            assert_eq!(size, jpeg.len());
            let decoded = image::load_from_memory(&data[chunk + 8..chunk + 8 + size]).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (32, 24));
        }
    }

    #[test]
    fn test_drop_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.avi");
        {
            let mut writer = AviWriter::create(&path, 8, 8, 10.0).unwrap();
            writer.write_frame(&[0xFF, 0xD8, 0xFF]).unwrap();
        }
        let data = std::fs::read(&path).unwrap();
        // odd payload padded to an even boundary
        assert_eq!(data.len() as u64, HEADER_LEN + 8 + 4 + 8 + 16);
        assert_eq!(u32_at(&data, AVIH_TOTAL_FRAMES_OFFSET as usize), 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.avi");
        let err = AviWriter::create(&path, 0, 480, 20.0).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!path.exists());
    }
}
