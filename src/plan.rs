//! Splitting an archive into fixed-size multipart byte ranges

use crate::error::UploadError;

/// One part of a multipart upload: `[start, start + length)` of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub length: u32,
}

impl ChunkDescriptor {
    /// Inclusive end offset. Only meaningful for non-empty chunks, which is all of them.
    pub fn last_byte(&self) -> u64 {
        self.start + u64::from(self.length) - 1
    }

    /// `Content-Range` value as the archive service expects it.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.last_byte())
    }
}

/// Plan the chunks covering `[0, file_size)`.
///
/// Every chunk except possibly the last is exactly `part_size` long; an empty
/// file yields no chunks.
pub fn plan(file_size: u64, part_size: u32) -> Result<Vec<ChunkDescriptor>, UploadError> {
    if part_size == 0 {
        return Err(UploadError::InvalidConfig("part size must be positive".into()));
    }
    let part = u64::from(part_size);
    let count = file_size.div_ceil(part);
    let count = u32::try_from(count).map_err(|_| {
        UploadError::InvalidConfig(format!(
            "{file_size} bytes needs {count} parts of {part_size} bytes"
        ))
    })?;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let length = part.min(file_size - start) as u32;
        chunks.push(ChunkDescriptor {
            index,
            start,
            length,
        });
        start += u64::from(length);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u32 = 1024 * 1024;

    fn assert_partition(file_size: u64, part_size: u32) {
        let chunks = plan(file_size, part_size).unwrap();
        let mut next = 0u64;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
            assert_eq!(c.start, next, "gap or overlap at chunk {i}");
            assert!(c.length > 0 && c.length <= part_size);
            if i + 1 < chunks.len() {
                assert_eq!(c.length, part_size);
            }
            next += u64::from(c.length);
        }
        assert_eq!(next, file_size);
        assert_eq!(chunks.len() as u64, file_size.div_ceil(u64::from(part_size)));
    }

    #[test]
    fn partitions_cover_file_exactly() {
        for &(size, part) in &[
            (1u64, 1u32),
            (7, 3),
            (9, 3),
            (10, 3),
            (u64::from(MIB) * 5 + 17, MIB),
            (u64::from(MIB) * 1024 * 6, 128 * MIB),
        ] {
            assert_partition(size, part);
        }
    }

    #[test]
    fn empty_file_has_no_chunks() {
        assert!(plan(0, MIB).unwrap().is_empty());
    }

    #[test]
    fn exact_multiple_keeps_full_last_chunk() {
        let chunks = plan(3 * u64::from(MIB), MIB).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.length == MIB));
        assert_eq!(chunks[2].start, 2 * u64::from(MIB));
    }

    #[test]
    fn remainder_goes_to_last_chunk() {
        let chunks = plan(10, 4).unwrap();
        assert_eq!(chunks.iter().map(|c| c.length).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(chunks[2].content_range(), "bytes 8-9/*");
    }

    #[test]
    fn zero_part_size_is_rejected() {
        assert!(matches!(plan(10, 0), Err(UploadError::InvalidConfig(_))));
    }
}
