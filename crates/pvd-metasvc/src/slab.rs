//! Slab buffers and the entry cursor.
//!
//! Paged metadata I/O never assumes one flat allocation: a read returns an
//! ordered sequence of fixed-size slabs, and [`EntryCursor`] carries a
//! `(slab, byte offset)` position across slab boundaries so callbacks can be
//! restarted mid-scan. Entry sizes always divide the slab size, so a single
//! entry never straddles two slabs.

use pvd_error::{PvdError, Result};
use pvd_types::paged::PAGED_SLAB_BYTES;
use smallvec::SmallVec;

/// Slab list; most spans touch a handful of record blocks, so the list
/// stays inline.
pub type SlabList = SmallVec<[Vec<u8>; 4]>;

/// An ordered sequence of fixed-size slabs holding a span of the paged
/// region.
#[derive(Debug, Clone)]
pub struct SlabBuffer {
    slabs: SlabList,
    /// Offset of the span's first byte within the first slab.
    lead: usize,
    /// Total span length in bytes.
    len: usize,
}

impl SlabBuffer {
    /// Assemble a buffer from pre-cut slabs. `lead` is the span's starting
    /// offset inside the first slab; `len` is the span length.
    pub fn new(slabs: SlabList, lead: usize, len: usize) -> Result<Self> {
        let total: usize = slabs.iter().map(Vec::len).sum();
        if lead + len > total {
            return Err(PvdError::internal(format!(
                "slab buffer too small: lead={lead} len={len} total={total}"
            )));
        }
        if slabs.iter().any(|slab| slab.len() > PAGED_SLAB_BYTES) {
            return Err(PvdError::internal("slab exceeds record-block size"));
        }
        Ok(Self { slabs, lead, len })
    }

    /// Span length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the span is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of backing slabs.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Copy the whole span out as one contiguous vector (test/diagnostic
    /// helper; the update paths use [`EntryCursor`] instead).
    #[must_use]
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let mut remaining = self.len;
        let mut lead = self.lead;
        for slab in &self.slabs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(slab.len() - lead);
            out.extend_from_slice(&slab[lead..lead + take]);
            remaining -= take;
            lead = 0;
        }
        out
    }

    /// Consume a single-slab buffer, returning the slab's full byte image
    /// (including any bytes outside the span window).
    pub fn into_single_slab(mut self) -> Vec<u8> {
        debug_assert_eq!(self.slabs.len(), 1, "buffer must hold exactly one slab");
        self.slabs.swap_remove(0)
    }

    /// Cursor over `entry_size`-byte entries in the span.
    pub fn cursor(&mut self, entry_size: usize) -> EntryCursor<'_> {
        EntryCursor {
            buffer: self,
            entry_size,
            slab: 0,
            offset: 0,
            consumed: 0,
        }
    }
}

/// A restartable position over the entries of a [`SlabBuffer`].
///
/// Each call to [`EntryCursor::next_entry`] yields a mutable view of the next
/// entry, crossing slab boundaries transparently. The cursor's `(slab,
/// offset)` position survives between calls, so an interrupted scan resumes
/// where it stopped.
pub struct EntryCursor<'a> {
    buffer: &'a mut SlabBuffer,
    entry_size: usize,
    slab: usize,
    offset: usize,
    consumed: usize,
}

impl EntryCursor<'_> {
    /// Bytes per entry.
    #[must_use]
    pub const fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Entries already yielded.
    #[must_use]
    pub const fn entries_consumed(&self) -> usize {
        self.consumed / self.entry_size
    }

    /// Entries remaining.
    #[must_use]
    pub const fn entries_remaining(&self) -> usize {
        (self.buffer.len - self.consumed) / self.entry_size
    }

    /// Yield a mutable view of the next entry, or `None` at the end of the
    /// span.
    pub fn next_entry(&mut self) -> Option<&mut [u8]> {
        if self.consumed + self.entry_size > self.buffer.len {
            return None;
        }
        // First call starts at the span's lead offset.
        if self.consumed == 0 {
            self.offset = self.buffer.lead;
        }
        // Cross into the next slab when the current one is exhausted.
        while self.offset >= self.buffer.slabs[self.slab].len() {
            self.offset -= self.buffer.slabs[self.slab].len();
            self.slab += 1;
        }
        let start = self.offset;
        self.offset += self.entry_size;
        self.consumed += self.entry_size;
        Some(&mut self.buffer.slabs[self.slab][start..start + self.entry_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(slab_sizes: &[usize], lead: usize, len: usize) -> SlabBuffer {
        let slabs = slab_sizes
            .iter()
            .enumerate()
            .map(|(index, size)| vec![index as u8; *size])
            .collect();
        SlabBuffer::new(slabs, lead, len).unwrap()
    }

    #[test]
    fn test_cursor_walks_single_slab() {
        let mut buffer = buffer_with(&[16], 0, 16);
        let mut cursor = buffer.cursor(2);
        let mut count = 0;
        while let Some(entry) = cursor.next_entry() {
            assert_eq!(entry.len(), 2);
            count += 1;
        }
        assert_eq!(count, 8);
    }

    #[test]
    fn test_cursor_crosses_slab_boundary() {
        let mut buffer = buffer_with(&[8, 8], 0, 16);
        let mut cursor = buffer.cursor(2);
        let mut sources = Vec::new();
        while let Some(entry) = cursor.next_entry() {
            sources.push(entry[0]);
        }
        assert_eq!(sources, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_cursor_respects_lead_offset() {
        let mut buffer = buffer_with(&[8, 8], 4, 8);
        let mut cursor = buffer.cursor(2);
        let mut count = 0;
        while cursor.next_entry().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_cursor_writes_are_visible() {
        let mut buffer = buffer_with(&[4, 4], 0, 8);
        {
            let mut cursor = buffer.cursor(2);
            while let Some(entry) = cursor.next_entry() {
                entry[0] = 0xAA;
            }
        }
        let bytes = buffer.to_contiguous();
        assert_eq!(bytes[0], 0xAA);
        assert_eq!(bytes[6], 0xAA);
    }

    #[test]
    fn test_cursor_position_survives_between_calls() {
        let mut buffer = buffer_with(&[4, 4], 0, 8);
        let mut cursor = buffer.cursor(2);
        cursor.next_entry().unwrap();
        cursor.next_entry().unwrap();
        assert_eq!(cursor.entries_consumed(), 2);
        assert_eq!(cursor.entries_remaining(), 2);
        // Next yield comes from the second slab.
        let entry = cursor.next_entry().unwrap();
        assert_eq!(entry[0], 1);
    }

    #[test]
    fn test_rejects_undersized_backing() {
        assert!(SlabBuffer::new(smallvec::smallvec![vec![0; 4]], 0, 8).is_err());
    }
}
