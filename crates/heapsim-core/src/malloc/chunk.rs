//! Boundary-tag chunk headers over a fixed byte arena.
//!
//! Every chunk starts with a 9-byte header:
//!
//! ```text
//! +-----------------+-----------------+-----------+
//! | prev_size (u32) |    size (u32)   | free (u8) |
//! +-----------------+-----------------+-----------+
//! | forward (u32)   | backward (u32)  |  ...      |  <- payload, or free-list links
//! +-----------------+-----------------+-----------+
//! ```
//!
//! `size` and `prev_size` are whole-chunk sizes (header + payload) stored
//! big-endian. A free chunk reuses the first 8 payload bytes for the
//! `forward`/`backward` offsets of its bin's circular list, which is why the
//! smallest payload is one allocation unit.
//!
//! The first chunk of the arena records a `prev_size` of 0.

use thiserror::Error;

/// Fixed metadata overhead of every chunk.
pub const HEADER_SIZE: usize = 2 * FIELD_BYTES + 1;

/// Allocation unit every request is rounded up to.
pub const UNIT: usize = 8;

/// Largest arena the 4-byte header fields can describe.
pub const MAX_ARENA_SIZE: usize = u32::MAX as usize;

const FIELD_BYTES: usize = 4;
const PREV_SIZE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = FIELD_BYTES;
const FLAG_OFFSET: usize = 2 * FIELD_BYTES;
const FORWARD_OFFSET: usize = HEADER_SIZE;
const BACKWARD_OFFSET: usize = HEADER_SIZE + FIELD_BYTES;

/// Codec contract violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk index {index} must be between 0 and arena length ({len})")]
    OutOfRange { index: usize, len: usize },
}

/// Rounds `size` up to the allocation unit. `None` on overflow.
#[must_use]
pub fn ceil_to_unit(size: usize) -> Option<usize> {
    match size % UNIT {
        0 => Some(size),
        remain => size.checked_add(UNIT - remain),
    }
}

/// Floors `size` to the allocation unit.
#[must_use]
pub const fn floor_to_unit(size: usize) -> usize {
    size - size % UNIT
}

/// The simulated heap memory. Never resized after construction.
#[derive(Debug, Clone)]
pub struct Arena {
    bytes: Box<[u8]>,
}

impl Arena {
    /// Creates a zero-filled arena of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity <= MAX_ARENA_SIZE);
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Header plus payload of the chunk at `index`.
    pub fn size(&self, index: usize) -> Result<usize, ChunkError> {
        self.read_field(index, SIZE_OFFSET)
    }

    /// Header plus payload of the chunk physically before `index` (0 for the first chunk).
    pub fn prev_size(&self, index: usize) -> Result<usize, ChunkError> {
        self.read_field(index, PREV_SIZE_OFFSET)
    }

    /// Payload bytes of the chunk, internal fragmentation included.
    pub fn real_size(&self, index: usize) -> Result<usize, ChunkError> {
        Ok(self.size(index)?.saturating_sub(HEADER_SIZE))
    }

    /// Payload bytes floored to the allocation unit.
    pub fn unit_size(&self, index: usize) -> Result<usize, ChunkError> {
        Ok(floor_to_unit(self.real_size(index)?))
    }

    pub fn prev_real_size(&self, index: usize) -> Result<usize, ChunkError> {
        Ok(self.prev_size(index)?.saturating_sub(HEADER_SIZE))
    }

    pub fn prev_unit_size(&self, index: usize) -> Result<usize, ChunkError> {
        Ok(floor_to_unit(self.prev_real_size(index)?))
    }

    pub fn is_free(&self, index: usize) -> Result<bool, ChunkError> {
        self.check(index, FLAG_OFFSET + 1)?;
        Ok(self.bytes[index + FLAG_OFFSET] != 0)
    }

    /// Offset just past the chunk at `index`.
    pub fn next_chunk_index(&self, index: usize) -> Result<usize, ChunkError> {
        Ok(index + self.size(index)?)
    }

    /// Offset of the physically preceding chunk, `None` for the first chunk.
    pub fn prev_chunk_index(&self, index: usize) -> Result<Option<usize>, ChunkError> {
        match self.prev_size(index)? {
            0 => Ok(None),
            prev => Ok(index.checked_sub(prev)),
        }
    }

    /// Next member of the chunk's bin list. Only meaningful while the chunk is free.
    pub fn forward_free_index(&self, index: usize) -> Result<usize, ChunkError> {
        self.read_field(index, FORWARD_OFFSET)
    }

    /// Previous member of the chunk's bin list. Only meaningful while the chunk is free.
    pub fn backward_free_index(&self, index: usize) -> Result<usize, ChunkError> {
        self.read_field(index, BACKWARD_OFFSET)
    }

    /// True iff a header plus `unit_size` payload bytes starting at `index` fit in the arena.
    pub fn has_enough_space(&self, index: usize, unit_size: usize) -> Result<bool, ChunkError> {
        self.check(index, 0)?;
        let last = index
            .checked_add(HEADER_SIZE)
            .and_then(|end| end.checked_add(unit_size));
        Ok(matches!(last, Some(end) if end <= self.bytes.len()))
    }

    /// True iff a `prev_size` field can be recorded at `index`.
    #[must_use]
    pub fn can_record_prev_size(&self, index: usize) -> bool {
        index
            .checked_add(PREV_SIZE_OFFSET + FIELD_BYTES)
            .is_some_and(|end| end <= self.bytes.len())
    }

    /// Stores `payload + HEADER_SIZE` as the chunk size.
    pub fn set_real_size(&mut self, index: usize, payload: usize) -> Result<(), ChunkError> {
        self.write_field(index, SIZE_OFFSET, payload + HEADER_SIZE)
    }

    /// Stores `payload + HEADER_SIZE` as the preceding chunk's size.
    pub fn set_prev_real_size(&mut self, index: usize, payload: usize) -> Result<(), ChunkError> {
        self.write_field(index, PREV_SIZE_OFFSET, payload + HEADER_SIZE)
    }

    /// Marks `index` as the first chunk of the arena.
    pub fn clear_prev_size(&mut self, index: usize) -> Result<(), ChunkError> {
        self.write_field(index, PREV_SIZE_OFFSET, 0)
    }

    /// Flips the free flag only; bin links are maintained by the bins.
    pub fn set_free(&mut self, index: usize, free: bool) -> Result<(), ChunkError> {
        self.check(index, FLAG_OFFSET + 1)?;
        self.bytes[index + FLAG_OFFSET] = u8::from(free);
        Ok(())
    }

    pub fn set_forward_free_index(&mut self, index: usize, forward: usize) -> Result<(), ChunkError> {
        self.write_field(index, FORWARD_OFFSET, forward)
    }

    pub fn set_backward_free_index(
        &mut self,
        index: usize,
        backward: usize,
    ) -> Result<(), ChunkError> {
        self.write_field(index, BACKWARD_OFFSET, backward)
    }

    fn check(&self, index: usize, field_end: usize) -> Result<(), ChunkError> {
        let len = self.bytes.len();
        let in_bounds = index <= len
            && (field_end == 0
                || index
                    .checked_add(field_end)
                    .is_some_and(|end| end <= len));
        if in_bounds {
            Ok(())
        } else {
            Err(ChunkError::OutOfRange { index, len })
        }
    }

    fn read_field(&self, index: usize, offset: usize) -> Result<usize, ChunkError> {
        self.check(index, offset + FIELD_BYTES)?;
        let at = index + offset;
        let mut buf = [0u8; FIELD_BYTES];
        buf.copy_from_slice(&self.bytes[at..at + FIELD_BYTES]);
        Ok(u32::from_be_bytes(buf) as usize)
    }

    fn write_field(&mut self, index: usize, offset: usize, value: usize) -> Result<(), ChunkError> {
        self.check(index, offset + FIELD_BYTES)?;
        // Offsets and sizes never exceed the arena, which is capped at MAX_ARENA_SIZE.
        debug_assert!(value <= MAX_ARENA_SIZE);
        let at = index + offset;
        self.bytes[at..at + FIELD_BYTES].copy_from_slice(&(value as u32).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_nine_bytes() {
        assert_eq!(HEADER_SIZE, 9);
    }

    #[test]
    fn unit_rounding() {
        let cases = [(1..9, 8), (9..17, 16), (17..25, 24), (25..33, 32)];
        for (sizes, expected) in cases {
            for size in sizes {
                assert_eq!(ceil_to_unit(size), Some(expected), "size={size}");
            }
        }
        assert_eq!(ceil_to_unit(0), Some(0));
        assert_eq!(ceil_to_unit(usize::MAX), None);
        assert_eq!(floor_to_unit(25), 24);
        assert_eq!(floor_to_unit(7), 0);
    }

    #[test]
    fn size_fields_include_header() {
        let mut arena = Arena::new(64);
        arena.set_real_size(0, 16).unwrap();
        arena.set_prev_real_size(0, 8).unwrap();
        assert_eq!(arena.size(0).unwrap(), 25);
        assert_eq!(arena.real_size(0).unwrap(), 16);
        assert_eq!(arena.prev_size(0).unwrap(), 17);
        assert_eq!(arena.prev_real_size(0).unwrap(), 8);
        assert_eq!(arena.next_chunk_index(0).unwrap(), 25);
    }

    #[test]
    fn fields_are_big_endian() {
        let mut arena = Arena::new(32);
        arena.set_real_size(0, 0x0100 - HEADER_SIZE).unwrap();
        assert_eq!(arena.bytes[4..8], [0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn unit_size_floors_internal_fragmentation() {
        let mut arena = Arena::new(64);
        arena.set_real_size(0, 25).unwrap();
        arena.set_prev_real_size(0, 19).unwrap();
        assert_eq!(arena.unit_size(0).unwrap(), 24);
        assert_eq!(arena.prev_unit_size(0).unwrap(), 16);
    }

    #[test]
    fn first_chunk_has_no_predecessor() {
        let mut arena = Arena::new(64);
        arena.clear_prev_size(0).unwrap();
        assert_eq!(arena.prev_chunk_index(0).unwrap(), None);

        arena.set_prev_real_size(17, 8).unwrap();
        assert_eq!(arena.prev_chunk_index(17).unwrap(), Some(0));
    }

    #[test]
    fn free_flag_leaves_links_alone() {
        let mut arena = Arena::new(64);
        arena.set_forward_free_index(0, 34).unwrap();
        arena.set_backward_free_index(0, 17).unwrap();
        arena.set_free(0, true).unwrap();
        assert!(arena.is_free(0).unwrap());
        arena.set_free(0, false).unwrap();
        assert!(!arena.is_free(0).unwrap());
        assert_eq!(arena.forward_free_index(0).unwrap(), 34);
        assert_eq!(arena.backward_free_index(0).unwrap(), 17);
    }

    #[test]
    fn enough_space_is_inclusive_of_last_byte() {
        let arena = Arena::new(17);
        assert!(arena.has_enough_space(0, 8).unwrap());
        assert!(!arena.has_enough_space(0, 16).unwrap());
        assert!(!arena.has_enough_space(17, 8).unwrap());
        assert!(!arena.has_enough_space(1, usize::MAX).unwrap());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut arena = Arena::new(32);
        assert_eq!(
            arena.size(33),
            Err(ChunkError::OutOfRange { index: 33, len: 32 })
        );
        assert!(arena.has_enough_space(33, 8).is_err());
        assert!(arena.set_free(40, true).is_err());
        // A header that would straddle the end of the arena is out of range too.
        assert!(arena.size(30).is_err());
        assert!(arena.has_enough_space(32, 0).is_ok());
    }

    #[test]
    fn prev_size_room_at_arena_tail() {
        let arena = Arena::new(512);
        assert!(arena.can_record_prev_size(508));
        assert!(!arena.can_record_prev_size(510));
    }
}
