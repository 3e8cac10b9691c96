use crate::bus::TransferDescriptor;

/// Bytes of record table storage used per queued record
pub const RECORD_SIZE: usize = 4;

/// Error type for an enqueue that did not fit
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueFull;

/// Trait for reformatting a record as it is enqueued
///
/// `Header` is supplied with every enqueue call and may be written in front of, or mixed into,
/// the caller's data.
pub trait RecordTransform {
    type Header: Copy;

    /// Number of bytes `encode` will produce
    fn encoded_len(&self, header: Self::Header, data: &[u8]) -> usize;

    /// Fills `out`, which is exactly `encoded_len` bytes long
    fn encode(&self, header: Self::Header, data: &[u8], out: &mut [u8]);
}

/// Stores records exactly as given
#[derive(Copy, Clone, Debug, Default)]
pub struct Verbatim;

impl RecordTransform for Verbatim {
    type Header = ();

    fn encoded_len(&self, _header: (), data: &[u8]) -> usize {
        data.len()
    }

    fn encode(&self, _header: (), data: &[u8], out: &mut [u8]) {
        out.copy_from_slice(data);
    }
}

/// Prepends the packed address/direction byte of a host request
#[derive(Copy, Clone, Debug, Default)]
pub struct DescriptorPrefix;

impl RecordTransform for DescriptorPrefix {
    type Header = TransferDescriptor;

    fn encoded_len(&self, _header: TransferDescriptor, data: &[u8]) -> usize {
        data.len() + 1
    }

    fn encode(&self, header: TransferDescriptor, data: &[u8], out: &mut [u8]) {
        out[0] = header.to_byte();
        out[1..].copy_from_slice(data);
    }
}

/// Table of `{offset, size}` records kept in plain bytes
struct RecordTable<'a> {
    raw: &'a mut [u8],
}

impl<'a> RecordTable<'a> {
    fn capacity(&self) -> usize {
        self.raw.len() / RECORD_SIZE
    }

    fn get(&self, idx: usize) -> (usize, usize) {
        let r = &self.raw[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE];
        (
            u16::from_le_bytes([r[0], r[1]]) as usize,
            u16::from_le_bytes([r[2], r[3]]) as usize,
        )
    }

    fn set(&mut self, idx: usize, offset: usize, size: usize) {
        let r = &mut self.raw[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE];
        r[..2].copy_from_slice(&(offset as u16).to_le_bytes());
        r[2..].copy_from_slice(&(size as u16).to_le_bytes());
    }
}

/// Bounded ring of variable length byte records
///
/// Records live in a borrowed payload arena and are never moved once enqueued. A record always
/// occupies one contiguous region: if it does not fit between the tail and the end of the
/// arena it is placed at the start, provided it fits before the oldest record. The skipped gap
/// at the end is reclaimed once the oldest record wraps as well.
///
/// Record offsets are 16 bits wide, so only the first `u16::MAX` bytes of a larger arena are used.
pub struct TransferQueue<'a, T: RecordTransform = Verbatim> {
    records: RecordTable<'a>,
    data: &'a mut [u8],
    transform: T,
    head: usize,
    size: usize,
    data_tail: usize,
    wrapped: bool,
}

impl<'a> TransferQueue<'a, Verbatim> {
    /// Creates a queue storing records verbatim
    ///
    /// `record_table` holds `record_table.len() / RECORD_SIZE` records.
    pub fn new(record_table: &'a mut [u8], data: &'a mut [u8]) -> Self {
        Self::with_transform(record_table, data, Verbatim)
    }
}

impl<'a, T: RecordTransform> TransferQueue<'a, T> {
    /// Creates a queue passing every enqueued record through `transform`
    pub fn with_transform(record_table: &'a mut [u8], data: &'a mut [u8], transform: T) -> Self {
        let len = data.len().min(u16::MAX as usize);
        let data = &mut data[..len];
        TransferQueue {
            records: RecordTable { raw: record_table },
            data,
            transform,
            head: 0,
            size: 0,
            data_tail: 0,
            wrapped: false,
        }
    }

    /// Checks for queue emptiness
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Checks whether the record table is exhausted
    pub fn is_full(&self) -> bool {
        self.size >= self.records.capacity()
    }

    /// Number of queued records
    pub fn len(&self) -> usize {
        self.size
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    /// Size of the payload arena
    pub fn data_capacity(&self) -> usize {
        self.data.len()
    }

    /// Encodes `data` with `header` and appends it as one record
    ///
    /// Fails without touching the queue if the record table is full or the encoded record does
    /// not fit in the arena.
    pub fn enqueue(&mut self, header: T::Header, data: &[u8]) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull);
        }
        let len = self.transform.encoded_len(header, data);
        if len > u16::MAX as usize {
            return Err(QueueFull);
        }
        let offset = self.reserve(len).ok_or(QueueFull)?;

        self.transform
            .encode(header, data, &mut self.data[offset..offset + len]);

        if self.is_empty() {
            self.wrapped = false;
        } else if !self.wrapped && offset != self.data_tail {
            self.wrapped = true;
        }
        let idx = (self.head + self.size) % self.records.capacity();
        self.records.set(idx, offset, len);
        self.data_tail = offset + len;
        self.size += 1;
        Ok(())
    }

    /// Returns the oldest record without removing it
    pub fn peek(&self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }
        let (offset, len) = self.records.get(self.head);
        Some(&self.data[offset..offset + len])
    }

    /// Removes the oldest record and returns a view of it
    ///
    /// The view stays valid until the queue is next modified.
    pub fn dequeue(&mut self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }
        let (offset, len) = self.records.get(self.head);
        self.head = (self.head + 1) % self.records.capacity();
        self.size -= 1;

        if self.is_empty() {
            self.head = 0;
            self.data_tail = 0;
            self.wrapped = false;
        } else if self.wrapped {
            let (next, _) = self.records.get(self.head);
            if next < offset {
                self.wrapped = false;
            }
        }
        Some(&self.data[offset..offset + len])
    }

    /// Drops all records
    pub fn clear(&mut self) {
        self.head = 0;
        self.size = 0;
        self.data_tail = 0;
        self.wrapped = false;
    }

    // Offset a record of `len` bytes would be stored at
    fn reserve(&self, len: usize) -> Option<usize> {
        if self.is_empty() {
            return (len <= self.data.len()).then_some(0);
        }
        let (head, _) = self.records.get(self.head);
        if self.wrapped {
            (head - self.data_tail >= len).then_some(self.data_tail)
        } else if self.data.len() - self.data_tail >= len {
            Some(self.data_tail)
        } else if head >= len {
            Some(0)
        } else {
            None
        }
    }
}
