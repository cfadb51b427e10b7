use std::io;

use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_32_ISO_HDLC, Crc};

use crate::BLCKSZ;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const PAGE_HEADER_SIZE: usize = 10;
pub const LINE_POINTER_SIZE: usize = 4;

const NTUPLES_OFFSET: usize = 0;
const LOWER_OFFSET: usize = 2;
const UPPER_OFFSET: usize = 4;
const CHECKSUM_OFFSET: usize = 6;

/// A fixed-size slotted storage page.
///
/// Layout: header (`ntuples`, `lower`, `upper`, `checksum`), then line
/// pointers `(offset, length)` growing forward from the header while tuple
/// bytes grow backward from the end of the page.
#[derive(Clone, PartialEq)]
pub struct Page {
    data: Box<[u8]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("ntuples", &self.ntuples())
            .field("free_space", &self.free_space())
            .field("checksum", &self.stored_checksum())
            .finish()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    pub fn new() -> Self {
        let mut data = vec![0u8; BLCKSZ].into_boxed_slice();
        LittleEndian::write_u16(&mut data[LOWER_OFFSET..], PAGE_HEADER_SIZE as u16);
        // BLCKSZ does not fit u16, so an empty page keeps upper at 0 and
        // `upper()` maps it back to the page end.
        LittleEndian::write_u16(&mut data[UPPER_OFFSET..], 0);
        let mut page = Page { data };
        page.seal();
        page
    }

    /// Rebuilds a page read from storage, verifying its checksum.
    pub fn from_bytes(bytes: Vec<u8>) -> io::Result<Page> {
        if bytes.len() != BLCKSZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("page must be {} bytes, got {}", BLCKSZ, bytes.len()),
            ));
        }

        let page = Page {
            data: bytes.into_boxed_slice(),
        };

        if !page.verify() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "page checksum mismatch: stored {:#010x}, computed {:#010x}",
                    page.stored_checksum(),
                    page.compute_checksum()
                ),
            ));
        }

        Ok(page)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn ntuples(&self) -> usize {
        LittleEndian::read_u16(&self.data[NTUPLES_OFFSET..]) as usize
    }

    #[inline]
    fn lower(&self) -> usize {
        LittleEndian::read_u16(&self.data[LOWER_OFFSET..]) as usize
    }

    #[inline]
    fn upper(&self) -> usize {
        match LittleEndian::read_u16(&self.data[UPPER_OFFSET..]) {
            0 => BLCKSZ,
            upper => upper as usize,
        }
    }

    pub fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    /// Appends a tuple. Returns `false` if the page has no room left.
    /// The page must be sealed again before being written out.
    pub fn add_tuple(&mut self, tuple: &[u8]) -> bool {
        if tuple.len() + LINE_POINTER_SIZE > self.free_space() {
            return false;
        }

        let ntuples = self.ntuples();
        let lower = self.lower();
        let upper = self.upper() - tuple.len();

        self.data[upper..upper + tuple.len()].copy_from_slice(tuple);
        LittleEndian::write_u16(&mut self.data[lower..], upper as u16);
        LittleEndian::write_u16(&mut self.data[lower + 2..], tuple.len() as u16);

        LittleEndian::write_u16(&mut self.data[NTUPLES_OFFSET..], (ntuples + 1) as u16);
        LittleEndian::write_u16(&mut self.data[LOWER_OFFSET..], (lower + LINE_POINTER_SIZE) as u16);
        LittleEndian::write_u16(&mut self.data[UPPER_OFFSET..], upper as u16);

        true
    }

    pub fn tuple(&self, index: usize) -> Option<&[u8]> {
        if index >= self.ntuples() {
            return None;
        }
        let lp = PAGE_HEADER_SIZE + index * LINE_POINTER_SIZE;
        let offset = LittleEndian::read_u16(&self.data[lp..]) as usize;
        let len = LittleEndian::read_u16(&self.data[lp + 2..]) as usize;
        self.data.get(offset..offset + len)
    }

    pub fn tuples(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.ntuples()).filter_map(move |i| self.tuple(i))
    }

    pub fn stored_checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.data[CHECKSUM_OFFSET..])
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&self.data[..CHECKSUM_OFFSET]);
        digest.update(&self.data[PAGE_HEADER_SIZE..]);
        digest.finalize()
    }

    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        LittleEndian::write_u32(&mut self.data[CHECKSUM_OFFSET..], checksum);
    }

    pub fn verify(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    /// Flips one byte of the tuple area. Test hook for checksum failures.
    pub fn corrupt(&mut self) {
        let last = BLCKSZ - 1;
        self.data[last] ^= 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_read_tuples() {
        let mut page = Page::new();
        assert!(page.add_tuple(b"alpha"));
        assert!(page.add_tuple(b"beta"));
        page.seal();

        assert_eq!(page.ntuples(), 2);
        assert_eq!(page.tuple(0), Some(&b"alpha"[..]));
        assert_eq!(page.tuple(1), Some(&b"beta"[..]));
        assert_eq!(page.tuple(2), None);
        assert_eq!(page.tuples().count(), 2);
        assert!(page.verify());
    }

    #[test]
    fn test_page_fills_up() {
        let mut page = Page::new();
        let tuple = [7u8; 1000];
        let mut added = 0;
        while page.add_tuple(&tuple) {
            added += 1;
        }
        assert_eq!(added, (BLCKSZ - PAGE_HEADER_SIZE) / (1000 + LINE_POINTER_SIZE));
        assert!(page.free_space() < 1000 + LINE_POINTER_SIZE);
    }

    #[test]
    fn test_checksum_mismatch_is_io_error() {
        let mut page = Page::new();
        page.add_tuple(b"payload");
        page.seal();
        page.corrupt();

        let err = Page::from_bytes(page.as_bytes().to_vec()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_round_trip_bytes() {
        let mut page = Page::new();
        page.add_tuple(b"payload");
        page.seal();
        let copy = Page::from_bytes(page.as_bytes().to_vec()).unwrap();
        assert_eq!(copy.tuple(0), Some(&b"payload"[..]));
    }
}
