use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::page::{Page, PageType, PAGE_HEADER_SIZE};
use crate::{PageId, PAGE_SIZE};

/// An opaque tuple: the engine stores and recovers byte strings; schema and
/// value encoding belong to the host layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Slotted heap page layout, following the common page header:
///
/// ```text
/// | common header | next_page_id | prev_page_id | lower | upper | slots... -> | ... <- tuple data |
/// ```
///
/// Slots grow from the low end, tuple bytes from the high end; `lower` and
/// `upper` are the water marks. Each slot is `(offset: u16, len: u16)`; the
/// top bit of `len` is the delete mark. The common header's `size` field
/// counts slots.
const OFFSET_NEXT: usize = PAGE_HEADER_SIZE;
const OFFSET_PREV: usize = PAGE_HEADER_SIZE + 4;
const OFFSET_LOWER: usize = PAGE_HEADER_SIZE + 8;
const OFFSET_UPPER: usize = PAGE_HEADER_SIZE + 10;
const SLOTS_START: usize = PAGE_HEADER_SIZE + 12;
const SLOT_SIZE: usize = 4;

const DELETE_MASK: u16 = 1 << 15;

/// The largest tuple a single heap page can hold.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - SLOTS_START - SLOT_SIZE;

impl Page {
    pub fn init_table_page(&mut self, page_id: PageId, prev_page_id: PageId) {
        self.reset();
        self.set_page_type(PageType::Table);
        self.set_size(0);
        self.set_header_page_id(page_id);
        self.write_u32(OFFSET_NEXT, crate::INVALID_PAGE_ID);
        self.write_u32(OFFSET_PREV, prev_page_id);
        self.write_u16(OFFSET_LOWER, SLOTS_START as u16);
        self.write_u16(OFFSET_UPPER, PAGE_SIZE as u16);
    }

    pub fn next_page_id(&self) -> PageId {
        self.read_u32(OFFSET_NEXT)
    }

    pub fn set_next_page_id(&mut self, id: PageId) {
        self.write_u32(OFFSET_NEXT, id);
    }

    pub fn prev_page_id(&self) -> PageId {
        self.read_u32(OFFSET_PREV)
    }

    fn lower(&self) -> u16 {
        self.read_u16(OFFSET_LOWER)
    }

    fn upper(&self) -> u16 {
        self.read_u16(OFFSET_UPPER)
    }

    fn slot_offset(slot: u32) -> usize {
        SLOTS_START + slot as usize * SLOT_SIZE
    }

    fn slot(&self, slot: u32) -> (u16, u16) {
        let at = Self::slot_offset(slot);
        (self.read_u16(at), self.read_u16(at + 2))
    }

    fn set_slot(&mut self, slot: u32, offset: u16, len_flags: u16) {
        let at = Self::slot_offset(slot);
        self.write_u16(at, offset);
        self.write_u16(at + 2, len_flags);
    }

    fn free_space(&self) -> usize {
        (self.upper() - self.lower()) as usize
    }

    /// Inserts a tuple, reusing the lowest freed slot if one exists.
    /// Returns the slot number, or `None` when the page is full.
    pub fn insert_tuple(&mut self, tuple: &Tuple) -> Option<u32> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return None;
        }
        let slot_count = self.size();
        let reuse = (0..slot_count).find(|s| {
            let (offset, len_flags) = self.slot(*s);
            offset == 0 && len_flags == 0
        });
        let needed = tuple.len() + if reuse.is_some() { 0 } else { SLOT_SIZE };
        if self.free_space() < needed {
            return None;
        }

        let slot = reuse.unwrap_or(slot_count);
        self.place_tuple(slot, tuple);
        if reuse.is_none() {
            self.write_u16(OFFSET_LOWER, (Self::slot_offset(slot + 1)) as u16);
            self.set_size(slot_count + 1);
        }
        Some(slot)
    }

    /// Installs a tuple at a specific slot; the slot must be free or one past
    /// the current slot array. Recovery and undo use this to pin a record to
    /// the rid the log names.
    pub fn insert_tuple_at(&mut self, slot: u32, tuple: &Tuple) -> EngineResult<()> {
        let slot_count = self.size();
        if slot > slot_count {
            return Err(EngineError::Corruption(format!(
                "slot {slot} beyond slot array of {slot_count}"
            )));
        }
        let new_slot = slot == slot_count;
        if !new_slot {
            let (offset, len_flags) = self.slot(slot);
            if offset != 0 || len_flags != 0 {
                return Err(EngineError::Corruption(format!("slot {slot} is occupied")));
            }
        }
        let needed = tuple.len() + if new_slot { SLOT_SIZE } else { 0 };
        if self.free_space() < needed {
            return Err(EngineError::OutOfSpace);
        }
        self.place_tuple(slot, tuple);
        if new_slot {
            self.write_u16(OFFSET_LOWER, (Self::slot_offset(slot + 1)) as u16);
            self.set_size(slot_count + 1);
        }
        Ok(())
    }

    fn place_tuple(&mut self, slot: u32, tuple: &Tuple) {
        let upper = self.upper() as usize - tuple.len();
        self.data[upper..upper + tuple.len()].copy_from_slice(tuple.as_slice());
        self.write_u16(OFFSET_UPPER, upper as u16);
        self.set_slot(slot, upper as u16, tuple.len() as u16);
    }

    pub fn get_tuple(&self, slot: u32) -> EngineResult<Tuple> {
        let (offset, len_flags) = self.checked_slot(slot)?;
        if len_flags & DELETE_MASK != 0 {
            return Err(EngineError::NotFound);
        }
        let len = len_flags as usize;
        Ok(Tuple::new(
            self.data[offset as usize..offset as usize + len].to_vec(),
        ))
    }

    /// Sets the delete mark; the bytes stay in place until `apply_delete`.
    pub fn mark_delete(&mut self, slot: u32) -> EngineResult<()> {
        let (offset, len_flags) = self.checked_slot(slot)?;
        if len_flags & DELETE_MASK != 0 {
            return Err(EngineError::NotFound);
        }
        self.set_slot(slot, offset, len_flags | DELETE_MASK);
        Ok(())
    }

    pub fn rollback_delete(&mut self, slot: u32) -> EngineResult<()> {
        let (offset, len_flags) = self.checked_slot(slot)?;
        self.set_slot(slot, offset, len_flags & !DELETE_MASK);
        Ok(())
    }

    /// Physically removes the tuple, compacting the data region, and returns
    /// the removed image.
    pub fn apply_delete(&mut self, slot: u32) -> EngineResult<Tuple> {
        let (offset, len_flags) = self.checked_slot(slot)?;
        let len = (len_flags & !DELETE_MASK) as usize;
        let image = Tuple::new(self.data[offset as usize..offset as usize + len].to_vec());

        self.compact_out(offset, len as u16);
        self.set_slot(slot, 0, 0);
        Ok(image)
    }

    /// Replaces the tuple at `slot`, returning the old image.
    pub fn update_tuple(&mut self, slot: u32, new: &Tuple) -> EngineResult<Tuple> {
        let (offset, len_flags) = self.checked_slot(slot)?;
        if len_flags & DELETE_MASK != 0 {
            return Err(EngineError::NotFound);
        }
        let old_len = len_flags as usize;
        let old = Tuple::new(self.data[offset as usize..offset as usize + old_len].to_vec());

        if new.len() == old_len {
            self.data[offset as usize..offset as usize + old_len].copy_from_slice(new.as_slice());
            return Ok(old);
        }
        if new.len() > old_len && self.free_space() < new.len() - old_len {
            return Err(EngineError::OutOfSpace);
        }
        self.compact_out(offset, old_len as u16);
        self.place_tuple(slot, new);
        Ok(old)
    }

    /// Whether the slot holds bytes, deleted-marked or not. Recovery uses
    /// this to keep undo compensations idempotent.
    pub fn slot_in_use(&self, slot: u32) -> bool {
        if slot >= self.size() {
            return false;
        }
        let (offset, len_flags) = self.slot(slot);
        offset != 0 || len_flags != 0
    }

    fn checked_slot(&self, slot: u32) -> EngineResult<(u16, u16)> {
        if slot >= self.size() {
            return Err(EngineError::NotFound);
        }
        let (offset, len_flags) = self.slot(slot);
        if offset == 0 && len_flags == 0 {
            return Err(EngineError::NotFound);
        }
        Ok((offset, len_flags))
    }

    /// Shifts the data region over the hole left at `[offset, offset + len)`
    /// and fixes the offsets of every slot that pointed below it.
    fn compact_out(&mut self, offset: u16, len: u16) {
        let upper = self.upper() as usize;
        self.data
            .copy_within(upper..offset as usize, upper + len as usize);
        self.write_u16(OFFSET_UPPER, upper as u16 + len);

        for s in 0..self.size() {
            let (o, lf) = self.slot(s);
            if (o != 0 || lf != 0) && o < offset {
                self.set_slot(s, o + len, lf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_page() -> Page {
        let mut page = Page::new(1);
        page.init_table_page(1, crate::INVALID_PAGE_ID);
        page
    }

    fn tuple(bytes: &[u8]) -> Tuple {
        Tuple::new(bytes.to_vec())
    }

    #[test]
    fn insert_and_get() {
        let mut page = table_page();
        let s0 = page.insert_tuple(&tuple(b"alpha")).unwrap();
        let s1 = page.insert_tuple(&tuple(b"beta")).unwrap();
        assert_eq!((s0, s1), (0, 1));
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"alpha");
        assert_eq!(page.get_tuple(1).unwrap().as_slice(), b"beta");
        assert!(matches!(page.get_tuple(2), Err(EngineError::NotFound)));
    }

    #[test]
    fn mark_then_rollback_delete() {
        let mut page = table_page();
        page.insert_tuple(&tuple(b"row")).unwrap();

        page.mark_delete(0).unwrap();
        assert!(matches!(page.get_tuple(0), Err(EngineError::NotFound)));
        assert!(matches!(page.mark_delete(0), Err(EngineError::NotFound)));

        page.rollback_delete(0).unwrap();
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"row");
    }

    #[test]
    fn apply_delete_compacts_and_frees_slot() {
        let mut page = table_page();
        page.insert_tuple(&tuple(b"first")).unwrap();
        page.insert_tuple(&tuple(b"second")).unwrap();
        page.insert_tuple(&tuple(b"third")).unwrap();

        let image = page.apply_delete(1).unwrap();
        assert_eq!(image.as_slice(), b"second");
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"first");
        assert_eq!(page.get_tuple(2).unwrap().as_slice(), b"third");
        assert!(matches!(page.get_tuple(1), Err(EngineError::NotFound)));

        // Freed slot is reused before the array grows.
        let slot = page.insert_tuple(&tuple(b"fourth")).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(page.get_tuple(1).unwrap().as_slice(), b"fourth");
        assert_eq!(page.size(), 3);
    }

    #[test]
    fn insert_at_slot_restores_rid() {
        let mut page = table_page();
        page.insert_tuple(&tuple(b"aaa")).unwrap();
        page.insert_tuple(&tuple(b"bbb")).unwrap();
        page.apply_delete(0).unwrap();

        page.insert_tuple_at(0, &tuple(b"aaa")).unwrap();
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"aaa");
        assert!(page.insert_tuple_at(1, &tuple(b"x")).is_err());
        assert!(page.insert_tuple_at(5, &tuple(b"x")).is_err());
    }

    #[test]
    fn update_in_place_and_resized() {
        let mut page = table_page();
        page.insert_tuple(&tuple(b"one")).unwrap();
        page.insert_tuple(&tuple(b"two")).unwrap();

        let old = page.update_tuple(0, &tuple(b"uno")).unwrap();
        assert_eq!(old.as_slice(), b"one");
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"uno");

        let old = page.update_tuple(0, &tuple(b"a longer value")).unwrap();
        assert_eq!(old.as_slice(), b"uno");
        assert_eq!(page.get_tuple(0).unwrap().as_slice(), b"a longer value");
        assert_eq!(page.get_tuple(1).unwrap().as_slice(), b"two");
    }

    #[test]
    fn page_reports_full() {
        let mut page = table_page();
        let big = Tuple::new(vec![7u8; 1000]);
        let mut inserted = 0;
        while page.insert_tuple(&big).is_some() {
            inserted += 1;
        }
        assert_eq!(inserted, 4);
        // A small row still fits in the remaining sliver.
        assert!(page.insert_tuple(&tuple(b"tiny")).is_some());
    }
}
