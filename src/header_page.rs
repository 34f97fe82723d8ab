use crate::page::{Page, PageType, PAGE_HEADER_SIZE};
use crate::{PageId, PAGE_SIZE};

/// The index-roots page (data page 0): a flat array of
/// `(name: [u8; 32], root_page_id: u32)` records mapping each index to its
/// current root. The common header's `size` field counts records.
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / RECORD_SIZE;

impl Page {
    pub fn init_header_page(&mut self) {
        self.reset();
        self.set_page_type(PageType::Header);
        self.set_size(0);
        self.set_header_page_id(crate::HEADER_PAGE_ID);
    }

    fn record_offset(index: u32) -> usize {
        PAGE_HEADER_SIZE + index as usize * RECORD_SIZE
    }

    fn record_name(&self, index: u32) -> &[u8] {
        let at = Self::record_offset(index);
        &self.data[at..at + NAME_SIZE]
    }

    fn find_record(&self, name: &str) -> Option<u32> {
        let needle = Self::encode_name(name)?;
        (0..self.size()).find(|i| self.record_name(*i) == needle)
    }

    fn encode_name(name: &str) -> Option<[u8; NAME_SIZE]> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_SIZE {
            return None;
        }
        let mut fixed = [0u8; NAME_SIZE];
        fixed[..bytes.len()].copy_from_slice(bytes);
        Some(fixed)
    }

    pub fn header_get_root(&self, name: &str) -> Option<PageId> {
        let index = self.find_record(name)?;
        Some(self.read_u32(Self::record_offset(index) + NAME_SIZE))
    }

    /// Adds a record. Returns false when the name is taken, invalid, or the
    /// page is full.
    pub fn header_insert_record(&mut self, name: &str, root: PageId) -> bool {
        let Some(fixed) = Self::encode_name(name) else {
            return false;
        };
        if self.find_record(name).is_some() || self.size() as usize >= MAX_RECORDS {
            return false;
        }
        let index = self.size();
        let at = Self::record_offset(index);
        self.data[at..at + NAME_SIZE].copy_from_slice(&fixed);
        self.write_u32(at + NAME_SIZE, root);
        self.set_size(index + 1);
        true
    }

    pub fn header_update_record(&mut self, name: &str, root: PageId) -> bool {
        let Some(index) = self.find_record(name) else {
            return false;
        };
        self.write_u32(Self::record_offset(index) + NAME_SIZE, root);
        true
    }

    pub fn header_delete_record(&mut self, name: &str) -> bool {
        let Some(index) = self.find_record(name) else {
            return false;
        };
        let last = self.size() - 1;
        if index != last {
            let src = Self::record_offset(last);
            let dst = Self::record_offset(index);
            let record: [u8; RECORD_SIZE] =
                self.data[src..src + RECORD_SIZE].try_into().unwrap();
            self.data[dst..dst + RECORD_SIZE].copy_from_slice(&record);
        }
        self.set_size(last);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_PAGE_ID;

    #[test]
    fn insert_update_get_delete() {
        let mut page = Page::new(0);
        page.init_header_page();

        assert!(page.header_insert_record("orders_pk", INVALID_PAGE_ID));
        assert!(!page.header_insert_record("orders_pk", 9));
        assert_eq!(page.header_get_root("orders_pk"), Some(INVALID_PAGE_ID));

        assert!(page.header_update_record("orders_pk", 12));
        assert_eq!(page.header_get_root("orders_pk"), Some(12));
        assert!(!page.header_update_record("missing", 1));

        assert!(page.header_insert_record("users_pk", 4));
        assert!(page.header_delete_record("orders_pk"));
        assert_eq!(page.header_get_root("orders_pk"), None);
        assert_eq!(page.header_get_root("users_pk"), Some(4));
    }

    #[test]
    fn rejects_oversized_names() {
        let mut page = Page::new(0);
        page.init_header_page();
        let long = "x".repeat(NAME_SIZE + 1);
        assert!(!page.header_insert_record(&long, 1));
        assert!(!page.header_insert_record("", 1));
    }
}
