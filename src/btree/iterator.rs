use std::marker::PhantomData;
use std::sync::Arc;

use crate::btree::node::{leaf, Storable};
use crate::buffer_pool::{BufferPoolManager, Frame};
use crate::{PageId, INVALID_PAGE_ID};

/// Forward scan over the leaf chain. Holds a pin on the current leaf and
/// follows `next_page_id` when a page is exhausted; pages are read under the
/// frame's read lock per step, not latched across steps.
pub struct IndexIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    frame: Option<Arc<Frame>>,
    page_id: PageId,
    index: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K: Storable, V: Storable> IndexIterator<K, V> {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        frame: Arc<Frame>,
        page_id: PageId,
        index: u32,
    ) -> Self {
        Self {
            bpm,
            frame: Some(frame),
            page_id,
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn empty(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            frame: None,
            page_id: INVALID_PAGE_ID,
            index: 0,
            _marker: PhantomData,
        }
    }
}

impl<K: Storable, V: Storable> Iterator for IndexIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let frame = self.frame.as_ref()?;
            let next = {
                let page = frame.read();
                if self.index < page.size() {
                    let item = leaf::item::<K, V>(&page, self.index);
                    self.index += 1;
                    return Some(item);
                }
                leaf::next_page_id(&page)
            };

            self.bpm.unpin_page(self.page_id, false);
            if next == INVALID_PAGE_ID {
                self.frame = None;
                return None;
            }
            match self.bpm.fetch_page(next) {
                Ok(frame) => {
                    self.frame = Some(frame);
                    self.page_id = next;
                    self.index = 0;
                }
                Err(_) => {
                    self.frame = None;
                    return None;
                }
            }
        }
    }
}

impl<K, V> Drop for IndexIterator<K, V> {
    fn drop(&mut self) {
        if self.frame.take().is_some() {
            self.bpm.unpin_page(self.page_id, false);
        }
    }
}
