//! A concurrent, page-resident B+tree index.
//!
//! All node I/O goes through the buffer pool. Concurrency uses latch
//! crabbing: a search read-latches each child before releasing its parent;
//! inserts and deletes hold write latches down the path and release every
//! ancestor as soon as the current node is safe (cannot split or underflow).
//! The root pointer is guarded by a tree-level mutex held by structure
//! changes until the root is known safe.

pub mod iterator;
pub mod node;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer_pool::{BufferPoolManager, PageLatch};
use crate::errors::{EngineError, EngineResult};
use crate::latch::Latch;
use crate::page::PageType;
use crate::transaction::Transaction;
use crate::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};

pub use iterator::IndexIterator;
pub use node::{KeyComparator, OrdComparator, Storable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Search,
    Insert,
    Delete,
}

/// Latches held during one tree operation, root-to-leaf. Released eagerly as
/// crabbing proves nodes safe, and fully at operation end.
struct Context {
    latches: Vec<(PageId, PageLatch)>,
    root_held: bool,
}

impl Context {
    fn new() -> Self {
        Self {
            latches: Vec::new(),
            root_held: false,
        }
    }
}

pub struct BPlusTree<K, V, C = OrdComparator> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    root_page_id: AtomicU32,
    root_latch: Latch,
    leaf_max_size: u32,
    internal_max_size: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Storable,
    V: Storable,
    C: KeyComparator<K>,
{
    /// Opens (or registers) the index named `name`, with node capacities
    /// derived from the page size.
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>, comparator: C) -> EngineResult<Self> {
        Self::with_max_sizes(name, bpm, comparator, 0, 0)
    }

    /// As [`BPlusTree::new`] but with explicit node capacities; 0 derives
    /// the capacity from the page size. Small capacities exercise splits and
    /// merges without thousands of keys.
    pub fn with_max_sizes(
        name: &str,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> EngineResult<Self> {
        let leaf_max = if leaf_max_size == 0 {
            node::leaf::max_cells::<K, V>()
        } else {
            leaf_max_size.min(node::leaf::max_cells::<K, V>())
        };
        let internal_max = if internal_max_size == 0 {
            node::internal::max_cells::<K>()
        } else {
            internal_max_size.min(node::internal::max_cells::<K>())
        };

        // The root pointer lives in the index-roots page and survives
        // restarts; register the index there on first open.
        let frame = bpm.fetch_page(HEADER_PAGE_ID)?;
        let (root, dirty) = {
            let mut page = frame.write();
            if page.page_type() != PageType::Header {
                page.init_header_page();
            }
            match page.header_get_root(name) {
                Some(root) => (root, false),
                None => {
                    if !page.header_insert_record(name, INVALID_PAGE_ID) {
                        drop(page);
                        bpm.unpin_page(HEADER_PAGE_ID, false);
                        return Err(EngineError::OutOfSpace);
                    }
                    (INVALID_PAGE_ID, true)
                }
            }
        };
        bpm.unpin_page(HEADER_PAGE_ID, dirty);

        Ok(Self {
            index_name: name.to_string(),
            bpm,
            comparator,
            root_page_id: AtomicU32::new(root),
            root_latch: Latch::new(),
            leaf_max_size: leaf_max,
            internal_max_size: internal_max,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K, mut txn: Option<&mut Transaction>) -> EngineResult<V> {
        let mut ctx = Context::new();
        self.lock_root(&mut ctx);
        if self.is_empty() {
            self.release_all(&mut ctx, false);
            return Err(EngineError::NotFound);
        }
        if let Err(e) = self.find_leaf(Some(key), Op::Search, &mut ctx) {
            self.release_all(&mut ctx, false);
            return Err(e);
        }
        self.note_page_set(&ctx, &mut txn);

        let result = {
            let page = ctx.latches.last().unwrap().1.page();
            node::leaf::lookup::<K, V, C>(page, key, &self.comparator).ok_or(EngineError::NotFound)
        };
        self.release_all(&mut ctx, false);
        self.clear_page_set(&mut txn);
        result
    }

    /// Inserts a unique key. `DuplicateKey` if it is already present.
    pub fn insert(&self, key: K, value: V, mut txn: Option<&mut Transaction>) -> EngineResult<()> {
        let mut ctx = Context::new();
        self.lock_root(&mut ctx);
        if self.is_empty() {
            let result = self.start_new_tree(key, value);
            self.release_all(&mut ctx, false);
            return result;
        }
        if let Err(e) = self.find_leaf(Some(&key), Op::Insert, &mut ctx) {
            self.release_all(&mut ctx, false);
            return Err(e);
        }
        self.note_page_set(&ctx, &mut txn);

        let result = self.insert_into_leaf(key, value, &mut ctx);
        let dirty = result.is_ok();
        self.release_all(&mut ctx, dirty);
        self.clear_page_set(&mut txn);
        result
    }

    /// Removes a key, rebalancing with borrow or merge as needed.
    pub fn remove(&self, key: &K, mut txn: Option<&mut Transaction>) -> EngineResult<()> {
        let mut ctx = Context::new();
        self.lock_root(&mut ctx);
        if self.is_empty() {
            self.release_all(&mut ctx, false);
            return Err(EngineError::NotFound);
        }
        if let Err(e) = self.find_leaf(Some(key), Op::Delete, &mut ctx) {
            self.release_all(&mut ctx, false);
            return Err(e);
        }
        self.note_page_set(&ctx, &mut txn);

        let result = self.remove_from_leaf(key, &mut ctx);
        let dirty = result.is_ok();
        self.release_all(&mut ctx, dirty);
        self.clear_page_set(&mut txn);
        result
    }

    /// Scan from the leftmost leaf.
    pub fn iter(&self) -> EngineResult<IndexIterator<K, V>> {
        self.descend_for_scan(None)
    }

    /// Scan from the first key `>= key`.
    pub fn iter_from(&self, key: &K) -> EngineResult<IndexIterator<K, V>> {
        self.descend_for_scan(Some(key))
    }

    fn descend_for_scan(&self, key: Option<&K>) -> EngineResult<IndexIterator<K, V>> {
        enum Step {
            Leaf(u32),
            Child(PageId),
        }

        let mut page_id = self.root_page_id.load(Ordering::SeqCst);
        if page_id == INVALID_PAGE_ID {
            return Ok(IndexIterator::empty(self.bpm.clone()));
        }
        loop {
            let frame = self.bpm.fetch_page(page_id)?;
            let step = {
                let page = frame.read();
                if page.page_type() == PageType::Leaf {
                    let index = match key {
                        Some(k) => node::leaf::key_index::<K, V, C>(&page, k, &self.comparator)
                            .unwrap_or(page.size()),
                        None => 0,
                    };
                    Step::Leaf(index)
                } else {
                    Step::Child(match key {
                        Some(k) => node::internal::lookup::<K, C>(&page, k, &self.comparator),
                        None => node::internal::child_at::<K>(&page, 0),
                    })
                }
            };
            match step {
                Step::Leaf(index) => {
                    return Ok(IndexIterator::new(self.bpm.clone(), frame, page_id, index));
                }
                Step::Child(child) => {
                    self.bpm.unpin_page(page_id, false);
                    page_id = child;
                }
            }
        }
    }

    fn lock_root(&self, ctx: &mut Context) {
        self.root_latch.wlock();
        ctx.root_held = true;
    }

    fn release_all(&self, ctx: &mut Context, dirty: bool) {
        for (page_id, latch) in ctx.latches.drain(..) {
            drop(latch);
            self.bpm.unpin_page(page_id, dirty);
        }
        if ctx.root_held {
            ctx.root_held = false;
            self.root_latch.wunlock();
        }
    }

    fn note_page_set(&self, ctx: &Context, txn: &mut Option<&mut Transaction>) {
        if let Some(txn) = txn.as_deref_mut() {
            txn.page_set = ctx.latches.iter().map(|(page_id, _)| *page_id).collect();
        }
    }

    fn clear_page_set(&self, txn: &mut Option<&mut Transaction>) {
        if let Some(txn) = txn.as_deref_mut() {
            txn.page_set.clear();
        }
    }

    /// Whether an operation of kind `op` on a node of this shape can still
    /// affect its ancestors.
    fn is_safe(&self, page: &crate::Page, op: Op) -> bool {
        match op {
            Op::Search => true,
            Op::Insert => page.size() < page.max_size(),
            Op::Delete => {
                if page.parent_page_id() == INVALID_PAGE_ID {
                    match page.page_type() {
                        PageType::Leaf => page.size() > 1,
                        _ => page.size() > 2,
                    }
                } else {
                    page.size() > node::min_size(page)
                }
            }
        }
    }

    /// Crabs from the root to the leaf responsible for `key` (leftmost leaf
    /// when `key` is `None`), leaving the latched path in `ctx`.
    fn find_leaf(&self, key: Option<&K>, op: Op, ctx: &mut Context) -> EngineResult<()> {
        debug_assert!(ctx.root_held);
        let mut page_id = self.root_page_id.load(Ordering::SeqCst);
        loop {
            let frame = self.bpm.fetch_page(page_id)?;
            let latch = match op {
                Op::Search => frame.rlatch(),
                Op::Insert | Op::Delete => frame.wlatch(),
            };

            let page_type = latch.page().page_type();
            if page_type != PageType::Leaf && page_type != PageType::Internal {
                drop(latch);
                self.bpm.unpin_page(page_id, false);
                return Err(EngineError::Corruption(format!(
                    "page {page_id} is not a b+tree page"
                )));
            }

            // The child is latched; ancestors can go as soon as it is safe.
            if self.is_safe(latch.page(), op) {
                self.release_all(ctx, false);
            }
            ctx.latches.push((page_id, latch));

            if page_type == PageType::Leaf {
                return Ok(());
            }
            let page = ctx.latches.last().unwrap().1.page();
            page_id = match key {
                Some(k) => node::internal::lookup::<K, C>(page, k, &self.comparator),
                None => node::internal::child_at::<K>(page, 0),
            };
        }
    }

    fn start_new_tree(&self, key: K, value: V) -> EngineResult<()> {
        let frame = self.bpm.new_page()?;
        let page_id = frame.read().id;
        {
            let mut page = frame.write();
            node::leaf::init::<K, V>(&mut page, page_id, INVALID_PAGE_ID, self.leaf_max_size);
            node::leaf::insert::<K, V, C>(&mut page, key, value, &self.comparator)?;
        }
        self.bpm.unpin_page(page_id, true);
        self.set_root_page_id(page_id)
    }

    fn insert_into_leaf(&self, key: K, value: V, ctx: &mut Context) -> EngineResult<()> {
        let (new_size, max_size) = {
            let (_, latch) = ctx.latches.last_mut().unwrap();
            let page = latch.page_mut();
            let new_size = node::leaf::insert::<K, V, C>(page, key, value, &self.comparator)?;
            (new_size, page.max_size())
        };
        if new_size <= max_size {
            return Ok(());
        }
        self.split_leaf(ctx)
    }

    fn split_leaf(&self, ctx: &mut Context) -> EngineResult<()> {
        let new_frame = self.bpm.new_page()?;
        let new_page_id = new_frame.read().id;
        let mut right = new_frame.wlatch();

        let (left_page_id, separator) = {
            let (left_page_id, left_latch) = ctx.latches.last_mut().unwrap();
            let left = left_latch.page_mut();
            node::leaf::init::<K, V>(
                right.page_mut(),
                new_page_id,
                left.parent_page_id(),
                self.leaf_max_size,
            );
            node::leaf::move_half_to::<K, V>(left, right.page_mut());
            (*left_page_id, node::leaf::key_at::<K, V>(right.page(), 0))
        };

        let result =
            self.insert_into_parent(ctx, left_page_id, separator, new_page_id, &mut right);
        drop(right);
        self.bpm.unpin_page(new_page_id, true);
        result
    }

    /// Wires a freshly-split `(left, right)` pair into the parent, splitting
    /// upward as long as parents overflow. `right` is still write-latched by
    /// the caller.
    fn insert_into_parent(
        &self,
        ctx: &mut Context,
        left_page_id: PageId,
        key: K,
        right_page_id: PageId,
        right: &mut PageLatch,
    ) -> EngineResult<()> {
        if ctx.latches.len() == 1 {
            // `left` was the root: grow the tree by one level.
            let root_frame = self.bpm.new_page()?;
            let root_page_id = root_frame.read().id;
            {
                let mut root = root_frame.write();
                node::internal::init::<K>(
                    &mut root,
                    root_page_id,
                    INVALID_PAGE_ID,
                    self.internal_max_size,
                );
                node::internal::populate_new_root::<K>(
                    &mut root,
                    left_page_id,
                    key,
                    right_page_id,
                );
            }
            self.bpm.unpin_page(root_page_id, true);

            ctx.latches
                .last_mut()
                .unwrap()
                .1
                .page_mut()
                .set_parent_page_id(root_page_id);
            right.page_mut().set_parent_page_id(root_page_id);
            return self.set_root_page_id(root_page_id);
        }

        let parent_index = ctx.latches.len() - 2;
        let (parent_page_id, new_size, max_size) = {
            let (parent_page_id, parent_latch) = &mut ctx.latches[parent_index];
            let parent = parent_latch.page_mut();
            let new_size =
                node::internal::insert_node_after::<K>(parent, left_page_id, key, right_page_id)?;
            (*parent_page_id, new_size, parent.max_size())
        };
        if new_size <= max_size {
            return Ok(());
        }

        // Parent overflow: split it and push the middle entry up.
        let new_frame = self.bpm.new_page()?;
        let new_page_id = new_frame.read().id;
        let mut new_right = new_frame.wlatch();

        let (push_key, moved_children) = {
            let (_, parent_latch) = &mut ctx.latches[parent_index];
            let parent = parent_latch.page_mut();
            node::internal::init::<K>(
                new_right.page_mut(),
                new_page_id,
                parent.parent_page_id(),
                self.internal_max_size,
            );
            node::internal::move_half_to::<K>(parent, new_right.page_mut())
        };
        for child in &moved_children {
            self.set_parent_of(
                ctx,
                &mut [(right_page_id, &mut *right), (new_page_id, &mut new_right)],
                *child,
                new_page_id,
            )?;
        }

        // The level below is fully wired; release it before recursing.
        let (done_page_id, done_latch) = ctx.latches.pop().unwrap();
        drop(done_latch);
        self.bpm.unpin_page(done_page_id, true);

        let result =
            self.insert_into_parent(ctx, parent_page_id, push_key, new_page_id, &mut new_right);
        drop(new_right);
        self.bpm.unpin_page(new_page_id, true);
        result
    }

    /// Updates a child's cached parent pointer, writing through an already
    /// held latch when the child is on the latched path.
    fn set_parent_of(
        &self,
        ctx: &mut Context,
        extras: &mut [(PageId, &mut PageLatch)],
        child: PageId,
        parent: PageId,
    ) -> EngineResult<()> {
        if let Some((_, latch)) = ctx.latches.iter_mut().find(|(id, _)| *id == child) {
            latch.page_mut().set_parent_page_id(parent);
            return Ok(());
        }
        for (id, latch) in extras.iter_mut() {
            if *id == child {
                latch.page_mut().set_parent_page_id(parent);
                return Ok(());
            }
        }
        let frame = self.bpm.fetch_page(child)?;
        frame.write().set_parent_page_id(parent);
        self.bpm.unpin_page(child, true);
        Ok(())
    }

    fn remove_from_leaf(&self, key: &K, ctx: &mut Context) -> EngineResult<()> {
        let (new_size, min_size, is_root) = {
            let (_, latch) = ctx.latches.last_mut().unwrap();
            let page = latch.page_mut();
            let new_size = node::leaf::remove_record::<K, V, C>(page, key, &self.comparator)?;
            (
                new_size,
                node::min_size(page),
                page.parent_page_id() == INVALID_PAGE_ID,
            )
        };
        if is_root {
            return self.adjust_root(ctx);
        }
        if new_size < min_size {
            return self.coalesce_or_redistribute(ctx);
        }
        Ok(())
    }

    /// Fixes the underflowing node at the top of `ctx` by borrowing from a
    /// sibling or merging with it, recursing into the parent as merges
    /// propagate.
    fn coalesce_or_redistribute(&self, ctx: &mut Context) -> EngineResult<()> {
        if ctx.latches.len() == 1 {
            return self.adjust_root(ctx);
        }
        let node_index = ctx.latches.len() - 1;
        let node_page_id = ctx.latches[node_index].0;

        // Prefer the left sibling; fall back to the right at slot 0.
        let (separator_index, sibling_page_id, sibling_on_left) = {
            let parent = ctx.latches[node_index - 1].1.page();
            let index = node::internal::value_index::<K>(parent, node_page_id).ok_or_else(|| {
                EngineError::Corruption(format!(
                    "page {node_page_id} missing from its parent's child array"
                ))
            })?;
            if index > 0 {
                (index, node::internal::child_at::<K>(parent, index - 1), true)
            } else {
                (
                    index,
                    node::internal::child_at::<K>(parent, index + 1),
                    false,
                )
            }
        };

        let sibling_frame = self.bpm.fetch_page(sibling_page_id)?;
        let mut sibling = sibling_frame.wlatch();

        let (node_size, node_max, is_leaf) = {
            let page = ctx.latches[node_index].1.page();
            (
                page.size(),
                page.max_size(),
                page.page_type() == PageType::Leaf,
            )
        };

        if sibling.page().size() + node_size > node_max {
            // Redistribute one entry through the parent separator.
            let moved_child = {
                let (head, tail) = ctx.latches.split_at_mut(node_index);
                let parent = head.last_mut().unwrap().1.page_mut();
                let node = tail[0].1.page_mut();
                let sib = sibling.page_mut();

                if sibling_on_left {
                    if is_leaf {
                        let new_sep = node::leaf::move_last_to_front_of::<K, V>(sib, node);
                        node::internal::set_key_at::<K>(parent, separator_index, new_sep);
                        None
                    } else {
                        let sep = node::internal::key_at::<K>(parent, separator_index);
                        let (new_sep, moved) =
                            node::internal::move_last_to_front_of::<K>(sib, node, sep);
                        node::internal::set_key_at::<K>(parent, separator_index, new_sep);
                        Some(moved)
                    }
                } else {
                    let sibling_index = separator_index + 1;
                    if is_leaf {
                        let new_sep = node::leaf::move_first_to_end_of::<K, V>(sib, node);
                        node::internal::set_key_at::<K>(parent, sibling_index, new_sep);
                        None
                    } else {
                        let sep = node::internal::key_at::<K>(parent, sibling_index);
                        let (new_sep, moved) =
                            node::internal::move_first_to_end_of::<K>(sib, node, sep);
                        node::internal::set_key_at::<K>(parent, sibling_index, new_sep);
                        Some(moved)
                    }
                }
            };
            if let Some(child) = moved_child {
                self.set_parent_of(
                    ctx,
                    &mut [(sibling_page_id, &mut sibling)],
                    child,
                    node_page_id,
                )?;
            }
            drop(sibling);
            self.bpm.unpin_page(sibling_page_id, true);
            return Ok(());
        }

        // Merge the right node into the left and drop the separator.
        let (left_page_id, right_page_id, right_index, node_is_right) = if sibling_on_left {
            (sibling_page_id, node_page_id, separator_index, true)
        } else {
            (node_page_id, sibling_page_id, separator_index + 1, false)
        };

        let moved_children = {
            let (head, tail) = ctx.latches.split_at_mut(node_index);
            let parent = head.last_mut().unwrap().1.page_mut();
            let node = tail[0].1.page_mut();
            let sib = sibling.page_mut();
            let (left, right) = if node_is_right { (sib, node) } else { (node, sib) };

            let moved = if is_leaf {
                node::leaf::move_all_to::<K, V>(right, left);
                Vec::new()
            } else {
                let sep = node::internal::key_at::<K>(parent, right_index);
                node::internal::move_all_to::<K>(right, left, sep)
            };
            node::internal::remove::<K>(parent, right_index);
            moved
        };
        for child in &moved_children {
            self.set_parent_of(
                ctx,
                &mut [(sibling_page_id, &mut sibling)],
                *child,
                left_page_id,
            )?;
        }

        let (popped_page_id, popped_latch) = ctx.latches.pop().unwrap();
        debug_assert_eq!(popped_page_id, node_page_id);
        drop(popped_latch);
        drop(sibling);
        self.bpm.unpin_page(node_page_id, true);
        self.bpm.unpin_page(sibling_page_id, true);
        // Deallocation can be declined if a scan still pins the page; the
        // page is unreachable from the tree either way.
        let _ = self.bpm.delete_page(right_page_id)?;

        let (parent_underflows, parent_is_root) = {
            let parent = ctx.latches.last().unwrap().1.page();
            (
                parent.size() < node::min_size(parent),
                parent.parent_page_id() == INVALID_PAGE_ID,
            )
        };
        if parent_is_root {
            return self.adjust_root(ctx);
        }
        if parent_underflows {
            return self.coalesce_or_redistribute(ctx);
        }
        Ok(())
    }

    /// Shrinks the tree at the root: an empty leaf root clears the index, an
    /// internal root with a single child promotes that child.
    fn adjust_root(&self, ctx: &mut Context) -> EngineResult<()> {
        enum RootAction {
            Keep,
            Clear,
            Promote(PageId),
        }

        debug_assert_eq!(ctx.latches.len(), 1);
        let (root_page_id, action) = {
            let (page_id, latch) = ctx.latches.last().unwrap();
            let page = latch.page();
            let action = match page.page_type() {
                PageType::Leaf if page.size() == 0 => RootAction::Clear,
                PageType::Internal if page.size() == 1 => {
                    RootAction::Promote(node::internal::child_at::<K>(page, 0))
                }
                _ => RootAction::Keep,
            };
            (*page_id, action)
        };

        match action {
            RootAction::Keep => Ok(()),
            RootAction::Clear => {
                self.set_root_page_id(INVALID_PAGE_ID)?;
                self.drop_root_page(ctx, root_page_id)
            }
            RootAction::Promote(child) => {
                let frame = self.bpm.fetch_page(child)?;
                frame.write().set_parent_page_id(INVALID_PAGE_ID);
                self.bpm.unpin_page(child, true);
                self.set_root_page_id(child)?;
                self.drop_root_page(ctx, root_page_id)
            }
        }
    }

    fn drop_root_page(&self, ctx: &mut Context, root_page_id: PageId) -> EngineResult<()> {
        let (page_id, latch) = ctx.latches.pop().unwrap();
        debug_assert_eq!(page_id, root_page_id);
        drop(latch);
        self.bpm.unpin_page(root_page_id, true);
        let _ = self.bpm.delete_page(root_page_id)?;
        Ok(())
    }

    /// Persists a root change into the index-roots page.
    fn set_root_page_id(&self, new_root: PageId) -> EngineResult<()> {
        self.root_page_id.store(new_root, Ordering::SeqCst);
        let frame = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = frame.write();
            if !page.header_update_record(&self.index_name, new_root) {
                page.header_insert_record(&self.index_name, new_root);
            }
        }
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }
}
