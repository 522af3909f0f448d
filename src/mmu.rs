//! Allocation table and per-page state
//!
//! Every allocation is described by an allocation-table entry (ATE) embedded
//! in the header pages of its own anonymous mapping, followed by the
//! application pages and a per-page flag vector. The table links live ATEs
//! into an intrusive doubly-linked list and resolves faulting addresses back
//! to their entry.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bitflags::bitflags;
use volatile::Volatile;

use crate::error::Result;
use crate::lock::Lock;

bitflags! {
    /// Per-page status byte.
    pub struct PageFlags: u8 {
        /// The page has contents on disk and must be filled from the
        /// backing file on its next fault; zero fill is forbidden.
        const ZFILL = 1 << 0;
        /// The page is not resident (protection is none).
        const RSDNT = 1 << 1;
        /// The page has been written since the last clear or evict.
        const DIRTY = 1 << 2;
        /// The page is not charged against the process budget.
        const CHRGD = 1 << 3;
    }
}

/// Allocation-table entry.
///
/// Lives at the start of its allocation's mapping; `flags` points at the
/// flag vector in the same mapping. All fields other than the list links
/// are guarded by `lock`; the links are guarded by the table lock.
#[repr(C)]
pub struct Ate {
    /// Application pages in the allocation.
    pub n_pages: usize,
    /// Pages with `RSDNT` clear.
    pub l_pages: usize,
    /// Pages with `CHRGD` clear.
    pub c_pages: usize,
    /// Pages with `DIRTY` set.
    pub d_pages: usize,
    /// Address of the first application byte.
    pub base: usize,
    /// Per-page flag vector.
    pub flags: *mut Volatile<u8>,
    prev: *mut Ate,
    next: *mut Ate,
    /// Guards the mutable fields above.
    pub lock: Lock,
}

impl Ate {
    /// Initialize an entry in place at the head of its mapping.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of one `Ate`, `flags` must point at
    /// an `n_pages`-byte vector in the same mapping, and the slot must not
    /// already hold a live entry.
    pub unsafe fn init_at(
        slot: *mut Ate,
        n_pages: usize,
        l_pages: usize,
        c_pages: usize,
        base: usize,
        flags: *mut Volatile<u8>,
    ) -> Result<()> {
        core::ptr::addr_of_mut!((*slot).n_pages).write(n_pages);
        core::ptr::addr_of_mut!((*slot).l_pages).write(l_pages);
        core::ptr::addr_of_mut!((*slot).c_pages).write(c_pages);
        core::ptr::addr_of_mut!((*slot).d_pages).write(0);
        core::ptr::addr_of_mut!((*slot).base).write(base);
        core::ptr::addr_of_mut!((*slot).flags).write(flags);
        core::ptr::addr_of_mut!((*slot).prev).write(core::ptr::null_mut());
        core::ptr::addr_of_mut!((*slot).next).write(core::ptr::null_mut());
        Lock::init_at(core::ptr::addr_of_mut!((*slot).lock))
    }

    /// Read page `ip`'s flag byte.
    ///
    /// # Safety
    ///
    /// `ip < n_pages` and `flags` must point at a live vector.
    #[inline]
    pub unsafe fn flag(&self, ip: usize) -> PageFlags {
        PageFlags::from_bits_truncate((*self.flags.add(ip)).read())
    }

    /// Overwrite page `ip`'s flag byte.
    ///
    /// # Safety
    ///
    /// As for [`Ate::flag`]; the caller must hold the ATE lock.
    #[inline]
    pub unsafe fn set_flag(&self, ip: usize, value: PageFlags) {
        (*self.flags.add(ip)).write(value.bits());
    }

    /// Set the bits of `add` in page `ip`'s flag byte.
    ///
    /// # Safety
    ///
    /// As for [`Ate::set_flag`].
    #[inline]
    pub unsafe fn or_flag(&self, ip: usize, add: PageFlags) {
        let cur = (*self.flags.add(ip)).read();
        (*self.flags.add(ip)).write(cur | add.bits());
    }

    /// Clear the bits of `remove` in page `ip`'s flag byte.
    ///
    /// # Safety
    ///
    /// As for [`Ate::set_flag`].
    #[inline]
    pub unsafe fn clear_flag(&self, ip: usize, remove: PageFlags) {
        let cur = (*self.flags.add(ip)).read();
        (*self.flags.add(ip)).write(cur & !remove.bits());
    }

    /// Whether `[base, base + n_pages * page_size)` contains `addr`.
    #[inline]
    pub fn contains(&self, addr: usize, page_size: usize) -> bool {
        addr >= self.base && addr < self.base + self.n_pages * page_size
    }
}

/// Pages occupied by the ATE header at the front of a mapping.
#[inline]
pub fn header_pages(page_size: usize) -> usize {
    1 + (core::mem::size_of::<Ate>() - 1) / page_size
}

/// Pages occupied by the flag vector of an `n_pages` allocation.
#[inline]
pub fn flag_pages(n_pages: usize, page_size: usize) -> usize {
    1 + (n_pages - 1) / page_size
}

/// The process's allocation table.
///
/// Entries are head-inserted; lookup is a linear scan. `lookup` hands off
/// from the table lock to the entry lock before returning, so a returned
/// entry cannot be freed out from under the caller by a concurrent
/// `invalidate`.
pub struct AllocTable {
    head: AtomicPtr<Ate>,
    page_size: AtomicUsize,
    lock: Lock,
}

unsafe impl Send for AllocTable {}
unsafe impl Sync for AllocTable {}

impl AllocTable {
    pub fn new() -> Result<Self> {
        Ok(AllocTable {
            head: AtomicPtr::new(core::ptr::null_mut()),
            page_size: AtomicUsize::new(0),
            lock: Lock::new()?,
        })
    }

    /// Record the configured page size and reset the list.
    pub fn init(&self, page_size: usize) {
        self.page_size.store(page_size, Ordering::Relaxed);
        self.head.store(core::ptr::null_mut(), Ordering::Relaxed);
    }

    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed)
    }

    /// Acquire the table lock for a whole-table walk.
    pub fn acquire(&self) -> Result<()> {
        self.lock.acquire()
    }

    /// Release the table lock.
    pub fn release(&self) -> Result<()> {
        self.lock.release()
    }

    /// First entry of the list. Caller must hold the table lock.
    pub fn first(&self) -> *mut Ate {
        self.head.load(Ordering::Relaxed)
    }

    /// Successor of `ate`. Caller must hold the table lock.
    ///
    /// # Safety
    ///
    /// `ate` must be a live entry of this table.
    pub unsafe fn next(&self, ate: *mut Ate) -> *mut Ate {
        (*ate).next
    }

    /// Head-insert `ate`.
    ///
    /// # Safety
    ///
    /// `ate` must point at an initialized entry not currently in any table.
    pub unsafe fn insert(&self, ate: *mut Ate) -> Result<()> {
        self.lock.acquire()?;

        let head = self.head.load(Ordering::Relaxed);
        (*ate).prev = core::ptr::null_mut();
        (*ate).next = head;
        if !head.is_null() {
            (*head).prev = ate;
        }
        self.head.store(ate, Ordering::Relaxed);

        self.lock.release()
    }

    /// Unlink `ate`.
    ///
    /// # Safety
    ///
    /// `ate` must be a live entry of this table.
    pub unsafe fn invalidate(&self, ate: *mut Ate) -> Result<()> {
        self.lock.acquire()?;

        let prev = (*ate).prev;
        let next = (*ate).next;
        if prev.is_null() {
            self.head.store(next, Ordering::Relaxed);
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*ate).prev = core::ptr::null_mut();
        (*ate).next = core::ptr::null_mut();

        self.lock.release()
    }

    /// Find the entry whose application range contains `addr`.
    ///
    /// On `Ok(Some(ate))` the entry's lock is held and the caller must
    /// release it. `Ok(None)` means no entry covers `addr`; lock failures
    /// are reported separately.
    pub fn lookup(&self, addr: usize) -> Result<Option<*mut Ate>> {
        let page_size = self.page_size();

        self.lock.acquire()?;

        let mut ate = self.head.load(Ordering::Relaxed);
        while !ate.is_null() {
            let entry = unsafe { &*ate };
            if entry.contains(addr, page_size) {
                break;
            }
            ate = entry.next;
        }

        if ate.is_null() {
            self.lock.release()?;
            return Ok(None);
        }

        // Take the entry lock before letting go of the table lock so a
        // concurrent invalidate cannot free the entry in between.
        if let Err(err) = unsafe { (*ate).lock.acquire() } {
            let _ = self.lock.release();
            return Err(err);
        }
        self.lock.release()?;

        Ok(Some(ate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a heap-backed entry that stands in for one embedded in a
    // mapping.
    fn make_ate(base: usize, n_pages: usize) -> *mut Ate {
        let flags = vec![0u8; n_pages].into_boxed_slice();
        let flags = Box::into_raw(flags) as *mut Volatile<u8>;
        let ate = Box::new(Ate {
            n_pages,
            l_pages: 0,
            c_pages: 0,
            d_pages: 0,
            base,
            flags,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            lock: Lock::new().unwrap(),
        });
        Box::into_raw(ate)
    }

    unsafe fn drop_ate(ate: *mut Ate, n_pages: usize) {
        let flags = (*ate).flags as *mut u8;
        drop(Box::from_raw(core::slice::from_raw_parts_mut(flags, n_pages)));
        drop(Box::from_raw(ate));
    }

    const PAGE: usize = 4096;

    #[test]
    fn lookup_finds_covering_entry() {
        let table = AllocTable::new().unwrap();
        table.init(PAGE);

        let a = make_ate(0x1000_0000, 4);
        let b = make_ate(0x2000_0000, 2);
        unsafe {
            table.insert(a).unwrap();
            table.insert(b).unwrap();
        }

        let hit = table.lookup(0x1000_0000 + 3 * PAGE).unwrap().unwrap();
        assert_eq!(hit, a);
        unsafe { (*hit).lock.release().unwrap() };

        let hit = table.lookup(0x2000_0000 + PAGE + 17).unwrap().unwrap();
        assert_eq!(hit, b);
        unsafe { (*hit).lock.release().unwrap() };

        // One past the end of `a` is not covered.
        assert!(table.lookup(0x1000_0000 + 4 * PAGE).unwrap().is_none());

        unsafe {
            table.invalidate(a).unwrap();
            table.invalidate(b).unwrap();
            drop_ate(a, 4);
            drop_ate(b, 2);
        }
    }

    #[test]
    fn head_insertion_orders_iteration() {
        let table = AllocTable::new().unwrap();
        table.init(PAGE);

        let a = make_ate(0x1000_0000, 1);
        let b = make_ate(0x2000_0000, 1);
        let c = make_ate(0x3000_0000, 1);
        unsafe {
            table.insert(a).unwrap();
            table.insert(b).unwrap();
            table.insert(c).unwrap();
        }

        table.acquire().unwrap();
        let mut order = Vec::new();
        let mut cur = table.first();
        while !cur.is_null() {
            order.push(cur);
            cur = unsafe { table.next(cur) };
        }
        table.release().unwrap();
        assert_eq!(order, vec![c, b, a]);

        unsafe {
            table.invalidate(b).unwrap();
        }
        table.acquire().unwrap();
        let mut order = Vec::new();
        let mut cur = table.first();
        while !cur.is_null() {
            order.push(cur);
            cur = unsafe { table.next(cur) };
        }
        table.release().unwrap();
        assert_eq!(order, vec![c, a]);

        unsafe {
            table.invalidate(c).unwrap();
            table.invalidate(a).unwrap();
            drop_ate(a, 1);
            drop_ate(b, 1);
            drop_ate(c, 1);
        }
    }

    #[test]
    fn lookup_returns_locked_entry() {
        let table = AllocTable::new().unwrap();
        table.init(PAGE);

        let a = make_ate(0x4000_0000, 1);
        unsafe { table.insert(a).unwrap() };

        let hit = table.lookup(0x4000_0000).unwrap().unwrap();
        // The lock is recursive, so re-acquiring on this thread succeeds;
        // the pairing below must balance both acquisitions.
        unsafe {
            (*hit).lock.acquire().unwrap();
            (*hit).lock.release().unwrap();
            (*hit).lock.release().unwrap();
            table.invalidate(a).unwrap();
            drop_ate(a, 1);
        }
    }

    #[test]
    fn flag_accessors() {
        let a = make_ate(0x5000_0000, 3);
        unsafe {
            assert_eq!((*a).flag(0), PageFlags::empty());
            (*a).set_flag(0, PageFlags::RSDNT | PageFlags::CHRGD);
            assert_eq!((*a).flag(0), PageFlags::RSDNT | PageFlags::CHRGD);
            (*a).or_flag(0, PageFlags::ZFILL);
            (*a).clear_flag(0, PageFlags::CHRGD);
            assert_eq!((*a).flag(0), PageFlags::RSDNT | PageFlags::ZFILL);
            // Neighbors are untouched.
            assert_eq!((*a).flag(1), PageFlags::empty());
            drop_ate(a, 3);
        }
    }

    #[test]
    fn geometry_helpers() {
        assert_eq!(header_pages(4096), 1);
        assert_eq!(flag_pages(1, 4096), 1);
        assert_eq!(flag_pages(4096, 4096), 1);
        assert_eq!(flag_pages(4097, 4096), 2);
    }
}
