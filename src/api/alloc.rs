//! Allocation lifecycle
//!
//! An allocation is one anonymous mapping of header, application, and
//! flag-vector pages, one allocation-table entry embedded in the header,
//! and one backing file on the scratch filesystem. The three are created
//! and destroyed together; any failure mid-construction unwinds in reverse
//! order so the IPC accounting and the filesystem are left as found.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use volatile::Volatile;

use crate::error::{fatal, Error, Result};
use crate::mmu::{flag_pages, header_pages, Ate, PageFlags};
use crate::opts::Opts;
use crate::vmm::{Stats, Vmm, VMM};

use super::extra::state_check;

/// System pages an allocation of this geometry charges at creation.
fn creation_charge(vmm: &Vmm, s_pages: usize, n_pages: usize, f_pages: usize) -> usize {
    let opts = vmm.opts();
    let pages = if opts.contains(Opts::METACH) {
        if opts.contains(Opts::RSDNT) {
            s_pages + n_pages + f_pages
        } else {
            s_pages + f_pages
        }
    } else if opts.contains(Opts::RSDNT) {
        n_pages
    } else {
        0
    };
    vmm.to_sys(pages)
}

fn map_flags(vmm: &Vmm) -> MapFlags {
    let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE;
    if vmm.opts().contains(Opts::MLOCK) {
        flags |= MapFlags::MAP_LOCKED;
    }
    flags
}

fn remove_backing(name: &str) -> Result<()> {
    match std::fs::remove_file(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Io(nix::errno::Errno::from_raw(
            err.raw_os_error().unwrap_or(libc::EIO),
        ))),
    }
}

/// Allocate `size` bytes of storage-backed memory.
///
/// The returned pointer addresses the application pages; the ATE and flag
/// vector live in the same mapping around them. Initial residency follows
/// the `RSDNT` option.
///
/// # Safety
///
/// The returned region is raw memory managed by the fault handler; the
/// caller must not let it outlive [`crate::destroy`] and must release it
/// through [`free`] or [`realloc`] only.
pub unsafe fn malloc(size: usize) -> Result<NonNull<u8>> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    if size == 0 {
        return Err(Error::Invalid);
    }
    state_check(vmm);

    let page_size = vmm.page_size();
    let s_pages = header_pages(page_size);
    let n_pages = 1 + (size - 1) / page_size;
    let f_pages = flag_pages(n_pages, page_size);
    let total = (s_pages + n_pages + f_pages) * page_size;
    let rsdnt = vmm.opts().contains(Opts::RSDNT);

    let charge = creation_charge(vmm, s_pages, n_pages, f_pages);
    vmm.ipc.madmit(charge, vmm.opts().contains(Opts::ADMITD))?;

    let uncharge = |err: Error| -> Error {
        if vmm.ipc.mevict(charge, 0).is_err() {
            fatal("malloc unwind", err);
        }
        err
    };

    let addr = match mmap_anonymous(
        None,
        NonZeroUsize::new(total).ok_or(Error::Invalid)?,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        map_flags(vmm),
    ) {
        Ok(addr) => addr.as_ptr() as usize,
        Err(errno) => return Err(uncharge(errno.into())),
    };
    let unmap = |err: Error| -> Error {
        let undone = unsafe {
            munmap(
                NonNull::new_unchecked(addr as *mut libc::c_void),
                total,
            )
        };
        if undone.is_err() {
            fatal("malloc unwind", err);
        }
        uncharge(err)
    };

    // Resident-default takes read protection so the first write costs one
    // fault, not two; evict-default takes none so nothing is admitted until
    // first touch.
    let app = addr + s_pages * page_size;
    let app_prot = if rsdnt {
        ProtFlags::PROT_READ
    } else {
        ProtFlags::PROT_NONE
    };
    if let Err(errno) = mprotect(
        NonNull::new_unchecked(app as *mut libc::c_void),
        n_pages * page_size,
        app_prot,
    ) {
        return Err(unmap(errno.into()));
    }

    let ate = addr as *mut Ate;
    let name = vmm.backing_name(ate);
    if let Err(err) = create_backing(&name) {
        return Err(unmap(err));
    }

    let flags = (addr + (s_pages + n_pages) * page_size) as *mut Volatile<u8>;
    let (l_pages, c_pages) = if rsdnt { (n_pages, n_pages) } else { (0, 0) };
    if let Err(err) = Ate::init_at(ate, n_pages, l_pages, c_pages, app, flags) {
        let _ = remove_backing(&name);
        return Err(unmap(err));
    }
    if !rsdnt {
        for ip in 0..n_pages {
            (*ate).set_flag(ip, PageFlags::CHRGD | PageFlags::RSDNT);
        }
    }

    if let Err(err) = vmm.mmu.insert(ate) {
        let _ = remove_backing(&name);
        return Err(unmap(err));
    }

    Stats::add(
        &vmm.stats.pages_alloc,
        vmm.to_sys(s_pages + n_pages + f_pages),
    );

    state_check(vmm);
    Ok(NonNull::new_unchecked(app as *mut u8))
}

fn create_backing(name: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(name)
        .map(drop)
        .map_err(|err| {
            Error::Io(nix::errno::Errno::from_raw(
                err.raw_os_error().unwrap_or(libc::EIO),
            ))
        })
}

/// Allocate zero-initialized storage for `num` elements of `size` bytes.
///
/// Fresh SBMA pages read as zero by construction, so this adds only the
/// overflow check over [`malloc`].
///
/// # Safety
///
/// As for [`malloc`].
pub unsafe fn calloc(num: usize, size: usize) -> Result<NonNull<u8>> {
    let bytes = num.checked_mul(size).ok_or(Error::Invalid)?;
    malloc(bytes)
}

/// Release an allocation: unlink its backing file, retire its table entry,
/// unmap it, and credit the IPC region. Cleanup continues past individual
/// failures; the first error is reported after everything reachable has
/// been released.
///
/// # Safety
///
/// `ptr` must be the pointer returned by [`malloc`]/[`realloc`] and must
/// not be used afterwards. No other thread may touch the allocation.
pub unsafe fn free(ptr: *mut u8) -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    let page_size = vmm.page_size();
    let s_pages = header_pages(page_size);
    let addr = ptr as usize;

    let ate = vmm.mmu.lookup(addr)?.ok_or(Error::Invalid)?;
    if (*ate).base != addr {
        (*ate).lock.release()?;
        return Err(Error::Invalid);
    }
    (*ate).lock.release()?;

    let mut first_err: Option<Error> = None;
    let mut note = |result: Result<()>| {
        if let Err(err) = result {
            first_err.get_or_insert(err);
        }
    };

    // Unlink from the table first: once the entry is unreachable, a
    // concurrent admission signal can no longer evict it between the
    // counter snapshot below and the IPC credit.
    note(vmm.mmu.invalidate(ate));

    let n_pages = (*ate).n_pages;
    let c_pages = (*ate).c_pages;
    let d_pages = (*ate).d_pages;
    let f_pages = flag_pages(n_pages, page_size);
    let total = (s_pages + n_pages + f_pages) * page_size;

    note(remove_backing(&vmm.backing_name(ate)));
    note((*ate).lock.destroy());
    note(
        munmap(NonNull::new_unchecked(ate as *mut libc::c_void), total)
            .map_err(Error::from),
    );

    let credit = if vmm.opts().contains(Opts::METACH) {
        vmm.to_sys(s_pages + c_pages + f_pages)
    } else {
        vmm.to_sys(c_pages)
    };
    note(vmm.ipc.mevict(credit, vmm.to_sys(d_pages)));

    Stats::sub(
        &vmm.stats.pages_alloc,
        vmm.to_sys(s_pages + n_pages + f_pages),
    );

    state_check(vmm);
    first_err.map_or(Ok(()), Err)
}

/// Resize an allocation in place or by moving it.
///
/// Shrinking trims the tail and credits the freed pages; growing admits
/// the new pages, `mremap`s the mapping, relocates the flag vector, and
/// renames the backing file if the mapping moved. A failure after the
/// `mremap` has committed is unrecoverable and aborts.
///
/// # Safety
///
/// As for [`free`]; on success the old pointer is invalid if the mapping
/// moved.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    if size == 0 {
        return Err(Error::Invalid);
    }
    state_check(vmm);

    let page_size = vmm.page_size();
    let s_pages = header_pages(page_size);
    let addr = ptr as usize;

    let ate = vmm.mmu.lookup(addr)?.ok_or(Error::Invalid)?;
    if (*ate).base != addr {
        (*ate).lock.release()?;
        return Err(Error::Invalid);
    }
    let on_pages = (*ate).n_pages;
    let of_pages = flag_pages(on_pages, page_size);

    let nn_pages = 1 + (size - 1) / page_size;
    let nf_pages = flag_pages(nn_pages, page_size);

    // Shrinking keeps the entry lock: it mutates counters and flags while
    // the entry stays visible in the table. Growing must give it up before
    // unlinking the entry, or a concurrent lookup's table-to-entry lock
    // handoff could deadlock against the unlink.
    let result = if nn_pages == on_pages {
        (*ate).lock.release()?;
        Ok(NonNull::new_unchecked(ptr))
    } else if nn_pages < on_pages {
        let result = shrink(vmm, ate, s_pages, on_pages, of_pages, nn_pages, nf_pages);
        (*ate).lock.release()?;
        result
    } else {
        (*ate).lock.release()?;
        grow(vmm, ate, s_pages, on_pages, of_pages, nn_pages, nf_pages)
    };

    state_check(vmm);
    result
}

unsafe fn shrink(
    vmm: &Vmm,
    ate: *mut Ate,
    s_pages: usize,
    on_pages: usize,
    of_pages: usize,
    nn_pages: usize,
    nf_pages: usize,
) -> Result<NonNull<u8>> {
    let page_size = vmm.page_size();
    let oaddr = ate as usize;

    let oc_pages = (*ate).c_pages;
    let od_pages = (*ate).d_pages;

    // Retire the tail pages from the entry's counters.
    (*ate).n_pages = nn_pages;
    for ip in nn_pages..on_pages {
        let flag = (*ate).flag(ip);
        if !flag.contains(PageFlags::RSDNT) {
            debug_assert!((*ate).l_pages > 0);
            (*ate).l_pages -= 1;
        }
        if !flag.contains(PageFlags::CHRGD) {
            debug_assert!((*ate).c_pages > 0);
            (*ate).c_pages -= 1;
        }
        if flag.contains(PageFlags::DIRTY) {
            debug_assert!((*ate).d_pages > 0);
            (*ate).d_pages -= 1;
        }
    }

    // The flag vector moves forward; its new home needs write access first.
    let new_flags = oaddr + (s_pages + nn_pages) * page_size;
    mprotect(
        NonNull::new_unchecked(new_flags as *mut libc::c_void),
        nf_pages * page_size,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    )?;
    if vmm.opts().contains(Opts::MLOCK) {
        nix::sys::mman::mlock(
            NonNull::new_unchecked(new_flags as *mut libc::c_void),
            nf_pages * page_size,
        )?;
    }
    let old_flags = oaddr + (s_pages + on_pages) * page_size;
    core::ptr::copy(
        old_flags as *const u8,
        new_flags as *mut u8,
        nf_pages * page_size,
    );
    (*ate).flags = new_flags as *mut Volatile<u8>;

    let tail = oaddr + (s_pages + nn_pages + nf_pages) * page_size;
    let tail_pages = (on_pages - nn_pages) + (of_pages - nf_pages);
    munmap(
        NonNull::new_unchecked(tail as *mut libc::c_void),
        tail_pages * page_size,
    )?;

    let c_delta = oc_pages - (*ate).c_pages;
    let d_delta = od_pages - (*ate).d_pages;
    let flag_credit = if vmm.opts().contains(Opts::METACH) {
        of_pages - nf_pages
    } else {
        0
    };
    vmm.ipc
        .mevict(vmm.to_sys(c_delta + flag_credit), vmm.to_sys(d_delta))?;

    Stats::sub(&vmm.stats.pages_alloc, vmm.to_sys(tail_pages));

    Ok(NonNull::new_unchecked((*ate).base as *mut u8))
}

unsafe fn grow(
    vmm: &Vmm,
    ate: *mut Ate,
    s_pages: usize,
    on_pages: usize,
    of_pages: usize,
    nn_pages: usize,
    nf_pages: usize,
) -> Result<NonNull<u8>> {
    let page_size = vmm.page_size();
    let opts = vmm.opts();
    let rsdnt = opts.contains(Opts::RSDNT);
    let merge = opts.contains(Opts::MERGE);
    let oaddr = ate as usize;
    let old_total = (s_pages + on_pages + of_pages) * page_size;
    let new_total = (s_pages + nn_pages + nf_pages) * page_size;

    let charge_pages = if opts.contains(Opts::METACH) {
        if rsdnt {
            (nn_pages - on_pages) + (nf_pages - of_pages)
        } else {
            nf_pages - of_pages
        }
    } else if rsdnt {
        nn_pages - on_pages
    } else {
        0
    };
    let charge = vmm.to_sys(charge_pages);
    vmm.ipc.madmit(charge, opts.contains(Opts::ADMITD))?;

    let uncharge = |err: Error| -> Error {
        if vmm.ipc.mevict(charge, 0).is_err() {
            fatal("realloc unwind", err);
        }
        err
    };

    if let Err(err) = vmm.mmu.invalidate(ate) {
        return Err(uncharge(err));
    }
    // The entry is unreachable now; a signalled eviction that was already
    // holding it has finished (the table lock above serialized against the
    // walk), so these counters are stable.
    let ol_pages = (*ate).l_pages;
    let oc_pages = (*ate).c_pages;

    let reinsert = |err: Error| -> Error {
        if unsafe { vmm.mmu.insert(ate) }.is_err() {
            fatal("realloc unwind", err);
        }
        uncharge(err)
    };

    if merge {
        // mprotect has split the mapping into many VMAs; collapse them so
        // the kernel will grow the range as one.
        if let Err(errno) = mprotect(
            NonNull::new_unchecked(oaddr as *mut libc::c_void),
            old_total,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        ) {
            return Err(reinsert(errno.into()));
        }
    }

    let naddr = {
        let remapped = libc::mremap(
            oaddr as *mut libc::c_void,
            old_total,
            new_total,
            libc::MREMAP_MAYMOVE,
        );
        if remapped == libc::MAP_FAILED {
            let err = Error::last_os();
            if merge {
                // Put the collapsed protections back the way the flags say.
                restore_protections(oaddr, s_pages, on_pages, page_size, ate);
            }
            return Err(reinsert(err));
        }
        remapped as usize
    };

    // The mapping has committed; from here every failure is fatal because
    // the old allocation no longer exists.
    let ate = naddr as *mut Ate;

    let old_flags = naddr + (s_pages + on_pages) * page_size;
    let new_flags = naddr + (s_pages + nn_pages) * page_size;
    core::ptr::copy(
        old_flags as *const u8,
        new_flags as *mut u8,
        of_pages * page_size,
    );

    let commit = |result: core::result::Result<(), nix::errno::Errno>| {
        if let Err(errno) = result {
            fatal("realloc commit", errno.into());
        }
    };

    let app = naddr + s_pages * page_size;
    let fresh_prot = if rsdnt {
        ProtFlags::PROT_READ
    } else {
        ProtFlags::PROT_NONE
    };
    if merge {
        commit(mprotect(
            NonNull::new_unchecked(app as *mut libc::c_void),
            nn_pages * page_size,
            fresh_prot,
        ));
        // Give surviving pages their per-flag protections back: read-write
        // for dirty, read for resident-clean, none for evicted.
        let flags = new_flags as *mut Volatile<u8>;
        for ip in 0..on_pages {
            let flag = PageFlags::from_bits_truncate((*flags.add(ip)).read());
            let prot = if flag.contains(PageFlags::DIRTY) {
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
            } else if !flag.contains(PageFlags::RSDNT) {
                ProtFlags::PROT_READ
            } else {
                ProtFlags::PROT_NONE
            };
            if prot != fresh_prot {
                commit(mprotect(
                    NonNull::new_unchecked((app + ip * page_size) as *mut libc::c_void),
                    page_size,
                    prot,
                ));
            }
        }
    } else {
        commit(mprotect(
            NonNull::new_unchecked((app + on_pages * page_size) as *mut libc::c_void),
            (nn_pages - on_pages) * page_size,
            fresh_prot,
        ));
    }

    if opts.contains(Opts::MLOCK) {
        if rsdnt {
            let (lock_addr, lock_len) = if merge {
                (app, nn_pages * page_size)
            } else {
                (
                    app + on_pages * page_size,
                    (nn_pages - on_pages) * page_size,
                )
            };
            commit(nix::sys::mman::mlock(
                NonNull::new_unchecked(lock_addr as *mut libc::c_void),
                lock_len,
            ));
        }
        commit(nix::sys::mman::mlock(
            NonNull::new_unchecked(new_flags as *mut libc::c_void),
            nf_pages * page_size,
        ));
    }

    if naddr != oaddr {
        let old_name = vmm.backing_name(oaddr as *const Ate);
        let new_name = vmm.backing_name(ate);
        if let Err(err) = std::fs::rename(&old_name, &new_name) {
            fatal(
                "realloc commit",
                Error::Io(nix::errno::Errno::from_raw(
                    err.raw_os_error().unwrap_or(libc::EIO),
                )),
            );
        }
    }

    (*ate).n_pages = nn_pages;
    if rsdnt {
        (*ate).l_pages = ol_pages + (nn_pages - on_pages);
        (*ate).c_pages = oc_pages + (nn_pages - on_pages);
    } else {
        (*ate).l_pages = ol_pages;
        (*ate).c_pages = oc_pages;
    }
    (*ate).base = app;
    (*ate).flags = new_flags as *mut Volatile<u8>;
    if !rsdnt {
        for ip in on_pages..nn_pages {
            (*ate).set_flag(ip, PageFlags::CHRGD | PageFlags::RSDNT);
        }
    }

    if let Err(err) = vmm.mmu.insert(ate) {
        fatal("realloc commit", err);
    }

    Stats::add(
        &vmm.stats.pages_alloc,
        vmm.to_sys((nn_pages - on_pages) + (nf_pages - of_pages)),
    );

    Ok(NonNull::new_unchecked(app as *mut u8))
}

/// After a failed `mremap` under the merge strategy, walk the flag vector
/// and restore the per-page protections the collapse destroyed.
unsafe fn restore_protections(
    oaddr: usize,
    s_pages: usize,
    on_pages: usize,
    page_size: usize,
    ate: *mut Ate,
) {
    let app = oaddr + s_pages * page_size;
    let rollback = |result: core::result::Result<(), nix::errno::Errno>| {
        if let Err(errno) = result {
            fatal("realloc unwind", errno.into());
        }
    };

    rollback(mprotect(
        NonNull::new_unchecked(app as *mut libc::c_void),
        on_pages * page_size,
        ProtFlags::PROT_NONE,
    ));
    for ip in 0..on_pages {
        let flag = (*ate).flag(ip);
        if flag.contains(PageFlags::DIRTY) {
            rollback(mprotect(
                NonNull::new_unchecked((app + ip * page_size) as *mut libc::c_void),
                page_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            ));
        } else if !flag.contains(PageFlags::RSDNT) {
            rollback(mprotect(
                NonNull::new_unchecked((app + ip * page_size) as *mut libc::c_void),
                page_size,
                ProtFlags::PROT_READ,
            ));
        }
    }
}
