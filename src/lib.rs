//! SBMA - storage-backed memory allocation with node-level admission control
//!
//! A user-space virtual-memory manager for data-intensive batch workloads
//! whose aggregate working set exceeds physical RAM. Large allocations are
//! backed by per-allocation files on a scratch filesystem and demand-loaded
//! through access-fault handling; a shared accounting region coordinates
//! the processes on a node so that at most one holds a large resident set
//! at a time. Processes standing in the way of another's admission are
//! signalled and evict their resident pages to disk.
//!
//! The crate is organized around the components of that design:
//! - `error`: error taxonomy and fatal escalation
//! - `opts`: the option word and its string grammar
//! - `fileio`: exact positional transfers to the backing files
//! - `lock`: recursive mutexes with timed acquisition
//! - `mmu`: per-page state, allocation-table entries, address lookup
//! - `ipc`: the shared region, named semaphores, and admission protocol
//! - `vmm`: the process-wide engine, fault handling, and page movement
//! - `api`: the public allocation and residency operations
//!
//! # Usage
//!
//! ```no_run
//! let opts = sbma::parse_optstr("lzyrd,merge");
//! sbma::init(sbma::DEFAULT_FSTEM, 0, 1 << 14, 1, 4096, opts).unwrap();
//!
//! let p = unsafe { sbma::malloc(1 << 20) }.unwrap();
//! // ... use p.as_ptr() ...
//! unsafe { sbma::free(p.as_ptr()) }.unwrap();
//!
//! sbma::destroy().unwrap();
//! ```
//!
//! # Safety
//!
//! The allocation operations hand out raw memory whose protections change
//! underneath the program as pages move between RAM and disk; they are
//! `unsafe fn`s with the caller contract documented on each. Callers must
//! not race concurrent mutators of the same allocation.

mod api;
mod error;
mod fileio;
mod ipc;
mod lock;
mod mmu;
mod opts;
mod vmm;

pub use api::alloc::{calloc, free, malloc, realloc};
pub use api::extra::{check, mallinfo, mallopt, sigoff, sigon, Mallinfo, MalloptParam};
pub use api::state::{
    mclear, mclearall, mevict, mevictall, mexist, mtouch, mtouch_atomic, mtouchall, ATOMIC_MAX,
};
pub use error::{Error, Result};
pub use opts::{parse_optstr, Opts, OPTSTR_MAX};
pub use vmm::{DEFAULT_FSTEM, DEFAULT_PAGE_SIZE};

/// Initialize the SBMA runtime for this process.
///
/// * `fstem` - prefix for the per-allocation backing files
/// * `uniq` - identifier shared by the coordinating processes on this node
/// * `page_size` - SBMA page size; a positive multiple of the kernel page
/// * `n_procs` - number of coordinating processes
/// * `max_mem` - node budget, in system pages
/// * `opts` - option word, typically from [`parse_optstr`]
///
/// The first process with a given `uniq` creates the shared accounting
/// region and the named semaphores; later ones join them. Idempotent while
/// initialized. With [`Opts::OSVMM`] the call records nothing and leaves
/// memory management to the OS.
pub fn init(
    fstem: &str,
    uniq: i32,
    page_size: usize,
    n_procs: usize,
    max_mem: usize,
    opts: Opts,
) -> Result<()> {
    vmm::VMM.init(fstem, uniq, page_size, n_procs, max_mem, opts)
}

/// Tear the SBMA runtime down: restore signal dispositions, leave the
/// coordination group, and unlink the node-lifetime objects. Idempotent
/// while uninitialized.
pub fn destroy() -> Result<()> {
    vmm::VMM.destroy()
}

/// The real-time signal number used for admission requests.
pub fn admission_signal() -> i32 {
    ipc::sigipc()
}
