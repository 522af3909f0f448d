//! Two-process admission: a process whose working set stands in the way of
//! another's admission is signalled and evicts its resident pages.
//!
//! The child (process B) holds three charged pages while blocked on a
//! pipe; the parent (process A) then touches its own three pages, which
//! must overflow the four-page budget, signal B, and wait for B's eviction
//! before being admitted.

mod common;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

const N_PAGES: usize = 3;
const BUDGET: usize = 4;

#[test]
fn admission_evicts_the_blocking_peer() {
    let page_size = common::page_size();
    let stem = common::fstem("admission");
    let uniq = common::uniq(8);

    let (mut parent_end, mut child_end) = UnixStream::pair().unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);

    if pid == 0 {
        // Child: process B.
        drop(parent_end);
        let code = child(&stem, uniq, page_size, &mut child_end);
        std::process::exit(code);
    }
    drop(child_end);

    // Parent: process A.
    let opts = sbma::parse_optstr("default");
    sbma::init(&stem, uniq, page_size, 2, BUDGET, opts).unwrap();

    let bytes = N_PAGES * page_size;
    let a = unsafe { sbma::malloc(bytes) }.unwrap().as_ptr();
    unsafe {
        for i in 0..bytes {
            *a.add(i) = (i % 83) as u8;
        }
    }
    // Stand aside so B can build its resident set.
    let evicted = sbma::mevictall().unwrap();
    assert_eq!(evicted, N_PAGES);
    assert_eq!(sbma::mallinfo().hblks, 0);

    // Let B charge its pages, then wait for its report.
    parent_end.write_all(&[1]).unwrap();
    let mut byte = [0u8; 1];
    parent_end.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], 2);

    // Three pages against one free: B must be told to evict.
    let charged = sbma::mtouchall().unwrap();
    assert_eq!(charged, N_PAGES);
    assert_eq!(sbma::mallinfo().hblks, N_PAGES);
    unsafe {
        for i in 0..bytes {
            assert_eq!(*a.add(i), (i % 83) as u8, "byte {} after readmission", i);
        }
    }

    // Release B and collect its verdict.
    parent_end.write_all(&[3]).unwrap();
    let mut status: libc::c_int = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child died abnormally");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child assertions failed");

    unsafe { sbma::free(a) }.unwrap();
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}

/// Process B: build a three-page resident set, block on the pipe, and
/// after the parent's admission verify every page was evicted.
fn child(stem: &str, uniq: i32, page_size: usize, pipe: &mut UnixStream) -> i32 {
    let opts = sbma::parse_optstr("default");
    if sbma::init(stem, uniq, page_size, 2, BUDGET, opts).is_err() {
        return 10;
    }

    let mut byte = [0u8; 1];
    if pipe.read_exact(&mut byte).is_err() || byte[0] != 1 {
        return 11;
    }

    let bytes = N_PAGES * page_size;
    let b = match unsafe { sbma::malloc(bytes) } {
        Ok(b) => b.as_ptr(),
        Err(_) => return 12,
    };
    unsafe {
        for i in 0..bytes {
            *b.add(i) = 0xC3;
        }
    }
    if sbma::mallinfo().hblks != N_PAGES {
        return 13;
    }

    if pipe.write_all(&[2]).is_err() {
        return 14;
    }

    // Block here; the admission signal interrupts and the handler evicts.
    if pipe.read_exact(&mut byte).is_err() || byte[0] != 3 {
        return 15;
    }

    // The signal arrived while this process slept: everything is out.
    let info = sbma::mallinfo();
    if info.hblks != 0 {
        return 16;
    }
    if info.smblks != 1 || info.ordblks != 1 {
        return 17;
    }
    // Dirty pages went to disk and come back intact.
    unsafe {
        for i in 0..bytes {
            if *b.add(i) != 0xC3 {
                return 18;
            }
        }
    }

    if unsafe { sbma::free(b) }.is_err() {
        return 19;
    }
    if sbma::destroy().is_err() {
        return 20;
    }
    0
}
