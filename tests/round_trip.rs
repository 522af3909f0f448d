//! Single-process round trip: allocate, write, evict, fault back in, free.

mod common;

#[test]
fn evict_and_reload_preserves_contents() {
    let page_size = common::page_size();
    let stem = common::fstem("round-trip");
    let opts = sbma::parse_optstr("default");
    assert!(opts.is_valid());

    sbma::init(&stem, common::uniq(1), page_size, 1, 16, opts).unwrap();

    let n_pages = 8;
    let bytes = n_pages * page_size;
    let p = unsafe { sbma::malloc(bytes) }.unwrap().as_ptr();

    // Writing every byte takes one read fault and one write fault per page
    // and dirties the whole allocation.
    unsafe {
        for i in 0..bytes {
            *p.add(i) = (i % 251) as u8;
        }
    }
    let info = sbma::mallinfo();
    assert_eq!(info.hblks, n_pages);
    assert_eq!(info.fordblks, n_pages);

    // Evicting returns the charged pages and writes every dirty page.
    let evicted = unsafe { sbma::mevict(p, bytes) }.unwrap();
    assert_eq!(evicted, n_pages);
    let info = sbma::mallinfo();
    assert_eq!(info.hblks, 0);
    assert_eq!(info.fsmblks, n_pages);

    // Faulting the range back in restores it bit-exactly.
    unsafe {
        for i in 0..bytes {
            assert_eq!(*p.add(i), (i % 251) as u8, "byte {} after reload", i);
        }
    }
    let info = sbma::mallinfo();
    assert_eq!(info.hblks, n_pages);
    assert_eq!(info.usmblks, n_pages);

    unsafe { sbma::free(p) }.unwrap();
    let info = sbma::mallinfo();
    assert_eq!(info.hblks, 0);
    assert_eq!(info.keepcost, 0);

    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
