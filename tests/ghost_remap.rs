//! Ghost loads stage file contents in a scratch mapping and remap them
//! into place; the observable round-trip behavior matches the direct path.

mod common;

#[test]
fn ghost_round_trip_matches_direct_path() {
    let page_size = common::page_size();
    let stem = common::fstem("ghost");
    let opts = sbma::parse_optstr("lzyrd,ghost");

    sbma::init(&stem, common::uniq(4), page_size, 1, 32, opts).unwrap();

    let n_pages = 6;
    let bytes = n_pages * page_size;
    let p = unsafe { sbma::malloc(bytes) }.unwrap().as_ptr();

    unsafe {
        for i in 0..bytes {
            *p.add(i) = (i % 127) as u8;
        }
    }

    let evicted = unsafe { sbma::mevict(p, bytes) }.unwrap();
    assert_eq!(evicted, n_pages);
    assert_eq!(sbma::mallinfo().fsmblks, n_pages);

    // Touch everything back through the ghost path in one call.
    let charged = unsafe { sbma::mtouch(p, bytes) }.unwrap();
    assert_eq!(charged, n_pages);
    assert_eq!(sbma::mallinfo().usmblks, n_pages);

    unsafe {
        for i in 0..bytes {
            assert_eq!(*p.add(i), (i % 127) as u8, "byte {} after ghost reload", i);
        }
    }

    // A page dirtied again after the ghost load writes back normally.
    unsafe {
        *p.add(3 * page_size) = 0xEE;
    }
    let evicted = unsafe { sbma::mevict(p, bytes) }.unwrap();
    assert_eq!(evicted, n_pages);
    assert_eq!(sbma::mallinfo().fsmblks, n_pages + 1);

    unsafe { sbma::free(p) }.unwrap();
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
