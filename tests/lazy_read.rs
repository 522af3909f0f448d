//! Lazy reads fault in exactly the touched page, and only pages with an
//! on-disk copy are read from the backing file.

mod common;

#[test]
fn touch_loads_only_the_requested_page() {
    let page_size = common::page_size();
    let stem = common::fstem("lazy");
    let opts = sbma::parse_optstr("lzyrd");

    sbma::init(&stem, common::uniq(3), page_size, 1, 16, opts).unwrap();

    let n_pages = 4;
    let bytes = n_pages * page_size;
    let p = unsafe { sbma::malloc(bytes) }.unwrap().as_ptr();

    // Dirty page 0, then push the whole allocation out. Only page 0 gains
    // an on-disk copy.
    unsafe {
        *p.add(0) = 0x5A;
        *p.add(page_size - 1) = 0xA5;
    }
    let evicted = unsafe { sbma::mevict(p, bytes) }.unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(sbma::mallinfo().fsmblks, 1);
    assert_eq!(sbma::mallinfo().hblks, 0);

    // Touching the written page reads exactly one page from disk and
    // leaves the other three evicted.
    let charged = unsafe { sbma::mtouch(p, page_size) }.unwrap();
    assert_eq!(charged, 1);
    assert_eq!(sbma::mallinfo().usmblks, 1);
    assert_eq!(sbma::mallinfo().hblks, 1);
    unsafe {
        assert_eq!(*p.add(0), 0x5A);
        assert_eq!(*p.add(page_size - 1), 0xA5);
    }

    // Touching a page that never went to disk zero-fills: charged but not
    // read.
    let charged = unsafe { sbma::mtouch(p.add(2 * page_size), page_size) }.unwrap();
    assert_eq!(charged, 1);
    assert_eq!(sbma::mallinfo().usmblks, 1);
    assert_eq!(sbma::mallinfo().hblks, 2);
    unsafe {
        assert_eq!(*p.add(2 * page_size), 0);
    }

    unsafe { sbma::free(p) }.unwrap();
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
