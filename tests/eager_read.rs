//! Eager reads: one fault makes the whole allocation resident. With
//! aggressive charging, the first touch also charges every page at once.

mod common;

#[test]
fn one_fault_loads_everything() {
    let page_size = common::page_size();
    let stem = common::fstem("eager");
    let opts = sbma::parse_optstr("aggrd,aggch,nomerge");

    sbma::init(&stem, common::uniq(9), page_size, 1, 16, opts).unwrap();

    let n_pages = 6;
    let bytes = n_pages * page_size;
    let p = unsafe { sbma::malloc(bytes) }.unwrap().as_ptr();
    assert_eq!(sbma::mallinfo().hblks, 0);

    // A single read of one byte faults once and brings in (and, with
    // aggch, charges) the entire allocation.
    unsafe {
        assert_eq!(*p.add(4 * page_size + 7), 0);
    }
    let info = sbma::mallinfo();
    assert_eq!(info.uordblks, 1);
    assert_eq!(info.hblks, n_pages);

    // Every other page is now readable without further faults.
    unsafe {
        for ip in 0..n_pages {
            assert_eq!(*p.add(ip * page_size), 0);
        }
    }
    assert_eq!(sbma::mallinfo().uordblks, 1);

    // Writes still fault individually.
    unsafe {
        *p.add(0) = 1;
        *p.add(page_size) = 2;
    }
    assert_eq!(sbma::mallinfo().fordblks, 2);

    unsafe { sbma::free(p) }.unwrap();
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
