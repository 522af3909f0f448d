//! realloc: shrinking credits the budget for the dropped tail and keeps
//! the head bytes; growing extends the mapping and preserves contents.

mod common;

// One process-wide engine: the two scenarios run sequentially in one test.
#[test]
fn shrink_then_grow() {
    shrink_credits_tail_and_keeps_contents();
    grow_preserves_contents();
}

fn shrink_credits_tail_and_keeps_contents() {
    let page_size = common::page_size();
    let stem = common::fstem("realloc-shrink");
    let opts = sbma::parse_optstr("default");

    sbma::init(&stem, common::uniq(5), page_size, 1, 32, opts).unwrap();

    let on_pages = 8;
    let p = unsafe { sbma::malloc(on_pages * page_size) }.unwrap().as_ptr();
    unsafe {
        for i in 0..on_pages * page_size {
            *p.add(i) = (i % 239) as u8;
        }
    }
    assert_eq!(sbma::mallinfo().hblks, on_pages);

    let nn_pages = 3;
    let q = unsafe { sbma::realloc(p, nn_pages * page_size) }.unwrap().as_ptr();
    // Shrinking never moves the mapping.
    assert_eq!(q, p);

    // Exactly the five dropped pages come back to the budget.
    assert_eq!(sbma::mallinfo().hblks, nn_pages);

    unsafe {
        for i in 0..nn_pages * page_size {
            assert_eq!(*q.add(i), (i % 239) as u8, "kept byte {}", i);
        }
    }

    unsafe { sbma::free(q) }.unwrap();
    assert_eq!(sbma::mallinfo().hblks, 0);
    assert_eq!(sbma::mallinfo().keepcost, 0);

    sbma::destroy().unwrap();
    common::cleanup(&stem);
}

fn grow_preserves_contents() {
    let page_size = common::page_size();
    let stem = common::fstem("realloc-grow");
    let opts = sbma::parse_optstr("default");

    sbma::init(&stem, common::uniq(6), page_size, 1, 64, opts).unwrap();

    let on_pages = 2;
    let p = unsafe { sbma::malloc(on_pages * page_size) }.unwrap().as_ptr();
    unsafe {
        for i in 0..on_pages * page_size {
            *p.add(i) = (i % 199) as u8;
        }
    }

    let nn_pages = 6;
    let q = unsafe { sbma::realloc(p, nn_pages * page_size) }
        .unwrap()
        .as_ptr();

    unsafe {
        for i in 0..on_pages * page_size {
            assert_eq!(*q.add(i), (i % 199) as u8, "surviving byte {}", i);
        }
        // The extension behaves like fresh memory.
        for i in on_pages * page_size..nn_pages * page_size {
            assert_eq!(*q.add(i), 0, "fresh byte {}", i);
        }
        for i in on_pages * page_size..nn_pages * page_size {
            *q.add(i) = 0x77;
        }
    }
    assert_eq!(sbma::mallinfo().hblks, nn_pages);

    // The whole grown allocation survives an evict/reload cycle, so the
    // backing file rename (if the mapping moved) kept the data reachable.
    let evicted = unsafe { sbma::mevict(q, nn_pages * page_size) }.unwrap();
    assert_eq!(evicted, nn_pages);
    unsafe {
        for i in 0..on_pages * page_size {
            assert_eq!(*q.add(i), (i % 199) as u8, "reloaded byte {}", i);
        }
        for i in on_pages * page_size..nn_pages * page_size {
            assert_eq!(*q.add(i), 0x77, "reloaded extension byte {}", i);
        }
    }

    unsafe { sbma::free(q) }.unwrap();
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
