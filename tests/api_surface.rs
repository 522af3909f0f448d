//! API surface behavior that doesn't need page traffic: initialization
//! validation, option plumbing, existence checks, and the state checker.

mod common;

// One process-wide engine: the scenarios run sequentially in one test.
#[test]
fn api_surface() {
    osvmm_disables_the_engine();
    lifecycle_and_introspection();
}

fn lifecycle_and_introspection() {
    let page_size = common::page_size();
    let stem = common::fstem("api");
    let opts = sbma::parse_optstr("lzyrd,merge,check,extra");

    // Nothing works before init.
    assert_eq!(unsafe { sbma::mtouch(core::ptr::null(), 1) }, Err(sbma::Error::Uninitialized));
    assert_eq!(sbma::mexist(core::ptr::null()), Ok(false));

    // Bad configurations are rejected.
    assert_eq!(
        sbma::init(&stem, common::uniq(10), page_size + 1, 1, 8, opts),
        Err(sbma::Error::Invalid)
    );
    assert_eq!(
        sbma::init(&stem, common::uniq(10), page_size, 1, 8, sbma::Opts::INVLD),
        Err(sbma::Error::Invalid)
    );

    sbma::init(&stem, common::uniq(10), page_size, 1, 8, opts).unwrap();
    // Re-init is a no-op.
    sbma::init(&stem, common::uniq(10), page_size, 1, 8, opts).unwrap();

    let p = unsafe { sbma::calloc(2, page_size) }.unwrap().as_ptr();
    unsafe {
        for i in 0..2 * page_size {
            assert_eq!(*p.add(i), 0);
        }
    }

    // Existence tracks the allocation's page range exactly.
    assert_eq!(sbma::mexist(p), Ok(true));
    assert_eq!(sbma::mexist(unsafe { p.add(2 * page_size - 1) }), Ok(true));
    assert_eq!(sbma::mexist(unsafe { p.add(2 * page_size) }), Ok(false));

    // With check,extra armed, the invariants hold at rest.
    sbma::check().unwrap();

    // Out-of-range state operations are invalid, not UB.
    assert_eq!(
        unsafe { sbma::mtouch(p, 3 * page_size) },
        Err(sbma::Error::Invalid)
    );
    assert_eq!(unsafe { sbma::mevict(p, 0) }, Err(sbma::Error::Invalid));

    // The option word can be swapped wholesale, but never to an invalid
    // one.
    assert_eq!(
        sbma::mallopt(sbma::MalloptParam::VmmOpts, sbma::Opts::INVLD),
        Err(sbma::Error::Invalid)
    );
    sbma::mallopt(sbma::MalloptParam::VmmOpts, sbma::parse_optstr("lzyrd,merge")).unwrap();

    // Signal eligibility toggling is idempotent at the API level.
    sbma::sigon().unwrap();
    sbma::sigoff().unwrap();

    // calloc overflow is caught.
    assert_eq!(
        unsafe { sbma::calloc(usize::MAX, 2) },
        Err(sbma::Error::Invalid)
    );

    unsafe { sbma::free(p) }.unwrap();
    assert_eq!(unsafe { sbma::malloc(0) }, Err(sbma::Error::Invalid));

    sbma::destroy().unwrap();
    // Destroy is idempotent too.
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}

fn osvmm_disables_the_engine() {
    let stem = common::fstem("api-osvmm");
    let opts = sbma::parse_optstr("osvmm");

    sbma::init(&stem, common::uniq(11), common::page_size(), 1, 8, opts).unwrap();
    // The engine stayed out of the way: allocation goes through the OS,
    // so SBMA reports itself uninitialized.
    assert_eq!(unsafe { sbma::malloc(4096) }, Err(sbma::Error::Uninitialized));
    sbma::destroy().unwrap();
    common::cleanup(&stem);
}
