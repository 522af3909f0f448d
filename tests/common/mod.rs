//! Shared setup for the integration scenarios.
//!
//! Each scenario file is its own process: signal dispositions and the IPC
//! region are process-global, so scenarios never share a binary. The
//! helpers here pick a per-test coordination id, a scratch directory for
//! backing files, and the kernel page size (so SBMA pages convert 1:1 to
//! system pages and budget arithmetic in the tests stays exact).

use std::path::PathBuf;

/// Kernel page size; used as the SBMA page size throughout the tests.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(sz > 0);
    sz as usize
}

/// Scratch directory for backing files, created fresh, returned with a
/// trailing separator so it can serve as the file stem.
pub fn fstem(tag: &str) -> String {
    let mut dir = PathBuf::from(std::env::temp_dir());
    dir.push(format!("sbma-test-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    format!("{}/", dir.display())
}

/// Coordination id unique to this test process (and shared with its forks).
pub fn uniq(salt: i32) -> i32 {
    ((std::process::id() as i32) & 0xffff) ^ (salt << 16)
}

/// Remove the scratch directory; missing files are fine.
pub fn cleanup(stem: &str) {
    let _ = std::fs::remove_dir_all(stem.trim_end_matches('/'));
}
