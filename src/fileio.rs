//! Positional file I/O for backing-store transfers
//!
//! Page ranges move between memory and the per-allocation backing files in
//! whole-range transfers: short reads and writes are retried until the
//! requested length has moved. These routines are called with an ATE lock
//! held and from inside the fault handler, so they go straight to
//! `pread`/`pwrite` rather than through any buffered wrapper.

use nix::errno::Errno;

use crate::error::{Error, Result};

/// Read exactly `len` bytes at file offset `off` into `buf`.
///
/// # Safety
///
/// `buf` must be valid for writes of `len` bytes and the caller must hold
/// the lock of the ATE whose pages `buf` aliases.
pub unsafe fn read_exact_at(fd: libc::c_int, buf: *mut u8, len: usize, off: usize) -> Result<()> {
    let mut buf = buf;
    let mut len = len;
    let mut off = off as libc::off_t;

    while len > 0 {
        let n = libc::pread(fd, buf as *mut libc::c_void, len, off);
        if n == -1 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return Err(Error::last_os());
        }
        if n == 0 {
            // The backing file is shorter than the page range it must cover.
            return Err(Error::Io(Errno::EIO));
        }
        buf = buf.add(n as usize);
        len -= n as usize;
        off += n as libc::off_t;
    }

    Ok(())
}

/// Write exactly `len` bytes from `buf` at file offset `off`.
///
/// # Safety
///
/// `buf` must be valid for reads of `len` bytes and the caller must hold
/// the lock of the ATE whose pages `buf` aliases.
pub unsafe fn write_exact_at(
    fd: libc::c_int,
    buf: *const u8,
    len: usize,
    off: usize,
) -> Result<()> {
    let mut buf = buf;
    let mut len = len;
    let mut off = off as libc::off_t;

    while len > 0 {
        let n = libc::pwrite(fd, buf as *const libc::c_void, len, off);
        if n == -1 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return Err(Error::last_os());
        }
        buf = buf.add(n as usize);
        len -= n as usize;
        off += n as libc::off_t;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::io::AsRawFd;

    fn scratch(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("sbma-fileio-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn round_trip_at_offset() {
        let path = scratch("rt");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        unsafe { write_exact_at(fd, data.as_ptr(), data.len(), 4096).unwrap() };

        let mut back = vec![0u8; data.len()];
        unsafe { read_exact_at(fd, back.as_mut_ptr(), back.len(), 4096).unwrap() };
        assert_eq!(back, data);

        drop(file);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_past_end_fails() {
        let path = scratch("eof");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let fd = file.as_raw_fd();

        let mut buf = [0u8; 64];
        let err = unsafe { read_exact_at(fd, buf.as_mut_ptr(), buf.len(), 0) };
        assert_eq!(err, Err(Error::Io(Errno::EIO)));

        drop(file);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_descriptor_reports_errno() {
        let mut buf = [0u8; 16];
        let err = unsafe { read_exact_at(-1, buf.as_mut_ptr(), buf.len(), 0) };
        assert!(matches!(err, Err(Error::Io(_))));
    }
}
