//! A reference client of the forkserver protocol, used by the integration
//! tests in place of a real instrumented binary.
//!
//! On startup it attaches the shared-memory bitmap named by `__AFL_SHM_ID`,
//! writes the 4-byte hello on fd 199, then serves fork requests from fd 198:
//! one forked child per request, child pid and raw wait status reported back
//! on fd 199.
//!
//! The child reads the input from stdin and reacts to it:
//! - edge 0 is always set (function entry);
//! - each of the first four bytes `b` at position `i` sets edge `i * 256 + b`;
//! - an input starting with `0xDE 0xAD` additionally sets edge 42;
//! - a leading `!` aborts (SIGABRT), a leading `z` sleeps for five seconds.

use std::env;
use std::process::abort;
use std::ptr;
use std::thread;
use std::time::Duration;

const MAP_SIZE: usize = 1 << 16;
const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
const CTL_FD: i32 = 198;
const ST_FD: i32 = 199;

fn attach_map() -> Option<*mut u8> {
    let id: i32 = env::var(SHM_ENV_VAR).ok()?.parse().ok()?;
    let base = unsafe { libc::shmat(id, ptr::null(), 0) };
    if base as isize == -1 {
        return None;
    }
    Some(base as *mut u8)
}

fn read_exact(fd: i32, buf: &mut [u8]) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if n <= 0 {
            return false;
        }
        filled += n as usize;
    }
    true
}

fn write_all(fd: i32, buf: &[u8]) -> bool {
    let mut written = 0;
    while written < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
            )
        };
        if n <= 0 {
            return false;
        }
        written += n as usize;
    }
    true
}

fn read_stdin() -> Vec<u8> {
    let mut input = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(0, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if n <= 0 {
            break;
        }
        input.extend_from_slice(&chunk[..n as usize]);
    }
    input
}

fn run_payload(map: Option<*mut u8>) {
    let input = read_stdin();

    if let Some(base) = map {
        let bump = |edge: usize| {
            let byte = unsafe { &mut *base.add(edge % MAP_SIZE) };
            *byte = byte.wrapping_add(1);
        };
        bump(0);
        for (i, b) in input.iter().take(4).enumerate() {
            bump(i * 256 + *b as usize);
        }
        if input.starts_with(&[0xDE, 0xAD]) {
            bump(42);
        }
    }

    match input.first() {
        Some(&b'!') => abort(),
        Some(&b'z') => thread::sleep(Duration::from_secs(5)),
        _ => {}
    }
}

fn main() {
    let map = attach_map();

    if !write_all(ST_FD, &[0u8; 4]) {
        return;
    }

    let mut request = [0u8; 4];
    while read_exact(CTL_FD, &mut request) {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return;
        }
        if pid == 0 {
            run_payload(map);
            unsafe { libc::_exit(0) };
        }

        if !write_all(ST_FD, &pid.to_ne_bytes()) {
            return;
        }
        let mut status: libc::c_int = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        if !write_all(ST_FD, &status.to_ne_bytes()) {
            return;
        }
    }
}
