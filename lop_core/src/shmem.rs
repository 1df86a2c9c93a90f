use std::io;
use std::ptr;

/// log2 of the coverage map size.
pub const MAP_SIZE_POW2: usize = 16;
/// Size in bytes of the edge-coverage bitmap shared with the target.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Environment variable through which the target's instrumentation locates
/// the shared-memory segment (decimal SysV shm id).
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// A SysV shared-memory segment holding the trace bitmap.
///
/// The segment is created private and attached for the lifetime of the value.
/// Dropping a `TraceMap` detaches the mapping and marks the segment for
/// removal, so the kernel resource is released on every exit path.
pub struct TraceMap {
    id: i32,
    base: *mut u8,
}

impl TraceMap {
    /// Allocates and attaches a fresh `MAP_SIZE`-byte segment.
    pub fn new() -> io::Result<Self> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }

        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(err);
        }

        Ok(Self {
            id,
            base: base as *mut u8,
        })
    }

    /// The segment id, as passed to the target via [`SHM_ENV_VAR`].
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Zeroes the whole bitmap. Must happen before every fork request.
    pub fn clear(&mut self) {
        unsafe { ptr::write_bytes(self.base, 0, MAP_SIZE) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, MAP_SIZE) }
    }

    #[cfg(test)]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base, MAP_SIZE) }
    }
}

impl Drop for TraceMap {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
        }
    }
}

// The segment is owned exclusively; the raw pointer never escapes.
unsafe impl Send for TraceMap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_map_allocates_and_zeroes() {
        let mut map = TraceMap::new().expect("shmget/shmat failed");
        assert!(map.id() >= 0);
        assert_eq!(map.as_slice().len(), MAP_SIZE);
        assert!(map.as_slice().iter().all(|b| *b == 0));

        map.as_mut_slice()[42] = 1;
        map.as_mut_slice()[MAP_SIZE - 1] = 0xFF;
        assert_eq!(map.as_slice()[42], 1);

        map.clear();
        assert!(map.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn trace_map_ids_are_distinct() {
        let a = TraceMap::new().unwrap();
        let b = TraceMap::new().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
