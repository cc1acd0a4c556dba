//! Baseline standard streams.
//!
//! fd 0/1/2 are registered at engine start (and again after a warm reset)
//! so they can be looked up by handle like any other descriptor. Writes are
//! synchronous; retiring a stream never closes the process's fd.

use std::sync::Arc;

use lowloop_core::{Descriptor, DescriptorKind, Interest, LoopError, LoopResult, Pollable};

use crate::engine::EngineHandle;

pub struct StdStream {
    d: Descriptor,
}

impl StdStream {
    pub fn new(fd: i32) -> Arc<StdStream> {
        Arc::new(StdStream {
            d: Descriptor::with_fd(DescriptorKind::Custom, fd),
        })
    }

    /// Write all of `data`, waiting out `EAGAIN` on non-blocking fds.
    pub fn write_all(&self, mut data: &[u8]) -> LoopResult<usize> {
        let total = data.len();
        let fd = self.d.fd();
        if fd < 0 {
            return Err(LoopError::os(libc::EBADF, "write"));
        }
        while !data.is_empty() {
            let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
            if n < 0 {
                let err = LoopError::last_os("write");
                if !err.is_would_block() {
                    return Err(err);
                }
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                unsafe {
                    libc::poll(&mut pfd, 1, -1);
                }
                continue;
            }
            data = &data[n as usize..];
        }
        Ok(total)
    }
}

impl Pollable for StdStream {
    fn descriptor(&self) -> &Descriptor {
        &self.d
    }

    fn on_readiness(&self, _ready: Interest) -> bool {
        true
    }

    fn on_retire(&self) {
        self.d.take_fd();
    }
}

/// Register fresh stream objects for fd 0, 1 and 2.
pub fn install(handle: &EngineHandle) -> LoopResult<()> {
    for fd in 0..3 {
        if let Some(old) = handle.registry().get(fd) {
            handle.retire(&old);
        }
        // Closed stdio (daemonized) is not an error.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            continue;
        }
        handle.advertise(StdStream::new(fd))?;
    }
    Ok(())
}

/// The registered stream for `fd` (0..=2), if any.
pub fn stream(handle: &EngineHandle, fd: i32) -> Option<Arc<dyn Pollable>> {
    if !(0..3).contains(&fd) {
        return None;
    }
    handle.registry().get(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_all_to_pipe() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let s = StdStream::new(fds[1]);
        assert_eq!(s.write_all(b"hello").unwrap(), 5);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(&buf[..n as usize], b"hello");

        // Retiring does not close.
        s.on_retire();
        assert_eq!(s.descriptor().fd(), -1);
        assert!(unsafe { libc::fcntl(fds[1], libc::F_GETFD) } >= 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
