//! `WakePipe`: the multiplexer's wake channel.
//!
//! A non-blocking pipe whose read end sits permanently in the poll set.
//! Byte `0xFF` means "re-examine your queues"; any other byte is a signal
//! number written by the process signal handler.

use std::os::unix::io::RawFd;

use lowloop_core::{LoopError, LoopResult, Notifier};

/// Byte written for a plain wake.
pub const WAKE_BYTE: u8 = 0xFF;

pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn create() -> LoopResult<Self> {
        let mut fds = [-1 as libc::c_int; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(LoopError::last_os("pipe2"));
        }
        Ok(WakePipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    #[inline]
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Drain everything currently in the pipe. Returns the non-wake bytes
    /// (signal numbers) in arrival order.
    pub fn drain(&self, signals: &mut Vec<u8>) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
            let n = n as usize;
            total += n;
            signals.extend(buf[..n].iter().copied().filter(|b| *b != WAKE_BYTE));
            if n < buf.len() {
                break;
            }
        }
        total
    }
}

impl Notifier for WakePipe {
    fn notify(&self) -> LoopResult<()> {
        let byte = WAKE_BYTE;
        let ret = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        if ret < 0 {
            let err = LoopError::last_os("write");
            // A full pipe already guarantees a wakeup.
            if err.is_would_block() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakes_coalesce_in_drain() {
        let pipe = WakePipe::create().unwrap();
        for _ in 0..10 {
            pipe.notify().unwrap();
        }
        let mut signals = Vec::new();
        assert_eq!(pipe.drain(&mut signals), 10);
        assert!(signals.is_empty());
        assert_eq!(pipe.drain(&mut signals), 0);
    }

    #[test]
    fn test_signal_bytes_are_kept() {
        let pipe = WakePipe::create().unwrap();
        pipe.notify().unwrap();
        let sig = libc::SIGUSR1 as u8;
        unsafe {
            libc::write(pipe.write_fd(), &sig as *const u8 as *const libc::c_void, 1);
        }
        let mut signals = Vec::new();
        pipe.drain(&mut signals);
        assert_eq!(signals, vec![sig]);
    }
}
