//! Descriptor state shared between the event loop and the multiplexer.
//!
//! A `Descriptor` is embedded in every object that owns an OS handle. All
//! fields are atomics: interest and delete requests come from any thread,
//! but only the multiplexer thread turns them into poll-set changes.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::interest::Interest;

/// What kind of object a descriptor belongs to.
///
/// `Listener` matters to the multiplexer: listeners paused on descriptor
/// exhaustion are re-armed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    File,
    Listener,
    Socket,
    Custom,
}

impl DescriptorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorKind::File => "file",
            DescriptorKind::Listener => "listener",
            DescriptorKind::Socket => "socket",
            DescriptorKind::Custom => "custom",
        }
    }
}

pub struct Descriptor {
    kind: DescriptorKind,
    /// Native handle, -1 when not open.
    fd: AtomicI32,
    /// Handle under which the registry knows us, -1 when unregistered.
    advertised: AtomicI32,
    requested: AtomicU8,
    /// Sitting in the multiplexer's changed list.
    changed: AtomicBool,
    /// Present in the multiplexer's poll set.
    polled: AtomicBool,
    pending_delete: AtomicBool,
    retired: AtomicBool,
    survive_reset: AtomicBool,
}

impl Descriptor {
    pub fn new(kind: DescriptorKind) -> Self {
        Self::with_fd(kind, -1)
    }

    pub fn with_fd(kind: DescriptorKind, fd: i32) -> Self {
        Descriptor {
            kind,
            fd: AtomicI32::new(fd),
            advertised: AtomicI32::new(-1),
            requested: AtomicU8::new(0),
            changed: AtomicBool::new(false),
            polled: AtomicBool::new(false),
            pending_delete: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            survive_reset: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_fd(&self, fd: i32) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Detach the native handle without closing it.
    #[inline]
    pub fn take_fd(&self) -> i32 {
        self.fd.swap(-1, Ordering::AcqRel)
    }

    /// Close the native handle if one is open. Idempotent.
    pub fn close_native(&self) {
        let fd = self.take_fd();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    #[inline]
    pub fn advertised(&self) -> i32 {
        self.advertised.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_advertised(&self, handle: i32) {
        self.advertised.store(handle, Ordering::Release);
    }

    #[inline]
    pub fn requested(&self) -> Interest {
        Interest::from_bits(self.requested.load(Ordering::Acquire))
    }

    /// Replace the requested mask, returns the previous one.
    #[inline]
    pub fn set_requested(&self, mask: Interest) -> Interest {
        Interest::from_bits(self.requested.swap(mask.bits(), Ordering::AcqRel))
    }

    /// Set the changed flag. `true` means the caller must enqueue.
    #[inline]
    pub fn mark_changed(&self) -> bool {
        !self.changed.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_polled(&self, on: bool) {
        self.polled.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_polled(&self) -> bool {
        self.polled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_pending_delete(&self) {
        self.pending_delete.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }

    /// Claim destruction. Only the first caller gets `true`.
    #[inline]
    pub fn try_retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_survive_reset(&self, on: bool) {
        self.survive_reset.store(on, Ordering::Release);
    }

    #[inline]
    pub fn survives_reset(&self) -> bool {
        self.survive_reset.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("fd", &self.fd())
            .field("advertised", &self.advertised())
            .field("requested", &self.requested())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// An object the multiplexer can watch.
///
/// `on_readiness` runs on the multiplexer thread; returning `false` makes
/// the multiplexer unregister the descriptor and retire it in place.
/// `on_retire` runs exactly once, on whichever thread destroys the object.
pub trait Pollable: Send + Sync + 'static {
    fn descriptor(&self) -> &Descriptor;

    fn on_readiness(&self, ready: Interest) -> bool;

    fn on_retire(&self) {
        self.descriptor().close_native();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_flag_coalesces() {
        let d = Descriptor::new(DescriptorKind::Socket);
        assert!(d.mark_changed());
        assert!(!d.mark_changed());
        assert!(!d.mark_changed());
        d.clear_changed();
        assert!(d.mark_changed());
    }

    #[test]
    fn test_retire_once() {
        let d = Descriptor::new(DescriptorKind::File);
        assert!(d.try_retire());
        assert!(!d.try_retire());
        assert!(d.is_retired());
    }

    #[test]
    fn test_requested_replaces() {
        let d = Descriptor::new(DescriptorKind::Custom);
        d.set_requested(Interest::READ | Interest::WRITE);
        let prev = d.set_requested(Interest::WRITE);
        assert_eq!(prev, Interest::READ | Interest::WRITE);
        assert_eq!(d.requested(), Interest::WRITE);
    }

    #[test]
    fn test_close_native_is_idempotent() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let d = Descriptor::with_fd(DescriptorKind::File, fds[0]);
        d.close_native();
        assert_eq!(d.fd(), -1);
        d.close_native();
        unsafe {
            libc::close(fds[1]);
        }
    }
}
