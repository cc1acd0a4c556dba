//! Hostname resolution on the modify lane.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use lowloop_core::{ktrace, LoopError, LoopResult};

use crate::blocking::{FnOp, PendingJob};
use crate::engine::EngineHandle;
use crate::event_loop::LoopContext;
use crate::pool::Lane;

/// Address family filter for [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Any,
    V4,
    V6,
}

impl Family {
    /// `0`, `4` or `6`.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Family::Any),
            4 => Some(Family::V4),
            6 => Some(Family::V6),
            _ => None,
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `host` on the calling thread. Literal addresses skip the lookup.
pub fn resolve(host: &str, port: u16, family: Family) -> LoopResult<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let addr = SocketAddr::new(ip, port);
        return if family.accepts(&addr) {
            Ok(vec![addr])
        } else {
            Err(LoopError::NotFound { host: host.to_string() })
        };
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| LoopError::NotFound { host: host.to_string() })?
        .filter(|a| family.accepts(a))
        .collect();
    ktrace!("resolved {} to {} addresses", host, addrs.len());
    if addrs.is_empty() {
        return Err(LoopError::NotFound { host: host.to_string() });
    }
    Ok(addrs)
}

impl LoopContext {
    pub fn lookup(
        &mut self,
        host: impl Into<String>,
        port: u16,
        family: Family,
        cb: impl FnOnce(&mut LoopContext, LoopResult<Vec<SocketAddr>>) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let host = host.into();
        let work = move || resolve(&host, port, family);
        self.submit_blocking(FnOp::new(Lane::Modify, work), move |cx, out| match out {
            Some(result) => cb(cx, result),
            None => cb(cx, Err(LoopError::os(libc::ECANCELED, "getaddrinfo"))),
        })
    }
}

impl EngineHandle {
    pub fn lookup_sync(&self, host: &str, port: u16, family: Family) -> LoopResult<Vec<SocketAddr>> {
        let host = host.to_string();
        match self.run_sync(FnOp::new(Lane::Modify, move || resolve(&host, port, family)))? {
            Some(result) => result,
            None => Err(LoopError::os(libc::ECANCELED, "getaddrinfo")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::event_loop::DefaultHost;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_literal_address() {
        let addrs = resolve("127.0.0.1", 80, Family::Any).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);
        let err = resolve("127.0.0.1", 80, Family::V6).unwrap_err();
        assert_eq!(err.code(), "ENOTFOUND");
    }

    #[test]
    fn test_unknown_host_is_not_found() {
        let err = resolve("no-such-host.invalid", 80, Family::Any).unwrap_err();
        assert_eq!(err.code(), "ENOTFOUND");
        assert_eq!(err.syscall(), Some("getaddrinfo"));
    }

    #[test]
    fn test_family_from_number() {
        assert_eq!(Family::from_number(4), Some(Family::V4));
        assert_eq!(Family::from_number(5), None);
    }

    #[test]
    fn test_lookup_on_loop() {
        let config = EngineConfig::new()
            .num_workers(1)
            .install_signals(false)
            .stdio_baseline(false);
        let mut e = Engine::new(config, Box::new(DefaultHost)).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));
        e.with_context(|cx| {
            let got = got.clone();
            cx.lookup("127.0.0.1", 8080, Family::V4, move |_, res| {
                *got.borrow_mut() = res?;
                Ok(())
            })
            .unwrap();
        });
        e.run().unwrap();
        assert_eq!(got.borrow().len(), 1);
        assert_eq!(got.borrow()[0].port(), 8080);
        assert_eq!(e.handle().lookup_sync("::1", 1, Family::V6).unwrap()[0].port(), 1);
    }
}
