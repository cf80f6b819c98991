use std::net::SocketAddr;

/// Round-robin selector over the resolved addresses of one target.
///
/// Failure reports are tallied per address but evict nothing; the counter
/// is the hook for dead-address suppression if it is ever needed.
pub struct TargetSelector {
    addrs: Vec<SocketAddr>,
    failures: Vec<u64>,
    cursor: usize,
}

impl TargetSelector {
    pub fn new(addrs: Vec<SocketAddr>) -> TargetSelector {
        assert!(!addrs.is_empty(), "selector needs at least one address");

        let failures = vec![0; addrs.len()];

        TargetSelector {
            addrs,
            failures,
            cursor: 0,
        }
    }

    /// The next address in rotation.
    #[inline]
    pub fn next(&mut self) -> SocketAddr {
        let addr = self.addrs[self.cursor];
        self.cursor = (self.cursor + 1) % self.addrs.len();
        addr
    }

    /// Records a connect failure against `addr`. Advisory only.
    pub fn report_failure(&mut self, addr: SocketAddr) {
        if let Some(at) = self.addrs.iter().position(|a| *a == addr) {
            self.failures[at] += 1;
        }
    }

    #[inline]
    pub fn failures(&self, addr: SocketAddr) -> u64 {
        self.addrs
            .iter()
            .position(|a| *a == addr)
            .map(|at| self.failures[at])
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_round_robin_wraps() {
        let mut selector = TargetSelector::new(vec![addr(1), addr(2), addr(3)]);

        assert_eq!(selector.next(), addr(1));
        assert_eq!(selector.next(), addr(2));
        assert_eq!(selector.next(), addr(3));
        assert_eq!(selector.next(), addr(1));
    }

    #[test]
    fn test_failure_reports_do_not_evict() {
        let mut selector = TargetSelector::new(vec![addr(1), addr(2)]);

        selector.report_failure(addr(1));
        selector.report_failure(addr(1));
        selector.report_failure(addr(9));

        assert_eq!(selector.failures(addr(1)), 2);
        assert_eq!(selector.failures(addr(2)), 0);

        // The rotation still serves the failing address.
        assert_eq!(selector.next(), addr(1));
        assert_eq!(selector.next(), addr(2));
        assert_eq!(selector.next(), addr(1));
    }
}
