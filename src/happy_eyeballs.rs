//! Dual-stack address racing ("Happy Eyeballs", RFC 8305 style).
//!
//! Each SRV candidate gets its own resolution task; results are merged into
//! a shared structure keyed by candidate index so that SRV priority order is
//! preserved while a slow or absent address family cannot stall the caller
//! indefinitely. `next()` serves one address per call, preferring the
//! lowest-index candidate and alternating address families, waiting at most
//! the resolution delay before falling back to whatever has resolved.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use trust_dns_resolver::TokioAsyncResolver;

use crate::dns::SrvCandidate;

/// How long background resolution may continue once the consumer stops
/// pulling addresses. Letting tasks finish warms the OS resolver cache for
/// the next attempt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A socket-ready address, tied back to the SRV candidate it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServiceAddress {
    pub addr: SocketAddr,
    pub direct_tls: bool,
    /// Index of the originating `SrvCandidate`, preserving priority order.
    pub origin_index: usize,
}

impl ResolvedServiceAddress {
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

struct RacerState {
    /// Unconsumed addresses per candidate index.
    queues: Vec<VecDeque<ResolvedServiceAddress>>,
    /// Whether the resolution task for an index has finished (success or not).
    completed: Vec<bool>,
    /// Lowest candidate index that is not yet exhausted.
    preferred: usize,
    /// Family of the last yielded address, for alternation.
    last_was_ipv4: Option<bool>,
}

impl RacerState {
    fn new(candidate_count: usize) -> Self {
        Self {
            queues: (0..candidate_count).map(|_| VecDeque::new()).collect(),
            completed: vec![false; candidate_count],
            preferred: 0,
            last_was_ipv4: None,
        }
    }

    /// Skip candidates whose resolution finished and whose addresses are
    /// all consumed.
    fn advance_preferred(&mut self) {
        while self.preferred < self.queues.len()
            && self.completed[self.preferred]
            && self.queues[self.preferred].is_empty()
        {
            self.preferred += 1;
        }
    }

    fn all_exhausted(&self) -> bool {
        self.completed.iter().all(|done| *done)
            && self.queues.iter().all(|q| q.is_empty())
    }

    /// Pop from queue `index`, preferring the requested family.
    fn pop(&mut self, index: usize, want_ipv4: bool) -> Option<ResolvedServiceAddress> {
        let queue = self.queues.get_mut(index)?;
        let position = queue
            .iter()
            .position(|a| a.is_ipv4() == want_ipv4)
            .unwrap_or(0);
        let address = queue.remove(position)?;
        self.last_was_ipv4 = Some(address.is_ipv4());
        Some(address)
    }
}

/// Races hostname resolution across SRV candidates and address families.
pub struct HappyEyeballsResolver {
    state: Arc<Mutex<RacerState>>,
    notify: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    prefer_ipv4: bool,
    resolution_delay: Duration,
}

impl HappyEyeballsResolver {
    pub fn new(candidate_count: usize, prefer_ipv4: bool, resolution_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RacerState::new(candidate_count))),
            notify: Arc::new(Notify::new()),
            tasks: Vec::with_capacity(candidate_count),
            prefer_ipv4,
            resolution_delay,
        }
    }

    /// Build a racer over the given candidates, spawning one DNS resolution
    /// task per candidate.
    pub fn for_candidates(
        resolver: TokioAsyncResolver,
        candidates: &[SrvCandidate],
        prefer_ipv4: bool,
        resolution_delay: Duration,
    ) -> Self {
        let mut racer = Self::new(candidates.len(), prefer_ipv4, resolution_delay);
        for (index, candidate) in candidates.iter().enumerate() {
            let resolver = resolver.clone();
            let hostname = candidate.hostname.clone();
            let port = candidate.port;
            let direct_tls = candidate.direct_tls;
            racer.solve(index, async move {
                match resolver.lookup_ip(hostname.as_str()).await {
                    Ok(lookup) => lookup
                        .iter()
                        .map(|ip| ResolvedServiceAddress {
                            addr: SocketAddr::new(ip, port),
                            direct_tls,
                            origin_index: index,
                        })
                        .collect(),
                    Err(e) => {
                        debug!(host = %hostname, error = %e, "Address resolution failed");
                        Vec::new()
                    }
                }
            });
        }
        racer
    }

    /// Run one resolution task for candidate `index`. The task's addresses
    /// become available to `next()` as soon as it completes.
    pub fn solve<F>(&mut self, index: usize, task: F)
    where
        F: std::future::Future<Output = Vec<ResolvedServiceAddress>> + Send + 'static,
    {
        let state = self.state.clone();
        let notify = self.notify.clone();
        self.tasks.push(tokio::spawn(async move {
            let addresses = task.await;
            {
                let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(queue) = st.queues.get_mut(index) {
                    for mut address in addresses {
                        address.origin_index = index;
                        queue.push_back(address);
                    }
                }
                if let Some(done) = st.completed.get_mut(index) {
                    *done = true;
                }
            }
            notify.notify_waiters();
        }));
    }

    /// Yield the next address to try, or `None` if nothing is available
    /// within the resolution delay (call again while `!is_exhausted()`),
    /// or if every candidate is exhausted.
    ///
    /// Selection policy: wait for the preferred (lowest non-exhausted)
    /// candidate to resolve, alternating address family against the last
    /// yielded address; on deadline expiry, fall back to the lowest-index
    /// address already available.
    pub async fn next(&self) -> Option<ResolvedServiceAddress> {
        let deadline = tokio::time::Instant::now() + self.resolution_delay;
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                st.advance_preferred();
                if st.all_exhausted() {
                    return None;
                }
                let want_ipv4 = match st.last_was_ipv4 {
                    Some(was_v4) => !was_v4,
                    None => self.prefer_ipv4,
                };
                let preferred = st.preferred;
                if preferred < st.queues.len()
                    && st.completed[preferred]
                    && !st.queues[preferred].is_empty()
                {
                    return st.pop(preferred, want_ipv4);
                }
                if tokio::time::Instant::now() >= deadline {
                    // The preferred candidate did not make it in time; take
                    // the lowest-index address that did.
                    let available = (0..st.queues.len()).find(|i| !st.queues[*i].is_empty());
                    return match available {
                        Some(index) => st.pop(index, want_ipv4),
                        None => None,
                    };
                }
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// True once every resolution task has completed (success or failure).
    pub fn is_done(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.completed.iter().all(|done| *done)
    }

    /// True when no address will ever be yielded again.
    pub fn is_exhausted(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.all_exhausted()
    }

    /// Stop pulling: let outstanding resolution finish for a short grace
    /// period (to warm OS caches), then cancel what remains.
    pub fn shutdown(self) {
        let tasks = self.tasks;
        if tasks.iter().all(|t| t.is_finished()) {
            return;
        }
        info!(outstanding = tasks.iter().filter(|t| !t.is_finished()).count(),
            "Racer shutting down, granting resolution grace period");
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            for task in tasks {
                task.abort();
            }
        });
    }

    /// Cancel all outstanding resolution immediately.
    pub fn shutdown_now(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    const DELAY: Duration = Duration::from_millis(50);

    fn v4(index: usize, last_octet: u8) -> ResolvedServiceAddress {
        ResolvedServiceAddress {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, last_octet)), 5269),
            direct_tls: false,
            origin_index: index,
        }
    }

    fn v6(index: usize, last: u16) -> ResolvedServiceAddress {
        ResolvedServiceAddress {
            addr: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last)),
                5269,
            ),
            direct_tls: false,
            origin_index: index,
        }
    }

    async fn immediate(addrs: Vec<ResolvedServiceAddress>) -> Vec<ResolvedServiceAddress> {
        addrs
    }

    async fn delayed(
        delay: Duration,
        addrs: Vec<ResolvedServiceAddress>,
    ) -> Vec<ResolvedServiceAddress> {
        tokio::time::sleep(delay).await;
        addrs
    }

    /// Pull until `want` addresses arrive or the attempt budget runs out.
    async fn collect(racer: &HappyEyeballsResolver, want: usize) -> Vec<ResolvedServiceAddress> {
        let mut results = Vec::new();
        for _ in 0..10 {
            if let Some(a) = racer.next().await {
                results.push(a);
            }
            if results.len() == want {
                break;
            }
        }
        results
    }

    #[tokio::test]
    async fn test_first_result_prefers_configured_family() {
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(1, prefer_ipv4, DELAY);
            racer.solve(0, immediate(vec![v4(0, 1), v6(0, 1)]));
            let result = racer.next().await.expect("address expected");
            assert_eq!(result.is_ipv4(), prefer_ipv4);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_no_records_yields_none_without_waiting() {
        let mut racer = HappyEyeballsResolver::new(1, true, DELAY);
        racer.solve(0, immediate(Vec::new()));
        // Let the solver task land.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(racer.next().await.is_none());
        assert!(racer.is_done());
        assert!(racer.is_exhausted());
        racer.shutdown_now();
    }

    #[tokio::test]
    async fn test_records_after_resolution_delay_yield_none_this_round() {
        let mut racer = HappyEyeballsResolver::new(1, true, DELAY);
        racer.solve(0, delayed(DELAY * 3, vec![v4(0, 1)]));
        assert!(racer.next().await.is_none(), "nothing resolved within the delay");
        assert!(!racer.is_exhausted(), "candidate is still outstanding");
        racer.shutdown_now();
    }

    #[tokio::test]
    async fn test_single_family_is_served_even_when_not_preferred() {
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(1, prefer_ipv4, DELAY);
            racer.solve(0, immediate(vec![v6(0, 1)]));
            assert!(racer.next().await.is_some(), "prefer_ipv4={}", prefer_ipv4);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_preferred_host_wins_when_resolved_within_delay() {
        // Candidate 0 resolves slightly late but within the delay; it must
        // still be yielded before the immediately-available candidate 1.
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(2, prefer_ipv4, DELAY);
            racer.solve(0, delayed(DELAY / 2, vec![v4(0, 1), v6(0, 1)]));
            racer.solve(1, immediate(vec![v4(1, 2), v6(1, 2)]));
            let result = racer.next().await.expect("address expected");
            assert_eq!(result.origin_index, 0);
            assert_eq!(result.is_ipv4(), prefer_ipv4);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_fallback_to_second_host_after_resolution_delay() {
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(2, prefer_ipv4, DELAY);
            racer.solve(0, delayed(DELAY * 3, vec![v4(0, 1), v6(0, 1)]));
            racer.solve(1, immediate(vec![v4(1, 2), v6(1, 2)]));
            let result = racer.next().await.expect("address expected");
            assert_eq!(result.origin_index, 1);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_all_results_alternate_family_within_priority_order() {
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(2, prefer_ipv4, DELAY);
            racer.solve(0, immediate(vec![v4(0, 1), v6(0, 1)]));
            racer.solve(1, immediate(vec![v4(1, 2), v6(1, 2)]));

            let results = collect(&racer, 4).await;
            assert_eq!(results.len(), 4);
            assert_eq!(results[0].origin_index, 0);
            assert_eq!(results[0].is_ipv4(), prefer_ipv4);
            assert_eq!(results[1].origin_index, 0);
            assert_eq!(results[1].is_ipv4(), !prefer_ipv4);
            assert_eq!(results[2].origin_index, 1);
            assert_eq!(results[2].is_ipv4(), prefer_ipv4);
            assert_eq!(results[3].origin_index, 1);
            assert_eq!(results[3].is_ipv4(), !prefer_ipv4);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_never_yields_duplicates_or_more_than_resolved() {
        let mut racer = HappyEyeballsResolver::new(2, true, DELAY);
        racer.solve(0, immediate(vec![v4(0, 1), v6(0, 1)]));
        racer.solve(1, immediate(vec![v6(1, 2)]));

        let results = collect(&racer, 5).await;
        assert_eq!(results.len(), 3, "only three addresses were resolved");
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                assert_ne!(a.addr, b.addr, "duplicate address yielded");
            }
        }
        assert!(racer.is_exhausted());
        racer.shutdown_now();
    }

    #[tokio::test]
    async fn test_family_interleaving_when_preferred_family_arrives_late() {
        // Candidate 0 (both families) resolves only after the delay;
        // candidate 1 has just the non-preferred family. The first yield
        // falls back to candidate 1, later yields drain candidate 0 in
        // family-alternating order.
        for prefer_ipv4 in [true, false] {
            let mut racer = HappyEyeballsResolver::new(2, prefer_ipv4, DELAY);
            racer.solve(0, delayed(DELAY * 3, vec![v4(0, 1), v6(0, 1)]));
            let other_family = if prefer_ipv4 { v6(1, 2) } else { v4(1, 2) };
            racer.solve(1, immediate(vec![other_family]));

            let results = collect(&racer, 3).await;
            assert_eq!(results.len(), 3);
            assert_eq!(results[0].origin_index, 1);
            assert_eq!(results[0].is_ipv4(), !prefer_ipv4);
            assert_eq!(results[1].origin_index, 0);
            assert_eq!(results[1].is_ipv4(), prefer_ipv4);
            assert_eq!(results[2].origin_index, 0);
            assert_eq!(results[2].is_ipv4(), !prefer_ipv4);
            racer.shutdown_now();
        }
    }

    #[tokio::test]
    async fn test_never_yields_from_incomplete_resolution() {
        let mut racer = HappyEyeballsResolver::new(1, true, DELAY);
        racer.solve(0, delayed(DELAY * 4, vec![v4(0, 1)]));
        // Two rounds while resolution is outstanding: nothing may be yielded.
        assert!(racer.next().await.is_none());
        assert!(!racer.is_done());
        // Once resolution completes, the address appears.
        tokio::time::sleep(DELAY * 4).await;
        let result = racer.next().await;
        assert_eq!(result.map(|r| r.origin_index), Some(0));
        racer.shutdown_now();
    }
}
