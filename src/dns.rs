//! XMPP service discovery: SRV record lookup and candidate ordering.
//!
//! Converts a remote XMPP domain into an ordered list of `SrvCandidate`s
//! ready for address resolution and TCP connection. Candidates come from
//! `_xmpps-server._tcp` (direct TLS) and `_xmpp-server._tcp` SRV records,
//! ordered per RFC 2782 (priority ascending, weighted-random within a
//! priority tier), with fallback to the legacy `_jabber._tcp` service and
//! finally to the bare domain on the default port.

use rand::Rng;
use std::collections::HashMap;
use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// One connectable service location from DNS (or the override table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub hostname: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    /// TLS immediately on connect, as opposed to in-band STARTTLS.
    pub direct_tls: bool,
}

impl SrvCandidate {
    /// A synthetic candidate for a domain without SRV records.
    pub fn fallback(domain: &str, port: u16) -> Self {
        Self {
            hostname: domain.to_string(),
            port,
            priority: 0,
            weight: 0,
            direct_tls: false,
        }
    }
}

/// Resolves remote XMPP domains into prioritized candidate lists.
pub struct ServiceResolver {
    resolver: TokioAsyncResolver,
    /// domain → "host:port"; a present entry bypasses DNS entirely.
    overrides: HashMap<String, (String, u16)>,
    allow_direct_tls: bool,
}

impl ServiceResolver {
    /// Build on the system resolver configuration, falling back to defaults
    /// when the system config cannot be loaded.
    pub fn from_system(overrides: &HashMap<String, String>, allow_direct_tls: bool) -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => {
                info!("Using system DNS resolver");
                r
            }
            Err(e) => {
                warn!(error = %e, "Failed to load system DNS config, falling back to default resolver");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self::new(resolver, overrides, allow_direct_tls)
    }

    pub fn new(
        resolver: TokioAsyncResolver,
        overrides: &HashMap<String, String>,
        allow_direct_tls: bool,
    ) -> Self {
        let overrides = overrides
            .iter()
            .filter_map(|(domain, target)| {
                match parse_host_port(target) {
                    Some((host, port)) => Some((domain.to_lowercase(), (host, port))),
                    None => {
                        warn!(domain = %domain, target = %target, "Ignoring malformed DNS override");
                        None
                    }
                }
            })
            .collect();
        Self {
            resolver,
            overrides,
            allow_direct_tls,
        }
    }

    /// The underlying recursive resolver, shared with address lookups.
    pub fn ip_resolver(&self) -> TokioAsyncResolver {
        self.resolver.clone()
    }

    /// Resolve a remote domain to an ordered candidate list.
    ///
    /// Never fails: DNS name-not-found yields empty lookups, transport
    /// errors are logged and treated as empty, and an empty end result is
    /// replaced by the synthetic `domain:default_port` fallback.
    pub async fn resolve(&self, domain: &str, default_port: u16) -> Vec<SrvCandidate> {
        // Static overrides are returned verbatim: single entry, no
        // prioritization, no DNS traffic.
        if let Some((host, port)) = self.overrides.get(&domain.to_lowercase()) {
            info!(domain, host = %host, port, "Using static DNS override");
            return vec![SrvCandidate {
                hostname: host.clone(),
                port: *port,
                priority: 0,
                weight: 0,
                direct_tls: false,
            }];
        }

        let mut records = Vec::new();
        let mut unavailable = false;
        if self.allow_direct_tls {
            let (found, marker) = self.srv_lookup(domain, "_xmpps-server._tcp", true).await;
            records.extend(found);
            unavailable |= marker;
        }
        let (found, marker) = self.srv_lookup(domain, "_xmpp-server._tcp", false).await;
        records.extend(found);
        unavailable |= marker;

        if records.is_empty() && !unavailable {
            let (found, marker) = self.srv_lookup(domain, "_jabber._tcp", false).await;
            records.extend(found);
            unavailable |= marker;
        }

        if records.is_empty() {
            // A "." target means the domain has declared the service
            // decidedly unavailable; the address fallback must not apply.
            if unavailable {
                warn!(domain, "SRV records declare service not available");
                return Vec::new();
            }
            warn!(domain, port = default_port, "No SRV records found, using fallback");
            return vec![SrvCandidate::fallback(domain, default_port)];
        }

        let ordered = prioritize(records, &mut rand::rng());
        info!(domain, count = ordered.len(), "SRV resolution complete");
        ordered
    }

    /// Returns the usable records plus whether a "." target was seen.
    async fn srv_lookup(
        &self,
        domain: &str,
        service: &str,
        direct_tls: bool,
    ) -> (Vec<SrvCandidate>, bool) {
        let srv_name = format!("{}.{}", service, domain);
        let started = std::time::Instant::now();
        match self.resolver.srv_lookup(&srv_name).await {
            Ok(lookup) => {
                let lookup_ms = started.elapsed().as_millis() as u64;
                let mut candidates = Vec::new();
                let mut unavailable = false;
                for r in lookup.iter() {
                    let target = r.target().to_string().trim_end_matches('.').to_string();
                    // RFC 2782: target "." means service decidedly not available
                    if target.is_empty() {
                        info!(domain, srv = %srv_name, "SRV record with '.' target");
                        unavailable = true;
                        continue;
                    }
                    info!(domain, host = %target, port = r.port(),
                        priority = r.priority(), weight = r.weight(), direct_tls,
                        "SRV record");
                    candidates.push(SrvCandidate {
                        hostname: target,
                        port: r.port(),
                        priority: r.priority(),
                        weight: r.weight(),
                        direct_tls,
                    });
                }
                info!(domain, srv = %srv_name, count = candidates.len(), lookup_ms, "SRV lookup done");
                (candidates, unavailable)
            }
            Err(e) => {
                // Name-not-found and transport errors alike are non-fatal here.
                info!(domain, srv = %srv_name,
                    lookup_ms = started.elapsed().as_millis() as u64,
                    error = %e, "SRV lookup failed");
                (Vec::new(), false)
            }
        }
    }
}

fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port_str) = target.rsplit_once(':')?;
    let port = port_str.parse::<u16>().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Order SRV records per RFC 2782 §3.
///
/// Records are grouped by priority ascending. Within a tier, nonzero-weight
/// records are drawn repeatedly without replacement using cumulative-weight
/// selection; zero-weight records are deferred to the end of their tier and
/// shuffled uniformly.
pub fn prioritize<R: Rng>(mut records: Vec<SrvCandidate>, rng: &mut R) -> Vec<SrvCandidate> {
    records.sort_by_key(|r| r.priority);

    let mut ordered = Vec::with_capacity(records.len());
    let mut records = records.into_iter().peekable();

    while let Some(first) = records.next() {
        let priority = first.priority;
        let mut tier = vec![first];
        while records.peek().map(|r| r.priority) == Some(priority) {
            // peek above guarantees the element exists
            if let Some(r) = records.next() {
                tier.push(r);
            }
        }

        let (mut weighted, mut zero): (Vec<_>, Vec<_>) =
            tier.into_iter().partition(|r| r.weight > 0);

        while !weighted.is_empty() {
            let total: u32 = weighted.iter().map(|r| r.weight as u32).sum();
            let mut draw = rng.random_range(0..total);
            let mut picked = 0;
            for (i, r) in weighted.iter().enumerate() {
                let w = r.weight as u32;
                if draw < w {
                    picked = i;
                    break;
                }
                draw -= w;
            }
            ordered.push(weighted.remove(picked));
        }

        // Uniform shuffle for the zero-weight remainder.
        for i in (1..zero.len()).rev() {
            let j = rng.random_range(0..=i);
            zero.swap(i, j);
        }
        ordered.append(&mut zero);
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn candidate(host: &str, priority: u16, weight: u16) -> SrvCandidate {
        SrvCandidate {
            hostname: host.to_string(),
            port: 5269,
            priority,
            weight,
            direct_tls: false,
        }
    }

    // --- prioritize tests ---

    #[test]
    fn test_prioritize_orders_by_priority_ascending() {
        let mut rng = StdRng::seed_from_u64(7);
        let records = vec![
            candidate("c.example.org", 20, 5),
            candidate("a.example.org", 0, 5),
            candidate("b.example.org", 10, 5),
        ];
        let ordered = prioritize(records, &mut rng);
        assert_eq!(ordered[0].hostname, "a.example.org");
        assert_eq!(ordered[1].hostname, "b.example.org");
        assert_eq!(ordered[2].hostname, "c.example.org");
    }

    #[test]
    fn test_prioritize_zero_weight_always_sorts_last_in_tier() {
        // Priority 0/weight 0 and priority 0/weight 10: the weighted record
        // must come first regardless of the random draw.
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let records = vec![
                candidate("zero.example.org", 0, 0),
                candidate("ten.example.org", 0, 10),
            ];
            let ordered = prioritize(records, &mut rng);
            assert_eq!(ordered[0].hostname, "ten.example.org", "seed {}", seed);
            assert_eq!(ordered[1].hostname, "zero.example.org");
        }
    }

    #[test]
    fn test_prioritize_zero_weight_stays_within_its_tier() {
        // A zero-weight record in a lower-priority tier still precedes every
        // record of higher-priority tiers.
        let mut rng = StdRng::seed_from_u64(3);
        let records = vec![
            candidate("tier1.example.org", 1, 100),
            candidate("zero.example.org", 0, 0),
        ];
        let ordered = prioritize(records, &mut rng);
        assert_eq!(ordered[0].hostname, "zero.example.org");
    }

    #[test]
    fn test_prioritize_weighted_selection_is_proportional() {
        // Statistical property: with weights 10 and 90 the heavy record
        // should be drawn first roughly 90% of the time.
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 5000;
        let mut heavy_first = 0;
        for _ in 0..trials {
            let records = vec![
                candidate("light.example.org", 0, 10),
                candidate("heavy.example.org", 0, 90),
            ];
            let ordered = prioritize(records, &mut rng);
            if ordered[0].hostname == "heavy.example.org" {
                heavy_first += 1;
            }
        }
        let share = heavy_first as f64 / trials as f64;
        assert!(
            (share - 0.9).abs() < 0.03,
            "expected ~0.90, observed {:.3}",
            share
        );
    }

    #[test]
    fn test_prioritize_preserves_all_records() {
        let mut rng = StdRng::seed_from_u64(11);
        let records: Vec<_> = (0..10u16)
            .map(|i| candidate(&format!("h{}.example.org", i), i % 3, i))
            .collect();
        let ordered = prioritize(records.clone(), &mut rng);
        assert_eq!(ordered.len(), records.len());
        for r in &records {
            assert!(ordered.contains(r), "missing {:?}", r);
        }
    }

    #[test]
    fn test_prioritize_empty_input() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(prioritize(Vec::new(), &mut rng).is_empty());
    }

    // --- parse_host_port tests ---

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("10.0.0.5:5269"),
            Some(("10.0.0.5".to_string(), 5269))
        );
        assert_eq!(parse_host_port("no-port.example.org"), None);
        assert_eq!(parse_host_port("host:notaport"), None);
        assert_eq!(parse_host_port(":5269"), None);
    }

    // --- resolver tests ---

    fn test_resolver(overrides: &HashMap<String, String>) -> ServiceResolver {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        ServiceResolver::new(resolver, overrides, true)
    }

    #[tokio::test]
    async fn test_resolve_override_bypasses_dns() {
        let mut overrides = HashMap::new();
        overrides.insert("example.org".to_string(), "10.0.0.5:5269".to_string());
        let resolver = test_resolver(&overrides);

        let candidates = resolver.resolve("example.org", 5269).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].hostname, "10.0.0.5");
        assert_eq!(candidates[0].port, 5269);
        assert!(!candidates[0].direct_tls);
    }

    #[tokio::test]
    async fn test_resolve_override_is_case_insensitive() {
        let mut overrides = HashMap::new();
        overrides.insert("Example.ORG".to_string(), "10.0.0.5:5270".to_string());
        let resolver = test_resolver(&overrides);

        let candidates = resolver.resolve("example.org", 5269).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].port, 5270);
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let resolver = test_resolver(&HashMap::new());
        let candidates = resolver
            .resolve("this-domain-definitely-does-not-exist-xmpp-test.example", 5269)
            .await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].hostname,
            "this-domain-definitely-does-not-exist-xmpp-test.example"
        );
        assert_eq!(candidates[0].port, 5269);
        assert!(!candidates[0].direct_tls);
    }

    #[tokio::test]
    async fn test_malformed_override_is_ignored() {
        let mut overrides = HashMap::new();
        overrides.insert("bad.example".to_string(), "no-port-here".to_string());
        let resolver = test_resolver(&overrides);
        // Falls through to DNS, which yields the synthetic fallback.
        let candidates = resolver.resolve("bad.example", 5269).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].hostname, "bad.example");
    }
}
