//! Best-guess origin address resolution behind a trusted reverse proxy.
//!
//! The forwarded-address header is only believed when the transport-layer
//! remote address falls inside the trusted range table. The table is
//! fetched at most once per process, on first use; a failed fetch leaves it
//! unpopulated so a later resolution retries.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::ApiError;

/// Ranges always trusted in addition to the fetched table.
const LOOPBACK_RANGES: [&str; 2] = ["127.0.0.0/8", "::1/128"];

/// Source of the trusted reverse-proxy address ranges.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IpNet>, ApiError>;
}

/// Fetches newline-separated CIDR lists over HTTP (the proxy vendor's
/// published v4 and v6 range lists).
pub struct HttpRangeSource {
    client: reqwest::Client,
    v4_url: String,
    v6_url: String,
}

impl HttpRangeSource {
    pub fn new(v4_url: &str, v6_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            v4_url: v4_url.to_string(),
            v6_url: v6_url.to_string(),
        }
    }

    async fn fetch_list(&self, url: &str) -> Result<Vec<IpNet>, ApiError> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut ranges = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<IpNet>() {
                Ok(net) => ranges.push(net),
                Err(e) => tracing::warn!(%url, %line, ?e, "skipping unparseable range"),
            }
        }
        Ok(ranges)
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn fetch(&self) -> Result<Vec<IpNet>, ApiError> {
        let mut ranges = self.fetch_list(&self.v4_url).await?;
        ranges.extend(self.fetch_list(&self.v6_url).await?);
        Ok(ranges)
    }
}

/// Resolver for a connection's real origin address.
pub struct RealIpResolver {
    source: Arc<dyn RangeSource>,
    // The fetch runs while this async lock is held, so concurrent first
    // resolutions queue behind exactly one fetch. A failed fetch leaves the
    // slot empty; the next resolution retries.
    ranges: Mutex<Option<Arc<Vec<IpNet>>>>,
}

impl RealIpResolver {
    pub fn new(source: Arc<dyn RangeSource>) -> Self {
        Self {
            source,
            ranges: Mutex::new(None),
        }
    }

    async fn ranges(&self) -> Option<Arc<Vec<IpNet>>> {
        let mut slot = self.ranges.lock().await;
        if let Some(ranges) = slot.as_ref() {
            return Some(ranges.clone());
        }

        match self.source.fetch().await {
            Ok(mut fetched) => {
                for raw in LOOPBACK_RANGES {
                    // Infallible: both literals are valid CIDR.
                    if let Ok(net) = raw.parse::<IpNet>() {
                        fetched.push(net);
                    }
                }
                tracing::info!(count = fetched.len(), "loaded trusted proxy ranges");
                let ranges = Arc::new(fetched);
                *slot = Some(ranges.clone());
                Some(ranges)
            }
            Err(e) => {
                tracing::warn!(%e, "trusted range fetch failed; header left untrusted");
                None
            }
        }
    }

    /// Resolve the best-guess origin address for a connection.
    ///
    /// Returns `None` only when no remote address is available at all.
    /// Malformed forwarded values fall back to the remote address.
    pub async fn resolve(
        &self,
        remote: Option<IpAddr>,
        forwarded: Option<&str>,
    ) -> Option<IpAddr> {
        let remote = remote?.to_canonical();

        let Some(forwarded) = forwarded else {
            return Some(remote);
        };
        let Some(ranges) = self.ranges().await else {
            return Some(remote);
        };

        if !ranges.iter().any(|net| net.contains(&remote)) {
            return Some(remote);
        }

        match forwarded.trim().parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(e) => {
                tracing::error!(%forwarded, ?e, "invalid forwarded address from trusted proxy");
                Some(remote)
            }
        }
    }
}

/// Non-reversible digest of a resolved address, keyed by a server secret.
/// The raw address never crosses into session state.
pub fn fingerprint(secret: &str, ip: &IpAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(ip.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        ranges: Vec<IpNet>,
        fetches: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl StaticSource {
        fn new(ranges: &[&str]) -> Self {
            Self {
                ranges: ranges.iter().map(|r| r.parse().unwrap()).collect(),
                fetches: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing_first(ranges: &[&str], failures: usize) -> Self {
            let source = Self::new(ranges);
            source.fail_first.store(failures, Ordering::SeqCst);
            source
        }
    }

    #[async_trait]
    impl RangeSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<IpNet>, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ApiError::internal("range list unavailable"));
            }
            Ok(self.ranges.clone())
        }
    }

    fn resolver(source: Arc<StaticSource>) -> RealIpResolver {
        RealIpResolver::new(source)
    }

    #[tokio::test]
    async fn no_remote_address_resolves_to_none() {
        let resolver = resolver(Arc::new(StaticSource::new(&["203.0.113.0/24"])));
        assert_eq!(resolver.resolve(None, Some("198.51.100.4")).await, None);
    }

    #[tokio::test]
    async fn trusted_remote_uses_forwarded_header() {
        let resolver = resolver(Arc::new(StaticSource::new(&["203.0.113.0/24"])));
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some("198.51.100.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn untrusted_remote_ignores_forwarded_header() {
        let resolver = resolver(Arc::new(StaticSource::new(&["192.0.2.0/24"])));
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some(remote));
    }

    #[tokio::test]
    async fn malformed_forwarded_value_falls_back_to_remote() {
        let resolver = resolver(Arc::new(StaticSource::new(&["203.0.113.0/24"])));
        let remote: IpAddr = "203.0.113.9".parse().unwrap();
        let resolved = resolver.resolve(Some(remote), Some("not-an-ip")).await;
        assert_eq!(resolved, Some(remote));
    }

    #[tokio::test]
    async fn mapped_ipv6_remote_is_normalized_before_range_check() {
        let resolver = resolver(Arc::new(StaticSource::new(&["203.0.113.0/24"])));
        let remote: IpAddr = "::ffff:203.0.113.9".parse().unwrap();
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some("198.51.100.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn loopback_remote_is_always_trusted() {
        let resolver = resolver(Arc::new(StaticSource::new(&["203.0.113.0/24"])));
        let remote: IpAddr = "127.0.0.1".parse().unwrap();
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some("198.51.100.4".parse().unwrap()));
    }

    #[tokio::test]
    async fn concurrent_first_resolutions_share_one_fetch() {
        let source = Arc::new(StaticSource::new(&["203.0.113.0/24"]));
        let resolver = Arc::new(resolver(source.clone()));
        let remote: IpAddr = "203.0.113.9".parse().unwrap();

        let a = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(Some(remote), Some("198.51.100.4")).await })
        };
        let b = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(Some(remote), Some("198.51.100.8")).await })
        };

        assert_eq!(a.await.unwrap(), Some("198.51.100.4".parse().unwrap()));
        assert_eq!(b.await.unwrap(), Some("198.51.100.8".parse().unwrap()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_on_next_resolution() {
        let source = Arc::new(StaticSource::failing_first(&["203.0.113.0/24"], 1));
        let resolver = resolver(source.clone());
        let remote: IpAddr = "203.0.113.9".parse().unwrap();

        // First attempt: fetch fails, header is not trusted.
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some(remote));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        // Second attempt: fetch retried and succeeds, header trusted.
        let resolved = resolver.resolve(Some(remote), Some("198.51.100.4")).await;
        assert_eq!(resolved, Some("198.51.100.4".parse().unwrap()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        // Third attempt: table already populated, no further fetch.
        resolver.resolve(Some(remote), None).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fingerprint_is_stable_and_opaque() {
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let a = fingerprint("secret", &ip);
        let b = fingerprint("secret", &ip);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("198.51.100.4"));
        assert_ne!(a, fingerprint("other-secret", &ip));
    }
}
