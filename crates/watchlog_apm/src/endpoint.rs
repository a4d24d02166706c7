//! Endpoint Resolver
//!
//! Picks the collector base URL. An endpoint configured explicitly is used
//! verbatim; otherwise the process probes for a Kubernetes environment and
//! switches to the in-cluster agent address when one is detected. Probe
//! failures of any kind count as "not detected".

use std::path::PathBuf;
use std::time::Duration;

/// Collector base URL used when nothing else is configured or detected.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:3774/apm";

/// Collector base URL inside a Kubernetes cluster.
pub const IN_CLUSTER_ENDPOINT: &str = "http://watchlog-python-agent.monitoring.svc.cluster.local:3774/apm";

/// Kubernetes environment detection.
#[derive(Debug, Clone)]
pub struct ClusterProbe {
    /// Service-account token mounted into every pod.
    pub token_path: PathBuf,
    /// Control-group file of the init process.
    pub cgroup_path: PathBuf,
    /// Marker looked for in the cgroup file.
    pub cgroup_marker: String,
    /// Name only resolvable through cluster DNS.
    pub dns_host: String,
    /// Upper bound on the DNS lookup.
    pub dns_timeout: Duration,
}

impl Default for ClusterProbe {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            cgroup_path: PathBuf::from("/proc/1/cgroup"),
            cgroup_marker: "kubepods".to_string(),
            dns_host: "kubernetes.default.svc.cluster.local".to_string(),
            dns_timeout: Duration::from_secs(2),
        }
    }
}

impl ClusterProbe {
    /// Returns `true` if any probe detects a cluster. Probes run in order and
    /// stop at the first hit.
    pub async fn detect(&self) -> bool {
        self.token_present().await || self.cgroup_matches().await || self.dns_resolves().await
    }

    async fn token_present(&self) -> bool {
        match tokio::fs::try_exists(&self.token_path).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::debug!(path = %self.token_path.display(), error = %e, "token probe failed");
                false
            }
        }
    }

    async fn cgroup_matches(&self) -> bool {
        match tokio::fs::read_to_string(&self.cgroup_path).await {
            Ok(contents) => contents.contains(&self.cgroup_marker),
            Err(e) => {
                tracing::debug!(path = %self.cgroup_path.display(), error = %e, "cgroup probe failed");
                false
            }
        }
    }

    async fn dns_resolves(&self) -> bool {
        let lookup = tokio::net::lookup_host((self.dns_host.as_str(), 443));
        match tokio::time::timeout(self.dns_timeout, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                tracing::debug!(host = %self.dns_host, error = %e, "dns probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(host = %self.dns_host, "dns probe timed out");
                false
            }
        }
    }

    /// Chooses the collector base URL.
    ///
    /// A `user_endpoint` that differs from `default` is returned unchanged and
    /// no probing happens.
    pub async fn resolve_base(&self, default: &str, user_endpoint: Option<&str>) -> String {
        if let Some(endpoint) = user_endpoint.filter(|e| *e != default) {
            return endpoint.to_string();
        }
        if self.detect().await {
            tracing::info!(endpoint = IN_CLUSTER_ENDPOINT, "kubernetes environment detected");
            IN_CLUSTER_ENDPOINT.to_string()
        } else {
            default.to_string()
        }
    }
}

/// Full ingestion URL for a service: `<base>/<service>/v1/traces`.
pub fn collector_url(base: &str, service_name: &str) -> String {
    format!("{}/{}/v1/traces", base, service_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn outside_cluster() -> ClusterProbe {
        let dir = tempdir().unwrap();
        ClusterProbe {
            token_path: dir.path().join("missing-token"),
            cgroup_path: dir.path().join("missing-cgroup"),
            dns_host: "cluster-probe.invalid".to_string(),
            dns_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_endpoint_outside_cluster() {
        let probe = outside_cluster();
        let base = probe.resolve_base(DEFAULT_ENDPOINT, None).await;
        assert_eq!(base, DEFAULT_ENDPOINT);
        assert_eq!(
            collector_url(&base, "orders"),
            "http://localhost:3774/apm/orders/v1/traces"
        );
    }

    #[tokio::test]
    async fn test_user_endpoint_skips_detection() {
        let token = NamedTempFile::new().unwrap();
        let probe = ClusterProbe {
            token_path: token.path().to_path_buf(),
            ..outside_cluster()
        };
        assert!(probe.detect().await);

        let base = probe
            .resolve_base(DEFAULT_ENDPOINT, Some("https://apm.example.com/ingest"))
            .await;
        assert_eq!(base, "https://apm.example.com/ingest");
    }

    #[tokio::test]
    async fn test_user_endpoint_equal_to_default_still_probes() {
        let token = NamedTempFile::new().unwrap();
        let probe = ClusterProbe {
            token_path: token.path().to_path_buf(),
            ..outside_cluster()
        };
        let base = probe.resolve_base(DEFAULT_ENDPOINT, Some(DEFAULT_ENDPOINT)).await;
        assert_eq!(base, IN_CLUSTER_ENDPOINT);
    }

    #[tokio::test]
    async fn test_cgroup_marker_detected() {
        let mut cgroup = NamedTempFile::new().unwrap();
        writeln!(cgroup, "12:memory:/kubepods/burstable/pod1234/abcd").unwrap();

        let probe = ClusterProbe {
            cgroup_path: cgroup.path().to_path_buf(),
            ..outside_cluster()
        };
        assert!(probe.detect().await);
        assert_eq!(probe.resolve_base(DEFAULT_ENDPOINT, None).await, IN_CLUSTER_ENDPOINT);
    }

    #[tokio::test]
    async fn test_cgroup_without_marker() {
        let mut cgroup = NamedTempFile::new().unwrap();
        writeln!(cgroup, "0::/init.scope").unwrap();

        let probe = ClusterProbe {
            cgroup_path: cgroup.path().to_path_buf(),
            ..outside_cluster()
        };
        assert!(!probe.detect().await);
    }

    #[tokio::test]
    async fn test_unreadable_cgroup_is_not_detected() {
        // A directory cannot be read as a string
        let dir = tempdir().unwrap();
        let probe = ClusterProbe {
            cgroup_path: dir.path().to_path_buf(),
            ..outside_cluster()
        };
        assert!(!probe.cgroup_matches().await);
    }

    #[tokio::test]
    async fn test_dns_probe_resolves_localhost() {
        let probe = ClusterProbe {
            dns_host: "localhost".to_string(),
            ..outside_cluster()
        };
        assert!(probe.dns_resolves().await);
    }
}
