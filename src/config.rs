use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// One configured check for a host. A plain TCP port is a degenerate range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSpec {
    Icmp,
    Tcp { ports: RangeInclusive<u16> },
}

impl TestSpec {
    pub fn label(&self) -> String {
        match self {
            Self::Icmp => "ICMP".into(),
            Self::Tcp { ports } if ports.start() == ports.end() => {
                format!("TCP port {}", ports.start())
            }
            Self::Tcp { ports } => format!("TCP ports {}-{}", ports.start(), ports.end()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Host {
    pub addr: IpAddr,
    pub description: String,
    /// Non-empty; a host with no declared tests gets one ICMP test.
    pub tests: Vec<TestSpec>,
}

/// Aggregation policy for a TCP test covering a port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPolicy {
    /// Up when at least one port in the range accepts a connection.
    Any,
    /// Up only when every port in the range accepts a connection.
    All,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub history_length: usize,
    pub slow_threshold_ms: f64,
    pub icmp_timeout: Duration,
    pub tcp_timeout: Duration,
    pub max_concurrency: usize,
    pub port_policy: PortPolicy,
    pub hosts: Vec<Host>,
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let raw: RawConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.interval_secs == 0 {
            bail!("interval_secs must be non-zero");
        }
        if raw.history_length == 0 {
            bail!("history_length must be non-zero");
        }
        if raw.max_concurrency == 0 {
            bail!("max_concurrency must be non-zero");
        }

        let mut hosts = Vec::new();
        for entry in raw.hosts {
            for (address, details) in entry {
                let details = details.unwrap_or_default();
                let addr: IpAddr = address
                    .parse()
                    .with_context(|| format!("invalid IP address: {address}"))?;
                let description = details.description.unwrap_or_else(|| address.clone());
                let tests = match details.tests {
                    Some(list) if !list.is_empty() => list
                        .into_iter()
                        .map(|test| parse_test(&address, test))
                        .collect::<Result<Vec<_>>>()?,
                    _ => vec![TestSpec::Icmp],
                };
                hosts.push(Host {
                    addr,
                    description,
                    tests,
                });
            }
        }
        if hosts.is_empty() {
            bail!("config must declare at least one host");
        }

        Ok(Self {
            interval: Duration::from_secs(raw.interval_secs),
            history_length: raw.history_length,
            slow_threshold_ms: raw.slow_threshold_ms,
            icmp_timeout: Duration::from_millis(raw.icmp_timeout_ms),
            tcp_timeout: Duration::from_millis(raw.tcp_timeout_ms),
            max_concurrency: raw.max_concurrency,
            port_policy: raw.port_policy,
            hosts,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    // IndexMap keeps hosts in file order when one list item carries
    // several host keys.
    hosts: Vec<IndexMap<String, Option<RawHost>>>,
    #[serde(default = "default_interval_secs")]
    interval_secs: u64,
    #[serde(default = "default_history_length")]
    history_length: usize,
    #[serde(default = "default_slow_threshold_ms")]
    slow_threshold_ms: f64,
    #[serde(default = "default_icmp_timeout_ms")]
    icmp_timeout_ms: u64,
    #[serde(default = "default_tcp_timeout_ms")]
    tcp_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    max_concurrency: usize,
    #[serde(default = "default_port_policy")]
    port_policy: PortPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct RawHost {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tests: Option<Vec<RawTest>>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default)]
    port: Option<RawPort>,
}

/// A port is either a YAML integer or a string, possibly `"low-high"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

fn default_interval_secs() -> u64 { 1 }
fn default_history_length() -> usize { 35 }
fn default_slow_threshold_ms() -> f64 { 200.0 }
fn default_icmp_timeout_ms() -> u64 { 1000 }
fn default_tcp_timeout_ms() -> u64 { 500 }
fn default_max_concurrency() -> usize { 20 }
fn default_port_policy() -> PortPolicy { PortPolicy::Any }
fn default_protocol() -> String { "ICMP".into() }

fn parse_test(address: &str, test: RawTest) -> Result<TestSpec> {
    match test.protocol.to_ascii_uppercase().as_str() {
        "ICMP" => Ok(TestSpec::Icmp),
        "TCP" => {
            let port = test
                .port
                .with_context(|| format!("TCP test for {address} must specify a port"))?;
            let ports = parse_ports(address, port)?;
            Ok(TestSpec::Tcp { ports })
        }
        other => bail!("unknown protocol '{other}' for {address}"),
    }
}

fn parse_ports(address: &str, port: RawPort) -> Result<RangeInclusive<u16>> {
    let range = match port {
        RawPort::Number(n) => n..=n,
        RawPort::Text(text) => {
            if let Some((low, high)) = text.split_once('-') {
                let low: u16 = low
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid port range '{text}' for {address}"))?;
                let high: u16 = high
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid port range '{text}' for {address}"))?;
                if low > high {
                    bail!("port range '{text}' for {address} must satisfy low <= high");
                }
                low..=high
            } else {
                let n: u16 = text
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid port '{text}' for {address}"))?;
                n..=n
            }
        }
    };
    if *range.start() == 0 {
        bail!("port 0 is not valid for {address}");
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_str(yaml: &str) -> Result<MonitorConfig> {
        MonitorConfig::from_raw(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn parses_full_config() {
        let config = load_str(
            r#"
interval_secs: 2
history_length: 10
slow_threshold_ms: 150
port_policy: all
hosts:
  - 10.0.0.1:
      description: core router
      tests:
        - protocol: ICMP
        - protocol: TCP
          port: 22
  - 10.0.0.2:
      tests:
        - protocol: TCP
          port: 8000-8002
"#,
        )
        .unwrap();

        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.history_length, 10);
        assert_eq!(config.port_policy, PortPolicy::All);
        assert_eq!(config.hosts.len(), 2);

        let router = &config.hosts[0];
        assert_eq!(router.addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(router.description, "core router");
        assert_eq!(
            router.tests,
            vec![TestSpec::Icmp, TestSpec::Tcp { ports: 22..=22 }]
        );

        let other = &config.hosts[1];
        assert_eq!(other.description, "10.0.0.2");
        assert_eq!(other.tests, vec![TestSpec::Tcp { ports: 8000..=8002 }]);
    }

    #[test]
    fn defaults_apply() {
        let config = load_str("hosts:\n  - 192.168.1.1: {}\n").unwrap();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.history_length, 35);
        assert_eq!(config.slow_threshold_ms, 200.0);
        assert_eq!(config.icmp_timeout, Duration::from_millis(1000));
        assert_eq!(config.tcp_timeout, Duration::from_millis(500));
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.port_policy, PortPolicy::Any);
    }

    #[test]
    fn bare_host_key_defaults_to_icmp() {
        let config = load_str("hosts:\n  - 10.0.0.9:\n").unwrap();
        assert_eq!(config.hosts[0].description, "10.0.0.9");
        assert_eq!(config.hosts[0].tests, vec![TestSpec::Icmp]);
    }

    #[test]
    fn host_without_tests_gets_one_icmp() {
        let config = load_str("hosts:\n  - 192.168.1.1:\n      description: gw\n").unwrap();
        assert_eq!(config.hosts[0].tests, vec![TestSpec::Icmp]);
    }

    #[test]
    fn multi_key_host_item_preserves_file_order() {
        let config = load_str(
            "hosts:\n  - 10.0.0.3: {}\n    10.0.0.1: {}\n    10.0.0.2: {}\n",
        )
        .unwrap();
        let order: Vec<String> = config.hosts.iter().map(|h| h.addr.to_string()).collect();
        assert_eq!(order, vec!["10.0.0.3", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn rejects_invalid_address() {
        let err = load_str("hosts:\n  - not-an-ip: {}\n").unwrap_err();
        assert!(err.to_string().contains("invalid IP address"));
    }

    #[test]
    fn rejects_empty_host_list() {
        assert!(load_str("hosts: []\n").is_err());
    }

    #[test]
    fn rejects_tcp_without_port() {
        let err = load_str(
            "hosts:\n  - 10.0.0.1:\n      tests:\n        - protocol: TCP\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must specify a port"));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let err = load_str(
            "hosts:\n  - 10.0.0.1:\n      tests:\n        - protocol: TCP\n          port: 90-80\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("low <= high"));
    }

    #[test]
    fn rejects_zero_history_length() {
        assert!(load_str("history_length: 0\nhosts:\n  - 10.0.0.1: {}\n").is_err());
    }

    #[test]
    fn accepts_ipv6_host() {
        let config = load_str("hosts:\n  - \"2001:db8::1\": {}\n").unwrap();
        assert!(config.hosts[0].addr.is_ipv6());
    }

    #[test]
    fn test_labels() {
        assert_eq!(TestSpec::Icmp.label(), "ICMP");
        assert_eq!(TestSpec::Tcp { ports: 22..=22 }.label(), "TCP port 22");
        assert_eq!(
            TestSpec::Tcp { ports: 8000..=8002 }.label(),
            "TCP ports 8000-8002"
        );
    }
}
