use futures::stream::{FuturesUnordered, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use surge_ping::{Client as PingClient, PingIdentifier, PingSequence};
use tokio::net::TcpStream;

use crate::config::{MonitorConfig, PortPolicy, TestSpec};
use crate::models::ProbeResult;

/// Run one configured test against a host, once. Expected network failures
/// (timeout, refused, unreachable, permission) fold into a failure result.
pub async fn probe(
    client: Option<&PingClient>,
    addr: IpAddr,
    spec: &TestSpec,
    config: &MonitorConfig,
) -> ProbeResult {
    match spec {
        TestSpec::Icmp => match client {
            Some(client) => check_icmp(client, addr, config.icmp_timeout).await,
            None => ProbeResult::failure("no ICMP client for this address family"),
        },
        TestSpec::Tcp { ports } => {
            check_tcp(addr, ports.clone(), config.tcp_timeout, config.port_policy).await
        }
    }
}

async fn check_icmp(client: &PingClient, addr: IpAddr, timeout: Duration) -> ProbeResult {
    let payload = [0u8; 56];
    let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
    pinger.timeout(timeout);
    match pinger.ping(PingSequence(0), &payload).await {
        Ok((_, rtt)) => ProbeResult::success(rtt.as_secs_f64() * 1000.0, "ICMP echo reply"),
        Err(e) => ProbeResult::failure(format!("ICMP: {e}")),
    }
}

/// Connect attempts for a port range are fanned out concurrently; the
/// policy decides how they aggregate into one result.
async fn check_tcp(
    addr: IpAddr,
    ports: std::ops::RangeInclusive<u16>,
    timeout: Duration,
    policy: PortPolicy,
) -> ProbeResult {
    let mut attempts: FuturesUnordered<_> = ports
        .map(|port| connect_port(addr, port, timeout))
        .collect();

    match policy {
        PortPolicy::Any => {
            let mut last_failure = String::from("no ports tested");
            while let Some(result) = attempts.next().await {
                if result.ok {
                    return result;
                }
                last_failure = result.message;
            }
            ProbeResult::failure(last_failure)
        }
        PortPolicy::All => {
            let mut slowest = 0.0f64;
            let mut open = 0usize;
            while let Some(result) = attempts.next().await {
                if !result.ok {
                    return ProbeResult::failure(result.message);
                }
                slowest = slowest.max(result.latency_ms.unwrap_or(0.0));
                open += 1;
            }
            ProbeResult::success(slowest, format!("all {open} ports open"))
        }
    }
}

async fn connect_port(addr: IpAddr, port: u16, timeout: Duration) -> ProbeResult {
    let target = SocketAddr::new(addr, port);
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => ProbeResult::success(
            start.elapsed().as_secs_f64() * 1000.0,
            format!("port {port} open"),
        ),
        Ok(Err(e)) => ProbeResult::failure(format!("port {port}: {e}")),
        Err(_) => ProbeResult::failure(format!("port {port}: connect timed out")),
    }
}
