//! Network discovery: CGNAT candidates from interface addresses and the
//! kernel route table, reverse DNS over the overlay resolver, whole-list
//! device events.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use if_watch::tokio::IfWatcher;
use lanchat_core::cgnat::is_cgnat;
use lanchat_core::dns::{build_ptr_query, parse_ptr_response, DnsError, MAX_PACKET_SIZE};
use lanchat_core::Device;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::service::{Event, Shared};

/// Linux route table of record.
const PROC_ROUTE: &str = "/proc/net/route";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no CGNAT address on any interface")]
    NoCandidates,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error("lookup timed out")]
    Timeout,
}

/// Watch interface changes and rerun the discovery pass on each one. Runs
/// until aborted; never touches connection handling.
pub async fn run(shared: Arc<Shared>) -> io::Result<()> {
    let mut watcher = IfWatcher::new()?;
    let addrs = current_addrs(&watcher);
    update_availability(&shared, &addrs);
    run_pass(&shared, &addrs).await;
    loop {
        match watcher.next().await {
            Some(Ok(event)) => {
                debug!(?event, "network path changed");
                let addrs = current_addrs(&watcher);
                update_availability(&shared, &addrs);
                run_pass(&shared, &addrs).await;
            }
            Some(Err(e)) => warn!(error = %e, "interface watcher error"),
            None => return Ok(()),
        }
    }
}

fn current_addrs(watcher: &IfWatcher) -> Vec<IpAddr> {
    watcher.iter().map(|net| net.addr()).collect()
}

fn update_availability(shared: &Shared, addrs: &[IpAddr]) {
    let available = addrs.iter().any(|a| !a.is_loopback());
    let was = shared.network_available.swap(available, Ordering::Relaxed);
    if was != available {
        info!(available, "network availability changed");
        let _ = shared.events.send(Event::NetworkAvailable(available));
    }
}

/// One discovery pass: emit a whole-list replacement, or an error when no
/// candidate exists at all. Individual lookup failures never fail the pass.
async fn run_pass(shared: &Arc<Shared>, addrs: &[IpAddr]) {
    match discover(&shared.config, Path::new(PROC_ROUTE), addrs).await {
        Ok(devices) => {
            info!(count = devices.len(), "discovery pass complete");
            if let Some(hostname) = devices
                .iter()
                .find(|d| d.is_local)
                .and_then(|d| d.hostname.clone())
            {
                *shared.local_hostname.lock().await = Some(hostname);
            }
            *shared.devices.lock().await = devices.clone();
            let _ = shared.events.send(Event::DeviceList(devices));
        }
        Err(e) => {
            warn!(error = %e, "discovery pass failed");
            shared.devices.lock().await.clear();
            let _ = shared.events.send(Event::DiscoveryError(e.to_string()));
        }
    }
}

/// Gather candidates (local interface address + /32 routes) and resolve
/// hostnames. The route table path is a parameter so tests can feed a
/// fixture file.
async fn discover(
    config: &Config,
    route_table: &Path,
    addrs: &[IpAddr],
) -> Result<Vec<Device>, DiscoveryError> {
    let local = addrs
        .iter()
        .find_map(|a| match a {
            IpAddr::V4(v4) if !v4.is_loopback() && is_cgnat(*v4) => Some(*v4),
            _ => None,
        })
        .ok_or(DiscoveryError::NoCandidates)?;

    let mut candidates: Vec<(Ipv4Addr, bool)> = vec![(local, true)];
    match route_candidates(route_table).await {
        Ok(routes) => {
            for addr in routes {
                if addr != local && candidates.iter().all(|(a, _)| *a != addr) {
                    candidates.push((addr, false));
                }
            }
        }
        Err(e) => warn!(error = %e, "route scan failed, using local address only"),
    }

    let mut lookups = JoinSet::new();
    for (index, (addr, is_local)) in candidates.into_iter().enumerate() {
        let server = config.dns_server.clone();
        let attempts = config.dns_attempts;
        let budget = config.dns_timeout();
        lookups.spawn(async move {
            let hostname = resolve_ptr(&server, addr, attempts, budget).await;
            (index, addr, is_local, hostname)
        });
    }

    let mut resolved: Vec<(usize, Device)> = Vec::new();
    while let Some(result) = lookups.join_next().await {
        let Ok((index, addr, is_local, hostname)) = result else {
            continue;
        };
        match hostname {
            Ok(hostname) => resolved.push((
                index,
                Device {
                    address: addr.to_string(),
                    hostname: Some(hostname),
                    interface: is_local.then(|| "vpn".to_string()),
                    is_local,
                },
            )),
            Err(e) => {
                warn!(address = %addr, error = %e, "reverse lookup failed");
                // The local device stays in the list even unnamed.
                if is_local {
                    resolved.push((
                        index,
                        Device {
                            address: addr.to_string(),
                            hostname: None,
                            interface: Some("vpn".to_string()),
                            is_local,
                        },
                    ));
                }
            }
        }
    }
    resolved.sort_by_key(|(index, _)| *index);
    Ok(resolved.into_iter().map(|(_, d)| d).collect())
}

/// /32 CGNAT destinations from the kernel route table.
async fn route_candidates(table: &Path) -> io::Result<Vec<Ipv4Addr>> {
    let contents = tokio::fs::read_to_string(table).await?;
    Ok(parse_route_table(&contents))
}

/// Parse `/proc/net/route`: whitespace-separated columns with hex
/// little-endian destination (col 1) and mask (col 7).
fn parse_route_table(contents: &str) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for line in contents.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 8 {
            continue;
        }
        let (Some(dest), Some(mask)) = (parse_route_addr(cols[1]), parse_route_addr(cols[7]))
        else {
            continue;
        };
        if mask != Ipv4Addr::BROADCAST {
            continue;
        }
        if is_cgnat(dest) && !out.contains(&dest) {
            out.push(dest);
        }
    }
    out
}

fn parse_route_addr(hex: &str) -> Option<Ipv4Addr> {
    let v = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(v.swap_bytes()))
}

static QUERY_ID: AtomicU16 = AtomicU16::new(0x1d01);

/// Reverse-resolve one address: bounded retries with linearly increasing
/// backoff, all under one cancellable budget.
async fn resolve_ptr(
    server: &str,
    addr: Ipv4Addr,
    attempts: u32,
    budget: Duration,
) -> Result<String, DiscoveryError> {
    let per_attempt = budget / attempts.max(1);
    let lookup = async {
        let mut last = DiscoveryError::Timeout;
        for attempt in 1..=attempts {
            match timeout(per_attempt, query_once(server, addr)).await {
                Ok(Ok(hostname)) => return Ok(hostname),
                Ok(Err(e)) => last = e,
                Err(_) => last = DiscoveryError::Timeout,
            }
            debug!(address = %addr, attempt, "reverse lookup attempt failed");
            if attempt < attempts {
                sleep(Duration::from_secs(attempt as u64)).await;
            }
        }
        Err(last)
    };
    match timeout(budget, lookup).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::Timeout),
    }
}

async fn query_once(server: &str, addr: Ipv4Addr) -> Result<String, DiscoveryError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    let query_id = QUERY_ID.fetch_add(1, Ordering::Relaxed);
    let query = build_ptr_query(addr, query_id);
    socket.send(&query).await?;
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let n = socket.recv(&mut buf).await?;
    Ok(parse_ptr_response(&buf[..n], query_id)?)
}
