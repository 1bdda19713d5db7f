//! Turns a raw scan into the resource set the calculator works on

use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

use crate::error::Result;
use crate::geoip::is_private_ip;
use crate::model::ResourceTrace;
use crate::upstream::{GreenClassifier, IpCountryResolver, RawScan};

/// Resolve origin countries and green hosting for every scanned resource.
///
/// IPs and hosts are deduplicated so each external service is asked once.
pub async fn collect_resources(
    scan: &RawScan,
    resolver: &dyn IpCountryResolver,
    classifier: &dyn GreenClassifier,
) -> Result<Vec<ResourceTrace>> {
    let ips: Vec<IpAddr> = scan
        .resources
        .iter()
        .filter_map(|r| r.origin_ip)
        .filter(|ip| !is_private_ip(ip))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let hosts: Vec<String> = scan
        .resources
        .iter()
        .map(|r| r.host.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let (countries, green) = tokio::try_join!(resolver.resolve(&ips), classifier.green_hosts(&hosts))?;
    debug!(
        "Scan covers {} hosts ({} green) across {} origin IPs",
        hosts.len(),
        green.len(),
        ips.len()
    );

    Ok(scan
        .resources
        .iter()
        .map(|r| ResourceTrace {
            url: r.url.to_string(),
            host: r.host.clone(),
            transfer_size: r.transfer_size,
            content_size: r.content_size,
            origin_ip: r.origin_ip.map(|ip| ip.to_string()),
            country_code: r.origin_ip.and_then(|ip| countries.get(&ip).cloned()),
            green: green.contains(&r.host),
        })
        .collect())
}
