//! Visitor country lookup using a MaxMind GeoLite2 database

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::countries;

/// GeoIP reader wrapper
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the database if available
    pub fn new(database_path: &str) -> Self {
        let path = Path::new(database_path);

        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            warn!("Visitor countries will be unknown; yearly estimates fall back to hosting-side intensity");
            return Self { reader: None };
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self { reader: Some(reader) }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {}", e);
                Self { reader: None }
            }
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    /// Alpha-2 country of a visitor IP; `None` for private or unknown addresses
    pub fn country(&self, ip: &str) -> Option<String> {
        let reader = self.reader.as_ref()?;

        let ip_addr: IpAddr = ip.parse().ok()?;

        if is_private_ip(&ip_addr) {
            return None;
        }

        let record: geoip2::Country = reader.lookup(ip_addr).ok().flatten()?;
        let iso_code = record.country.as_ref().and_then(|c| c.iso_code)?;

        countries::normalize_alpha2(iso_code).map(str::to_string)
    }

    /// Check if the GeoIP database is loaded
    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

/// Check if an IP address is private/local
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
            || ipv4.is_loopback()
            || ipv4.is_link_local()
            || ipv4.is_broadcast()
            || ipv4.is_documentation()
            || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
            || ipv6.is_unspecified()
            // fc00::/7 unique local
            || (ipv6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Thread-safe GeoIP wrapper
pub type SharedGeoIp = Arc<GeoIp>;
