//! Subject descriptions and default IP identities

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

use rcgen::{DistinguishedName, DnType};
use tracing::debug;

use certwarden_config::CertificateDescConfig;

const OID_STREET_ADDRESS: [u64; 4] = [2, 5, 4, 9];
const OID_POSTAL_CODE: [u64; 4] = [2, 5, 4, 17];

/// Organization details placed into every subject DN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateDesc {
    pub organization: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub street: Option<String>,
    pub zip: Option<String>,
}

impl CertificateDesc {
    /// Subject DN with the given common name and every configured attribute
    pub fn distinguished_name(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);

        let attributes = [
            (DnType::OrganizationName, &self.organization),
            (DnType::CountryName, &self.country),
            (DnType::StateOrProvinceName, &self.province),
            (DnType::LocalityName, &self.city),
            (DnType::CustomDnType(OID_STREET_ADDRESS.to_vec()), &self.street),
            (DnType::CustomDnType(OID_POSTAL_CODE.to_vec()), &self.zip),
        ];
        for (ty, value) in attributes {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                dn.push(ty, value);
            }
        }
        dn
    }
}

impl From<&CertificateDescConfig> for CertificateDesc {
    fn from(config: &CertificateDescConfig) -> Self {
        Self {
            organization: config.organization.clone(),
            country: config.country.clone(),
            province: config.province.clone(),
            city: config.city.clone(),
            street: config.street.clone(),
            zip: config.zip.clone(),
        }
    }
}

/// Addresses of the interfaces used for outbound traffic
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which
/// local address would be used. Families without a route are skipped.
pub fn local_ip_addresses(add_localhost: bool) -> Vec<IpAddr> {
    let mut addrs = Vec::new();

    let probes: [(IpAddr, &str); 2] = [
        (IpAddr::V4(Ipv4Addr::UNSPECIFIED), "192.0.2.1:9"),
        (IpAddr::V6(Ipv6Addr::UNSPECIFIED), "[2001:db8::1]:9"),
    ];
    for (bind, target) in probes {
        match outbound_address(bind, target) {
            Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => {
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(target = %target, error = %e, "No outbound address for family"),
        }
    }

    if add_localhost {
        addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        addrs.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
    }
    addrs
}

fn outbound_address(bind: IpAddr, target: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((bind, 0))?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}
