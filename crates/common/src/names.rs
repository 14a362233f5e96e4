//! Validated names and addresses used in certificates and config

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

use crate::Error;

/// Longest accepted client name
pub const MAX_CLIENT_NAME: usize = 64;

/// A client certificate label: 1-64 of `[A-Za-z0-9_-]`, not starting with `-`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientName(String);

impl ClientName {
    pub fn parse(name: &str) -> Result<Self, Error> {
        static RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));
        if name.starts_with('-') || !RE.is_match(name) {
            return Err(Error::precondition(format!(
                "Invalid client name '{}'. Use one word only, no special characters except '-' and '_', \
                 at most {} characters.",
                name, MAX_CLIENT_NAME
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True for a fully qualified domain name such as `vpn.example.com`
pub fn is_dns_name(name: &str) -> bool {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([a-zA-Z0-9](-?[a-zA-Z0-9])*\.)+[a-zA-Z]{2,}$").expect("static regex")
    });
    RE.is_match(name)
}

/// How clients reach the server; also the server certificate's label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Ip(Ipv4Addr),
    Dns(String),
}

impl ServerAddr {
    pub fn dns(name: &str) -> Result<Self, Error> {
        if is_dns_name(name) {
            Ok(ServerAddr::Dns(name.to_string()))
        } else {
            Err(Error::precondition(format!(
                "Invalid DNS name '{}'. Must be a fully qualified domain name (FQDN).",
                name
            )))
        }
    }

    pub fn ip(addr: &str) -> Result<Self, Error> {
        addr.trim()
            .parse()
            .map(ServerAddr::Ip)
            .map_err(|_| Error::precondition(format!("Invalid IPv4 address '{}'.", addr)))
    }

    /// Parse either form, preferring an IPv4 address
    pub fn parse(value: &str) -> Result<Self, Error> {
        Self::ip(value).or_else(|_| Self::dns(value))
    }

    pub fn is_dns(&self) -> bool {
        matches!(self, ServerAddr::Dns(_))
    }

    /// `leftid=` value: DNS names carry the `@` identity sigil
    pub fn left_id(&self) -> String {
        match self {
            ServerAddr::Ip(ip) => ip.to_string(),
            ServerAddr::Dns(name) => format!("@{}", name),
        }
    }

    /// `--extSAN` value for the server certificate
    pub fn subject_alt_name(&self) -> String {
        match self {
            ServerAddr::Ip(ip) => format!("ip:{ip},dns:{ip}"),
            ServerAddr::Dns(name) => format!("dns:{}", name),
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Ip(ip) => write!(f, "{}", ip),
            ServerAddr::Dns(name) => f.write_str(name),
        }
    }
}

/// One or two DNS servers pushed to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServers {
    pub primary: Ipv4Addr,
    pub secondary: Option<Ipv4Addr>,
}

impl DnsServers {
    pub fn parse<S: AsRef<str>>(servers: &[S]) -> Result<Self, Error> {
        let parse_one = |s: &str| -> Result<Ipv4Addr, Error> {
            s.trim()
                .parse()
                .map_err(|_| Error::precondition(format!("Invalid DNS server '{}'.", s)))
        };
        match servers {
            [primary] => Ok(Self {
                primary: parse_one(primary.as_ref())?,
                secondary: None,
            }),
            [primary, secondary] => Ok(Self {
                primary: parse_one(primary.as_ref())?,
                secondary: Some(parse_one(secondary.as_ref())?),
            }),
            _ => Err(Error::precondition("Specify one or two DNS servers.")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        std::iter::once(self.primary).chain(self.secondary)
    }
}

impl Default for DnsServers {
    fn default() -> Self {
        Self {
            primary: Ipv4Addr::new(8, 8, 8, 8),
            secondary: Some(Ipv4Addr::new(8, 8, 4, 4)),
        }
    }
}

impl fmt::Display for DnsServers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.iter().map(|ip| ip.to_string()).collect();
        f.write_str(&list.join(" "))
    }
}

/// Client certificate validity in months, 1-120
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity(u32);

impl Validity {
    pub const MAX: Validity = Validity(120);

    pub fn months(months: u32) -> Result<Self, Error> {
        if (1..=120).contains(&months) {
            Ok(Self(months))
        } else {
            Err(Error::precondition(format!(
                "Invalid validity period '{}'. Enter an integer between 1 and 120.",
                months
            )))
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        value
            .trim()
            .parse()
            .map_err(|_| {
                Error::precondition(format!(
                    "Invalid validity period '{}'. Enter an integer between 1 and 120.",
                    value
                ))
            })
            .and_then(Self::months)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_names() {
        let longest = "x".repeat(64);
        let too_long = "x".repeat(65);
        for ok in ["vpnclient", "a", "my-phone_2", longest.as_str()] {
            assert!(ClientName::parse(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "-flag", "two words", "dot.name", "ünï", too_long.as_str(), "IKEv2 VPN CA"] {
            assert!(ClientName::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_dns_names() {
        assert!(is_dns_name("vpn.example.com"));
        assert!(is_dns_name("a-b.example.co"));
        assert!(!is_dns_name("localhost"));
        assert!(!is_dns_name("-bad.example.com"));
        assert!(!is_dns_name("1.2.3.4"));
    }

    #[test]
    fn test_server_addr_forms() {
        let ip = ServerAddr::parse("203.0.113.5").unwrap();
        assert_eq!(ip.left_id(), "203.0.113.5");
        assert_eq!(ip.subject_alt_name(), "ip:203.0.113.5,dns:203.0.113.5");

        let dns = ServerAddr::parse("vpn.example.com").unwrap();
        assert!(dns.is_dns());
        assert_eq!(dns.left_id(), "@vpn.example.com");
        assert_eq!(dns.subject_alt_name(), "dns:vpn.example.com");

        assert!(ServerAddr::parse("not a host").is_err());
    }

    #[test]
    fn test_dns_servers() {
        let one = DnsServers::parse(&["1.1.1.1"]).unwrap();
        assert_eq!(one.to_string(), "1.1.1.1");
        let two = DnsServers::parse(&["8.8.8.8", "8.8.4.4"]).unwrap();
        assert_eq!(two, DnsServers::default());
        assert!(DnsServers::parse::<&str>(&[]).is_err());
        assert!(DnsServers::parse(&["8.8.8.8", "nope"]).is_err());
    }

    #[test]
    fn test_validity() {
        assert_eq!(Validity::parse("12").unwrap().get(), 12);
        assert!(Validity::parse("0").is_err());
        assert!(Validity::parse("121").is_err());
        assert!(Validity::parse("ten").is_err());
    }
}
