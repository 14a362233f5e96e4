//! Libreswan versions and what each one understands
//!
//! The installed version is mapped once onto a [`Capabilities`] value via an
//! ordered table; config writing and config patching only look at that.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::system::{Cmd, CommandRunner};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwanVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SwanVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            patch: 0,
        }
    }

    /// Extract the version from `ipsec --version` output, e.g.
    /// "Linux Libreswan 4.12 (XFRM) on 6.1.0-13-amd64" or "Libreswan U3.32/K4.19"
    pub fn from_ipsec_output(output: &str) -> Option<Self> {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)libreswan\s+U?(\d+\.\d+(?:\.\d+)?)").expect("static regex")
        });
        RE.captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Query the installed Libreswan through `ipsec --version`
    pub fn installed(runner: &dyn CommandRunner, ipsec: &str) -> Result<Option<Self>, Error> {
        let out = runner.run(&Cmd::new(ipsec).arg("--version"));
        Ok(match out {
            Ok(out) if out.success => Self::from_ipsec_output(&out.stdout),
            _ => None,
        })
    }
}

impl FromStr for SwanVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^([3-9]|[1-9][0-9]{1,2})\.([0-9]|[1-9][0-9]{1,2})(?:\.([0-9]|[1-9][0-9]{1,2}))?$")
                .expect("static regex")
        });
        let s = s.trim();
        let caps = RE
            .captures(s)
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;
        let num = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().parse::<u32>())
                .transpose()
                .map_err(|_| Error::InvalidVersion(s.to_string()))
        };
        Ok(Self {
            major: num(1)?.unwrap_or(0),
            minor: num(2)?.unwrap_or(0),
            patch: num(3)?.unwrap_or(0),
        })
    }
}

impl fmt::Display for SwanVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// How client DNS servers are written in a conn block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsSyntax {
    /// `modecfgdns1=` / `modecfgdns2=`
    PerServer,
    /// `modecfgdns="a b"`
    Quoted,
}

/// Config syntax and features available in a Libreswan release range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub dns: DnsSyntax,
    /// `mobike=` is understood
    pub mobike: bool,
    /// Name of the UDP encapsulation directive
    pub encapsulation: &'static str,
    /// `ikev2=yes|no` instead of `insist|never`
    pub ikev2_yes_no: bool,
    /// `virtual-private=` instead of `virtual_private=`
    pub dashed_virtual_private: bool,
    /// iOS needs `authby=rsa-sha1` spelled out
    pub rsa_sha1_auth: bool,
    pub ike: &'static str,
    pub phase2alg: &'static str,
}

const IKE: &str = "aes256-sha2,aes128-sha2,aes256-sha1,aes128-sha1,aes256-sha2;modp1024,aes128-sha1;modp1024";
const PHASE2_LEGACY: &str = "aes128-sha1,aes256-sha1,aes128-sha2,aes256-sha2";
const PHASE2: &str = "aes_gcm-null,aes128-sha1,aes256-sha1,aes128-sha2,aes256-sha2";

const LEGACY: Capabilities = Capabilities {
    dns: DnsSyntax::PerServer,
    mobike: false,
    encapsulation: "forceencaps",
    ikev2_yes_no: false,
    dashed_virtual_private: false,
    rsa_sha1_auth: false,
    ike: IKE,
    phase2alg: PHASE2_LEGACY,
};

const V3_23: Capabilities = Capabilities {
    dns: DnsSyntax::Quoted,
    mobike: true,
    phase2alg: PHASE2,
    ..LEGACY
};

const V3_29: Capabilities = Capabilities {
    encapsulation: "encapsulation",
    ..V3_23
};

const V4_0: Capabilities = Capabilities {
    ikev2_yes_no: true,
    dashed_virtual_private: true,
    ..V3_29
};

const V4_2: Capabilities = Capabilities {
    rsa_sha1_auth: true,
    ..V4_0
};

/// Lowest version of each row, newest first; the first row not above the
/// queried version wins
const CAPABILITY_TABLE: &[(SwanVersion, Capabilities)] = &[
    (SwanVersion::new(4, 2), V4_2),
    (SwanVersion::new(4, 0), V4_0),
    (SwanVersion::new(3, 29), V3_29),
    (SwanVersion::new(3, 23), V3_23),
    (SwanVersion::new(3, 19), LEGACY),
];

impl Capabilities {
    pub fn for_version(version: SwanVersion) -> Self {
        CAPABILITY_TABLE
            .iter()
            .find(|(min, _)| version >= *min)
            .map(|(_, caps)| *caps)
            .unwrap_or(LEGACY)
    }
}

/// Installed versions the IKEv2 setup knows how to configure:
/// 3.19-3.23, 3.25-3.27, 3.29, 3.31-3.32, 4.x and 5.x
pub fn setup_supports(version: SwanVersion) -> bool {
    match (version.major, version.minor) {
        (3, 19..=23) | (3, 25..=27) | (3, 29) | (3, 31..=32) => true,
        (4, _) | (5, _) => true,
        _ => false,
    }
}

/// Versions the upgrade tool is able to build
pub const UPGRADE_TARGETS: &[&str] = &[
    "3.32", "4.1", "4.2", "4.3", "4.4", "4.5", "4.6", "4.7", "4.9", "4.10", "4.11", "4.12",
    "4.14", "4.15", "5.0", "5.1", "5.2",
];

pub fn upgrade_supports(version: SwanVersion) -> bool {
    UPGRADE_TARGETS
        .iter()
        .filter_map(|v| v.parse::<SwanVersion>().ok())
        .any(|v| v == version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SwanVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_order() {
        assert!(v("4.10") > v("4.9"));
        assert!(v("3.32") < v("4.0"));
        assert_eq!(v("5.0.1").to_string(), "5.0.1");
        assert_eq!(v("4.5").to_string(), "4.5");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<SwanVersion>().is_err());
        assert!("2.6".parse::<SwanVersion>().is_err());
        assert!("4.05".parse::<SwanVersion>().is_err());
        assert!("<html>".parse::<SwanVersion>().is_err());
    }

    #[test]
    fn test_from_ipsec_output() {
        assert_eq!(
            SwanVersion::from_ipsec_output("Linux Libreswan 4.12 (XFRM) on 6.1.0-13-amd64"),
            Some(v("4.12"))
        );
        assert_eq!(
            SwanVersion::from_ipsec_output("Linux Libreswan U3.32/K4.19.0 (netkey) on 4.19.0"),
            Some(v("3.32"))
        );
        assert_eq!(SwanVersion::from_ipsec_output("strongSwan 5.9"), None);
    }

    #[test]
    fn test_capability_rows() {
        let legacy = Capabilities::for_version(v("3.22"));
        assert_eq!(legacy.dns, DnsSyntax::PerServer);
        assert!(!legacy.mobike);

        let modern = Capabilities::for_version(v("3.23"));
        assert_eq!(modern.dns, DnsSyntax::Quoted);
        assert!(modern.mobike);
        assert_eq!(modern.encapsulation, "forceencaps");

        assert_eq!(Capabilities::for_version(v("3.29")).encapsulation, "encapsulation");
        assert!(!Capabilities::for_version(v("4.1")).rsa_sha1_auth);
        assert!(Capabilities::for_version(v("4.1")).ikev2_yes_no);
        assert!(Capabilities::for_version(v("5.2")).rsa_sha1_auth);
    }

    #[test]
    fn test_setup_supports() {
        assert!(setup_supports(v("3.19")));
        assert!(!setup_supports(v("3.24")));
        assert!(!setup_supports(v("3.28")));
        assert!(!setup_supports(v("3.30")));
        assert!(setup_supports(v("4.15")));
        assert!(!setup_supports(v("3.18")));
    }

    #[test]
    fn test_upgrade_allow_list() {
        assert!(upgrade_supports(v("5.2")));
        assert!(upgrade_supports(v("3.32")));
        assert!(!upgrade_supports(v("4.8")));
        assert!(!upgrade_supports(v("3.31")));
    }
}
