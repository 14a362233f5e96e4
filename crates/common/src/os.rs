//! Host OS and kernel detection

use std::fmt;
use std::path::Path;

use crate::system::{Cmd, CommandRunner};
use crate::Error;

/// Supported distribution families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Ubuntu,
    /// Debian and Raspbian
    Debian,
    /// CentOS, RHEL, Rocky, AlmaLinux, Oracle Linux
    Rhel,
    AmazonLinux,
    Alpine,
}

/// `ID=` values from os-release and the family each maps to
const RECOGNIZED: &[(&str, OsFamily)] = &[
    ("ubuntu", OsFamily::Ubuntu),
    ("debian", OsFamily::Debian),
    ("raspbian", OsFamily::Debian),
    ("centos", OsFamily::Rhel),
    ("rhel", OsFamily::Rhel),
    ("rocky", OsFamily::Rhel),
    ("almalinux", OsFamily::Rhel),
    ("ol", OsFamily::Rhel),
    ("amzn", OsFamily::AmazonLinux),
    ("alpine", OsFamily::Alpine),
];

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Ubuntu => "Ubuntu",
            OsFamily::Debian => "Debian",
            OsFamily::Rhel => "CentOS/RHEL",
            OsFamily::AmazonLinux => "Amazon Linux",
            OsFamily::Alpine => "Alpine Linux",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub family: OsFamily,
    /// Raw `ID=` value, e.g. "rocky"
    pub id: String,
    /// Raw `VERSION_ID=` value, e.g. "22.04"
    pub version_id: String,
    pub major: u32,
    pub minor: u32,
}

impl OsInfo {
    /// Parse the contents of `/etc/os-release`
    pub fn parse(os_release: &str) -> Result<Self, Error> {
        let field = |key: &str| {
            os_release.lines().find_map(|line| {
                line.strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(|value| value.trim().trim_matches('"').to_string())
            })
        };

        let id = field("ID").unwrap_or_default().to_ascii_lowercase();
        let family = RECOGNIZED
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, family)| *family)
            .ok_or_else(|| {
                Error::precondition(
                    "This script only supports Ubuntu, Debian, CentOS/RHEL, Rocky Linux, \
                     AlmaLinux, Oracle Linux, Amazon Linux 2 or Alpine Linux.",
                )
            })?;

        let version_id = field("VERSION_ID").unwrap_or_default();
        let mut parts = version_id.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Ok(Self {
            family,
            id,
            version_id,
            major,
            minor,
        })
    }

    /// Read and parse `/etc/os-release`
    pub fn detect() -> Result<Self, Error> {
        let content = std::fs::read_to_string("/etc/os-release").map_err(|_| {
            Error::precondition("Cannot read /etc/os-release. Unsupported OS.")
        })?;
        Self::parse(&content)
    }

    /// Short OS tag used in version-check URLs
    pub fn url_tag(&self) -> &str {
        match self.family {
            OsFamily::Rhel => "centos",
            _ => self.id.as_str(),
        }
    }

    /// Version component used in version-check URLs ("2204" for Ubuntu 22.04)
    pub fn url_version(&self) -> String {
        match self.family {
            OsFamily::Ubuntu => self.version_id.replace('.', ""),
            OsFamily::Alpine => format!("{}.{}", self.major, self.minor),
            _ => self.major.to_string(),
        }
    }
}

/// True when running inside a Docker/Podman container
pub fn in_container() -> bool {
    Path::new("/.dockerenv").exists()
        || Path::new("/run/.containerenv").exists()
        || std::env::var("container").is_ok_and(|v| v == "docker" || v == "podman")
}

/// OpenVZ guests cannot run Libreswan's kernel stack
pub fn check_not_openvz() -> Result<(), Error> {
    if Path::new("/proc/user_beancounters").exists() {
        return Err(Error::precondition("OpenVZ VPS is not supported."));
    }
    Ok(())
}

/// What the running kernel says about itself, for the MOBIKE check
#[derive(Debug, Clone, Default)]
pub struct KernelInfo {
    /// `uname -m`
    pub machine: String,
    /// `uname -v`
    pub version: String,
    /// Decompressed `/proc/config.gz`, if available
    pub proc_config: Option<String>,
    /// `/boot/config-$(uname -r)`, if present
    pub boot_config: Option<String>,
}

const XFRM_MIGRATE: &str = "CONFIG_XFRM_MIGRATE=y";

impl KernelInfo {
    pub fn probe(runner: &dyn CommandRunner) -> Result<Self, Error> {
        let uname = |flag: &str| -> Result<String, Error> {
            let out = runner.run_checked(&Cmd::new("uname").arg(flag), "Querying kernel")?;
            Ok(out.stdout.trim().to_string())
        };
        let machine = uname("-m")?;
        let version = uname("-v")?;
        let release = uname("-r")?;

        let proc_config = if is_arm(&machine) {
            let _ = runner.run(&Cmd::new("modprobe").args(["-q", "configs"]));
            if Path::new("/proc/config.gz").exists() {
                runner
                    .run(&Cmd::new("zcat").arg("/proc/config.gz"))
                    .ok()
                    .filter(|out| out.success)
                    .map(|out| out.stdout)
            } else {
                None
            }
        } else {
            None
        };
        let boot_config = std::fs::read_to_string(format!("/boot/config-{}", release)).ok();

        Ok(Self {
            machine,
            version,
            proc_config,
            boot_config,
        })
    }

    /// Whether the kernel can migrate IPsec SAs (MOBIKE)
    pub fn supports_mobike(&self, os: &OsInfo, in_container: bool) -> bool {
        if is_arm(&self.machine) {
            match &self.proc_config {
                Some(config) if config.contains(XFRM_MIGRATE) => {}
                _ => return false,
            }
        }
        if let Some(config) = &self.boot_config {
            if !config.contains(XFRM_MIGRATE) {
                return false;
            }
        }
        // Ubuntu kernels lack SA migration regardless of config
        let ubuntu_kernel = self.version.to_ascii_lowercase().contains("ubuntu");
        if ubuntu_kernel || (!in_container && os.family == OsFamily::Ubuntu) {
            return false;
        }
        true
    }
}

fn is_arm(machine: &str) -> bool {
    let machine = machine.to_ascii_lowercase();
    machine.starts_with("arm") || machine.starts_with("aarch64")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBIAN: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nNAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nID=debian\n";

    #[test]
    fn test_parse_debian() {
        let os = OsInfo::parse(DEBIAN).unwrap();
        assert_eq!(os.family, OsFamily::Debian);
        assert_eq!(os.major, 12);
        assert_eq!(os.url_tag(), "debian");
    }

    #[test]
    fn test_parse_ubuntu_version() {
        let os = OsInfo::parse("ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n").unwrap();
        assert_eq!(os.family, OsFamily::Ubuntu);
        assert_eq!((os.major, os.minor), (22, 4));
        assert_eq!(os.url_version(), "2204");
    }

    #[test]
    fn test_parse_rhel_family() {
        let os = OsInfo::parse("ID=\"rocky\"\nVERSION_ID=\"9.3\"\n").unwrap();
        assert_eq!(os.family, OsFamily::Rhel);
        assert_eq!(os.url_tag(), "centos");
        assert_eq!(os.url_version(), "9");
    }

    #[test]
    fn test_parse_alpine_version() {
        let os = OsInfo::parse("ID=alpine\nVERSION_ID=3.19.1\n").unwrap();
        assert_eq!(os.url_version(), "3.19");
    }

    #[test]
    fn test_unknown_os_rejected() {
        let err = OsInfo::parse("ID=arch\n").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_id_like_is_not_id() {
        let os = OsInfo::parse("ID_LIKE=ubuntu\nID=debian\nVERSION_ID=11\n").unwrap();
        assert_eq!(os.family, OsFamily::Debian);
    }

    fn kernel(machine: &str, version: &str) -> KernelInfo {
        KernelInfo {
            machine: machine.into(),
            version: version.into(),
            proc_config: None,
            boot_config: None,
        }
    }

    #[test]
    fn test_mobike_x86_debian() {
        let os = OsInfo::parse(DEBIAN).unwrap();
        assert!(kernel("x86_64", "#1 SMP Debian 6.1.0").supports_mobike(&os, false));
    }

    #[test]
    fn test_mobike_boot_config_without_migrate() {
        let os = OsInfo::parse(DEBIAN).unwrap();
        let mut k = kernel("x86_64", "#1 SMP Debian");
        k.boot_config = Some("CONFIG_XFRM=y\n# CONFIG_XFRM_MIGRATE is not set\n".into());
        assert!(!k.supports_mobike(&os, false));
    }

    #[test]
    fn test_mobike_arm_needs_proc_config() {
        let os = OsInfo::parse(DEBIAN).unwrap();
        let mut k = kernel("aarch64", "#1 SMP");
        assert!(!k.supports_mobike(&os, false));
        k.proc_config = Some("CONFIG_XFRM_MIGRATE=y\n".into());
        assert!(k.supports_mobike(&os, false));
    }

    #[test]
    fn test_mobike_ubuntu_excluded() {
        let ubuntu = OsInfo::parse("ID=ubuntu\nVERSION_ID=\"22.04\"\n").unwrap();
        assert!(!kernel("x86_64", "#1 SMP").supports_mobike(&ubuntu, false));

        let os = OsInfo::parse(DEBIAN).unwrap();
        assert!(!kernel("x86_64", "#90-Ubuntu SMP").supports_mobike(&os, true));
    }
}
