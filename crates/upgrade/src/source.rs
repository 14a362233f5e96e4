//! Libreswan source tree preparation: mirrors, build dependencies, known
//! source fixes and build flags
//!
//! The fixes are tied to exact upstream releases and are kept as data.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use ikev2kit_common::os::{OsFamily, OsInfo};
use ikev2kit_common::system::Cmd;
use ikev2kit_common::SwanVersion;

/// Version built when the config file does not name one
pub const TARGET_VERSION: &str = "5.2";

/// Source archive URLs, primary first
pub fn mirror_urls(version: SwanVersion) -> Vec<String> {
    vec![
        format!("https://github.com/libreswan/libreswan/archive/v{}.tar.gz", version),
        format!("https://download.libreswan.org/libreswan-{}.tar.gz", version),
    ]
}

/// Where the archive is saved and unpacked
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub archive: PathBuf,
    pub dir: PathBuf,
}

impl SourceTree {
    pub fn new(src_dir: &Path, version: SwanVersion) -> Self {
        Self {
            archive: src_dir.join(format!("libreswan-{}.tar.gz", version)),
            dir: src_dir.join(format!("libreswan-{}", version)),
        }
    }

    pub fn unpack_cmd(&self) -> Cmd {
        let parent = self.archive.parent().unwrap_or_else(|| Path::new("."));
        Cmd::new("tar")
            .arg("xzf")
            .arg(self.archive.to_string_lossy())
            .current_dir(parent)
    }
}

/// Package manager commands installing what the build needs
pub fn build_dependency_cmds(os: &OsInfo) -> Vec<Cmd> {
    match os.family {
        OsFamily::Ubuntu | OsFamily::Debian => vec![
            Cmd::new("apt-get").args(["-yqq", "update"]),
            Cmd::new("apt-get").args(["-yqq", "install"]).args([
                "libnss3-dev",
                "libnspr4-dev",
                "pkg-config",
                "libpam0g-dev",
                "libcap-ng-dev",
                "libcap-ng-utils",
                "libselinux1-dev",
                "libcurl4-openssl-dev",
                "libnss3-tools",
                "libevent-dev",
                "libsystemd-dev",
                "flex",
                "bison",
                "gcc",
                "make",
                "wget",
                "sed",
            ]),
        ],
        OsFamily::Rhel | OsFamily::AmazonLinux => vec![Cmd::new("yum").args(["-y", "-q", "install"]).args([
            "nss-devel",
            "nspr-devel",
            "pkgconfig",
            "pam-devel",
            "libcap-ng-devel",
            "libselinux-devel",
            "curl-devel",
            "nss-tools",
            "libevent-devel",
            "systemd-devel",
            "flex",
            "bison",
            "gcc",
            "make",
            "wget",
            "sed",
            "tar",
        ])],
        OsFamily::Alpine => vec![Cmd::new("apk").args(["add", "-U", "-q"]).args([
            "bash",
            "bsd-compat-headers",
            "coreutils",
            "curl-dev",
            "flex",
            "bison",
            "gcc",
            "make",
            "musl-dev",
            "libcap-ng-dev",
            "libevent-dev",
            "linux-headers",
            "linux-pam-dev",
            "nspr-dev",
            "nss-dev",
            "nss-tools",
            "openrc",
            "wget",
            "sed",
            "tar",
        ])],
    }
}

#[derive(Debug, Clone, Copy)]
enum Edit {
    Replace {
        from: &'static str,
        to: &'static str,
    },
    DeleteLinesContaining(&'static str),
}

#[derive(Debug, Clone, Copy)]
struct SourceFix {
    first: SwanVersion,
    last: SwanVersion,
    file: &'static str,
    edit: Edit,
}

const SOURCE_FIXES: &[SourceFix] = &[
    SourceFix {
        first: SwanVersion::new(4, 4),
        last: SwanVersion::new(4, 4),
        file: "include/lswlog.h",
        edit: Edit::Replace {
            from: "#define LSWBUF_CANARY -2",
            to: "#define LSWBUF_CANARY ((char) -2)",
        },
    },
    SourceFix {
        first: SwanVersion::new(3, 23),
        last: SwanVersion::new(3, 29),
        file: "Makefile",
        edit: Edit::DeleteLinesContaining("docker-targets.mk"),
    },
];

/// Apply the fixes known for `version` inside the unpacked tree.
/// Returns the files that were changed.
pub fn apply_source_fixes(dir: &Path, version: SwanVersion) -> Result<Vec<&'static str>> {
    let mut changed = Vec::new();
    for fix in SOURCE_FIXES
        .iter()
        .filter(|f| (f.first..=f.last).contains(&version))
    {
        let path = dir.join(fix.file);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let patched = match fix.edit {
            Edit::Replace { from, to } => content.replace(from, to),
            Edit::DeleteLinesContaining(needle) => content
                .lines()
                .filter(|line| !line.contains(needle))
                .map(|line| format!("{}\n", line))
                .collect(),
        };
        if patched == content {
            log::warn!("Source fix for {} did not apply", fix.file);
            continue;
        }
        fs::write(&path, patched).with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Patched {}", path.display());
        changed.push(fix.file);
    }
    Ok(changed)
}

/// Contents of `Makefile.inc.local` for this build.
/// `if_link_header` is `/usr/include/linux/if_link.h`, if readable.
pub fn build_flags(version: SwanVersion, os: &OsInfo, if_link_header: Option<&str>) -> String {
    let mut flags = vec![
        "WERROR_CFLAGS=-w -s",
        "USE_DNSSEC=false",
        "USE_DH2=true",
        "FINALNSSDIR=/etc/ipsec.d",
        "NSSDIR=/etc/ipsec.d",
    ];
    let v4 = version >= SwanVersion::new(4, 0);
    if v4 {
        flags.push("USE_NSS_KDF=false");
    }
    if !if_link_header.is_some_and(|h| h.contains("IFLA_XFRM_LINK")) {
        flags.push("USE_XFRM_INTERFACE_IFLA_HEADER=true");
    }
    if v4 && os.family == OsFamily::Alpine {
        flags.push("USE_GLIBC_KERN_FLIP_HEADERS=true");
    }

    let mut out = flags.join("\n");
    out.push('\n');
    out
}
