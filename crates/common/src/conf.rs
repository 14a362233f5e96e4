//! The `ikev2-cp` connection and its place in `ipsec.conf`

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::names::{DnsServers, ServerAddr};
use crate::version::{Capabilities, DnsSyntax};
use crate::Error;

/// Name of the connection block written by setup
pub const CONN_NAME: &str = "ikev2-cp";

/// Client address pool used when `ipsec.conf` does not define one
pub const DEFAULT_POOL: &str = "192.168.43.10-192.168.43.250";

/// Line that pulls every fragment in the config directory into `ipsec.conf`
pub fn include_line(ipsec_dir: &Path) -> String {
    format!("include {}/*.conf", ipsec_dir.display())
}

/// Values that vary between installations
#[derive(Debug, Clone)]
pub struct ConnParams<'a> {
    pub server: &'a ServerAddr,
    pub dns: &'a DnsServers,
    pub pool: &'a str,
    pub mobike: bool,
    pub caps: Capabilities,
}

/// Render the `conn ikev2-cp` fragment for the installed Libreswan
pub fn render_fragment(p: &ConnParams<'_>) -> String {
    let caps = &p.caps;
    let mut lines = vec![
        format!("conn {}", CONN_NAME),
        "  left=%defaultroute".to_string(),
        format!("  leftcert={}", p.server),
        format!("  leftid={}", p.server.left_id()),
        "  leftsendcert=always".to_string(),
        "  leftsubnet=0.0.0.0/0".to_string(),
        "  leftrsasigkey=%cert".to_string(),
        "  right=%any".to_string(),
        "  rightid=%fromcert".to_string(),
        format!("  rightaddresspool={}", p.pool),
        "  rightca=%same".to_string(),
        "  rightrsasigkey=%cert".to_string(),
        "  narrowing=yes".to_string(),
        "  dpddelay=30".to_string(),
        "  dpdtimeout=120".to_string(),
        "  dpdaction=clear".to_string(),
        "  auto=add".to_string(),
        format!("  ikev2={}", if caps.ikev2_yes_no { "yes" } else { "insist" }),
        "  rekey=no".to_string(),
        "  pfs=no".to_string(),
        format!("  ike={}", caps.ike),
        format!("  phase2alg={}", caps.phase2alg),
        "  ikelifetime=24h".to_string(),
        "  salifetime=24h".to_string(),
        format!("  {}=yes", caps.encapsulation),
    ];
    lines.extend(dns_lines(caps.dns, p.dns).into_iter().map(|l| format!("  {}", l)));
    if caps.mobike {
        lines.push(format!("  mobike={}", if p.mobike { "yes" } else { "no" }));
    }
    if caps.rsa_sha1_auth {
        lines.push("  authby=rsa-sha1".to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// DNS directives in the given syntax, without indentation
pub fn dns_lines(syntax: DnsSyntax, dns: &DnsServers) -> Vec<String> {
    match syntax {
        DnsSyntax::PerServer => dns
            .iter()
            .enumerate()
            .map(|(i, ip)| format!("modecfgdns{}={}", i + 1, ip))
            .collect(),
        DnsSyntax::Quoted => match dns.secondary {
            None => vec![format!("modecfgdns={}", dns.primary)],
            Some(_) => vec![format!("modecfgdns=\"{}\"", dns)],
        },
    }
}

/// First `rightaddresspool=` value in `ipsec.conf`, or [`DEFAULT_POOL`]
pub fn address_pool(ipsec_conf: &str) -> String {
    directive(ipsec_conf, "rightaddresspool").unwrap_or_else(|| DEFAULT_POOL.to_string())
}

/// Value of the first `key=value` line for `key`, ignoring comments
pub fn directive(config: &str, key: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

/// True if IKEv2 was already set up, either as a fragment or inline
pub fn is_installed(ipsec_conf: &Path, fragment: &Path) -> bool {
    if fragment.exists() {
        return true;
    }
    fs::read_to_string(ipsec_conf)
        .map(|content| has_conn_block(&content))
        .unwrap_or(false)
}

fn has_conn_block(config: &str) -> bool {
    config
        .lines()
        .any(|line| line.split_whitespace().collect::<Vec<_>>() == ["conn", CONN_NAME])
}

/// What an existing setup recorded about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledConn {
    pub server: ServerAddr,
    pub mobike: bool,
}

impl InstalledConn {
    /// Recover the server address and MOBIKE choice from a written fragment
    pub fn from_fragment(fragment: &str) -> Result<Self, Error> {
        let server = directive(fragment, "leftcert").ok_or_else(|| {
            Error::precondition("Cannot find 'leftcert=' in the IKEv2 config. Abort.")
        })?;
        let server = ServerAddr::parse(&server)?;
        let mobike = directive(fragment, "mobike").is_some_and(|v| v == "yes");
        Ok(Self { server, mobike })
    }

    pub fn read(fragment: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(fragment).map_err(|e| {
            Error::precondition(format!(
                "Cannot read IKEv2 config {}: {}",
                fragment.display(),
                e
            ))
        })?;
        Self::from_fragment(&content)
    }
}

/// Write the fragment and make sure `ipsec.conf` includes it
pub fn install(ipsec_conf: &Path, fragment: &Path, content: &str) -> Result<(), Error> {
    if let Some(dir) = fragment.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(fragment, content)?;
    log::debug!("Wrote {}", fragment.display());

    let include = include_line(fragment.parent().unwrap_or_else(|| Path::new("/etc/ipsec.d")));
    ensure_include(ipsec_conf, &include)
}

/// Append `include` to `ipsec.conf` unless an identical line exists
pub fn ensure_include(ipsec_conf: &Path, include: &str) -> Result<(), Error> {
    let existing = match fs::read_to_string(ipsec_conf) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing.lines().any(|line| line.trim() == include) {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ipsec_conf)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{}", include)?;
    Ok(())
}

/// Remove the fragment and, if present, the inline `conn ikev2-cp` block.
/// The include line stays since other fragments may rely on it.
pub fn uninstall(ipsec_conf: &Path, fragment: &Path) -> Result<(), Error> {
    match fs::remove_file(fragment) {
        Ok(()) => log::debug!("Removed {}", fragment.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let content = match fs::read_to_string(ipsec_conf) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if has_conn_block(&content) {
        fs::write(ipsec_conf, strip_conn_block(&content))?;
    }
    Ok(())
}

/// Drop the `conn ikev2-cp` header and its indented body
fn strip_conn_block(config: &str) -> String {
    let mut out = String::with_capacity(config.len());
    let mut skipping = false;
    for line in config.lines() {
        let is_header = line.split_whitespace().collect::<Vec<_>>() == ["conn", CONN_NAME];
        if is_header {
            skipping = true;
            continue;
        }
        if skipping {
            let indented = line.starts_with(' ') || line.starts_with('\t');
            if indented || line.trim().is_empty() {
                continue;
            }
            skipping = false;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
