//! Rewrites obsolete `ipsec.conf` syntax for a newer (or older) Libreswan
//!
//! The transformer works line by line and only touches `key=value` lines
//! that one of [`RULES`] or the DNS conversion recognizes. Indentation,
//! comments and unknown lines pass through unchanged.

use std::fs;
use std::path::Path;

use crate::conf::dns_lines;
use crate::names::DnsServers;
use crate::version::{Capabilities, DnsSyntax};
use crate::Error;

enum Action {
    RenameKey(&'static str),
    SetValue(&'static str),
    Delete,
}

struct Rule {
    key: &'static str,
    /// Only match this exact value
    value: Option<&'static str>,
    action: Action,
    applies: fn(&Capabilities) -> bool,
}

const RULES: &[Rule] = &[
    Rule {
        key: "forceencaps",
        value: None,
        action: Action::RenameKey("encapsulation"),
        applies: |c| c.encapsulation == "encapsulation",
    },
    Rule {
        key: "encapsulation",
        value: None,
        action: Action::RenameKey("forceencaps"),
        applies: |c| c.encapsulation == "forceencaps",
    },
    Rule {
        key: "ikev2",
        value: Some("insist"),
        action: Action::SetValue("yes"),
        applies: |c| c.ikev2_yes_no,
    },
    Rule {
        key: "ikev2",
        value: Some("never"),
        action: Action::SetValue("no"),
        applies: |c| c.ikev2_yes_no,
    },
    Rule {
        key: "virtual_private",
        value: None,
        action: Action::RenameKey("virtual-private"),
        applies: |c| c.dashed_virtual_private,
    },
    Rule {
        key: "auth",
        value: Some("esp"),
        action: Action::Delete,
        applies: |c| c.ikev2_yes_no,
    },
];

/// A `key=value` line split into its parts
struct Directive<'a> {
    indent: &'a str,
    key: &'a str,
    value: &'a str,
}

impl<'a> Directive<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let body = line.trim_start();
        if body.starts_with('#') {
            return None;
        }
        let indent = &line[..line.len() - body.len()];
        let (key, value) = body.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            indent,
            key,
            value: value.trim(),
        })
    }
}

/// Result of patching one config text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub text: String,
    /// Number of input lines rewritten or removed
    pub changes: usize,
}

/// Bring `config` in line with what `caps` understands
pub fn patch_config(config: &str, caps: &Capabilities) -> Patched {
    let lines: Vec<&str> = config.lines().collect();
    let mut absorbed = vec![false; lines.len()];
    let mut out: Vec<String> = Vec::new();
    let mut changes = 0;

    for (i, &line) in lines.iter().enumerate() {
        if absorbed[i] {
            continue;
        }
        let Some(d) = Directive::parse(line) else {
            out.push(line.to_string());
            continue;
        };

        if let Some(rule) = RULES.iter().find(|r| {
            r.key == d.key && r.value.is_none_or(|v| v == d.value) && (r.applies)(caps)
        }) {
            changes += 1;
            match rule.action {
                Action::RenameKey(key) => out.push(format!("{}{}={}", d.indent, key, d.value)),
                Action::SetValue(value) => out.push(format!("{}{}={}", d.indent, d.key, value)),
                Action::Delete => {}
            }
            continue;
        }

        match (caps.dns, d.key) {
            (DnsSyntax::Quoted, "modecfgdns1" | "modecfgdns2") => {
                let other_key = if d.key == "modecfgdns1" { "modecfgdns2" } else { "modecfgdns1" };
                let other = find_in_section(&lines, i, other_key);
                if other.is_some_and(|(j, _)| j < i) {
                    // its partner came first and could not be converted
                    keep_dns(&mut out, line);
                    continue;
                }
                let mut servers = vec![d.value.to_string()];
                if let Some((_, value)) = other {
                    if d.key == "modecfgdns1" {
                        servers.push(value.to_string());
                    } else {
                        servers.insert(0, value.to_string());
                    }
                }
                match rewrite_dns(d.indent, &servers, DnsSyntax::Quoted) {
                    Some(rewritten) => {
                        changes += 1;
                        if let Some((j, _)) = other {
                            absorbed[j] = true;
                            changes += 1;
                        }
                        out.extend(rewritten);
                    }
                    None => keep_dns(&mut out, line),
                }
            }
            (DnsSyntax::PerServer, "modecfgdns") => {
                let servers: Vec<String> = d
                    .value
                    .trim_matches('"')
                    .split([' ', ','])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                match rewrite_dns(d.indent, &servers, DnsSyntax::PerServer) {
                    Some(rewritten) => {
                        changes += 1;
                        out.extend(rewritten);
                    }
                    None => keep_dns(&mut out, line),
                }
            }
            _ => out.push(line.to_string()),
        }
    }

    let mut text = out.join("\n");
    if config.ends_with('\n') {
        text.push('\n');
    }
    Patched { text, changes }
}

/// Find `key` elsewhere in the section holding line `at`. A section is
/// bounded by lines that start in column 0 and are not comments.
fn find_in_section<'a>(lines: &[&'a str], at: usize, key: &str) -> Option<(usize, &'a str)> {
    let inside = |line: &&str| {
        line.is_empty() || line.starts_with(char::is_whitespace) || line.starts_with('#')
    };
    let start = lines[..at]
        .iter()
        .rposition(|line| !inside(line))
        .map_or(0, |p| p + 1);
    let end = lines[at + 1..]
        .iter()
        .position(|line| !inside(line))
        .map_or(lines.len(), |p| at + 1 + p);
    (start..end).filter(|&j| j != at).find_map(|j| {
        Directive::parse(lines[j])
            .filter(|d| d.key == key)
            .map(|d| (j, d.value))
    })
}

/// DNS lines for `servers`, or `None` if they do not parse as addresses
fn rewrite_dns(indent: &str, servers: &[String], syntax: DnsSyntax) -> Option<Vec<String>> {
    let dns = DnsServers::parse(servers).ok()?;
    Some(
        dns_lines(syntax, &dns)
            .into_iter()
            .map(|l| format!("{}{}", indent, l))
            .collect(),
    )
}

fn keep_dns(out: &mut Vec<String>, line: &str) {
    log::warn!("Leaving unrecognized DNS line as is: {}", line.trim());
    out.push(line.to_string());
}

/// Patch a config file in place. Returns true if it was rewritten; a
/// missing file is not an error.
pub fn patch_file(path: &Path, caps: &Capabilities) -> Result<bool, Error> {
    let config = match fs::read_to_string(path) {
        Ok(config) => config,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let patched = patch_config(&config, caps);
    if patched.changes == 0 {
        return Ok(false);
    }
    fs::write(path, patched.text)?;
    log::info!("Updated {} ({} line(s))", path.display(), patched.changes);
    Ok(true)
}
