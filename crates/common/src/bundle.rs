//! Client bundle: `.p12`, `.mobileconfig` and `.sswan`
//!
//! The property list and JSON profile embed the exported PKCS#12 file and
//! the CA certificate, so they are rendered after the `.p12` export.

use std::fs;
use std::io::Write;
use std::os::unix::fs::chown;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::certdb::{create_private_file, CertDb};
use crate::config::encoding;
use crate::names::{ClientName, ServerAddr};
use crate::system::{Cmd, CommandRunner};
use crate::Error;

/// Characters for generated passwords; no I, O, Q, l, 0 or 1
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
pub const PASSWORD_LEN: usize = 16;

/// Column width of embedded base64 payloads
const BASE64_WIDTH: usize = 52;

/// Random password for client config files
pub fn generate_password() -> String {
    let mut rng = OsRng;
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// Where bundle files go and who should own them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub dir: PathBuf,
    /// uid/gid of the invoking sudo user when exporting to their home
    pub owner: Option<(u32, u32)>,
}

impl ExportTarget {
    /// Pick the export directory: the config directory in containers, the
    /// sudo user's home if there is one, otherwise the current user's home
    pub fn select(
        runner: &dyn CommandRunner,
        in_container: bool,
        ipsec_dir: &Path,
        sudo_user: Option<&str>,
    ) -> Result<Self, Error> {
        if in_container {
            return Ok(Self {
                dir: ipsec_dir.to_path_buf(),
                owner: None,
            });
        }
        if let Some(user) = sudo_user.filter(|u| !u.is_empty() && *u != "root") {
            let out = runner.run(&Cmd::new("getent").args(["passwd", user]))?;
            if out.success {
                if let Some((uid, gid, home)) = parse_passwd_entry(&out.stdout) {
                    if home != Path::new("/") && home.is_dir() {
                        return Ok(Self {
                            dir: home,
                            owner: Some((uid, gid)),
                        });
                    }
                }
            }
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Ok(Self {
            dir: home,
            owner: None,
        })
    }

    pub fn fixed(dir: PathBuf) -> Self {
        Self { dir, owner: None }
    }

    pub fn path(&self, client: &ClientName, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", client, ext))
    }

    /// Hand `path` to the sudo user, if any
    pub fn adjust_owner(&self, path: &Path) -> Result<(), Error> {
        if let Some((uid, gid)) = self.owner {
            chown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    }
}

/// uid, gid and home from a `getent passwd` line
fn parse_passwd_entry(line: &str) -> Option<(u32, u32, PathBuf)> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 6 {
        return None;
    }
    let uid = fields[2].parse().ok()?;
    let gid = fields[3].parse().ok()?;
    Some((uid, gid, PathBuf::from(fields[5])))
}

/// Everything needed to render the mobile profiles
#[derive(Debug, Clone)]
pub struct ProfileInput<'a> {
    pub client: &'a ClientName,
    pub server: &'a ServerAddr,
    pub password: &'a str,
    pub mobike: bool,
    /// Raw bytes of the exported `.p12`
    pub p12: &'a [u8],
    /// Base64 body of the CA certificate
    pub ca_base64: &'a str,
}

/// Apple configuration profile (property list)
pub fn render_mobileconfig(input: &ProfileInput<'_>) -> String {
    let p12_uuid = Uuid::new_v4().to_string().to_uppercase();
    let uuid = || Uuid::new_v4().to_string().to_uppercase();
    let indent = |lines: Vec<String>| {
        lines
            .iter()
            .map(|l| format!("        {}", l))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let p12_data = indent(encoding::encode_wrapped(input.p12, BASE64_WIDTH));
    let ca_data = indent(encoding::wrap(input.ca_base64, BASE64_WIDTH));
    let server = xml_escape(&input.server.to_string());
    let client = xml_escape(input.client.as_str());
    let password = xml_escape(input.password);
    let disable_mobike = if input.mobike { 0 } else { 1 };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>PayloadContent</key>
  <array>
    <dict>
      <key>IKEv2</key>
      <dict>
        <key>AuthenticationMethod</key>
        <string>Certificate</string>
        <key>ChildSecurityAssociationParameters</key>
        <dict>
          <key>DiffieHellmanGroup</key>
          <integer>19</integer>
          <key>EncryptionAlgorithm</key>
          <string>AES-256-GCM</string>
          <key>IntegrityAlgorithm</key>
          <string>SHA2-256</string>
          <key>LifeTimeInMinutes</key>
          <integer>1410</integer>
        </dict>
        <key>DeadPeerDetectionRate</key>
        <string>Medium</string>
        <key>DisableMOBIKE</key>
        <integer>{disable_mobike}</integer>
        <key>DisableRedirect</key>
        <integer>1</integer>
        <key>EnableCertificateRevocationCheck</key>
        <integer>0</integer>
        <key>EnablePFS</key>
        <integer>0</integer>
        <key>IKESecurityAssociationParameters</key>
        <dict>
          <key>DiffieHellmanGroup</key>
          <integer>14</integer>
          <key>EncryptionAlgorithm</key>
          <string>AES-256</string>
          <key>IntegrityAlgorithm</key>
          <string>SHA2-256</string>
          <key>LifeTimeInMinutes</key>
          <integer>1410</integer>
        </dict>
        <key>LocalIdentifier</key>
        <string>{client}</string>
        <key>PayloadCertificateUUID</key>
        <string>{p12_uuid}</string>
        <key>OnDemandEnabled</key>
        <integer>0</integer>
        <key>RemoteAddress</key>
        <string>{server}</string>
        <key>RemoteIdentifier</key>
        <string>{server}</string>
        <key>UseConfigurationAttributeInternalIPSubnet</key>
        <integer>0</integer>
      </dict>
      <key>IPv4</key>
      <dict>
        <key>OverridePrimary</key>
        <integer>1</integer>
      </dict>
      <key>PayloadDescription</key>
      <string>Configures VPN settings</string>
      <key>PayloadDisplayName</key>
      <string>VPN</string>
      <key>PayloadIdentifier</key>
      <string>com.apple.vpn.managed.{vpn_uuid}</string>
      <key>PayloadType</key>
      <string>com.apple.vpn.managed</string>
      <key>PayloadUUID</key>
      <string>{vpn_uuid}</string>
      <key>PayloadVersion</key>
      <integer>1</integer>
      <key>Proxies</key>
      <dict>
        <key>HTTPEnable</key>
        <integer>0</integer>
        <key>HTTPSEnable</key>
        <integer>0</integer>
      </dict>
      <key>UserDefinedName</key>
      <string>{server}</string>
      <key>VPNType</key>
      <string>IKEv2</string>
    </dict>
    <dict>
      <key>Password</key>
      <string>{password}</string>
      <key>PayloadCertificateFileName</key>
      <string>{client}</string>
      <key>PayloadContent</key>
      <data>
{p12_data}
      </data>
      <key>PayloadDescription</key>
      <string>Adds a PKCS#12-formatted certificate</string>
      <key>PayloadDisplayName</key>
      <string>{client}</string>
      <key>PayloadIdentifier</key>
      <string>com.apple.security.pkcs12.{p12_uuid}</string>
      <key>PayloadType</key>
      <string>com.apple.security.pkcs12</string>
      <key>PayloadUUID</key>
      <string>{p12_uuid}</string>
      <key>PayloadVersion</key>
      <integer>1</integer>
    </dict>
    <dict>
      <key>PayloadContent</key>
      <data>
{ca_data}
      </data>
      <key>PayloadCertificateFileName</key>
      <string>ikev2vpnca</string>
      <key>PayloadDescription</key>
      <string>Adds a CA root certificate</string>
      <key>PayloadDisplayName</key>
      <string>Certificate Authority (CA)</string>
      <key>PayloadIdentifier</key>
      <string>com.apple.security.root.{ca_uuid}</string>
      <key>PayloadType</key>
      <string>com.apple.security.root</string>
      <key>PayloadUUID</key>
      <string>{ca_uuid}</string>
      <key>PayloadVersion</key>
      <integer>1</integer>
    </dict>
  </array>
  <key>PayloadDisplayName</key>
  <string>IKEv2 VPN ({server})</string>
  <key>PayloadIdentifier</key>
  <string>com.apple.vpn.managed.{profile_uuid}</string>
  <key>PayloadRemovalDisallowed</key>
  <false/>
  <key>PayloadType</key>
  <string>Configuration</string>
  <key>PayloadUUID</key>
  <string>{profile_uuid}</string>
  <key>PayloadVersion</key>
  <integer>1</integer>
</dict>
</plist>
"#,
        vpn_uuid = uuid(),
        ca_uuid = uuid(),
        profile_uuid = uuid(),
    )
}

#[derive(Serialize)]
struct SswanProfile {
    uuid: String,
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    remote: SswanRemote,
    local: SswanLocal,
    #[serde(rename = "ike-proposal")]
    ike_proposal: &'static str,
    #[serde(rename = "esp-proposal")]
    esp_proposal: &'static str,
}

#[derive(Serialize)]
struct SswanRemote {
    addr: String,
}

#[derive(Serialize)]
struct SswanLocal {
    p12: String,
    #[serde(rename = "rsa-pss")]
    rsa_pss: &'static str,
}

/// strongSwan VPN Client profile (JSON). The `.p12` is embedded as base64
/// wrapped at 52 columns; line breaks come out as escaped `\n`.
pub fn render_sswan(input: &ProfileInput<'_>) -> Result<String, Error> {
    let profile = SswanProfile {
        uuid: Uuid::new_v4().to_string(),
        name: format!("IKEv2 VPN ({})", input.server),
        kind: "ikev2-cert",
        remote: SswanRemote {
            addr: input.server.to_string(),
        },
        local: SswanLocal {
            p12: encoding::encode_wrapped(input.p12, BASE64_WIDTH)
                .into_iter()
                .map(|line| line + "\n")
                .collect(),
            rsa_pss: "true",
        },
        ike_proposal: "aes256-sha256-modp2048",
        esp_proposal: "aes128gcm16",
    };
    let mut json = serde_json::to_string_pretty(&profile)
        .map_err(|e| Error::tool("Encoding strongSwan profile", e.to_string()))?;
    json.push('\n');
    Ok(json)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Paths of a written bundle
#[derive(Debug, Clone)]
pub struct Bundle {
    pub p12: PathBuf,
    pub mobileconfig: PathBuf,
    pub sswan: PathBuf,
}

impl Bundle {
    pub fn paths(&self) -> [&Path; 3] {
        [&self.p12, &self.mobileconfig, &self.sswan]
    }
}

/// Export the `.p12` and render both mobile profiles next to it.
/// Re-running overwrites the same three files.
pub fn export_bundle(
    db: &CertDb<'_>,
    target: &ExportTarget,
    client: &ClientName,
    server: &ServerAddr,
    password: &str,
    mobike: bool,
) -> Result<Bundle, Error> {
    let bundle = Bundle {
        p12: target.path(client, "p12"),
        mobileconfig: target.path(client, "mobileconfig"),
        sswan: target.path(client, "sswan"),
    };

    log::info!("Exporting client configuration for '{}'...", client);
    db.export_p12(client, password, &bundle.p12)?;
    target.adjust_owner(&bundle.p12)?;

    let p12 = fs::read(&bundle.p12)?;
    let ca_base64 = db.ca_certificate_base64()?;
    let input = ProfileInput {
        client,
        server,
        password,
        mobike,
        p12: &p12,
        ca_base64: &ca_base64,
    };

    write_private(&bundle.mobileconfig, &render_mobileconfig(&input), target)?;
    write_private(&bundle.sswan, &render_sswan(&input)?, target)?;
    Ok(bundle)
}

fn write_private(path: &Path, content: &str, target: &ExportTarget) -> Result<(), Error> {
    let mut file = create_private_file(path)?;
    file.write_all(content.as_bytes())?;
    target.adjust_owner(path)?;
    Ok(())
}
