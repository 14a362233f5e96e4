//! Certificate lifecycle in the Libreswan NSS database
//!
//! All operations shell out to `certutil`, `crlutil` and `pk12util`. Labels
//! ("nicknames" in NSS terms) are unique within the database.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tempfile::NamedTempFile;

use crate::names::{ClientName, ServerAddr, Validity};
use crate::system::{Cmd, CommandRunner};
use crate::Error;

/// Label and common name of the VPN CA
pub const CA_NAME: &str = "IKEv2 VPN CA";

const ORGANIZATION: &str = "IKEv2 VPN";
const KEY_TYPE: &str = "rsa";
const KEY_BITS: &str = "3072";
const CA_VALIDITY_MONTHS: &str = "120";
const SERVER_VALIDITY_MONTHS: &str = "120";
const NOISE_BYTES: usize = 1024;

/// Answers for the `-2` basic-constraints questions: CA, no path length, not critical
const CA_CONSTRAINT_ANSWERS: &str = "y\n\nN\n";

pub struct CertDb<'a> {
    runner: &'a dyn CommandRunner,
    db: String,
    jitter: bool,
}

impl<'a> CertDb<'a> {
    /// Open the SQL-format database stored in `dir`
    pub fn new(runner: &'a dyn CommandRunner, dir: &Path) -> Self {
        Self {
            runner,
            db: format!("sql:{}", dir.display()),
            jitter: true,
        }
    }

    /// Skip the random pause before server/client key generation
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn certutil(&self) -> Cmd {
        Cmd::new("certutil").args(["-d", self.db.as_str()])
    }

    /// Whether a certificate labelled `label` exists
    pub fn exists(&self, label: &str) -> Result<bool, Error> {
        let out = self.runner.run(&self.certutil().args(["-L", "-n", label]))?;
        Ok(out.success)
    }

    /// Fail if `label` is already taken
    pub fn ensure_absent(&self, label: &str) -> Result<(), Error> {
        if self.exists(label)? {
            return Err(Error::precondition(format!(
                "Certificate '{}' already exists. Abort.",
                label
            )));
        }
        Ok(())
    }

    /// Every label in the database
    pub fn labels(&self) -> Result<Vec<String>, Error> {
        let out = self
            .runner
            .run_checked(&self.certutil().arg("-L"), "Listing certificates")?;
        Ok(parse_labels(&out.stdout))
    }

    /// Client labels: everything except the CA and host-style labels with a dot
    pub fn client_labels(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .labels()?
            .into_iter()
            .filter(|label| label != CA_NAME && !label.contains('.'))
            .collect())
    }

    pub fn create_ca(&self) -> Result<(), Error> {
        self.ensure_absent(CA_NAME)?;
        log::info!("Generating CA certificate...");
        let noise = noise_file()?;
        let cmd = self
            .certutil()
            .args(["-z", &noise.path().to_string_lossy()])
            .args(["-S", "-x", "-n", CA_NAME])
            .args(["-s", &format!("O={},CN={}", ORGANIZATION, CA_NAME)])
            .args(["-k", KEY_TYPE, "-g", KEY_BITS, "-v", CA_VALIDITY_MONTHS])
            .args(["-t", "CT,,", "-2"])
            .stdin(CA_CONSTRAINT_ANSWERS);
        self.runner.run_checked(&cmd, "Creating CA certificate")?;
        Ok(())
    }

    pub fn create_server_cert(&self, server: &ServerAddr) -> Result<(), Error> {
        let label = server.to_string();
        self.ensure_absent(&label)?;
        log::info!("Generating VPN server certificate...");
        self.pause();
        let noise = noise_file()?;
        let cmd = self
            .certutil()
            .args(["-z", &noise.path().to_string_lossy()])
            .args(["-S", "-c", CA_NAME, "-n", &label])
            .args(["-s", &format!("O={},CN={}", ORGANIZATION, label)])
            .args(["-k", KEY_TYPE, "-g", KEY_BITS, "-v", SERVER_VALIDITY_MONTHS])
            .args(["-t", ",,"])
            .args(["--keyUsage", "digitalSignature,keyEncipherment"])
            .args(["--extKeyUsage", "serverAuth"])
            .args(["--extSAN", &server.subject_alt_name()]);
        self.runner.run_checked(&cmd, "Creating server certificate")?;
        Ok(())
    }

    pub fn create_client_cert(&self, client: &ClientName, validity: Validity) -> Result<(), Error> {
        self.ensure_absent(client.as_str())?;
        log::info!("Generating client certificate...");
        self.pause();
        let noise = noise_file()?;
        let months = validity.get().to_string();
        let cmd = self
            .certutil()
            .args(["-z", &noise.path().to_string_lossy()])
            .args(["-S", "-c", CA_NAME, "-n", client.as_str()])
            .args(["-s", &format!("O={},CN={}", ORGANIZATION, client)])
            .args(["-k", KEY_TYPE, "-g", KEY_BITS, "-v", months.as_str()])
            .args(["-t", ",,"])
            .args(["--keyUsage", "digitalSignature,keyEncipherment"])
            .args(["--extKeyUsage", "serverAuth,clientAuth"])
            .args(["-8", client.as_str()]);
        self.runner.run_checked(&cmd, "Creating client certificate")?;
        Ok(())
    }

    /// Export cert, key and CA of `client` into a password-protected PKCS#12 file.
    ///
    /// The file is created owner-only before `pk12util` writes to it and is
    /// removed again if the export fails.
    pub fn export_p12(&self, client: &ClientName, password: &str, out: &Path) -> Result<(), Error> {
        create_private_file(out)?;

        let password_file = if password.is_empty() {
            None
        } else {
            let mut file = NamedTempFile::new()?;
            file.write_all(password.as_bytes())?;
            file.flush()?;
            Some(file)
        };

        let mut cmd = Cmd::new("pk12util")
            .args(["-d", self.db.as_str(), "-n", client.as_str()])
            .args(["-o", &out.to_string_lossy()]);
        cmd = match &password_file {
            Some(file) => cmd.args(["-w", &file.path().to_string_lossy()]),
            None => cmd.args(["-W", ""]),
        };

        let result = self.runner.run_checked(&cmd, "Exporting client configuration");
        if let Err(e) = result {
            let _ = fs::remove_file(out);
            return Err(e);
        }
        // pk12util may have replaced the file; enforce the mode again
        fs::set_permissions(out, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Base64 body of the CA certificate (PEM without armor lines)
    pub fn ca_certificate_base64(&self) -> Result<String, Error> {
        let out = self.runner.run_checked(
            &self.certutil().args(["-L", "-n", CA_NAME, "-a"]),
            "Reading CA certificate",
        )?;
        let body: String = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("-----"))
            .collect();
        if body.is_empty() {
            return Err(Error::tool("Reading CA certificate", "empty output"));
        }
        Ok(body)
    }

    /// Mark `label` untrusted, then delete its key and certificate.
    ///
    /// Only the trust change must succeed; deletion is allowed to fail since
    /// the entry may already be partly gone.
    pub fn revoke_and_delete(&self, label: &str) -> Result<(), Error> {
        log::info!("Deleting certificate '{}'...", label);
        self.runner.run_checked(
            &self.certutil().args(["-M", "-n", label, "-t", "p,p,p"]),
            &format!("Marking certificate '{}' untrusted", label),
        )?;
        for flag in ["-F", "-D"] {
            let out = self.runner.run(&self.certutil().args([flag, "-n", label]))?;
            if !out.success {
                log::warn!("certutil {} for '{}' failed: {}", flag, label, out.stderr.trim());
            }
        }
        Ok(())
    }

    /// Remove every certificate, the CA's CRL and finally the CA itself.
    /// Running it against an empty database does nothing.
    pub fn delete_all(&self) -> Result<(), Error> {
        for label in self.labels()?.iter().filter(|l| *l != CA_NAME) {
            self.revoke_and_delete(label)?;
        }
        let crl = self
            .runner
            .run(&Cmd::new("crlutil").args(["-D", "-d", self.db.as_str(), "-n", CA_NAME]))?;
        if !crl.success {
            log::warn!("Could not delete the CRL of '{}': {}", CA_NAME, crl.stderr.trim());
        }
        if self.exists(CA_NAME)? {
            self.revoke_and_delete(CA_NAME)?;
        }
        Ok(())
    }

    /// Add `client`'s serial to the CA's revocation list, creating the list if needed
    pub fn revoke_client(&self, client: &ClientName, revoked_at: DateTime<Utc>) -> Result<(), Error> {
        let info = self.runner.run_checked(
            &self.certutil().args(["-L", "-n", client.as_str()]),
            "Reading client certificate",
        )?;
        let serial = parse_serial(&info.stdout).ok_or_else(|| {
            Error::tool("Reading client certificate", "serial number not found")
        })?;

        let crlutil = || Cmd::new("crlutil").args(["-d", self.db.as_str(), "-n", CA_NAME]);
        if !self.runner.run(&crlutil().arg("-L"))?.success {
            log::info!("Creating certificate revocation list...");
            self.runner
                .run_checked(&crlutil().args(["-G", "-c", "/dev/null"]), "Creating CRL")?;
        }

        log::info!("Revoking client certificate '{}' (serial {})...", client, serial);
        self.runner.run_checked(
            &crlutil()
                .arg("-M")
                .stdin(format!("addcert {} {}\n", serial, crl_timestamp(revoked_at))),
            "Revoking client certificate",
        )?;
        Ok(())
    }

    fn pause(&self) {
        if self.jitter {
            let secs = rand::thread_rng().gen_range(1..=3);
            thread::sleep(Duration::from_secs(secs));
        }
    }
}

/// Revocation date in the GeneralizedTime form `crlutil` expects
pub fn crl_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%SZ").to_string()
}

/// Fresh entropy for `certutil -z`, in a private temp file
fn noise_file() -> Result<NamedTempFile, Error> {
    let mut noise = [0u8; NOISE_BYTES];
    OsRng.fill_bytes(&mut noise);
    let mut file = NamedTempFile::new()?;
    file.write_all(&noise)?;
    file.flush()?;
    Ok(file)
}

/// Create or truncate `path` with mode 0600
pub fn create_private_file(path: &Path) -> Result<fs::File, Error> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies to new files
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

/// Labels from `certutil -L` table output
pub fn parse_labels(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.contains("Certificate Nickname") && !line.contains("SSL,S/MIME"))
        .filter_map(|line| {
            let (label, _trust) = line.rsplit_once(char::is_whitespace)?;
            let label = label.trim();
            (!label.is_empty()).then(|| label.to_string())
        })
        .collect()
}

/// Decimal serial number from `certutil -L -n <label>` output
pub fn parse_serial(info: &str) -> Option<String> {
    let mut lines = info.lines();
    while let Some(line) = lines.next() {
        let Some(rest) = line.trim().strip_prefix("Serial Number:") else {
            continue;
        };
        let rest = rest.trim();
        if let Some(decimal) = rest.split_whitespace().next() {
            if decimal.chars().all(|c| c.is_ascii_digit()) {
                return Some(decimal.to_string());
            }
        }
        // Long serials are printed as colon-separated hex on the next line
        let hex: String = lines
            .next()?
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect();
        let hex = hex.trim_start_matches('0');
        if hex.is_empty() {
            return Some("0".to_string());
        }
        if hex.len() > 32 {
            return None;
        }
        return u128::from_str_radix(hex, 16).ok().map(|n| n.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "
Certificate Nickname                                         Trust Attributes
                                                             SSL,S/MIME,JAR/XPI

IKEv2 VPN CA                                                 CTu,u,u
203.0.113.5                                                  u,u,u
vpnclient                                                    u,u,u
phone_2                                                      u,u,u
";

    #[test]
    fn test_parse_labels() {
        assert_eq!(
            parse_labels(LISTING),
            vec!["IKEv2 VPN CA", "203.0.113.5", "vpnclient", "phone_2"]
        );
        assert!(parse_labels("").is_empty());
    }

    #[test]
    fn test_parse_serial_decimal() {
        let info = "Certificate:\n    Data:\n        Version: 3 (0x2)\n        Serial Number: 2714472241 (0xa1cb8f31)\n";
        assert_eq!(parse_serial(info).as_deref(), Some("2714472241"));
    }

    #[test]
    fn test_parse_serial_hex() {
        let info = "        Serial Number:\n            00:a1:cb:8f:31\n        Signature Algorithm: x\n";
        assert_eq!(parse_serial(info).as_deref(), Some("2714472241"));
    }

    #[test]
    fn test_parse_serial_missing() {
        assert_eq!(parse_serial("Certificate:\n"), None);
    }

    #[test]
    fn test_crl_timestamp() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(crl_timestamp(at), "20240305070809Z");
    }

    #[test]
    fn test_private_file_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.p12");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        create_private_file(&path).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(meta.len(), 0);
    }
}
