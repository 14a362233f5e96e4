//! HTTP fetches with bounded retries, public IP detection and the
//! Libreswan update check

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::os::OsInfo;
use crate::system::{Cmd, CommandRunner};
use crate::version::SwanVersion;
use crate::Error;

pub trait Fetch {
    fn get_text(&self, url: &str) -> Result<String, Error>;
    fn download(&self, url: &str, dest: &Path) -> Result<(), Error>;
}

/// Blocking HTTP client that retries failed requests
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    retries: u32,
    backoff: Duration,
}

impl HttpFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("ikev2kit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            retries: config.retries.max(1),
            backoff: Duration::from_secs(2),
        })
    }

    fn with_retries<T>(&self, url: &str, op: impl Fn() -> Result<T, Error>) -> Result<T, Error> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    log::debug!("Fetching {} failed (attempt {}): {}", url, attempt, e);
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Fetch for HttpFetcher {
    fn get_text(&self, url: &str) -> Result<String, Error> {
        self.with_retries(url, || {
            let response = self.client.get(url).send()?.error_for_status()?;
            Ok(response.text()?)
        })
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), Error> {
        self.with_retries(url, || {
            let response = self.client.get(url).send()?.error_for_status()?;
            let body = response.bytes()?;
            fs::write(dest, &body)?;
            Ok(())
        })
    }
}

/// Try each URL in order until one downloads; returns the URL used
pub fn download_first<'u>(fetch: &dyn Fetch, urls: &'u [String], dest: &Path) -> Result<&'u str, Error> {
    let mut last = Error::Network("no download URL".to_string());
    for url in urls {
        log::info!("Downloading {}...", url);
        match fetch.download(url, dest) {
            Ok(()) => return Ok(url.as_str()),
            Err(e) => {
                log::warn!("Download from {} failed: {}", url, e);
                last = e;
            }
        }
    }
    Err(last)
}

/// Find this server's public IPv4 address: OpenDNS via `dig` first, then
/// the HTTP echo services in order
pub fn detect_public_ip(
    runner: &dyn CommandRunner,
    fetch: &dyn Fetch,
    echo_urls: &[String],
) -> Result<Ipv4Addr, Error> {
    let dig = Cmd::new("dig").args([
        "@resolver1.opendns.com",
        "-t",
        "A",
        "-4",
        "myip.opendns.com",
        "+short",
    ]);
    if let Ok(out) = runner.run(&dig) {
        if let Some(ip) = out.success.then(|| parse_ipv4(&out.stdout)).flatten() {
            return Ok(ip);
        }
    }

    for url in echo_urls {
        match fetch.get_text(url) {
            Ok(body) => {
                if let Some(ip) = parse_ipv4(&body) {
                    return Ok(ip);
                }
                log::debug!("{} returned no IPv4 address", url);
            }
            Err(e) => log::debug!("{} failed: {}", url, e),
        }
    }

    Err(Error::precondition(
        "Cannot detect this server's public IP. Set 'public_ip' in the [setup] section of the config file.",
    ))
}

fn parse_ipv4(text: &str) -> Option<Ipv4Addr> {
    text.lines().next()?.trim().parse().ok()
}

/// Endpoint reporting the newest Libreswan suitable for IKEv2 setup
pub fn ikev2_update_url(base: &str, os: &OsInfo, arch: &str, installed: SwanVersion) -> String {
    format!(
        "{}/{}/{}/swanverikev2?arch={}&ver={}",
        base.trim_end_matches('/'),
        os.url_tag(),
        os.url_version(),
        arch,
        installed
    )
}

/// Endpoint reporting the newest Libreswan the upgrade tool can build
pub fn upgrade_check_url(
    base: &str,
    os: &OsInfo,
    arch: &str,
    installed: SwanVersion,
    target: SwanVersion,
) -> String {
    format!(
        "{}/{}/{}/swanverupg?arch={}&ver1={}&ver2={}",
        base.trim_end_matches('/'),
        os.url_tag(),
        os.url_version(),
        arch,
        installed,
        target
    )
}

/// Ask `url` for the latest version and return it if newer than `than`.
/// Any failure means "no update known".
pub fn newer_version(fetch: &dyn Fetch, url: &str, than: SwanVersion) -> Option<SwanVersion> {
    let body = match fetch.get_text(url) {
        Ok(body) => body,
        Err(e) => {
            log::debug!("Version check failed: {}", e);
            return None;
        }
    };
    let latest: SwanVersion = body.lines().next()?.trim().parse().ok()?;
    (latest > than).then_some(latest)
}
