//! Test doubles: a host whose NSS tools and services live in memory

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;

use ikev2kit_common::net::Fetch;
use ikev2kit_common::{Cmd, CommandRunner, Error, Output};

const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nTUlJQ0FDQQ==\n-----END CERTIFICATE-----\n";

#[derive(Default)]
pub struct FakeHost {
    pub labels: RefCell<Vec<String>>,
    pub calls: RefCell<Vec<Cmd>>,
    /// Answer for `dig`
    pub public_ip: Option<String>,
    /// Program whose every run exits non-zero
    pub failing: Cell<Option<&'static str>>,
}

impl FakeHost {
    pub fn with_labels(labels: &[&str]) -> Self {
        let host = Self::default();
        host.labels
            .borrow_mut()
            .extend(labels.iter().map(|l| l.to_string()));
        host
    }

    pub fn has(&self, label: &str) -> bool {
        self.labels.borrow().iter().any(|l| l == label)
    }

    pub fn ran(&self, program: &str, arg: &str) -> bool {
        self.calls
            .borrow()
            .iter()
            .any(|c| c.program == program && c.has_arg(arg))
    }

    fn listing(&self) -> String {
        let mut out = String::from("\nCertificate Nickname                                         Trust Attributes\n");
        out.push_str("                                                             SSL,S/MIME,JAR/XPI\n\n");
        for label in self.labels.borrow().iter() {
            out.push_str(&format!("{:<61}u,u,u\n", label));
        }
        out
    }

    fn certutil(&self, cmd: &Cmd, nick: Option<String>) -> Output {
        match nick {
            Some(nick) if cmd.has_arg("-S") => {
                if self.has(&nick) {
                    Output::failed("certutil: nickname already in use")
                } else {
                    self.labels.borrow_mut().push(nick);
                    Output::ok("")
                }
            }
            Some(nick) if cmd.has_arg("-L") => match (self.has(&nick), cmd.has_arg("-a")) {
                (false, _) => Output::failed("certutil: Could not find cert"),
                (true, true) => Output::ok(CA_PEM),
                (true, false) => Output::ok("        Serial Number: 7 (0x7)\n"),
            },
            None if cmd.has_arg("-L") => Output::ok(self.listing()),
            Some(nick) if cmd.has_arg("-M") && !self.has(&nick) => {
                Output::failed("certutil: Could not find cert")
            }
            Some(nick) if cmd.has_arg("-D") => {
                self.labels.borrow_mut().retain(|l| *l != nick);
                Output::ok("")
            }
            _ => Output::ok(""),
        }
    }
}

fn value_after<'c>(cmd: &'c Cmd, flag: &str) -> Option<&'c str> {
    let pos = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(pos + 1).map(String::as_str)
}

impl CommandRunner for FakeHost {
    fn run(&self, cmd: &Cmd) -> Result<Output, Error> {
        self.calls.borrow_mut().push(cmd.clone());
        if self.failing.get() == Some(cmd.program.as_str()) {
            return Ok(Output::failed(format!("{}: exited with status 1", cmd.program)));
        }
        let nick = value_after(cmd, "-n").map(str::to_string);

        let out = match cmd.program.as_str() {
            "certutil" => self.certutil(cmd, nick),
            "pk12util" => match nick {
                Some(nick) if self.has(&nick) => {
                    let path = value_after(cmd, "-o").unwrap_or_default();
                    fs::write(path, format!("p12 for {}", nick))?;
                    Output::ok("")
                }
                _ => Output::failed("pk12util: find user certs from nickname failed"),
            },
            "id" => Output::ok("0\n"),
            "uname" => Output::ok("x86_64\n"),
            "dig" => match &self.public_ip {
                Some(ip) => Output::ok(format!("{}\n", ip)),
                None => Output::failed(""),
            },
            _ => Output::ok(""),
        };
        Ok(out)
    }
}

/// Every request fails, as if offline
pub struct Offline;

impl Fetch for Offline {
    fn get_text(&self, url: &str) -> Result<String, Error> {
        Err(Error::Network(format!("offline: {}", url)))
    }

    fn download(&self, url: &str, _dest: &Path) -> Result<(), Error> {
        Err(Error::Network(format!("offline: {}", url)))
    }
}
