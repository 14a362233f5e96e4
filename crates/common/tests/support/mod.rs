//! An in-memory stand-in for the NSS command line tools

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;

use ikev2kit_common::{Cmd, CommandRunner, Error, Output};

pub const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nTUlJQ0FDQQ==\nQUJD\n-----END CERTIFICATE-----\n";

/// Keeps certificate labels in memory and records every command
#[derive(Default)]
pub struct FakeNss {
    pub labels: RefCell<Vec<String>>,
    pub calls: RefCell<Vec<Cmd>>,
}

impl FakeNss {
    pub fn with_labels(labels: &[&str]) -> Self {
        let nss = Self::default();
        nss.labels
            .borrow_mut()
            .extend(labels.iter().map(|l| l.to_string()));
        nss
    }

    pub fn has(&self, label: &str) -> bool {
        self.labels.borrow().iter().any(|l| l == label)
    }

    pub fn count(&self, program: &str, flag: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.program == program && c.has_arg(flag))
            .count()
    }

    fn listing(&self) -> String {
        let mut out = String::from("\nCertificate Nickname                                         Trust Attributes\n");
        out.push_str("                                                             SSL,S/MIME,JAR/XPI\n\n");
        for label in self.labels.borrow().iter() {
            out.push_str(&format!("{:<61}u,u,u\n", label));
        }
        out
    }
}

fn value_after<'c>(cmd: &'c Cmd, flag: &str) -> Option<&'c str> {
    let pos = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(pos + 1).map(String::as_str)
}

impl CommandRunner for FakeNss {
    fn run(&self, cmd: &Cmd) -> Result<Output, Error> {
        self.calls.borrow_mut().push(cmd.clone());
        let nick = value_after(cmd, "-n").map(str::to_string);

        let out = match (cmd.program.as_str(), nick) {
            ("certutil", Some(nick)) if cmd.has_arg("-S") => {
                if self.has(&nick) {
                    Output::failed("certutil: nickname already in use")
                } else {
                    self.labels.borrow_mut().push(nick);
                    Output::ok("")
                }
            }
            ("certutil", Some(nick)) if cmd.has_arg("-L") => match (self.has(&nick), cmd.has_arg("-a")) {
                (false, _) => Output::failed("certutil: Could not find cert"),
                (true, true) => Output::ok(CA_PEM),
                (true, false) => Output::ok("Certificate:\n    Data:\n        Serial Number: 42 (0x2a)\n"),
            },
            ("certutil", None) if cmd.has_arg("-L") => Output::ok(self.listing()),
            ("certutil", Some(nick)) if cmd.has_arg("-M") => {
                if self.has(&nick) {
                    Output::ok("")
                } else {
                    Output::failed("certutil: Could not find cert")
                }
            }
            ("certutil", Some(nick)) if cmd.has_arg("-D") => {
                self.labels.borrow_mut().retain(|l| *l != nick);
                Output::ok("")
            }
            ("pk12util", Some(nick)) => {
                if !self.has(&nick) {
                    Output::failed("pk12util: find user certs from nickname failed")
                } else {
                    let path = value_after(cmd, "-o").unwrap_or_default();
                    fs::write(path, format!("p12 for {}", nick))?;
                    Output::ok("pk12util: PKCS12 EXPORT SUCCESSFUL")
                }
            }
            _ => Output::ok(""),
        };
        Ok(out)
    }
}
