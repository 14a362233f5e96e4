//! Upgrade pipeline
//!
//! Every check and question happens in [`Upgrader::plan`] before the host is
//! touched. [`Upgrader::install`] then runs the build to the end or stops at
//! the first failing step; there is no rollback.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

use ikev2kit_common::net::{self, Fetch};
use ikev2kit_common::os::{OsFamily, OsInfo};
use ikev2kit_common::patch;
use ikev2kit_common::prompt::{confirm, Prompt};
use ikev2kit_common::system::{self, Cmd};
use ikev2kit_common::version::{upgrade_supports, UPGRADE_TARGETS};
use ikev2kit_common::{Capabilities, CommandRunner, Config, Error, SwanVersion};

use crate::source::{self, SourceTree, TARGET_VERSION};

const IF_LINK_HEADER: &str = "/usr/include/linux/if_link.h";

/// What will be built, fixed once every check has passed
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub os: OsInfo,
    pub installed: SwanVersion,
    pub target: SwanVersion,
}

impl UpgradePlan {
    /// Validate an upgrade from `installed` to `target` on `os`
    pub fn check(os: OsInfo, installed: Option<SwanVersion>, target: SwanVersion) -> Result<Self, Error> {
        check_os_supported(&os)?;
        if target == SwanVersion::new(3, 32) && os.family == OsFamily::Debian && os.major >= 11 {
            return Err(Error::precondition(
                "Libreswan 3.32 is not supported on Debian 11 or newer.",
            ));
        }
        let installed = installed.ok_or_else(|| {
            Error::precondition(
                "This script requires Libreswan already installed. See: https://github.com/hwdsl2/setup-ipsec-vpn",
            )
        })?;
        if !upgrade_supports(target) {
            return Err(Error::precondition(format!(
                "Libreswan version '{}' is not supported. Supported versions: {}",
                target,
                UPGRADE_TARGETS.join(", ")
            )));
        }
        Ok(Self { os, installed, target })
    }

    pub fn is_reinstall(&self) -> bool {
        self.installed == self.target
    }
}

/// Ubuntu 20.04+, Debian 10+, CentOS/RHEL 8-9 and clones, Amazon Linux 2,
/// Alpine 3.19+
pub fn check_os_supported(os: &OsInfo) -> Result<(), Error> {
    let supported = match os.family {
        OsFamily::Ubuntu => os.major >= 20,
        OsFamily::Debian => os.major >= 10,
        OsFamily::Rhel => matches!(os.major, 8 | 9),
        OsFamily::AmazonLinux => os.major == 2,
        OsFamily::Alpine => os.major > 3 || (os.major == 3 && os.minor >= 19),
    };
    if supported {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "{} {} is not supported by this script.",
            os.family, os.version_id
        )))
    }
}

/// Version to build: the config file's choice or the built-in one
pub fn target_version(config: &Config) -> Result<SwanVersion, Error> {
    config
        .upgrade
        .target_version
        .as_deref()
        .unwrap_or(TARGET_VERSION)
        .parse()
}

pub struct Upgrader<'a> {
    pub config: Config,
    pub runner: &'a dyn CommandRunner,
    pub fetch: &'a dyn Fetch,
    pub prompt: &'a mut dyn Prompt,
    pub out: &'a mut dyn Write,
}

impl<'a> Upgrader<'a> {
    fn ipsec_bin(&self) -> String {
        self.config.paths.ipsec_bin.to_string_lossy().into_owned()
    }

    pub fn run(&mut self, os: OsInfo) -> Result<()> {
        let plan = self.plan(os)?;
        self.install(&plan)
    }

    /// Preflight checks and confirmations. Nothing is changed on the host.
    pub fn plan(&mut self, os: OsInfo) -> Result<UpgradePlan> {
        system::require_root(self.runner)?;
        let target = target_version(&self.config)?;
        let installed = SwanVersion::installed(self.runner, &self.ipsec_bin())?;
        let plan = UpgradePlan::check(os, installed, target)?;
        log::debug!("Installed Libreswan {}, target {}", plan.installed, plan.target);

        self.check_for_newer(&plan)?;

        if plan.is_reinstall() {
            writeln!(self.out, "\nLibreswan {} is already installed.", plan.installed)?;
            if !confirm(self.prompt, "Do you want to reinstall it?", false)? {
                bail!(Error::Aborted);
            }
        }

        writeln!(self.out, "\nCurrent Libreswan version: {}", plan.installed)?;
        writeln!(self.out, "Version to be installed: {}\n", plan.target)?;
        writeln!(
            self.out,
            "Note: This will compile Libreswan from source and replace the installed version."
        )?;
        if !confirm(self.prompt, "Do you want to continue?", true)? {
            bail!(Error::Aborted);
        }
        Ok(plan)
    }

    /// Ask the update server whether something newer than the target exists
    fn check_for_newer(&mut self, plan: &UpgradePlan) -> Result<()> {
        let Ok(arch) = system::machine_arch(self.runner) else {
            return Ok(());
        };
        let url = net::upgrade_check_url(
            &self.config.network.update_base_url,
            &plan.os,
            &arch,
            plan.installed,
            plan.target,
        );
        if let Some(latest) = net::newer_version(self.fetch, &url, plan.target) {
            writeln!(
                self.out,
                "\nNote: A newer version of Libreswan ({}) is supported. \
                 Set 'target_version' in the [upgrade] section of the config file to use it.",
                latest
            )?;
            let question = format!("Continue with Libreswan {} anyway?", plan.target);
            if !confirm(self.prompt, &question, true)? {
                bail!(Error::Aborted);
            }
        }
        Ok(())
    }

    /// Build and install `plan.target`, then bring the configs up to date
    pub fn install(&mut self, plan: &UpgradePlan) -> Result<()> {
        log::info!("Installing packages required for the build...");
        for cmd in source::build_dependency_cmds(&plan.os) {
            self.runner.run_checked(&cmd, "Installing required packages")?;
        }

        let src_dir = &self.config.paths.src_dir;
        fs::create_dir_all(src_dir)
            .with_context(|| format!("Failed to create {}", src_dir.display()))?;
        let tree = SourceTree::new(src_dir, plan.target);
        if tree.dir.exists() {
            fs::remove_dir_all(&tree.dir)
                .with_context(|| format!("Failed to remove {}", tree.dir.display()))?;
        }

        let urls = source::mirror_urls(plan.target);
        net::download_first(self.fetch, &urls, &tree.archive)
            .context("Cannot download Libreswan source")?;
        self.runner.run_checked(&tree.unpack_cmd(), "Extracting Libreswan source")?;

        for file in source::apply_source_fixes(&tree.dir, plan.target)? {
            log::info!("Applied source fix to {}", file);
        }
        let header = fs::read_to_string(IF_LINK_HEADER).ok();
        let flags = source::build_flags(plan.target, &plan.os, header.as_deref());
        let local = tree.dir.join("Makefile.inc.local");
        fs::write(&local, flags).with_context(|| format!("Failed to write {}", local.display()))?;

        self.build(&tree.dir)?;
        self.verify(plan.target)?;

        let caps = Capabilities::for_version(plan.target);
        for path in [self.config.paths.ipsec_conf.clone(), self.config.paths.fragment()] {
            patch::patch_file(&path, &caps)
                .with_context(|| format!("Failed to update {}", path.display()))?;
        }

        system::restart_ipsec(self.runner, &plan.os)?;
        cleanup(&tree);

        writeln!(
            self.out,
            "\nLibreswan {} was installed successfully!",
            plan.target
        )?;
        Ok(())
    }

    fn build(&self, dir: &Path) -> Result<()> {
        let jobs = std::thread::available_parallelism().map_or(1, |n| n.get()) + 1;
        log::info!("Compiling and installing Libreswan, please wait...");
        self.runner.run_checked(
            &Cmd::new("make")
                .arg(format!("-j{}", jobs))
                .args(["-s", "base"])
                .current_dir(dir),
            "Compiling Libreswan",
        )?;
        self.runner.run_checked(
            &Cmd::new("make").args(["-s", "install-base"]).current_dir(dir),
            "Installing Libreswan",
        )?;
        Ok(())
    }

    fn verify(&self, target: SwanVersion) -> Result<()> {
        match SwanVersion::installed(self.runner, &self.ipsec_bin())? {
            Some(found) if found == target => Ok(()),
            found => bail!(
                "Libreswan {} failed to build (ipsec --version reports {})",
                target,
                found.map_or_else(|| "nothing".to_string(), |v| v.to_string())
            ),
        }
    }
}

fn cleanup(tree: &SourceTree) {
    if let Err(e) = fs::remove_file(&tree.archive) {
        log::warn!("Could not remove {}: {}", tree.archive.display(), e);
    }
    if let Err(e) = fs::remove_dir_all(&tree.dir) {
        log::warn!("Could not remove {}: {}", tree.dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    use ikev2kit_common::prompt::ScriptedPrompt;
    use ikev2kit_common::Output;
    use tempfile::TempDir;

    /// A host whose `make install-base` switches `ipsec --version` to the
    /// version being built
    struct FakeBuild {
        installed: RefCell<Option<String>>,
        building: String,
        fail: Option<&'static str>,
        calls: RefCell<Vec<Cmd>>,
    }

    impl FakeBuild {
        fn new(installed: &str, building: &str) -> Self {
            Self {
                installed: RefCell::new(Some(installed.to_string())),
                building: building.to_string(),
                fail: None,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn programs(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.program.clone()).collect()
        }

        fn ran(&self, program: &str, arg: &str) -> bool {
            self.calls
                .borrow()
                .iter()
                .any(|c| c.program == program && c.has_arg(arg))
        }
    }

    impl CommandRunner for FakeBuild {
        fn run(&self, cmd: &Cmd) -> Result<Output, Error> {
            self.calls.borrow_mut().push(cmd.clone());
            if self.fail.is_some_and(|arg| cmd.has_arg(arg)) {
                return Ok(Output::failed("make: *** [base] Error 2"));
            }
            let out = match cmd.program.as_str() {
                "id" => Output::ok("0\n"),
                "uname" => Output::ok("x86_64\n"),
                "ipsec" => match self.installed.borrow().as_deref() {
                    Some(v) => Output::ok(format!("Linux Libreswan {} (XFRM) on 6.1.0-13-amd64\n", v)),
                    None => Output::failed("ipsec: command not found"),
                },
                "tar" => {
                    let archive = cmd.args[1].clone();
                    let dir = archive.trim_end_matches(".tar.gz");
                    fs::create_dir_all(dir)?;
                    Output::ok("")
                }
                "make" if cmd.has_arg("install-base") => {
                    *self.installed.borrow_mut() = Some(self.building.clone());
                    Output::ok("")
                }
                _ => Output::ok(""),
            };
            Ok(out)
        }
    }

    /// Update server and source mirrors
    #[derive(Default)]
    struct Mirrors {
        latest: Option<&'static str>,
        primary_down: bool,
        downloads: RefCell<Vec<String>>,
    }

    impl Fetch for Mirrors {
        fn get_text(&self, url: &str) -> Result<String, Error> {
            self.latest
                .map(|v| format!("{}\n", v))
                .ok_or_else(|| Error::Network(format!("no answer from {}", url)))
        }

        fn download(&self, url: &str, dest: &Path) -> Result<(), Error> {
            self.downloads.borrow_mut().push(url.to_string());
            if self.primary_down && url.contains("github.com") {
                return Err(Error::Network("HTTP 503".to_string()));
            }
            fs::write(dest, "tarball")?;
            Ok(())
        }
    }

    fn debian(version: &str) -> OsInfo {
        OsInfo::parse(&format!("ID=debian\nVERSION_ID=\"{}\"\n", version)).unwrap()
    }

    fn v(s: &str) -> SwanVersion {
        s.parse().unwrap()
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.ipsec_conf = dir.path().join("ipsec.conf");
        config.paths.ipsec_dir = dir.path().join("ipsec.d");
        config.paths.ipsec_bin = PathBuf::from("ipsec");
        config.paths.src_dir = dir.path().join("src");
        config
    }

    fn run(
        config: Config,
        runner: &FakeBuild,
        fetch: &Mirrors,
        prompt: &mut ScriptedPrompt,
        os: OsInfo,
    ) -> (Result<()>, String) {
        let mut out = Vec::new();
        let result = Upgrader {
            config,
            runner,
            fetch,
            prompt,
            out: &mut out,
        }
        .run(os);
        (result, String::from_utf8(out).unwrap())
    }

    fn is_aborted(result: &Result<()>) -> bool {
        matches!(
            result.as_ref().map_err(|e| e.downcast_ref::<Error>()),
            Err(Some(Error::Aborted))
        )
    }

    #[test]
    fn test_supported_platforms() {
        let os = |id: &str, ver: &str| OsInfo::parse(&format!("ID={}\nVERSION_ID=\"{}\"\n", id, ver)).unwrap();
        assert!(check_os_supported(&os("ubuntu", "24.04")).is_ok());
        assert!(check_os_supported(&os("ubuntu", "18.04")).is_err());
        assert!(check_os_supported(&os("debian", "10")).is_ok());
        assert!(check_os_supported(&os("rocky", "9.3")).is_ok());
        assert!(check_os_supported(&os("centos", "7")).is_err());
        assert!(check_os_supported(&os("amzn", "2")).is_ok());
        assert!(check_os_supported(&os("amzn", "2023")).is_err());
        assert!(check_os_supported(&os("alpine", "3.19.1")).is_ok());
        assert!(check_os_supported(&os("alpine", "3.18.4")).is_err());
    }

    #[test]
    fn test_plan_checks() {
        let plan = UpgradePlan::check(debian("12"), Some(v("4.12")), v("5.2")).unwrap();
        assert!(!plan.is_reinstall());

        let err = UpgradePlan::check(debian("11"), Some(v("4.12")), v("3.32")).unwrap_err();
        assert!(err.to_string().contains("3.32 is not supported on Debian 11"));
        assert!(UpgradePlan::check(debian("10"), Some(v("4.12")), v("3.32")).is_ok());

        let err = UpgradePlan::check(debian("12"), None, v("5.2")).unwrap_err();
        assert!(err.to_string().contains("requires Libreswan already installed"));

        let err = UpgradePlan::check(debian("12"), Some(v("4.12")), v("4.8")).unwrap_err();
        assert!(err.to_string().contains("'4.8' is not supported"));
    }

    #[test]
    fn test_target_version_from_config() {
        let mut config = Config::default();
        assert_eq!(target_version(&config).unwrap(), v(TARGET_VERSION));
        config.upgrade.target_version = Some("4.15".into());
        assert_eq!(target_version(&config).unwrap(), v("4.15"));
        config.upgrade.target_version = Some("latest".into());
        assert!(target_version(&config).is_err());
    }

    #[test]
    fn test_reinstall_declined_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeBuild::new(TARGET_VERSION, TARGET_VERSION);
        let mut prompt = ScriptedPrompt::new(["n"]);

        let (result, out) = run(config(&dir), &runner, &Mirrors::default(), &mut prompt, debian("12"));
        assert!(is_aborted(&result));
        assert!(out.contains("is already installed"));
        assert_eq!(prompt.asked, vec!["Do you want to reinstall it? [y/N] "]);
        assert!(runner
            .programs()
            .iter()
            .all(|p| ["id", "ipsec", "uname"].contains(&p.as_str())));
        assert!(!dir.path().join("src").exists());
    }

    #[test]
    fn test_newer_version_declined() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeBuild::new("4.12", "5.2");
        let fetch = Mirrors {
            latest: Some("5.3"),
            ..Mirrors::default()
        };
        let mut prompt = ScriptedPrompt::new(["n"]);

        let (result, out) = run(config(&dir), &runner, &fetch, &mut prompt, debian("12"));
        assert!(is_aborted(&result));
        assert!(out.contains("A newer version of Libreswan (5.3) is supported"));
        assert!(!runner.ran("apt-get", "install"));
        assert!(fetch.downloads.borrow().is_empty());
    }

    #[test]
    fn test_upgrade_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        fs::write(
            &config.paths.ipsec_conf,
            "config setup\n  virtual_private=%v4:10.0.0.0/8\n\nconn shared\n  forceencaps=yes\n",
        )
        .unwrap();
        let runner = FakeBuild::new("4.12", "5.2");
        let fetch = Mirrors {
            primary_down: true,
            ..Mirrors::default()
        };
        let mut prompt = ScriptedPrompt::new([""]);

        let (result, out) = run(config.clone(), &runner, &fetch, &mut prompt, debian("12"));
        result.unwrap();
        assert!(out.contains("Current Libreswan version: 4.12"));
        assert!(out.contains("Libreswan 5.2 was installed successfully!"));

        assert_eq!(
            *fetch.downloads.borrow(),
            vec![
                "https://github.com/libreswan/libreswan/archive/v5.2.tar.gz",
                "https://download.libreswan.org/libreswan-5.2.tar.gz",
            ]
        );

        let programs = runner.programs();
        let pos = |p: &str| programs.iter().position(|x| x == p).unwrap();
        assert!(pos("apt-get") < pos("tar"));
        assert!(pos("tar") < pos("make"));
        assert!(pos("make") < pos("service"));
        assert!(runner.ran("make", "base"));
        assert!(runner.ran("make", "install-base"));
        assert!(runner.ran("service", "restart"));

        let conf = fs::read_to_string(&config.paths.ipsec_conf).unwrap();
        assert!(conf.contains("  virtual-private=%v4:10.0.0.0/8\n"));
        assert!(conf.contains("  encapsulation=yes\n"));
        assert!(!config.paths.fragment().exists());

        // the build tree is removed afterwards
        assert!(!config.paths.src_dir.join("libreswan-5.2").exists());
        assert!(!config.paths.src_dir.join("libreswan-5.2.tar.gz").exists());
    }

    #[test]
    fn test_build_failure_stops_before_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = FakeBuild::new("4.12", "5.2");
        runner.fail = Some("base");
        let mut prompt = ScriptedPrompt::new(["y"]);

        let (result, _) = run(config(&dir), &runner, &Mirrors::default(), &mut prompt, debian("12"));
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Compiling Libreswan failed"));
        assert!(!runner.ran("make", "install-base"));
        assert!(!runner.ran("service", "restart"));
    }

    #[test]
    fn test_wrong_version_after_install_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // install-base "succeeds" but leaves 4.12 in place
        let runner = FakeBuild::new("4.12", "4.12");
        let mut prompt = ScriptedPrompt::new(["y"]);

        let (result, _) = run(config(&dir), &runner, &Mirrors::default(), &mut prompt, debian("12"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Libreswan 5.2 failed to build"));
        assert!(!runner.ran("service", "restart"));
    }
}
