//! IKEv2 setup and client management
//!
//! [`SetupContext`] is filled once by [`SetupContext::probe`] and then only
//! read. [`Setup`] runs one [`Mode`] against it, with every side effect going
//! through the runner, fetcher, prompt and output it was given.

use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use ikev2kit_common::bundle::{self, Bundle, ExportTarget};
use ikev2kit_common::certdb::{CertDb, CA_NAME};
use ikev2kit_common::conf::{self, ConnParams, InstalledConn};
use ikev2kit_common::net::{self, Fetch};
use ikev2kit_common::os::{self, KernelInfo, OsInfo};
use ikev2kit_common::prompt::{ask_until, ask_with_default, confirm, Prompt};
use ikev2kit_common::system::{self, Cmd};
use ikev2kit_common::version::setup_supports;
use ikev2kit_common::{
    Capabilities, ClientName, CommandRunner, Config, DnsServers, Error, ServerAddr, SwanVersion,
    Validity,
};

use crate::cli::Mode;

/// Host facts gathered during preflight
#[derive(Debug, Clone)]
pub struct SetupContext {
    pub config: Config,
    pub os: OsInfo,
    pub version: SwanVersion,
    pub caps: Capabilities,
    pub in_container: bool,
    /// Kernel can migrate SAs, so MOBIKE may be offered
    pub kernel_mobike: bool,
    pub sudo_user: Option<String>,
}

impl SetupContext {
    /// Run the read-only preflight checks and describe the host
    pub fn probe(config: Config, runner: &dyn CommandRunner) -> Result<Self> {
        system::require_root(runner)?;
        os::check_not_openvz()?;
        let os = OsInfo::detect()?;
        log::debug!("Detected {} {}", os.family, os.version_id);

        let ipsec = config.paths.ipsec_bin.to_string_lossy().into_owned();
        let version = SwanVersion::installed(runner, &ipsec)?.ok_or_else(|| {
            Error::precondition(
                "This script requires Libreswan already installed. See: https://github.com/hwdsl2/setup-ipsec-vpn",
            )
        })?;
        if !setup_supports(version) {
            bail!(Error::precondition(format!(
                "Libreswan version '{}' is not supported. This script requires one of these versions: \
                 3.19-3.23, 3.25-3.27, 3.29, 3.31-3.32, 4.x or 5.x",
                version
            )));
        }
        check_base_config(&config.paths.ipsec_conf)?;
        system::require_tools(&["certutil", "crlutil", "pk12util"])?;

        let in_container = os::in_container();
        let kernel_mobike = KernelInfo::probe(runner)?.supports_mobike(&os, in_container);

        Ok(Self {
            caps: Capabilities::for_version(version),
            config,
            os,
            version,
            in_container,
            kernel_mobike,
            sudo_user: std::env::var("SUDO_USER").ok(),
        })
    }

    pub fn ipsec_conf(&self) -> &Path {
        &self.config.paths.ipsec_conf
    }

    pub fn fragment(&self) -> PathBuf {
        self.config.paths.fragment()
    }

    pub fn is_installed(&self) -> bool {
        conf::is_installed(self.ipsec_conf(), &self.fragment())
    }
}

/// The IPsec VPN itself must be configured before IKEv2 is added on top
fn check_base_config(ipsec_conf: &Path) -> Result<(), Error> {
    let content = fs::read_to_string(ipsec_conf).unwrap_or_default();
    if !content.lines().any(|line| line.trim() == "config setup") {
        return Err(Error::precondition(format!(
            "{} is missing or has no 'config setup' section. Set up the IPsec VPN first.",
            ipsec_conf.display()
        )));
    }
    Ok(())
}

/// Answers for a full setup, collected before anything is changed
#[derive(Debug, Clone)]
pub struct SetupPlan {
    pub server: ServerAddr,
    pub client: ClientName,
    pub validity: Validity,
    pub dns: DnsServers,
    pub mobike: bool,
}

pub struct Setup<'a> {
    pub ctx: SetupContext,
    pub runner: &'a dyn CommandRunner,
    pub fetch: &'a dyn Fetch,
    pub prompt: &'a mut dyn Prompt,
    pub out: &'a mut dyn Write,
    /// Random pause before certificate generation
    pub jitter: bool,
}

impl<'a> Setup<'a> {
    fn certdb(&self) -> CertDb<'a> {
        let db = CertDb::new(self.runner, &self.ctx.config.paths.ipsec_dir);
        if self.jitter {
            db
        } else {
            db.without_jitter()
        }
    }

    pub fn run(&mut self, mode: Mode) -> Result<()> {
        let installed = self.ctx.is_installed();
        if mode.needs_existing_setup() && !installed {
            bail!(Error::precondition(
                "You must first set up IKEv2 before managing VPN clients. Run 'ikev2-setup' first."
            ));
        }

        match mode {
            Mode::Auto if installed => bail!(Error::precondition(
                "IKEv2 is already set up on this server. To manage VPN clients, re-run without '--auto'."
            )),
            Mode::Auto => {
                let plan = self.auto_plan()?;
                self.full_setup(&plan)
            }
            Mode::Interactive if installed => self.menu(),
            Mode::Interactive => {
                let plan = self.interactive_plan()?;
                self.full_setup(&plan)
            }
            Mode::AddClient(name) => {
                let client = self.check_new_client(&name)?;
                let validity = Validity::months(self.ctx.config.setup.client_validity)?;
                self.add_client(&client, validity)
            }
            Mode::ExportClient(name) => {
                let client = self.check_existing_client(&name)?;
                self.export_client(&client)
            }
            Mode::ListClients => self.list_clients(),
            Mode::RevokeClient(name) => {
                let client = self.check_existing_client(&name)?;
                self.revoke_client(&client)
            }
            Mode::Remove => self.remove(),
        }
    }

    fn installed_conn(&self) -> Result<InstalledConn> {
        let fragment = self.ctx.fragment();
        if fragment.exists() {
            return Ok(InstalledConn::read(&fragment)?);
        }
        let content = fs::read_to_string(self.ctx.ipsec_conf())
            .with_context(|| format!("Failed to read {}", self.ctx.ipsec_conf().display()))?;
        Ok(InstalledConn::from_fragment(&content)?)
    }

    /// A valid name that is not yet in the certificate database
    fn check_new_client(&self, name: &str) -> Result<ClientName> {
        let client = ClientName::parse(name)?;
        let db = self.certdb();
        if db.exists(client.as_str())? {
            bail!(Error::precondition(format!(
                "Invalid client name. Client '{}' already exists.",
                client
            )));
        }
        Ok(client)
    }

    /// A valid name of an issued client certificate, never the CA or the server
    fn check_existing_client(&self, name: &str) -> Result<ClientName> {
        let client = ClientName::parse(name)?;
        let server = self.installed_conn()?.server;
        let reserved = client.as_str() == CA_NAME || client.as_str() == server.to_string();
        if reserved || !self.certdb().exists(client.as_str())? {
            bail!(Error::precondition(format!(
                "Invalid client name, or client '{}' does not exist.",
                client
            )));
        }
        Ok(client)
    }

    fn auto_plan(&mut self) -> Result<SetupPlan> {
        let setup = self.ctx.config.setup.clone();
        let server = match (&setup.dns_name, &setup.public_ip) {
            (Some(name), _) => ServerAddr::dns(name)?,
            (None, Some(ip)) => ServerAddr::ip(ip)?,
            (None, None) => ServerAddr::Ip(self.detect_public_ip()?),
        };
        Ok(SetupPlan {
            server,
            client: ClientName::parse(&setup.client_name)?,
            validity: Validity::months(setup.client_validity)?,
            dns: DnsServers::parse(&setup.dns_servers)?,
            mobike: setup.mobike && self.ctx.kernel_mobike && self.ctx.caps.mobike,
        })
    }

    fn detect_public_ip(&mut self) -> Result<Ipv4Addr> {
        writeln!(self.out, "Trying to auto discover IP of this server...")?;
        Ok(net::detect_public_ip(
            self.runner,
            self.fetch,
            &self.ctx.config.network.public_ip_urls,
        )?)
    }

    fn interactive_plan(&mut self) -> Result<SetupPlan> {
        let defaults = self.ctx.config.setup.clone();
        writeln!(self.out, "\nWelcome! Use this script to set up IKEv2 on your VPN server.\n")?;

        let use_dns = confirm(
            self.prompt,
            "Do you want IKEv2 clients to connect to this server using a DNS name?",
            defaults.dns_name.is_some(),
        )?;
        let server = if use_dns {
            ask_until(
                self.prompt,
                "Enter the DNS name of this VPN server",
                defaults.dns_name.as_deref().unwrap_or(""),
                |s| ServerAddr::dns(s).map_err(|e| e.to_string()),
            )?
        } else {
            let detected = match &defaults.public_ip {
                Some(ip) => ip.clone(),
                None => self
                    .detect_public_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default(),
            };
            ask_until(
                self.prompt,
                "Enter the IPv4 address of this VPN server",
                &detected,
                |s| ServerAddr::ip(s).map_err(|e| e.to_string()),
            )?
        };

        let client = ask_until(
            self.prompt,
            "Provide a name for the IKEv2 VPN client",
            &defaults.client_name,
            |s| ClientName::parse(s).map_err(|e| e.to_string()),
        )?;
        let validity = ask_until(
            self.prompt,
            "Specify the validity period (in months) for this client certificate",
            &defaults.client_validity.to_string(),
            |s| Validity::parse(s).map_err(|e| e.to_string()),
        )?;

        let default_dns = DnsServers::parse(&defaults.dns_servers)?;
        let dns = if confirm(
            self.prompt,
            &format!("Clients will use {} as DNS servers. Use other DNS servers?", default_dns),
            false,
        )? {
            self.ask_dns_servers()?
        } else {
            default_dns
        };

        let mobike = if self.ctx.caps.mobike && self.ctx.kernel_mobike {
            confirm(
                self.prompt,
                "Enable MOBIKE (lets clients change network without reconnecting)?",
                defaults.mobike,
            )?
        } else {
            false
        };

        let plan = SetupPlan {
            server,
            client,
            validity,
            dns,
            mobike,
        };
        self.show_plan(&plan)?;
        if !confirm(self.prompt, "Do you want to continue?", true)? {
            return Err(Error::Aborted.into());
        }
        Ok(plan)
    }

    fn ask_dns_servers(&mut self) -> Result<DnsServers> {
        let primary: Ipv4Addr = ask_until(self.prompt, "Enter primary DNS server", "", |s| {
            s.parse::<Ipv4Addr>()
                .map_err(|_| format!("Invalid DNS server '{}'.", s))
        })?;
        let secondary: Option<Ipv4Addr> = ask_until(
            self.prompt,
            "Enter secondary DNS server (Enter to skip)",
            "",
            |s| {
                if s.is_empty() {
                    Ok(None)
                } else {
                    s.parse::<Ipv4Addr>()
                        .map(Some)
                        .map_err(|_| format!("Invalid DNS server '{}'.", s))
                }
            },
        )?;
        Ok(DnsServers { primary, secondary })
    }

    fn show_plan(&mut self, plan: &SetupPlan) -> Result<()> {
        let out = &mut *self.out;
        writeln!(out, "\nWe are ready to set up IKEv2 now. Below are the setup options you selected.\n")?;
        writeln!(out, "======================================\n")?;
        writeln!(out, "VPN server address: {}", plan.server)?;
        writeln!(out, "VPN client name: {}", plan.client)?;
        writeln!(out, "Client cert valid for: {} months", plan.validity.get())?;
        writeln!(out, "MOBIKE support: {}", if plan.mobike { "Enable" } else { "Disable" })?;
        writeln!(out, "DNS server(s): {}", plan.dns)?;
        writeln!(out, "\n======================================\n")?;
        Ok(())
    }

    fn export_target(&self) -> Result<ExportTarget> {
        if let Some(dir) = &self.ctx.config.setup.export_dir {
            return Ok(ExportTarget::fixed(dir.clone()));
        }
        Ok(ExportTarget::select(
            self.runner,
            self.ctx.in_container,
            &self.ctx.config.paths.ipsec_dir,
            self.ctx.sudo_user.as_deref(),
        )?)
    }

    fn password(&self) -> String {
        self.ctx
            .config
            .setup
            .client_password
            .clone()
            .unwrap_or_else(bundle::generate_password)
    }

    pub fn full_setup(&mut self, plan: &SetupPlan) -> Result<()> {
        let db = self.certdb();
        // all labels must be free before the first certificate is generated
        db.ensure_absent(CA_NAME)?;
        db.ensure_absent(&plan.server.to_string())?;
        db.ensure_absent(plan.client.as_str())?;

        db.create_ca()?;
        db.create_server_cert(&plan.server)?;
        db.create_client_cert(&plan.client, plan.validity)?;

        let password = self.password();
        let target = self.export_target()?;
        let bundle =
            bundle::export_bundle(&db, &target, &plan.client, &plan.server, &password, plan.mobike)?;

        log::info!("Adding a new IKEv2 connection...");
        let ipsec_conf = fs::read_to_string(self.ctx.ipsec_conf()).unwrap_or_default();
        let pool = conf::address_pool(&ipsec_conf);
        let fragment = conf::render_fragment(&ConnParams {
            server: &plan.server,
            dns: &plan.dns,
            pool: &pool,
            mobike: plan.mobike,
            caps: self.ctx.caps,
        });
        conf::install(self.ctx.ipsec_conf(), &self.ctx.fragment(), &fragment)?;

        system::restart_ipsec(self.runner, &self.ctx.os)?;
        self.print_summary(
            "IKEv2 setup successful. Details for IKEv2 mode:",
            &plan.server,
            &plan.client,
            &bundle,
            &password,
        )?;
        self.update_notice()?;
        Ok(())
    }

    pub fn add_client(&mut self, client: &ClientName, validity: Validity) -> Result<()> {
        let installed = self.installed_conn()?;
        let db = self.certdb();
        db.create_client_cert(client, validity)?;
        let password = self.password();
        let target = self.export_target()?;
        let bundle =
            bundle::export_bundle(&db, &target, client, &installed.server, &password, installed.mobike)?;
        self.print_summary(
            &format!("New IKEv2 client \"{}\" added!", client),
            &installed.server,
            client,
            &bundle,
            &password,
        )
    }

    pub fn export_client(&mut self, client: &ClientName) -> Result<()> {
        let installed = self.installed_conn()?;
        let db = self.certdb();
        let password = self.password();
        let target = self.export_target()?;
        let bundle =
            bundle::export_bundle(&db, &target, client, &installed.server, &password, installed.mobike)?;
        self.print_summary(
            &format!("IKEv2 client \"{}\" exported!", client),
            &installed.server,
            client,
            &bundle,
            &password,
        )
    }

    pub fn list_clients(&mut self) -> Result<()> {
        let clients = self.certdb().client_labels()?;
        writeln!(self.out, "\nChecking for existing IKEv2 client(s)...\n")?;
        for name in &clients {
            writeln!(self.out, "{}", name)?;
        }
        let noun = if clients.len() == 1 { "client" } else { "clients" };
        writeln!(self.out, "\nTotal: {} {}", clients.len(), noun)?;
        Ok(())
    }

    pub fn revoke_client(&mut self, client: &ClientName) -> Result<()> {
        writeln!(
            self.out,
            "\nWARNING: You have selected to revoke IKEv2 client \"{}\".\n         \
             After revocation, this certificate *cannot* be used by VPN client(s) to connect.",
            client
        )?;
        if !confirm(self.prompt, "Are you sure you want to revoke this client?", false)? {
            return Err(Error::Aborted.into());
        }
        self.certdb().revoke_client(client, chrono::Utc::now())?;
        let ipsec = self.ctx.config.paths.ipsec_bin.to_string_lossy().into_owned();
        self.runner
            .run_checked(&Cmd::new(ipsec).arg("crls"), "Reloading revocation list")?;
        writeln!(self.out, "\nCertificate \"{}\" revoked!", client)?;
        Ok(())
    }

    /// Remove the connection and every certificate. A host where an earlier
    /// removal stopped after the connection was deleted still has the CA,
    /// and the certificate cleanup is picked up from there.
    pub fn remove(&mut self) -> Result<()> {
        let installed = self.ctx.is_installed();
        if !installed && !self.certdb().exists(CA_NAME)? {
            writeln!(self.out, "IKEv2 is not set up on this server. Nothing to remove.")?;
            return Ok(());
        }
        if !installed {
            writeln!(self.out, "\nFound IKEv2 certificates left over from an earlier removal.")?;
        }
        writeln!(
            self.out,
            "\nWARNING: This option will remove IKEv2 from this VPN server, but keep the IPsec/L2TP\n         \
             and IPsec/XAuth (\"Cisco IPsec\") modes, if installed. All IKEv2 configuration\n         \
             including certificates and keys will be permanently deleted."
        )?;
        if !confirm(self.prompt, "Are you sure you want to remove IKEv2?", false)? {
            return Err(Error::Aborted.into());
        }

        if installed {
            log::info!("Deleting IKEv2 configuration...");
            conf::uninstall(self.ctx.ipsec_conf(), &self.ctx.fragment())?;
        }
        system::restart_ipsec(self.runner, &self.ctx.os)?;
        self.certdb().delete_all()?;
        writeln!(self.out, "\nIKEv2 removed!")?;
        Ok(())
    }

    fn menu(&mut self) -> Result<()> {
        writeln!(self.out, "\nIKEv2 is already set up on this server.\n")?;
        writeln!(self.out, "Select an option:")?;
        for line in [
            "  1) Add a new client",
            "  2) Export config for an existing client",
            "  3) List existing clients",
            "  4) Revoke an existing client",
            "  5) Remove IKEv2",
            "  6) Exit",
        ] {
            writeln!(self.out, "{}", line)?;
        }
        let choice = ask_until(self.prompt, "Option", "", |s| match s.parse::<u8>() {
            Ok(n @ 1..=6) => Ok(n),
            _ => Err("Invalid option. Enter a number from 1 to 6.".to_string()),
        })?;

        match choice {
            1 => {
                let client = self.ask_client_name("Provide a name for the new client", |s, name| {
                    s.check_new_client(name)
                })?;
                let default = self.ctx.config.setup.client_validity.to_string();
                let validity = ask_until(
                    self.prompt,
                    "Specify the validity period (in months) for this client certificate",
                    &default,
                    |s| Validity::parse(s).map_err(|e| e.to_string()),
                )?;
                self.add_client(&client, validity)
            }
            2 => {
                self.list_clients()?;
                let client = self.ask_client_name("Enter the name of the client to export", |s, name| {
                    s.check_existing_client(name)
                })?;
                self.export_client(&client)
            }
            3 => self.list_clients(),
            4 => {
                self.list_clients()?;
                let client = self.ask_client_name("Enter the name of the client to revoke", |s, name| {
                    s.check_existing_client(name)
                })?;
                self.revoke_client(&client)
            }
            5 => self.remove(),
            _ => Ok(()),
        }
    }

    /// Ask until `check` accepts the name; the checks query the database,
    /// so they cannot live inside the prompt closure
    fn ask_client_name<F>(&mut self, question: &str, check: F) -> Result<ClientName>
    where
        F: Fn(&Self, &str) -> Result<ClientName>,
    {
        loop {
            let name = ask_with_default(self.prompt, question, "")?;
            match check(self, &name) {
                Ok(client) => return Ok(client),
                Err(e) => match e.downcast_ref::<Error>() {
                    Some(Error::Precondition(msg)) => writeln!(self.out, "{}", msg)?,
                    _ => return Err(e),
                },
            }
        }
    }

    fn print_summary(
        &mut self,
        headline: &str,
        server: &ServerAddr,
        client: &ClientName,
        bundle: &Bundle,
        password: &str,
    ) -> Result<()> {
        let out = &mut *self.out;
        writeln!(out, "\n================================================\n")?;
        writeln!(out, "{}\n", headline)?;
        writeln!(out, "VPN server address: {}", server)?;
        writeln!(out, "VPN client name: {}\n", client)?;
        writeln!(out, "Client configuration is available at:")?;
        for path in bundle.paths() {
            writeln!(out, "  {}", path.display())?;
        }
        writeln!(out, "\n*IMPORTANT* Password for client config files:\n{}", password)?;
        writeln!(out, "Write this down, you'll need it for import!\n")?;
        writeln!(out, "Next steps: Configure IKEv2 clients. See: https://vpnsetup.net/clients")?;
        writeln!(out, "\n================================================")?;
        Ok(())
    }

    /// Mention a newer Libreswan if the update server knows one. Silent on failure.
    fn update_notice(&mut self) -> Result<()> {
        let Ok(arch) = system::machine_arch(self.runner) else {
            return Ok(());
        };
        let url = net::ikev2_update_url(
            &self.ctx.config.network.update_base_url,
            &self.ctx.os,
            &arch,
            self.ctx.version,
        );
        if let Some(latest) = net::newer_version(self.fetch, &url, self.ctx.version) {
            writeln!(
                self.out,
                "\nNote: A newer version of Libreswan ({}) is available. To update, run 'swan-upgrade'.",
                latest
            )?;
        }
        Ok(())
    }
}
