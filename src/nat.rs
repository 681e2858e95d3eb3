//! Idempotent NAT rules for internet sharing.
//!
//! A hotspot shares the host's uplink through three iptables rules:
//!
//! - `-t nat POSTROUTING -s <subnet> ! -d <subnet> -j MASQUERADE`
//! - `FORWARD -i <hotspot> -o <internet> -j ACCEPT`
//! - `FORWARD -i <internet> -o <hotspot> -m state --state RELATED,ESTABLISHED -j ACCEPT`
//!
//! Every rule is checked with `-C` before it is appended, so repeated starts
//! never stack duplicates. Cleanup drains each shape with `-D` until iptables
//! reports there is nothing left to delete.
//!
//! ## Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use netpilot::diagnostics::DiagnosticQueue;
//! use netpilot::exec::SystemRunner;
//! use netpilot::nat::{NatReconciler, Subnet};
//!
//! let nat = NatReconciler::new(Arc::new(SystemRunner::new()), Arc::new(DiagnosticQueue::default()));
//! let subnet = Subnet::from_gateway(Ipv4Addr::new(10, 42, 0, 1));
//! nat.setup("wlan0", "eth0", &subnet)?;
//! nat.cleanup("wlan0", &subnet)?;
//! # Ok::<(), netpilot::NetError>(())
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::diagnostics::DiagnosticQueue;
use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner};
use crate::sanitize::validate_interface_name;

/// Ceiling on deletions per rule shape during cleanup.
pub const MAX_DELETE_ATTEMPTS: usize = 10;

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    /// The /24 containing `gateway`.
    pub fn from_gateway(gateway: Ipv4Addr) -> Self {
        let [a, b, c, _] = gateway.octets();
        Self {
            network: Ipv4Addr::new(a, b, c, 0),
            prefix: 24,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Table types in netfilter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// Chain names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Forward,
    Postrouting,
}

impl Chain {
    fn as_str(&self) -> &'static str {
        match self {
            Chain::Forward => "FORWARD",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

/// Target actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Masquerade,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Masquerade => "MASQUERADE",
        }
    }
}

/// Iptables rule builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    table: Table,
    chain: Chain,
    in_interface: Option<String>,
    out_interface: Option<String>,
    source: Option<Subnet>,
    not_destination: Option<Subnet>,
    state: Option<String>,
    target: Target,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            in_interface: None,
            out_interface: None,
            source: None,
            not_destination: None,
            state: None,
            target,
        }
    }

    pub fn in_interface(mut self, iface: &str) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some(iface.to_string());
        self
    }

    pub fn source(mut self, subnet: Subnet) -> Self {
        self.source = Some(subnet);
        self
    }

    /// Matches destinations outside `subnet` (`! -d`).
    pub fn not_destination(mut self, subnet: Subnet) -> Self {
        self.not_destination = Some(subnet);
        self
    }

    pub fn connection_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    /// iptables arguments for `action` (`-A`, `-C` or `-D`).
    pub fn to_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.as_str().to_string(),
        ];

        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }

        if let Some(iface) = &self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }

        if let Some(src) = &self.source {
            args.push("-s".to_string());
            args.push(src.to_string());
        }

        if let Some(dst) = &self.not_destination {
            args.push("!".to_string());
            args.push("-d".to_string());
            args.push(dst.to_string());
        }

        if let Some(state) = &self.state {
            args.push("-m".to_string());
            args.push("state".to_string());
            args.push("--state".to_string());
            args.push(state.clone());
        }

        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());

        args
    }
}

/// Masquerade traffic leaving `subnet` for anywhere else.
pub fn masquerade_rule(subnet: Subnet) -> Rule {
    Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade)
        .source(subnet)
        .not_destination(subnet)
}

/// Forward hotspot clients to the uplink.
pub fn outbound_rule(hotspot_iface: &str, internet_iface: &str) -> Rule {
    Rule::new(Table::Filter, Chain::Forward, Target::Accept)
        .in_interface(hotspot_iface)
        .out_interface(internet_iface)
}

/// Forward replies from the uplink back to hotspot clients.
pub fn inbound_rule(hotspot_iface: &str, internet_iface: &str) -> Rule {
    Rule::new(Table::Filter, Chain::Forward, Target::Accept)
        .in_interface(internet_iface)
        .out_interface(hotspot_iface)
        .connection_state("RELATED,ESTABLISHED")
}

/// What [`NatReconciler::setup`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatReport {
    /// Rules were reconciled; `added` were appended, `present` already existed.
    Applied { added: usize, present: usize },
    /// Not privileged; the hotspot runs without internet sharing.
    Skipped,
}

pub struct NatReconciler {
    runner: Arc<dyn CommandRunner>,
    queue: Arc<DiagnosticQueue>,
    privileged: bool,
}

impl NatReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>, queue: Arc<DiagnosticQueue>) -> Self {
        Self {
            runner,
            queue,
            privileged: is_root(),
        }
    }

    /// Overrides the effective-uid check.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    fn iptables(&self, args: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("Executing: iptables {}", args.join(" "));
        self.runner.run("iptables", &args)
    }

    /// Appends `rule` unless an identical one exists. Returns whether it was added.
    fn ensure(&self, rule: &Rule) -> Result<bool> {
        if self.iptables(&rule.to_args("-C"))?.success() {
            return Ok(false);
        }
        self.iptables(&rule.to_args("-A"))?.into_result("iptables")?;
        Ok(true)
    }

    /// Establishes the sharing rules for `subnet` behind `hotspot_iface`.
    ///
    /// Without root privileges this does nothing and reports [`NatReport::Skipped`].
    /// The masquerade and outbound rules are required; the inbound rule is
    /// best-effort. Rules applied before a failure are left in place.
    pub fn setup(&self, hotspot_iface: &str, internet_iface: &str, subnet: &Subnet) -> Result<NatReport> {
        if !self.privileged {
            info!("not running as root, skipping NAT setup for {}", hotspot_iface);
            return Ok(NatReport::Skipped);
        }
        validate_interface_name(hotspot_iface)?;
        validate_interface_name(internet_iface)?;

        let shapes = [
            (masquerade_rule(*subnet), true),
            (outbound_rule(hotspot_iface, internet_iface), true),
            (inbound_rule(hotspot_iface, internet_iface), false),
        ];

        let (mut added, mut present) = (0, 0);
        for (rule, required) in &shapes {
            match self.ensure(rule) {
                Ok(true) => added += 1,
                Ok(false) => present += 1,
                Err(e) if *required => {
                    self.queue
                        .push_error(&format!("Failed to add NAT rule for {}: {}", hotspot_iface, e));
                    return Err(e);
                }
                Err(e) => {
                    self.queue.push_warning(&format!(
                        "Failed to add return-traffic rule for {}: {}",
                        hotspot_iface, e
                    ));
                }
            }
        }

        info!(
            hotspot = hotspot_iface,
            internet = internet_iface,
            %subnet,
            added,
            present,
            "NAT rules reconciled"
        );
        Ok(NatReport::Applied { added, present })
    }

    /// Removes every sharing rule for `subnet` and `hotspot_iface`.
    ///
    /// Forward rules are discovered from `iptables -S FORWARD` because the
    /// uplink they were created with is not known here. Returns the number of
    /// rules deleted.
    pub fn cleanup(&self, hotspot_iface: &str, subnet: &Subnet) -> Result<usize> {
        if !self.privileged {
            debug!("not running as root, skipping NAT cleanup for {}", hotspot_iface);
            return Ok(0);
        }
        validate_interface_name(hotspot_iface)?;

        let mut shapes = vec![masquerade_rule(*subnet).to_args("-D")];
        for shape in self.forward_shapes(hotspot_iface)? {
            if !shapes.contains(&shape) {
                shapes.push(shape);
            }
        }

        let mut deleted = 0;
        for shape in &shapes {
            for _ in 0..MAX_DELETE_ATTEMPTS {
                if !self.iptables(shape)?.success() {
                    break;
                }
                deleted += 1;
            }
        }

        info!(hotspot = hotspot_iface, %subnet, deleted, "NAT rules removed");
        Ok(deleted)
    }

    /// `-D` argument lists for ACCEPT rules in FORWARD that mention `iface`.
    fn forward_shapes(&self, iface: &str) -> Result<Vec<Vec<String>>> {
        let output = self.iptables(&["-t".into(), "filter".into(), "-S".into(), "FORWARD".into()])?;
        if !output.success() {
            self.queue.push_warning(&format!(
                "Could not list forward rules: {}",
                output.diagnostic()
            ));
            return Ok(Vec::new());
        }
        Ok(parse_forward_rules(&output.stdout, iface))
    }
}

fn parse_forward_rules(listing: &str, iface: &str) -> Vec<Vec<String>> {
    listing
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.first() != Some(&"-A") || tokens.get(1) != Some(&"FORWARD") {
                return None;
            }
            let mentions_iface = tokens
                .windows(2)
                .any(|w| (w[0] == "-i" || w[0] == "-o") && w[1] == iface);
            let accepts = tokens.windows(2).any(|w| w == ["-j", "ACCEPT"]);
            if !(mentions_iface && accepts) {
                return None;
            }
            let mut args = vec!["-t".to_string(), "filter".to_string(), "-D".to_string()];
            args.extend(tokens[1..].iter().map(|t| t.to_string()));
            Some(args)
        })
        .collect()
}

/// Whether the effective user is root.
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::{FakeRunner, fail, ok};
    use std::sync::Mutex;

    const NO_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

    /// Simulates iptables -C/-A/-D/-S against an in-memory rule list.
    fn fake_iptables() -> (Arc<FakeRunner>, Arc<Mutex<Vec<String>>>) {
        let fake = Arc::new(FakeRunner::new());
        let table = Arc::new(Mutex::new(Vec::<String>::new()));
        let rules = Arc::clone(&table);
        fake.on_fn("iptables", move |args| {
            let mut rules = rules.lock().unwrap();
            let (tbl, action, chain) = (&args[1], args[2].as_str(), &args[3]);
            let key = format!("{} {} {}", tbl, chain, args[4..].join(" "));
            match action {
                "-S" => {
                    let prefix = format!("{} {} ", tbl, chain);
                    let listing: String = rules
                        .iter()
                        .filter_map(|r| r.strip_prefix(&prefix))
                        .map(|rest| format!("-A {} {}\n", chain, rest))
                        .collect();
                    ok(&format!("-P {} ACCEPT\n{}", chain, listing))
                }
                "-C" if rules.contains(&key) => ok(""),
                "-C" => fail(1, NO_RULE),
                "-A" => {
                    rules.push(key);
                    ok("")
                }
                "-D" => match rules.iter().position(|r| *r == key) {
                    Some(pos) => {
                        rules.remove(pos);
                        ok("")
                    }
                    None => fail(1, NO_RULE),
                },
                _ => fail(2, "unsupported"),
            }
        });
        (fake, table)
    }

    fn subnet() -> Subnet {
        Subnet::from_gateway(Ipv4Addr::new(10, 42, 0, 1))
    }

    fn reconciler(fake: &Arc<FakeRunner>, queue: &Arc<DiagnosticQueue>) -> NatReconciler {
        NatReconciler::new(fake.clone(), Arc::clone(queue)).with_privileged(true)
    }

    #[test]
    fn test_rule_builder() {
        assert_eq!(
            masquerade_rule(subnet()).to_args("-A").join(" "),
            "-t nat -A POSTROUTING -s 10.42.0.0/24 ! -d 10.42.0.0/24 -j MASQUERADE"
        );
        assert_eq!(
            inbound_rule("wlan0", "eth0").to_args("-C").join(" "),
            "-t filter -C FORWARD -i eth0 -o wlan0 -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
    }

    #[test]
    fn test_setup_is_idempotent() {
        let (fake, table) = fake_iptables();
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);

        let first = nat.setup("wlan0", "eth0", &subnet()).unwrap();
        assert_eq!(first, NatReport::Applied { added: 3, present: 0 });
        let appends = fake.count("iptables -t nat -A") + fake.count("iptables -t filter -A");

        let second = nat.setup("wlan0", "eth0", &subnet()).unwrap();
        assert_eq!(second, NatReport::Applied { added: 0, present: 3 });
        assert_eq!(
            fake.count("iptables -t nat -A") + fake.count("iptables -t filter -A"),
            appends
        );
        assert_eq!(table.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_setup_without_privilege_is_a_noop() {
        let fake = Arc::new(FakeRunner::new());
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = NatReconciler::new(fake.clone(), queue).with_privileged(false);
        assert_eq!(nat.setup("wlan0", "eth0", &subnet()).unwrap(), NatReport::Skipped);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_setup_rejects_bad_interface() {
        let (fake, _) = fake_iptables();
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);
        assert!(nat.setup("wlan0", "eth0;reboot", &subnet()).is_err());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_required_rule_failure_propagates() {
        let fake = Arc::new(FakeRunner::new());
        fake.on("iptables -t nat -C", fail(1, NO_RULE))
            .on("iptables -t nat -A", fail(4, "iptables v1.8.9: can't initialize iptables table `nat'"));
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);
        assert!(nat.setup("wlan0", "eth0", &subnet()).is_err());
        assert!(queue.has_pending());
    }

    #[test]
    fn test_inbound_rule_is_best_effort() {
        let fake = Arc::new(FakeRunner::new());
        fake.on("iptables -t nat -C", fail(1, NO_RULE))
            .on("iptables -t filter -C", fail(1, NO_RULE))
            .on(
                "iptables -t filter -A FORWARD -i eth0",
                fail(2, "iptables: No chain/target/match by that name."),
            );
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);
        let report = nat.setup("wlan0", "eth0", &subnet()).unwrap();
        assert_eq!(report, NatReport::Applied { added: 2, present: 0 });
        assert_eq!(queue.pop().unwrap().severity, crate::diagnostics::Severity::Warning);
    }

    #[test]
    fn test_cleanup_drains_duplicates() {
        let (fake, table) = fake_iptables();
        {
            let mut rules = table.lock().unwrap();
            for _ in 0..3 {
                rules.push("nat POSTROUTING -s 10.42.0.0/24 ! -d 10.42.0.0/24 -j MASQUERADE".into());
                rules.push("filter FORWARD -i wlan0 -o eth0 -j ACCEPT".into());
            }
            rules.push(
                "filter FORWARD -i eth0 -o wlan0 -m state --state RELATED,ESTABLISHED -j ACCEPT".into(),
            );
            rules.push("filter FORWARD -i eth1 -o eth0 -j ACCEPT".into());
        }
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);

        assert_eq!(nat.cleanup("wlan0", &subnet()).unwrap(), 7);
        assert_eq!(
            *table.lock().unwrap(),
            vec!["filter FORWARD -i eth1 -o eth0 -j ACCEPT".to_string()]
        );
    }

    #[test]
    fn test_cleanup_attempts_are_bounded() {
        let fake = Arc::new(FakeRunner::new());
        // A delete that always "succeeds" must not loop forever
        fake.on("iptables -t nat -D", ok(""));
        let queue = Arc::new(DiagnosticQueue::active(8));
        let nat = reconciler(&fake, &queue);
        assert_eq!(nat.cleanup("wlan0", &subnet()).unwrap(), MAX_DELETE_ATTEMPTS);
    }
}
