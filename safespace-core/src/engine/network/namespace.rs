//! Linux network namespaces wired with a veth pair.
//!
//! Layout per domain:
//!
//! ```text
//!   host                         namespace ss-<id>
//!   vh-<id> 192.168.N.1/24 <---> vg-<id> 192.168.N.2/24
//!                                tap-<id> 192.168.N.3/24 (VM attached)
//! ```
//!
//! Egress leaves through a MASQUERADE rule on the host when NAT is on.
//! Impairment is `tc netem` on both veth ends.

use super::steps::{SetupStep, StepAction};
use super::{IsolationStrategy, NetworkConfig, StrategyKind};
use crate::config::NetworkTools;
use crate::executor::CommandOutput;

pub struct NamespaceStrategy {
    tools: NetworkTools,
}

impl NamespaceStrategy {
    pub fn new(tools: NetworkTools) -> Self {
        Self { tools }
    }

    fn ip(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.tools.ip.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    /// `ip netns exec <ns> <argv...>`
    fn in_ns(&self, ns: &str, argv: Vec<String>) -> Vec<String> {
        let mut full = self.ip(&["netns", "exec", ns]);
        full.extend(argv);
        full
    }

    fn nat_rule(&self, op: &str, cidr: &str) -> Vec<String> {
        [
            self.tools.iptables.as_str(),
            "-t",
            "nat",
            op,
            "POSTROUTING",
            "-s",
            cidr,
            "-j",
            "MASQUERADE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn netem(&self, dev: &str, shape: &[String]) -> Vec<String> {
        let mut argv: Vec<String> = [self.tools.tc.as_str(), "qdisc", "add", "dev", dev, "root", "netem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        argv.extend(shape.iter().cloned());
        argv
    }
}

impl IsolationStrategy for NamespaceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Namespace
    }

    fn setup_steps(&self, config: &NetworkConfig) -> Vec<SetupStep> {
        let ns = config.domain_id.as_str();
        let vh = config.host_iface.as_str();
        let vg = config.guest_iface.as_str();
        let host_addr = format!("{}/24", config.plan.host_ip);
        let guest_addr = format!("{}/24", config.plan.guest_ip);
        let gateway = config.plan.host_ip.to_string();
        let cidr = config.plan.cidr();

        let mut steps = vec![
            SetupStep::run("create-namespace", self.ip(&["netns", "add", ns]))
                .undo_with(self.ip(&["netns", "delete", ns])),
            SetupStep::run(
                "create-veth",
                self.ip(&["link", "add", vh, "type", "veth", "peer", "name", vg]),
            )
            .undo_with(self.ip(&["link", "delete", vh])),
            SetupStep::run("move-peer", self.ip(&["link", "set", vg, "netns", ns])),
            SetupStep::run("address-host", self.ip(&["addr", "add", &host_addr, "dev", vh])),
            SetupStep::run(
                "address-guest",
                self.in_ns(ns, self.ip(&["addr", "add", &guest_addr, "dev", vg])),
            ),
            SetupStep::run("link-up-host", self.ip(&["link", "set", vh, "up"])),
            SetupStep::run("link-up-guest", self.in_ns(ns, self.ip(&["link", "set", vg, "up"]))),
            SetupStep::run("loopback-up", self.in_ns(ns, self.ip(&["link", "set", "lo", "up"]))),
            SetupStep::run(
                "default-route",
                self.in_ns(ns, self.ip(&["route", "add", "default", "via", &gateway])),
            ),
        ];

        if config.nat {
            steps.push(SetupStep::run(
                "enable-forwarding",
                vec![
                    self.tools.sysctl.clone(),
                    "-w".to_string(),
                    "net.ipv4.ip_forward=1".to_string(),
                ],
            ));
            steps.push(
                SetupStep::run("install-nat", self.nat_rule("-A", &cidr))
                    .undo_with(self.nat_rule("-D", &cidr)),
            );
        }

        if let Some(shape) = config.impairment.filter(|i| !i.is_noop()) {
            let args = shape.netem_args();
            steps.push(
                SetupStep::run("impair-egress", self.netem(vh, &args)).undo_with(vec![
                    self.tools.tc.clone(),
                    "qdisc".to_string(),
                    "del".to_string(),
                    "dev".to_string(),
                    vh.to_string(),
                    "root".to_string(),
                ]),
            );
            steps.push(SetupStep::run("impair-ingress", self.in_ns(ns, self.netem(vg, &args))));
        }

        steps
    }

    fn teardown_actions(&self, config: &NetworkConfig) -> Vec<StepAction> {
        let mut actions = Vec::new();
        if config.nat {
            actions.push(StepAction::Run(self.nat_rule("-D", &config.plan.cidr())));
        }
        // Deleting the namespace destroys the peer, the tap and the host end.
        actions.push(StepAction::Run(self.ip(&["link", "delete", &config.host_iface])));
        actions.push(StepAction::Run(self.ip(&["netns", "delete", &config.domain_id])));
        actions
    }

    fn attach_steps(&self, config: &NetworkConfig, tap: &str) -> Vec<SetupStep> {
        let ns = config.domain_id.as_str();
        let tap_addr = format!("{}/24", config.plan.tap_ip);
        vec![
            SetupStep::run(
                "create-tap",
                self.in_ns(ns, self.ip(&["tuntap", "add", "dev", tap, "mode", "tap"])),
            )
            .undo_with(self.in_ns(ns, self.ip(&["link", "delete", tap]))),
            SetupStep::run("address-tap", self.in_ns(ns, self.ip(&["addr", "add", &tap_addr, "dev", tap]))),
            SetupStep::run("link-up-tap", self.in_ns(ns, self.ip(&["link", "set", tap, "up"]))),
        ]
    }

    fn wants_tap(&self) -> bool {
        true
    }

    fn exec_prefix(&self, config: &NetworkConfig) -> Vec<String> {
        self.ip(&["netns", "exec", &config.domain_id])
    }

    fn probe_command(&self, _config: &NetworkConfig) -> Vec<String> {
        self.ip(&["netns", "list"])
    }

    fn domain_present(&self, config: &NetworkConfig, output: &CommandOutput) -> bool {
        list_namespaces(&output.stdout)
            .iter()
            .any(|ns| *ns == config.domain_id)
    }

    fn list_command(&self) -> Vec<String> {
        self.ip(&["netns", "list"])
    }

    fn parse_domains(&self, output: &CommandOutput) -> Vec<String> {
        list_namespaces(&output.stdout)
    }

    fn orphan_teardown(&self, domain_id: &str) -> Vec<StepAction> {
        vec![StepAction::Run(self.ip(&["netns", "delete", domain_id]))]
    }
}

/// Namespace names from `ip netns list`, which may append ` (id: N)`.
fn list_namespaces(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
