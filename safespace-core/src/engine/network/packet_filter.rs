//! macOS isolation with a loopback alias and a pf anchor.
//!
//! Each domain owns an address on `lo0` and an anchor
//! `safespace/ss-<id>` whose rules confine traffic from that address.
//! Impairment goes through a dummynet pipe numbered `1000 + subnet index`.

use std::path::PathBuf;

use super::steps::{SetupStep, StepAction};
use super::{IsolationStrategy, NetworkConfig, StrategyKind};
use crate::config::NetworkTools;
use crate::executor::CommandOutput;

/// Parent anchor for all domains.
pub const ANCHOR_ROOT: &str = "safespace";

pub struct PacketFilterStrategy {
    tools: NetworkTools,
    rules_dir: PathBuf,
}

impl PacketFilterStrategy {
    pub fn new(tools: NetworkTools, rules_dir: PathBuf) -> Self {
        Self { tools, rules_dir }
    }

    fn anchor(domain_id: &str) -> String {
        format!("{ANCHOR_ROOT}/{domain_id}")
    }

    fn rules_path(&self, domain_id: &str) -> PathBuf {
        self.rules_dir.join(format!("{domain_id}.conf"))
    }

    fn pipe(config: &NetworkConfig) -> String {
        (1000 + u32::from(config.plan.index)).to_string()
    }

    fn cmd(&self, tool: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![tool.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn rules(config: &NetworkConfig) -> String {
        let ip = config.plan.tap_ip;
        let cidr = config.plan.cidr();
        let mut rules = format!("# safespace domain {}\n", config.domain_id);
        if config.impairment.is_some_and(|i| !i.is_noop()) {
            rules.push_str(&format!(
                "dummynet out quick from {ip} to any pipe {}\n",
                Self::pipe(config)
            ));
        }
        rules.push_str(&format!("pass quick from {ip} to {cidr}\n"));
        rules.push_str(&format!("pass quick from {cidr} to {ip}\n"));
        if !config.nat {
            rules.push_str(&format!("block drop out quick from {ip} to any\n"));
        }
        rules
    }
}

impl IsolationStrategy for PacketFilterStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PacketFilter
    }

    fn setup_steps(&self, config: &NetworkConfig) -> Vec<SetupStep> {
        let ip = config.plan.tap_ip.to_string();
        let anchor = Self::anchor(&config.domain_id);
        let rules_path = self.rules_path(&config.domain_id);
        let rules_arg = rules_path.display().to_string();
        let ifconfig = self.tools.ifconfig.as_str();
        let pfctl = self.tools.pfctl.as_str();

        let mut steps = vec![SetupStep::run(
            "loopback-alias",
            self.cmd(ifconfig, &["lo0", "alias", &ip, "netmask", "255.255.255.0"]),
        )
        .undo_with(self.cmd(ifconfig, &["lo0", "-alias", &ip]))];

        if let Some(shape) = config.impairment.filter(|i| !i.is_noop()) {
            let pipe = Self::pipe(config);
            let mut argv = self.cmd(&self.tools.dnctl, &["pipe", &pipe, "config"]);
            argv.extend(shape.dummynet_args());
            steps.push(
                SetupStep::run("configure-pipe", argv)
                    .undo_with(self.cmd(&self.tools.dnctl, &["pipe", &pipe, "delete"])),
            );
        }

        steps.push(SetupStep::write_file("write-rules", rules_path, Self::rules(config)));
        steps.push(
            SetupStep::run("load-anchor", self.cmd(pfctl, &["-a", &anchor, "-f", &rules_arg]))
                .undo_with(self.cmd(pfctl, &["-a", &anchor, "-F", "all"])),
        );
        // pf may already be enabled; `-E` then only bumps its reference count.
        steps.push(SetupStep::run("enable-pf", self.cmd(pfctl, &["-E"])).tolerant());
        steps
    }

    fn teardown_actions(&self, config: &NetworkConfig) -> Vec<StepAction> {
        let anchor = Self::anchor(&config.domain_id);
        let ip = config.plan.tap_ip.to_string();
        let mut actions = vec![StepAction::Run(
            self.cmd(&self.tools.pfctl, &["-a", &anchor, "-F", "all"]),
        )];
        if config.impairment.is_some_and(|i| !i.is_noop()) {
            let pipe = Self::pipe(config);
            actions.push(StepAction::Run(self.cmd(&self.tools.dnctl, &["pipe", &pipe, "delete"])));
        }
        actions.push(StepAction::Run(self.cmd(&self.tools.ifconfig, &["lo0", "-alias", &ip])));
        actions.push(StepAction::RemoveFile(self.rules_path(&config.domain_id)));
        actions
    }

    fn attach_steps(&self, _config: &NetworkConfig, _tap: &str) -> Vec<SetupStep> {
        Vec::new()
    }

    fn wants_tap(&self) -> bool {
        false
    }

    fn exec_prefix(&self, config: &NetworkConfig) -> Vec<String> {
        vec![
            "env".to_string(),
            format!("SAFESPACE_BIND_IP={}", config.plan.tap_ip),
            format!("SAFESPACE_NETWORK={}", config.plan.cidr()),
        ]
    }

    fn probe_command(&self, config: &NetworkConfig) -> Vec<String> {
        let anchor = Self::anchor(&config.domain_id);
        self.cmd(&self.tools.pfctl, &["-a", &anchor, "-s", "rules"])
    }

    fn domain_present(&self, _config: &NetworkConfig, output: &CommandOutput) -> bool {
        output.success() && !output.stdout.trim().is_empty()
    }

    fn list_command(&self) -> Vec<String> {
        self.cmd(&self.tools.pfctl, &["-a", ANCHOR_ROOT, "-s", "Anchors"])
    }

    fn parse_domains(&self, output: &CommandOutput) -> Vec<String> {
        let prefix = format!("{ANCHOR_ROOT}/");
        output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect()
    }

    fn orphan_teardown(&self, domain_id: &str) -> Vec<StepAction> {
        let anchor = Self::anchor(domain_id);
        vec![
            StepAction::Run(self.cmd(&self.tools.pfctl, &["-a", &anchor, "-F", "all"])),
            StepAction::RemoveFile(self.rules_path(domain_id)),
        ]
    }
}
