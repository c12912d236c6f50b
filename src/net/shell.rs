// Production driver: shells out to ip/iptables/sysctl. Each primitive logs
// one line and folds "already exists" / "already gone" tool outcomes into
// success so re-running a plan over partial state converges.

use std::net::Ipv4Addr;

use crate::alloc::Cidr;
use crate::error::{Result, VpcError};
use crate::net::command::{CommandExecutor, CommandResult};
use crate::net::driver::{FilterRule, NetworkDriver, Route};

/// Tool stderr fragments that mean "the object is already there".
const ALREADY_PRESENT: &[&str] = &["File exists", "already exists"];

/// Tool stderr fragments that mean "the object is already gone".
const ALREADY_ABSENT: &[&str] = &[
    "Cannot find device",
    "No such file or directory",
    "No such device",
    "No such process",
    "Cannot assign requested address",
    "does not exist",
    "No chain/target/match by that name",
    "Bad rule (does a matching rule exist",
];

pub struct ShellDriver;

impl ShellDriver {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, cmd: &str) -> Result<CommandResult> {
        CommandExecutor::execute_shell(cmd)
    }

    /// Run a command that must succeed outright.
    fn run_strict(&self, cmd: &str) -> Result<()> {
        let result = self.run(cmd)?;
        if !result.success {
            return Err(VpcError::Driver {
                cmd: cmd.to_string(),
                stderr: result.stderr.trim().to_string(),
            });
        }
        tracing::info!("{}", cmd);
        Ok(())
    }

    /// Run a command, treating the listed stderr fragments as convergence.
    fn run_converging(&self, cmd: &str, converged: &[&str]) -> Result<()> {
        let result = self.run(cmd)?;
        if result.success {
            tracing::info!("{}", cmd);
            return Ok(());
        }
        if converged.iter().any(|m| result.stderr.contains(m)) {
            tracing::info!("{} (already converged)", cmd);
            return Ok(());
        }
        Err(VpcError::Driver {
            cmd: cmd.to_string(),
            stderr: result.stderr.trim().to_string(),
        })
    }

    fn ns_exec(ns: &str, inner: &str) -> String {
        format!("ip netns exec {} {}", ns, inner)
    }

    /// iptables match arguments shared by -A, -C and -D for a rule.
    fn filter_rule_args(rule: &FilterRule) -> String {
        let mut args = String::new();
        if let Some(src) = rule.src {
            args.push_str(&format!("-s {} ", src));
        }
        if let Some(dst) = rule.dst {
            args.push_str(&format!("-d {} ", dst));
        }
        if let Some(proto) = rule.protocol {
            args.push_str(&format!("-p {} ", proto.as_str()));
            if let Some(port) = rule.port {
                args.push_str(&format!("--dport {} ", port));
            }
        }
        args.push_str(&format!(
            "-m comment --comment {} -j {}",
            rule.tag,
            rule.verdict.as_str()
        ));
        args
    }
}

impl Default for ShellDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDriver for ShellDriver {
    fn enable_ip_forwarding(&self) -> Result<()> {
        self.run_strict("sysctl -w net.ipv4.ip_forward=1")
    }

    fn default_egress_interface(&self) -> Result<String> {
        let cmd = "ip route show default";
        let result = self.run(cmd)?;
        if !result.success {
            return Err(VpcError::Driver {
                cmd: cmd.to_string(),
                stderr: result.stderr.trim().to_string(),
            });
        }
        // Output looks like "default via 192.0.2.1 dev eth0 ...";
        // the interface is the token after "dev".
        let mut tokens = result.stdout.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                if let Some(iface) = tokens.next() {
                    return Ok(iface.to_string());
                }
            }
        }
        Err(VpcError::Driver {
            cmd: cmd.to_string(),
            stderr: "no default route on host".to_string(),
        })
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        self.run_converging(
            &format!("ip link add {} type bridge", name),
            ALREADY_PRESENT,
        )
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        let _ = self.run(&format!("ip link set {} down", name));
        self.run_converging(&format!("ip link delete {}", name), ALREADY_ABSENT)
    }

    fn link_up(&self, name: &str) -> Result<()> {
        self.run_strict(&format!("ip link set {} up", name))
    }

    fn addr_add(&self, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.run_converging(
            &format!("ip addr add {}/{} dev {}", addr, prefix, link),
            ALREADY_PRESENT,
        )
    }

    fn addr_del(&self, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.run_converging(
            &format!("ip addr del {}/{} dev {}", addr, prefix, link),
            ALREADY_ABSENT,
        )
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        self.run_converging(&format!("ip netns add {}", name), ALREADY_PRESENT)
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        self.run_converging(&format!("ip netns delete {}", name), ALREADY_ABSENT)
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        let result = self.run("ip netns list")?;
        if !result.success {
            return Ok(Vec::new());
        }
        // Lines look like "ns-v-a (id: 3)"; the name is the first token.
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn kill_namespace_processes(&self, name: &str) -> Result<()> {
        // Workloads left in the namespace would keep its interfaces alive.
        let cmd = format!("ip netns pids {} | xargs -r kill -9", name);
        let _ = self.run(&cmd)?;
        tracing::info!("{}", cmd);
        Ok(())
    }

    fn create_veth_pair(&self, first: &str, second: &str) -> Result<()> {
        self.run_converging(
            &format!("ip link add {} type veth peer name {}", first, second),
            ALREADY_PRESENT,
        )
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.run_converging(&format!("ip link delete {}", name), ALREADY_ABSENT)
    }

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()> {
        self.run_strict(&format!("ip link set {} master {}", link, bridge))
    }

    fn move_into_namespace(&self, link: &str, ns: &str) -> Result<()> {
        self.run_strict(&format!("ip link set {} netns {}", link, ns))
    }

    fn ns_loopback_up(&self, ns: &str) -> Result<()> {
        self.run_strict(&Self::ns_exec(ns, "ip link set lo up"))
    }

    fn ns_rename_link(&self, ns: &str, from: &str, to: &str) -> Result<()> {
        self.run_strict(&Self::ns_exec(
            ns,
            &format!("ip link set {} name {}", from, to),
        ))
    }

    fn ns_link_up(&self, ns: &str, link: &str) -> Result<()> {
        self.run_strict(&Self::ns_exec(ns, &format!("ip link set {} up", link)))
    }

    fn ns_addr_add(&self, ns: &str, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.run_converging(
            &Self::ns_exec(ns, &format!("ip addr add {}/{} dev {}", addr, prefix, link)),
            ALREADY_PRESENT,
        )
    }

    fn ns_route_add(&self, ns: &str, route: &Route) -> Result<()> {
        self.run_converging(
            &Self::ns_exec(ns, &format!("ip route add {}", route)),
            ALREADY_PRESENT,
        )
    }

    fn ns_route_del(&self, ns: &str, route: &Route) -> Result<()> {
        self.run_converging(
            &Self::ns_exec(ns, &format!("ip route del {}", route)),
            ALREADY_ABSENT,
        )
    }

    fn add_masquerade(&self, cidr: Cidr, egress: &str) -> Result<()> {
        // Check-then-add keeps the rule unique under re-runs.
        self.run_strict(&format!(
            "iptables -t nat -C POSTROUTING -s {} -o {} -j MASQUERADE 2>/dev/null || \
             iptables -t nat -A POSTROUTING -s {} -o {} -j MASQUERADE",
            cidr, egress, cidr, egress
        ))
    }

    fn remove_masquerade(&self, cidr: Cidr, egress: &str) -> Result<()> {
        self.run_converging(
            &format!(
                "iptables -t nat -D POSTROUTING -s {} -o {} -j MASQUERADE",
                cidr, egress
            ),
            ALREADY_ABSENT,
        )
    }

    fn add_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        let args = Self::filter_rule_args(rule);
        self.run_strict(&format!(
            "iptables -C FORWARD {} 2>/dev/null || iptables -A FORWARD {}",
            args, args
        ))
    }

    fn remove_filter_rule(&self, rule: &FilterRule) -> Result<()> {
        self.run_converging(
            &format!("iptables -D FORWARD {}", Self::filter_rule_args(rule)),
            ALREADY_ABSENT,
        )
    }

    fn remove_filter_rules_by_tag(&self, tag: &str) -> Result<()> {
        let result = self.run("iptables -S FORWARD")?;
        if !result.success {
            return Err(VpcError::Driver {
                cmd: "iptables -S FORWARD".to_string(),
                stderr: result.stderr.trim().to_string(),
            });
        }

        let needle = format!("--comment {} ", tag);
        let quoted = format!("--comment \"{}\" ", tag);
        for line in result.stdout.lines() {
            let padded = format!("{} ", line);
            if !padded.contains(&needle) && !padded.contains(&quoted) {
                continue;
            }
            if let Some(rest) = line.strip_prefix("-A FORWARD ") {
                self.run_converging(&format!("iptables -D FORWARD {}", rest), ALREADY_ABSENT)?;
            }
        }
        Ok(())
    }

    fn spawn_in_namespace(&self, ns: &str, command: &str) -> Result<()> {
        let cmd = Self::ns_exec(ns, command);
        tracing::info!("{} (detached)", cmd);
        CommandExecutor::spawn_shell(&cmd)
    }
}
