// The driver interface: narrow verb-level primitives over kernel networking.
// The reconciler composes these into plans; the production implementation
// shells out to ip/iptables, tests substitute an in-memory mock.

use std::fmt;
use std::net::Ipv4Addr;

use crate::alloc::Cidr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

/// A route inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Default { via: Ipv4Addr },
    Prefix { dst: Cidr, via: Ipv4Addr },
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Default { via } => write!(f, "default via {}", via),
            Route::Prefix { dst, via } => write!(f, "{} via {}", dst, via),
        }
    }
}

/// A packet-filter rule at the host forward hook. Every rule carries a tag
/// (an iptables comment) so this tool can later remove exactly the rules it
/// installed and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub src: Option<Cidr>,
    pub dst: Option<Cidr>,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
    pub verdict: Verdict,
    pub tag: String,
}

/// Imperative shim over kernel networking. Create/delete primitives converge:
/// "already exists" and "already gone" outcomes are success, everything else
/// surfaces as a typed driver error.
pub trait NetworkDriver {
    fn enable_ip_forwarding(&self) -> Result<()>;

    /// Interface carrying the host's default route; shared by all public
    /// subnets' NAT rules and read once per invocation.
    fn default_egress_interface(&self) -> Result<String>;

    fn create_bridge(&self, name: &str) -> Result<()>;
    fn delete_bridge(&self, name: &str) -> Result<()>;
    fn link_up(&self, name: &str) -> Result<()>;
    fn addr_add(&self, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;
    fn addr_del(&self, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;

    fn create_namespace(&self, name: &str) -> Result<()>;
    fn delete_namespace(&self, name: &str) -> Result<()>;
    fn list_namespaces(&self) -> Result<Vec<String>>;
    fn kill_namespace_processes(&self, name: &str) -> Result<()>;

    fn create_veth_pair(&self, first: &str, second: &str) -> Result<()>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()>;
    fn move_into_namespace(&self, link: &str, ns: &str) -> Result<()>;

    fn ns_loopback_up(&self, ns: &str) -> Result<()>;
    fn ns_rename_link(&self, ns: &str, from: &str, to: &str) -> Result<()>;
    fn ns_link_up(&self, ns: &str, link: &str) -> Result<()>;
    fn ns_addr_add(&self, ns: &str, link: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;
    fn ns_route_add(&self, ns: &str, route: &Route) -> Result<()>;
    fn ns_route_del(&self, ns: &str, route: &Route) -> Result<()>;

    fn add_masquerade(&self, cidr: Cidr, egress: &str) -> Result<()>;
    fn remove_masquerade(&self, cidr: Cidr, egress: &str) -> Result<()>;

    fn add_filter_rule(&self, rule: &FilterRule) -> Result<()>;
    fn remove_filter_rule(&self, rule: &FilterRule) -> Result<()>;
    fn remove_filter_rules_by_tag(&self, tag: &str) -> Result<()>;

    /// Start a program inside a namespace, detached. Workload deployer only.
    fn spawn_in_namespace(&self, ns: &str, command: &str) -> Result<()>;
}
