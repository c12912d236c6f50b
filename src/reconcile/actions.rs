// Plan steps. Every step knows how to apply itself to a driver and how to
// revert itself, so a failed plan can unwind exactly what it performed in
// reverse order.

use std::net::Ipv4Addr;

use crate::alloc::Cidr;
use crate::error::Result;
use crate::net::{FilterRule, NetworkDriver, Route};

#[derive(Debug, Clone)]
pub enum Action {
    EnableIpForwarding,
    CreateBridge { name: String },
    DeleteBridge { name: String },
    LinkUp { name: String },
    AddrAdd { link: String, addr: Ipv4Addr, prefix: u8 },
    AddrDel { link: String, addr: Ipv4Addr, prefix: u8 },
    CreateNamespace { name: String },
    KillNamespaceProcesses { name: String },
    DeleteNamespace { name: String },
    CreateVethPair { first: String, second: String },
    DeleteLink { name: String },
    AttachToBridge { link: String, bridge: String },
    MoveIntoNamespace { link: String, ns: String },
    NsLoopbackUp { ns: String },
    NsRenameLink { ns: String, from: String, to: String },
    NsLinkUp { ns: String, link: String },
    NsAddrAdd { ns: String, link: String, addr: Ipv4Addr, prefix: u8 },
    NsRouteAdd { ns: String, route: Route },
    NsRouteDel { ns: String, route: Route },
    AddMasquerade { cidr: Cidr, egress: String },
    RemoveMasquerade { cidr: Cidr, egress: String },
    AddFilterRule { rule: FilterRule },
    /// Remove every rule carrying `tag`. `replaced` holds the rules the tag
    /// previously carried so a revert can reinstall them.
    ClearTaggedRules { tag: String, replaced: Vec<FilterRule> },
}

impl Action {
    pub fn apply(&self, driver: &dyn NetworkDriver) -> Result<()> {
        match self {
            Action::EnableIpForwarding => driver.enable_ip_forwarding(),
            Action::CreateBridge { name } => driver.create_bridge(name),
            Action::DeleteBridge { name } => driver.delete_bridge(name),
            Action::LinkUp { name } => driver.link_up(name),
            Action::AddrAdd { link, addr, prefix } => driver.addr_add(link, *addr, *prefix),
            Action::AddrDel { link, addr, prefix } => driver.addr_del(link, *addr, *prefix),
            Action::CreateNamespace { name } => driver.create_namespace(name),
            Action::KillNamespaceProcesses { name } => driver.kill_namespace_processes(name),
            Action::DeleteNamespace { name } => driver.delete_namespace(name),
            Action::CreateVethPair { first, second } => driver.create_veth_pair(first, second),
            Action::DeleteLink { name } => driver.delete_link(name),
            Action::AttachToBridge { link, bridge } => driver.attach_to_bridge(link, bridge),
            Action::MoveIntoNamespace { link, ns } => driver.move_into_namespace(link, ns),
            Action::NsLoopbackUp { ns } => driver.ns_loopback_up(ns),
            Action::NsRenameLink { ns, from, to } => driver.ns_rename_link(ns, from, to),
            Action::NsLinkUp { ns, link } => driver.ns_link_up(ns, link),
            Action::NsAddrAdd {
                ns,
                link,
                addr,
                prefix,
            } => driver.ns_addr_add(ns, link, *addr, *prefix),
            Action::NsRouteAdd { ns, route } => driver.ns_route_add(ns, route),
            Action::NsRouteDel { ns, route } => driver.ns_route_del(ns, route),
            Action::AddMasquerade { cidr, egress } => driver.add_masquerade(*cidr, egress),
            Action::RemoveMasquerade { cidr, egress } => driver.remove_masquerade(*cidr, egress),
            Action::AddFilterRule { rule } => driver.add_filter_rule(rule),
            Action::ClearTaggedRules { tag, .. } => driver.remove_filter_rules_by_tag(tag),
        }
    }

    /// Undo this step. Steps whose effect is reclaimed by a larger revert
    /// (a moved link vanishes with its namespace, an attachment with its
    /// veth pair) or that are deliberately left in place (IP forwarding is
    /// host-shared) revert as no-ops.
    pub fn revert(&self, driver: &dyn NetworkDriver) -> Result<()> {
        match self {
            Action::EnableIpForwarding => Ok(()),
            Action::CreateBridge { name } => driver.delete_bridge(name),
            Action::DeleteBridge { .. } => Ok(()),
            Action::LinkUp { .. } => Ok(()),
            Action::AddrAdd { link, addr, prefix } => driver.addr_del(link, *addr, *prefix),
            Action::AddrDel { link, addr, prefix } => driver.addr_add(link, *addr, *prefix),
            Action::CreateNamespace { name } => driver.delete_namespace(name),
            Action::KillNamespaceProcesses { .. } => Ok(()),
            Action::DeleteNamespace { .. } => Ok(()),
            Action::CreateVethPair { first, .. } => driver.delete_link(first),
            Action::DeleteLink { .. } => Ok(()),
            Action::AttachToBridge { .. } => Ok(()),
            Action::MoveIntoNamespace { .. } => Ok(()),
            Action::NsLoopbackUp { .. } => Ok(()),
            Action::NsRenameLink { ns, from, to } => driver.ns_rename_link(ns, to, from),
            Action::NsLinkUp { .. } => Ok(()),
            Action::NsAddrAdd { .. } => Ok(()),
            Action::NsRouteAdd { ns, route } => driver.ns_route_del(ns, route),
            Action::NsRouteDel { ns, route } => driver.ns_route_add(ns, route),
            Action::AddMasquerade { cidr, egress } => driver.remove_masquerade(*cidr, egress),
            Action::RemoveMasquerade { cidr, egress } => driver.add_masquerade(*cidr, egress),
            Action::AddFilterRule { rule } => driver.remove_filter_rule(rule),
            Action::ClearTaggedRules { replaced, .. } => {
                for rule in replaced {
                    driver.add_filter_rule(rule)?;
                }
                Ok(())
            }
        }
    }
}
