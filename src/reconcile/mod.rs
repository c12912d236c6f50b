// The reconciler turns a typed intent plus the current store snapshot into
// an ordered plan of driver calls. Plans record every step they perform; a
// failed (or interrupted) plan unwinds its completed prefix in reverse
// order, and the store is only written once the whole plan has succeeded.

pub mod actions;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::alloc::{self, Cidr};
use crate::deploy::{self, WorkloadKind};
use crate::error::{Result, VpcError};
use crate::model::{PeeringRecord, SubnetKind, SubnetRecord, VpcRecord};
use crate::net::{FilterRule, NetworkDriver, Route, Verdict};
use crate::policy;
use crate::routing;
use crate::store::Store;

use actions::Action;

pub struct Reconciler<'a> {
    store: &'a Store,
    driver: &'a dyn NetworkDriver,
    interrupted: Arc<AtomicBool>,
}

/// Executes plan steps one at a time, remembering what it did. The abort
/// flag is checked at every primitive boundary.
struct PlanExecutor<'a> {
    driver: &'a dyn NetworkDriver,
    interrupted: Arc<AtomicBool>,
    completed: Vec<Action>,
}

impl<'a> PlanExecutor<'a> {
    fn apply(&mut self, action: Action) -> Result<()> {
        if self.interrupted.load(Ordering::Relaxed) {
            return Err(VpcError::Interrupted);
        }
        action.apply(self.driver)?;
        self.completed.push(action);
        Ok(())
    }

    /// Best-effort reverse-ordered unwind. Revert failures are logged and
    /// never shadow the primary error.
    fn rollback(&mut self) {
        for action in self.completed.drain(..).rev() {
            if let Err(e) = action.revert(self.driver) {
                tracing::warn!("rollback of {:?} failed: {}", action, e);
            }
        }
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a Store,
        driver: &'a dyn NetworkDriver,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            driver,
            interrupted,
        }
    }

    fn executor(&self) -> PlanExecutor<'a> {
        PlanExecutor {
            driver: self.driver,
            interrupted: Arc::clone(&self.interrupted),
            completed: Vec::new(),
        }
    }

    fn finish(&self, mut plan: PlanExecutor<'_>, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("plan failed: {}; unwinding {} steps", e, plan.completed.len());
                plan.rollback();
                Err(e)
            }
        }
    }

    /// Records for every VPC this record peers with, minus `exclude`.
    /// Dangling references (partner record missing) are skipped with a
    /// warning; they can occur while recovering from an interrupted teardown.
    fn peer_records_excluding(&self, vpc: &VpcRecord, exclude: &str) -> Result<Vec<VpcRecord>> {
        let mut records = Vec::new();
        for peering in &vpc.peerings {
            if peering.peer == exclude {
                continue;
            }
            match self.store.try_load(&peering.peer)? {
                Some(rec) => records.push(rec),
                None => tracing::warn!(
                    "VPC '{}' records a peering with missing VPC '{}'",
                    vpc.name,
                    peering.peer
                ),
            }
        }
        Ok(records)
    }

    // ── create-vpc ────────────────────────────────────────────────────

    pub fn create_vpc(&self, name: &str, cidr: &str) -> Result<()> {
        alloc::validate_name("VPC", name)?;
        let cidr = Cidr::parse(cidr)?;
        if cidr.prefix() > 24 {
            return Err(VpcError::Validation(format!(
                "VPC CIDR {} too small: prefix must be /24 or shorter to leave room for subnets",
                cidr
            )));
        }

        if let Some(existing) = self.store.try_load(name)? {
            if existing.cidr == cidr {
                tracing::info!("VPC '{}' already exists with CIDR {}; nothing to do", name, cidr);
                return Ok(());
            }
            return Err(VpcError::Conflict(format!(
                "VPC '{}' already exists with CIDR {}",
                name, existing.cidr
            )));
        }
        for other in self.store.list()? {
            if other.cidr.overlaps(&cidr) {
                return Err(VpcError::Validation(format!(
                    "CIDR {} overlaps VPC '{}' ({})",
                    cidr, other.name, other.cidr
                )));
            }
        }

        let record = VpcRecord {
            name: name.to_string(),
            cidr,
            gateway: cidr.first_usable(),
            bridge: alloc::bridge_name(name),
            subnets: Vec::new(),
            peerings: Vec::new(),
            policies: Default::default(),
        };

        let mut plan = self.executor();
        let outcome = (|| {
            plan.apply(Action::EnableIpForwarding)?;
            plan.apply(Action::CreateBridge {
                name: record.bridge.clone(),
            })?;
            plan.apply(Action::LinkUp {
                name: record.bridge.clone(),
            })?;
            plan.apply(Action::AddrAdd {
                link: record.bridge.clone(),
                addr: record.gateway,
                prefix: cidr.prefix(),
            })?;
            self.store.save(&record)
        })();
        self.finish(plan, outcome)
    }

    // ── create-subnet ─────────────────────────────────────────────────

    pub fn create_subnet(
        &self,
        vpc: &str,
        name: &str,
        cidr: &str,
        kind: SubnetKind,
    ) -> Result<()> {
        alloc::validate_name("VPC", vpc)?;
        alloc::validate_name("subnet", name)?;
        let mut record = self.store.load(vpc)?;
        let cidr = Cidr::parse(cidr)?;
        if cidr.usable_hosts() < 2 {
            return Err(VpcError::Validation(format!(
                "subnet CIDR {} has no room for a gateway and an endpoint",
                cidr
            )));
        }

        if let Some(existing) = record.subnet(name) {
            if existing.cidr == cidr && existing.kind == kind {
                tracing::info!("subnet '{}/{}' already exists; nothing to do", vpc, name);
                return Ok(());
            }
            return Err(VpcError::Conflict(format!(
                "subnet '{}' already exists in VPC '{}' with CIDR {} ({})",
                name,
                vpc,
                existing.cidr,
                existing.kind.as_str()
            )));
        }
        if !record.cidr.contains(&cidr) || cidr.prefix() <= record.cidr.prefix() {
            return Err(VpcError::Validation(format!(
                "subnet CIDR {} is not a proper subset of VPC CIDR {}",
                cidr, record.cidr
            )));
        }
        for sibling in &record.subnets {
            if sibling.cidr.overlaps(&cidr) {
                return Err(VpcError::Validation(format!(
                    "subnet CIDR {} overlaps sibling '{}' ({})",
                    cidr, sibling.name, sibling.cidr
                )));
            }
        }

        let subnet = SubnetRecord {
            name: name.to_string(),
            cidr,
            kind,
            gateway: cidr.first_usable(),
            endpoint: cidr.second_usable(),
            namespace: alloc::namespace_name(vpc, name),
            veth_host: alloc::veth_host_name(vpc, name),
            veth_ns: alloc::veth_ns_name(vpc, name),
        };

        let peers = self.peer_records_excluding(&record, "")?;
        let egress = match kind {
            SubnetKind::Public => Some(self.driver.default_egress_interface()?),
            SubnetKind::Private => None,
        };

        let mut plan = self.executor();
        let outcome = (|| {
            plan.apply(Action::CreateNamespace {
                name: subnet.namespace.clone(),
            })?;
            plan.apply(Action::NsLoopbackUp {
                ns: subnet.namespace.clone(),
            })?;
            plan.apply(Action::CreateVethPair {
                first: subnet.veth_host.clone(),
                second: subnet.veth_ns.clone(),
            })?;
            plan.apply(Action::AttachToBridge {
                link: subnet.veth_host.clone(),
                bridge: record.bridge.clone(),
            })?;
            plan.apply(Action::LinkUp {
                name: subnet.veth_host.clone(),
            })?;
            plan.apply(Action::MoveIntoNamespace {
                link: subnet.veth_ns.clone(),
                ns: subnet.namespace.clone(),
            })?;
            plan.apply(Action::NsRenameLink {
                ns: subnet.namespace.clone(),
                from: subnet.veth_ns.clone(),
                to: alloc::NS_INTERFACE.to_string(),
            })?;
            plan.apply(Action::AddrAdd {
                link: record.bridge.clone(),
                addr: subnet.gateway,
                prefix: cidr.prefix(),
            })?;
            plan.apply(Action::NsAddrAdd {
                ns: subnet.namespace.clone(),
                link: alloc::NS_INTERFACE.to_string(),
                addr: subnet.endpoint,
                prefix: cidr.prefix(),
            })?;
            plan.apply(Action::NsLinkUp {
                ns: subnet.namespace.clone(),
                link: alloc::NS_INTERFACE.to_string(),
            })?;
            plan.apply(Action::NsRouteAdd {
                ns: subnet.namespace.clone(),
                route: Route::Default {
                    via: subnet.gateway,
                },
            })?;
            // A namespace born into an already-peered VPC still needs its
            // routes to every peer.
            for peer in &peers {
                plan.apply(Action::NsRouteAdd {
                    ns: subnet.namespace.clone(),
                    route: Route::Prefix {
                        dst: peer.cidr,
                        via: subnet.gateway,
                    },
                })?;
            }
            if let Some(egress) = &egress {
                plan.apply(Action::AddMasquerade {
                    cidr,
                    egress: egress.clone(),
                })?;
            }

            record.subnets.push(subnet.clone());
            self.store.save(&record)
        })();
        self.finish(plan, outcome)
    }

    // ── peer ──────────────────────────────────────────────────────────

    pub fn peer(&self, vpc1: &str, vpc2: &str) -> Result<()> {
        alloc::validate_name("VPC", vpc1)?;
        alloc::validate_name("VPC", vpc2)?;
        if vpc1 == vpc2 {
            return Err(VpcError::Validation(
                "cannot peer a VPC with itself".to_string(),
            ));
        }

        let (a_name, b_name) = alloc::canonical_pair(vpc1, vpc2);
        let a_before = self.store.load(a_name)?;
        let b_before = self.store.load(b_name)?;

        let a_side = a_before.peering_with(b_name).cloned();
        let b_side = b_before.peering_with(a_name).cloned();
        if a_side.is_some() && b_side.is_some() {
            tracing::info!("VPCs '{}' and '{}' are already peered; nothing to do", a_name, b_name);
            return Ok(());
        }

        // A unilateral record survives an interrupted peering; reuse its
        // block instead of allocating a second one.
        let block = match (&a_side, &b_side) {
            (Some(p), _) => p.block,
            (_, Some(p)) => p.block,
            _ => {
                let in_use: Vec<Cidr> = self
                    .store
                    .list()?
                    .iter()
                    .flat_map(|r| r.peerings.iter().map(|p| p.block))
                    .collect();
                alloc::peering_block(&in_use)?
            }
        };
        let endpoint_a = block.first_usable();
        let endpoint_b = block.second_usable();
        let (leg_a, leg_b) = alloc::peering_veth_names(a_name, b_name);
        let tag = policy::peering_tag(a_name, b_name);

        // Route deltas are computed as if the peering did not exist yet, so
        // recovery re-emits the adds and the converging driver absorbs them.
        let a_others = self.peer_records_excluding(&a_before, b_name)?;
        let b_others = self.peer_records_excluding(&b_before, a_name)?;
        let mut a_with = a_others.clone();
        a_with.push(b_before.clone());
        let mut b_with = b_others.clone();
        b_with.push(a_before.clone());
        let delta_a = routing::diff(
            &routing::desired_routes(&a_before, &a_others),
            &routing::desired_routes(&a_before, &a_with),
        );
        let delta_b = routing::diff(
            &routing::desired_routes(&b_before, &b_others),
            &routing::desired_routes(&b_before, &b_with),
        );

        let mut a_after = a_before.clone();
        a_after.peerings.retain(|p| p.peer != b_name);
        a_after.peerings.push(PeeringRecord {
            peer: b_name.to_string(),
            block,
            local_endpoint: endpoint_a,
            remote_endpoint: endpoint_b,
            veth_local: leg_a.clone(),
            veth_remote: leg_b.clone(),
        });
        let mut b_after = b_before.clone();
        b_after.peerings.retain(|p| p.peer != a_name);
        b_after.peerings.push(PeeringRecord {
            peer: a_name.to_string(),
            block,
            local_endpoint: endpoint_b,
            remote_endpoint: endpoint_a,
            veth_local: leg_b.clone(),
            veth_remote: leg_a.clone(),
        });

        let mut plan = self.executor();
        let outcome = (|| {
            plan.apply(Action::CreateVethPair {
                first: leg_a.clone(),
                second: leg_b.clone(),
            })?;
            plan.apply(Action::AttachToBridge {
                link: leg_a.clone(),
                bridge: a_before.bridge.clone(),
            })?;
            plan.apply(Action::LinkUp { name: leg_a.clone() })?;
            plan.apply(Action::AttachToBridge {
                link: leg_b.clone(),
                bridge: b_before.bridge.clone(),
            })?;
            plan.apply(Action::LinkUp { name: leg_b.clone() })?;
            plan.apply(Action::AddrAdd {
                link: a_before.bridge.clone(),
                addr: endpoint_a,
                prefix: block.prefix(),
            })?;
            plan.apply(Action::AddrAdd {
                link: b_before.bridge.clone(),
                addr: endpoint_b,
                prefix: block.prefix(),
            })?;
            for (ns, route) in delta_a.add.iter().chain(delta_b.add.iter()) {
                plan.apply(Action::NsRouteAdd {
                    ns: ns.clone(),
                    route: *route,
                })?;
            }
            plan.apply(Action::AddFilterRule {
                rule: FilterRule {
                    src: Some(a_before.cidr),
                    dst: Some(b_before.cidr),
                    protocol: None,
                    port: None,
                    verdict: Verdict::Accept,
                    tag: tag.clone(),
                },
            })?;
            plan.apply(Action::AddFilterRule {
                rule: FilterRule {
                    src: Some(b_before.cidr),
                    dst: Some(a_before.cidr),
                    protocol: None,
                    port: None,
                    verdict: Verdict::Accept,
                    tag: tag.clone(),
                },
            })?;

            // Both copies of the peering are committed inside one plan; if
            // the second write fails the first is restored.
            self.store.save(&a_after)?;
            if let Err(e) = self.store.save(&b_after) {
                if let Err(restore) = self.store.save(&a_before) {
                    tracing::warn!("could not restore record '{}': {}", a_before.name, restore);
                }
                return Err(e);
            }
            Ok(())
        })();
        self.finish(plan, outcome)
    }

    // ── apply-firewall ────────────────────────────────────────────────

    pub fn apply_firewall(&self, vpc: &str, subnet: &str, policy_path: &Path) -> Result<()> {
        alloc::validate_name("VPC", vpc)?;
        alloc::validate_name("subnet", subnet)?;
        let mut record = self.store.load(vpc)?;
        let sub = record
            .subnet(subnet)
            .cloned()
            .ok_or_else(|| VpcError::NotFound {
                kind: "subnet",
                name: format!("{}/{}", vpc, subnet),
            })?;

        let text = std::fs::read_to_string(policy_path).map_err(|e| {
            VpcError::Validation(format!(
                "cannot read policy file {}: {}",
                policy_path.display(),
                e
            ))
        })?;
        let doc: crate::model::PolicyDocument = serde_json::from_str(&text)
            .map_err(|e| VpcError::Validation(format!("invalid policy file: {}", e)))?;
        if doc.subnet != sub.cidr {
            return Err(VpcError::Validation(format!(
                "policy targets {} but subnet '{}' is {}",
                doc.subnet, subnet, sub.cidr
            )));
        }

        let rules = policy::compile(vpc, subnet, sub.cidr, &doc)?;
        let previous = record
            .policies
            .get(subnet)
            .map(|old| policy::compile(vpc, subnet, sub.cidr, old))
            .transpose()?
            .unwrap_or_default();

        let mut plan = self.executor();
        let outcome = (|| {
            plan.apply(Action::ClearTaggedRules {
                tag: policy::policy_tag(vpc, subnet),
                replaced: previous,
            })?;
            for rule in &rules {
                plan.apply(Action::AddFilterRule { rule: rule.clone() })?;
            }
            record.policies.insert(subnet.to_string(), doc);
            self.store.save(&record)
        })();
        self.finish(plan, outcome)
    }

    // ── delete-subnet ─────────────────────────────────────────────────

    pub fn delete_subnet(&self, vpc: &str, name: &str) -> Result<()> {
        alloc::validate_name("VPC", vpc)?;
        alloc::validate_name("subnet", name)?;

        let record = match self.store.try_load(vpc)? {
            Some(record) => record,
            None => return self.sweep_unrecorded_subnet(vpc, name),
        };
        let sub = match record.subnet(name).cloned() {
            Some(sub) => sub,
            None => return self.sweep_unrecorded_subnet(vpc, name),
        };

        let egress = self.egress_for_teardown(&sub);
        let mut record = record;
        let mut plan = self.executor();
        let outcome = (|| {
            self.append_subnet_teardown(&mut plan, vpc, &record.bridge, &sub, egress.as_deref())?;
            record.subnets.retain(|s| s.name != name);
            record.policies.remove(name);
            self.store.save(&record)
        })();
        self.finish(plan, outcome)
    }

    /// Teardown for a subnet that the store does not know about. Happens
    /// after a crash between namespace creation and the record write; the
    /// derived names are deterministic, so whatever half exists converges
    /// to gone.
    fn sweep_unrecorded_subnet(&self, vpc: &str, name: &str) -> Result<()> {
        tracing::info!(
            "subnet '{}/{}' is not recorded; sweeping derived objects",
            vpc,
            name
        );
        let ns = alloc::namespace_name(vpc, name);
        self.driver.kill_namespace_processes(&ns)?;
        self.driver.delete_namespace(&ns)?;
        self.driver.delete_link(&alloc::veth_host_name(vpc, name))?;
        self.driver
            .remove_filter_rules_by_tag(&policy::policy_tag(vpc, name))?;
        Ok(())
    }

    fn egress_for_teardown(&self, sub: &SubnetRecord) -> Option<String> {
        if sub.kind != SubnetKind::Public {
            return None;
        }
        match self.driver.default_egress_interface() {
            Ok(iface) => Some(iface),
            Err(e) => {
                tracing::warn!("cannot determine egress interface, skipping NAT removal: {}", e);
                None
            }
        }
    }

    fn append_subnet_teardown(
        &self,
        plan: &mut PlanExecutor<'_>,
        vpc: &str,
        bridge: &str,
        sub: &SubnetRecord,
        egress: Option<&str>,
    ) -> Result<()> {
        if let Some(egress) = egress {
            plan.apply(Action::RemoveMasquerade {
                cidr: sub.cidr,
                egress: egress.to_string(),
            })?;
        }
        plan.apply(Action::ClearTaggedRules {
            tag: policy::policy_tag(vpc, &sub.name),
            replaced: Vec::new(),
        })?;
        plan.apply(Action::KillNamespaceProcesses {
            name: sub.namespace.clone(),
        })?;
        plan.apply(Action::DeleteNamespace {
            name: sub.namespace.clone(),
        })?;
        plan.apply(Action::DeleteLink {
            name: sub.veth_host.clone(),
        })?;
        plan.apply(Action::AddrDel {
            link: bridge.to_string(),
            addr: sub.gateway,
            prefix: sub.cidr.prefix(),
        })?;
        Ok(())
    }

    // ── delete-vpc ────────────────────────────────────────────────────

    pub fn delete_vpc(&self, name: &str) -> Result<()> {
        alloc::validate_name("VPC", name)?;
        let record = self.store.try_load(name)?;

        // Partners are collected from both directions: this record's
        // peerings and any record still referencing us (a unilateral copy
        // left by an interrupted run).
        let mut partners: Vec<(String, PeeringRecord)> = Vec::new();
        if let Some(record) = &record {
            for p in &record.peerings {
                partners.push((p.peer.clone(), p.clone()));
            }
        }
        for partner in self.store.peered_with(name)? {
            if partners.iter().any(|(n, _)| *n == partner.name) {
                continue;
            }
            // Mirror the partner's view into ours: its local leg is our
            // remote one and vice versa.
            let theirs = partner.peering_with(name).cloned();
            if let Some(theirs) = theirs {
                partners.push((
                    partner.name.clone(),
                    PeeringRecord {
                        peer: partner.name.clone(),
                        block: theirs.block,
                        local_endpoint: theirs.remote_endpoint,
                        remote_endpoint: theirs.local_endpoint,
                        veth_local: theirs.veth_remote,
                        veth_remote: theirs.veth_local,
                    },
                ));
            }
        }

        let needs_egress = record
            .as_ref()
            .map(|r| r.subnets.iter().any(|s| s.kind == SubnetKind::Public))
            .unwrap_or(false);
        let egress = if needs_egress {
            match self.driver.default_egress_interface() {
                Ok(iface) => Some(iface),
                Err(e) => {
                    tracing::warn!(
                        "cannot determine egress interface, skipping NAT removal: {}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut updated_partners: Vec<VpcRecord> = Vec::new();
        let mut plan = self.executor();
        let outcome = (|| {
            if let Some(record) = &record {
                for sub in &record.subnets {
                    let sub_egress = if sub.kind == SubnetKind::Public {
                        egress.as_deref()
                    } else {
                        None
                    };
                    self.append_subnet_teardown(
                        &mut plan,
                        name,
                        &record.bridge,
                        sub,
                        sub_egress,
                    )?;
                }
            }

            for (partner_name, peering) in &partners {
                plan.apply(Action::DeleteLink {
                    name: peering.veth_local.clone(),
                })?;
                let (first, second) = alloc::canonical_pair(name, partner_name);
                plan.apply(Action::ClearTaggedRules {
                    tag: policy::peering_tag(first, second),
                    replaced: Vec::new(),
                })?;

                if let Some(mut partner) = self.store.try_load(partner_name)? {
                    if let Some(record) = &record {
                        // Drop the partner's routes toward us; its own
                        // namespaces survive the unpeering.
                        for sub in &partner.subnets {
                            plan.apply(Action::NsRouteDel {
                                ns: sub.namespace.clone(),
                                route: Route::Prefix {
                                    dst: record.cidr,
                                    via: sub.gateway,
                                },
                            })?;
                        }
                    }
                    plan.apply(Action::AddrDel {
                        link: partner.bridge.clone(),
                        addr: peering.remote_endpoint,
                        prefix: peering.block.prefix(),
                    })?;
                    partner.peerings.retain(|p| p.peer != name);
                    updated_partners.push(partner);
                }
            }

            plan.apply(Action::DeleteBridge {
                name: alloc::bridge_name(name),
            })?;

            // Catch namespaces from crashed partial subnets that never made
            // it into the record.
            let prefix = format!("ns-{}-", name);
            for ns in self.driver.list_namespaces()? {
                if ns.starts_with(&prefix) {
                    plan.apply(Action::KillNamespaceProcesses { name: ns.clone() })?;
                    plan.apply(Action::DeleteNamespace { name: ns })?;
                }
            }

            for partner in &updated_partners {
                self.store.save(partner)?;
            }
            self.store.delete(name)
        })();
        self.finish(plan, outcome)
    }

    // ── boundary commands ─────────────────────────────────────────────

    pub fn deploy(&self, vpc: &str, subnet: &str, kind: WorkloadKind, port: u16) -> Result<()> {
        alloc::validate_name("VPC", vpc)?;
        alloc::validate_name("subnet", subnet)?;
        let record = self.store.load(vpc)?;
        let sub = record
            .subnet(subnet)
            .ok_or_else(|| VpcError::NotFound {
                kind: "subnet",
                name: format!("{}/{}", vpc, subnet),
            })?;
        deploy::run(self.driver, self.store.root(), &record, sub, kind, port)
    }

    pub fn list(&self) -> Result<Vec<VpcRecord>> {
        self.store.list()
    }
}
