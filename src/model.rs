// Persistent record types. One JSON document per VPC; the layout here is the
// on-disk contract, so field names are fixed (camelCase keys).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::alloc::Cidr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcRecord {
    pub name: String,
    pub cidr: Cidr,
    pub gateway: Ipv4Addr,
    pub bridge: String,
    #[serde(default)]
    pub subnets: Vec<SubnetRecord>,
    #[serde(default)]
    pub peerings: Vec<PeeringRecord>,
    /// Applied firewall policies, keyed by subnet name. Kept verbatim so a
    /// failed replacement can reinstall the previous rule set.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyDocument>,
}

impl VpcRecord {
    pub fn subnet(&self, name: &str) -> Option<&SubnetRecord> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn peering_with(&self, peer: &str) -> Option<&PeeringRecord> {
        self.peerings.iter().find(|p| p.peer == peer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetRecord {
    pub name: String,
    pub cidr: Cidr,
    #[serde(rename = "type")]
    pub kind: SubnetKind,
    /// First usable address of the subnet CIDR, held by the VPC bridge.
    pub gateway: Ipv4Addr,
    /// Second usable address, assigned to eth0 inside the namespace.
    pub endpoint: Ipv4Addr,
    pub namespace: String,
    pub veth_host: String,
    pub veth_ns: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    Public,
    Private,
}

impl SubnetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetKind::Public => "public",
            SubnetKind::Private => "private",
        }
    }
}

/// One half of a peering. The same peering appears in both VPC records with
/// local/remote swapped; the reconciler keeps the two copies in sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringRecord {
    pub peer: String,
    /// The /30 carved from the reserved peering range.
    pub block: Cidr,
    /// Address on this VPC's bridge for the peering leg.
    pub local_endpoint: Ipv4Addr,
    /// Address on the peer's bridge.
    pub remote_endpoint: Ipv4Addr,
    pub veth_local: String,
    pub veth_remote: String,
}

/// Operator-supplied firewall policy (also the persisted form). Protocol and
/// action stay as strings here; the policy compiler owns their validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub subnet: Cidr,
    #[serde(default)]
    pub ingress: Vec<PolicyRule>,
    #[serde(default)]
    pub egress: Vec<PolicyRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_with_camel_case_keys() {
        let rec = VpcRecord {
            name: "prod".to_string(),
            cidr: Cidr::parse("10.0.0.0/16").unwrap(),
            gateway: "10.0.0.1".parse().unwrap(),
            bridge: "br-prod".to_string(),
            subnets: vec![SubnetRecord {
                name: "web".to_string(),
                cidr: Cidr::parse("10.0.1.0/24").unwrap(),
                kind: SubnetKind::Public,
                gateway: "10.0.1.1".parse().unwrap(),
                endpoint: "10.0.1.2".parse().unwrap(),
                namespace: "ns-prod-web".to_string(),
                veth_host: "veth-prod-web-h".to_string(),
                veth_ns: "veth-prod-web-n".to_string(),
            }],
            peerings: vec![PeeringRecord {
                peer: "stage".to_string(),
                block: Cidr::parse("192.168.0.0/30").unwrap(),
                local_endpoint: "192.168.0.1".parse().unwrap(),
                remote_endpoint: "192.168.0.2".parse().unwrap(),
                veth_local: "veth-peer-prod-stage-a".to_string(),
                veth_remote: "veth-peer-prod-stage-b".to_string(),
            }],
            policies: BTreeMap::new(),
        };

        let json = serde_json::to_string_pretty(&rec).unwrap();
        assert!(json.contains("\"vethHost\""));
        assert!(json.contains("\"localEndpoint\""));
        assert!(json.contains("\"type\": \"public\""));

        let back: VpcRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn policy_document_defaults_missing_directions_to_empty() {
        let doc: PolicyDocument =
            serde_json::from_str(r#"{ "subnet": "10.0.1.0/24" }"#).unwrap();
        assert!(doc.ingress.is_empty());
        assert!(doc.egress.is_empty());

        let doc: PolicyDocument = serde_json::from_str(
            r#"{ "subnet": "10.0.1.0/24",
                 "ingress": [ { "port": 80, "protocol": "tcp", "action": "allow" } ],
                 "egress":  [ { "action": "deny" } ] }"#,
        )
        .unwrap();
        assert_eq!(doc.ingress.len(), 1);
        assert_eq!(doc.ingress[0].port, Some(80));
        assert_eq!(doc.egress[0].port, None);
    }
}
