// Policy compiler. Pure translation from a declarative policy document to an
// ordered sequence of tagged forward-hook filter rules. Order is preserved
// exactly as written; no dedupe, no reordering.

use crate::alloc::Cidr;
use crate::error::{Result, VpcError};
use crate::model::{PolicyDocument, PolicyRule};
use crate::net::{FilterRule, Protocol, Verdict};

/// Tag carried by every rule a policy installs, used for bulk removal on
/// replacement or subnet teardown. Operator-installed rules never match it.
pub fn policy_tag(vpc: &str, subnet: &str) -> String {
    format!("vpcctl:policy:{}:{}", vpc, subnet)
}

/// Tag for the forwarding-allow rules of a peering; the pair is canonical
/// (lexicographic), so both directions share one tag.
pub fn peering_tag(a: &str, b: &str) -> String {
    format!("vpcctl:peer:{}:{}", a, b)
}

/// Compile a policy into filter rules. Ingress rules scope destination =
/// subnet CIDR; egress rules scope source = subnet CIDR. Whenever a
/// direction has any rules, a trailing default-DROP for that direction is
/// appended: applying a policy closes the subnet by default.
pub fn compile(
    vpc: &str,
    subnet_name: &str,
    subnet_cidr: Cidr,
    doc: &PolicyDocument,
) -> Result<Vec<FilterRule>> {
    let tag = policy_tag(vpc, subnet_name);
    let mut rules = Vec::new();

    for rule in &doc.ingress {
        rules.push(FilterRule {
            src: None,
            dst: Some(subnet_cidr),
            protocol: Some(required_protocol(rule, "ingress")?),
            port: Some(required_port(rule, "ingress")?),
            verdict: parse_action(&rule.action)?,
            tag: tag.clone(),
        });
    }
    if !doc.ingress.is_empty() {
        rules.push(FilterRule {
            src: None,
            dst: Some(subnet_cidr),
            protocol: None,
            port: None,
            verdict: Verdict::Drop,
            tag: tag.clone(),
        });
    }

    for rule in &doc.egress {
        let protocol = rule.protocol.as_deref().map(parse_protocol).transpose()?;
        if rule.port.is_some() && protocol.is_none() {
            return Err(VpcError::Validation(
                "egress rule with a port must also name a protocol".to_string(),
            ));
        }
        rules.push(FilterRule {
            src: Some(subnet_cidr),
            dst: None,
            protocol,
            port: rule.port,
            verdict: parse_action(&rule.action)?,
            tag: tag.clone(),
        });
    }
    if !doc.egress.is_empty() {
        rules.push(FilterRule {
            src: Some(subnet_cidr),
            dst: None,
            protocol: None,
            port: None,
            verdict: Verdict::Drop,
            tag,
        });
    }

    Ok(rules)
}

fn parse_protocol(s: &str) -> Result<Protocol> {
    match s {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(VpcError::Validation(format!(
            "unknown protocol '{}': expected tcp or udp",
            other
        ))),
    }
}

fn parse_action(s: &str) -> Result<Verdict> {
    match s {
        "allow" => Ok(Verdict::Accept),
        "deny" => Ok(Verdict::Drop),
        other => Err(VpcError::Validation(format!(
            "unknown action '{}': expected allow or deny",
            other
        ))),
    }
}

fn required_protocol(rule: &PolicyRule, direction: &str) -> Result<Protocol> {
    match rule.protocol.as_deref() {
        Some(p) => parse_protocol(p),
        None => Err(VpcError::Validation(format!(
            "{} rule is missing a protocol",
            direction
        ))),
    }
}

fn required_port(rule: &PolicyRule, direction: &str) -> Result<u16> {
    rule.port.ok_or_else(|| {
        VpcError::Validation(format!("{} rule is missing a port", direction))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> PolicyDocument {
        serde_json::from_str(json).unwrap()
    }

    fn cidr() -> Cidr {
        Cidr::parse("10.0.1.0/24").unwrap()
    }

    #[test]
    fn ingress_rules_compile_in_order_with_trailing_drop() {
        let doc = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "ingress": [ { "port": 80, "protocol": "tcp", "action": "allow" },
                              { "port": 22, "protocol": "tcp", "action": "deny" } ] }"#,
        );
        let rules = compile("v", "a", cidr(), &doc).unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].port, Some(80));
        assert_eq!(rules[0].verdict, Verdict::Accept);
        assert_eq!(rules[0].dst, Some(cidr()));
        assert_eq!(rules[1].port, Some(22));
        assert_eq!(rules[1].verdict, Verdict::Drop);
        // Closed by default once a policy is applied.
        assert_eq!(rules[2].port, None);
        assert_eq!(rules[2].verdict, Verdict::Drop);
        assert!(rules.iter().all(|r| r.tag == "vpcctl:policy:v:a"));
    }

    #[test]
    fn empty_policy_compiles_to_nothing() {
        let doc = doc(r#"{ "subnet": "10.0.1.0/24" }"#);
        assert!(compile("v", "a", cidr(), &doc).unwrap().is_empty());
    }

    #[test]
    fn egress_rules_scope_source_and_may_omit_port() {
        let doc = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "egress": [ { "action": "allow", "port": 443, "protocol": "tcp" },
                             { "action": "deny" } ] }"#,
        );
        let rules = compile("v", "a", cidr(), &doc).unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].src, Some(cidr()));
        assert_eq!(rules[0].dst, None);
        assert_eq!(rules[1].protocol, None);
        assert_eq!(rules[2].verdict, Verdict::Drop);
    }

    #[test]
    fn unknown_protocol_or_action_is_a_validation_error() {
        let bad_proto = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "ingress": [ { "port": 80, "protocol": "icmp", "action": "allow" } ] }"#,
        );
        let err = compile("v", "a", cidr(), &bad_proto).unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let bad_action = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "ingress": [ { "port": 80, "protocol": "tcp", "action": "reject" } ] }"#,
        );
        assert!(compile("v", "a", cidr(), &bad_action).is_err());
    }

    #[test]
    fn ingress_rule_without_port_is_rejected() {
        let doc = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "ingress": [ { "protocol": "tcp", "action": "allow" } ] }"#,
        );
        assert!(compile("v", "a", cidr(), &doc).is_err());
    }

    #[test]
    fn egress_port_without_protocol_is_rejected() {
        let doc = doc(
            r#"{ "subnet": "10.0.1.0/24",
                 "egress": [ { "port": 53, "action": "allow" } ] }"#,
        );
        assert!(compile("v", "a", cidr(), &doc).is_err());
    }
}
