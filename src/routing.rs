// Routing planner. Pure: no driver calls, no store access. Given a VPC
// record and the records it peers with, produce the route set every one of
// its namespaces should hold; the reconciler diffs two such pictures and
// executes the delta.

use crate::model::VpcRecord;
use crate::net::Route;

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceRoutes {
    pub namespace: String,
    pub routes: Vec<Route>,
}

/// Desired routes for every namespace in `vpc`: the default route via the
/// subnet gateway, plus one prefix route per peered VPC via the same gateway.
pub fn desired_routes(vpc: &VpcRecord, peered: &[VpcRecord]) -> Vec<NamespaceRoutes> {
    vpc.subnets
        .iter()
        .map(|subnet| {
            let mut routes = vec![Route::Default {
                via: subnet.gateway,
            }];
            for peer in peered {
                routes.push(Route::Prefix {
                    dst: peer.cidr,
                    via: subnet.gateway,
                });
            }
            NamespaceRoutes {
                namespace: subnet.namespace.clone(),
                routes,
            }
        })
        .collect()
}

#[derive(Debug, Default, PartialEq)]
pub struct RouteDelta {
    pub add: Vec<(String, Route)>,
    pub remove: Vec<(String, Route)>,
}

impl RouteDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Diff two route pictures. Namespaces present only in `current` are
/// skipped: their routes disappear with the namespace itself and emitting
/// removals for them would only race teardown.
pub fn diff(current: &[NamespaceRoutes], desired: &[NamespaceRoutes]) -> RouteDelta {
    let mut delta = RouteDelta::default();

    for want in desired {
        let have = current
            .iter()
            .find(|c| c.namespace == want.namespace)
            .map(|c| c.routes.as_slice())
            .unwrap_or(&[]);

        for route in &want.routes {
            if !have.contains(route) {
                delta.add.push((want.namespace.clone(), *route));
            }
        }
        for route in have {
            if !want.routes.contains(route) {
                delta.remove.push((want.namespace.clone(), *route));
            }
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Cidr;
    use crate::model::{SubnetKind, SubnetRecord};
    use std::collections::BTreeMap;

    fn vpc(name: &str, cidr: &str, subnets: &[(&str, &str)]) -> VpcRecord {
        let cidr = Cidr::parse(cidr).unwrap();
        VpcRecord {
            name: name.to_string(),
            cidr,
            gateway: cidr.first_usable(),
            bridge: format!("br-{}", name),
            subnets: subnets
                .iter()
                .map(|(sub, sub_cidr)| {
                    let sub_cidr = Cidr::parse(sub_cidr).unwrap();
                    SubnetRecord {
                        name: sub.to_string(),
                        cidr: sub_cidr,
                        kind: SubnetKind::Private,
                        gateway: sub_cidr.first_usable(),
                        endpoint: sub_cidr.second_usable(),
                        namespace: format!("ns-{}-{}", name, sub),
                        veth_host: format!("veth-{}-{}-h", name, sub),
                        veth_ns: format!("veth-{}-{}-n", name, sub),
                    }
                })
                .collect(),
            peerings: Vec::new(),
            policies: BTreeMap::new(),
        }
    }

    #[test]
    fn unpeered_vpc_wants_only_default_routes() {
        let v = vpc("v", "10.0.0.0/16", &[("a", "10.0.1.0/24")]);
        let routes = desired_routes(&v, &[]);
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0].routes,
            vec![Route::Default {
                via: "10.0.1.1".parse().unwrap()
            }]
        );
    }

    #[test]
    fn every_namespace_gets_a_route_per_peer() {
        let v = vpc(
            "v",
            "10.0.0.0/16",
            &[("a", "10.0.1.0/24"), ("b", "10.0.2.0/24")],
        );
        let w = vpc("w", "10.1.0.0/16", &[("a", "10.1.1.0/24")]);

        let routes = desired_routes(&v, &[w]);
        for ns in &routes {
            assert_eq!(ns.routes.len(), 2);
            assert!(ns.routes.iter().any(|r| matches!(
                r,
                Route::Prefix { dst, .. } if dst.to_string() == "10.1.0.0/16"
            )));
        }
        // Each namespace routes via its own subnet gateway.
        assert!(routes[0]
            .routes
            .contains(&Route::Prefix {
                dst: Cidr::parse("10.1.0.0/16").unwrap(),
                via: "10.0.1.1".parse().unwrap(),
            }));
        assert!(routes[1]
            .routes
            .contains(&Route::Prefix {
                dst: Cidr::parse("10.1.0.0/16").unwrap(),
                via: "10.0.2.1".parse().unwrap(),
            }));
    }

    #[test]
    fn diff_emits_adds_for_new_peer_and_removes_for_dropped_peer() {
        let v = vpc("v", "10.0.0.0/16", &[("a", "10.0.1.0/24")]);
        let w = vpc("w", "10.1.0.0/16", &[("a", "10.1.1.0/24")]);

        let before = desired_routes(&v, &[]);
        let after = desired_routes(&v, &[w]);

        let up = diff(&before, &after);
        assert_eq!(up.remove, vec![]);
        assert_eq!(
            up.add,
            vec![(
                "ns-v-a".to_string(),
                Route::Prefix {
                    dst: Cidr::parse("10.1.0.0/16").unwrap(),
                    via: "10.0.1.1".parse().unwrap(),
                }
            )]
        );

        let down = diff(&after, &before);
        assert_eq!(down.add, vec![]);
        assert_eq!(down.remove.len(), 1);
    }

    #[test]
    fn diff_skips_namespaces_slated_for_teardown() {
        let two = vpc(
            "v",
            "10.0.0.0/16",
            &[("a", "10.0.1.0/24"), ("b", "10.0.2.0/24")],
        );
        let one = vpc("v", "10.0.0.0/16", &[("a", "10.0.1.0/24")]);

        let delta = diff(&desired_routes(&two, &[]), &desired_routes(&one, &[]));
        assert!(delta.is_empty());
    }
}
