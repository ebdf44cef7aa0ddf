//! Property tests: hierarchy invariants survive arbitrary write sequences

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use proptest::prelude::*;

use vrf_ipam::application::services::PrefixStore;
use vrf_ipam::config::Settings;
use vrf_ipam::domain::{Cidr, NewPrefix, PrefixPatch, TreeBuilder};
use vrf_ipam::Prefix;

#[derive(Debug, Clone)]
enum Op {
    /// Insert under the nth existing prefix (or as root when out of range)
    Insert { addr: u32, len: u8, parent: usize, routable: bool },
    Delete { target: usize },
    Darken { target: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u32..0x0100_0000, 8u8..=28, 0usize..12, any::<bool>()).prop_map(
            |(addr, len, parent, routable)| Op::Insert { addr, len, parent, routable }
        ),
        1 => (0usize..12).prop_map(|target| Op::Delete { target }),
        1 => (0usize..12).prop_map(|target| Op::Darken { target }),
    ]
}

/// Network of `10.x.y.z/len` with host bits cleared.
fn cidr_in_ten(addr: u32, len: u8) -> Cidr {
    let raw = 0x0A00_0000 | addr;
    let masked = raw & (u32::MAX << (32 - u32::from(len)));
    Cidr::new(IpAddr::V4(Ipv4Addr::from(masked)), len).unwrap()
}

fn apply(store: &PrefixStore, op: &Op) {
    let current = store.list_by_domain("default").unwrap();
    match *op {
        Op::Insert { addr, len, parent, routable } => {
            let mut new = NewPrefix::manual("default", cidr_in_ten(addr, len)).with_routable(routable);
            if let Some(p) = current.get(parent) {
                new = new.with_parent(p.id.clone());
            }
            let _ = store.insert(new);
        }
        Op::Delete { target } => {
            if let Some(p) = current.get(target) {
                let _ = store.delete(&p.id);
            }
        }
        Op::Darken { target } => {
            if let Some(p) = current.get(target) {
                let _ = store.update(
                    &p.id,
                    PrefixPatch {
                        routable: Some(false),
                        ..Default::default()
                    },
                );
            }
        }
    }
}

/// Walk up from `node` through `by_id` looking for `anc`.
fn is_ancestor_in<'a>(by_id: &HashMap<&str, &'a Prefix>, anc: &str, mut node: &'a Prefix) -> bool {
    while let Some(pid) = node.parent_id.as_deref() {
        if pid == anc {
            return true;
        }
        match by_id.get(pid) {
            Some(&next) => node = next,
            None => return false,
        }
    }
    false
}

fn check_invariants(prefixes: &[Prefix]) -> Result<(), TestCaseError> {
    let by_id: HashMap<&str, &Prefix> = prefixes.iter().map(|p| (p.id.as_str(), p)).collect();

    let cidrs: HashSet<Cidr> = prefixes.iter().map(|p| p.cidr).collect();
    prop_assert_eq!(cidrs.len(), prefixes.len(), "duplicate cidr in domain");

    for p in prefixes {
        match p.parent_id.as_deref() {
            None => prop_assert_eq!(p.depth, 0),
            Some(pid) => {
                let parent = by_id.get(pid).copied();
                prop_assert!(parent.is_some(), "dangling parent {}", pid);
                let parent = parent.unwrap();
                prop_assert!(parent.cidr.contains(&p.cidr));
                prop_assert_eq!(p.depth, parent.depth + 1);
                if !parent.routable {
                    prop_assert!(!p.routable, "{} routable under dark {}", p.id, pid);
                }
            }
        }
    }

    // Any two prefixes are disjoint or one is an ancestor of the other
    for (i, a) in prefixes.iter().enumerate() {
        for b in &prefixes[i + 1..] {
            if a.cidr.overlaps(&b.cidr) {
                prop_assert!(
                    is_ancestor_in(&by_id, &a.id, b) || is_ancestor_in(&by_id, &b.id, a),
                    "{} and {} overlap outside a containment chain",
                    a.cidr,
                    b.cidr
                );
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_random_writes_keep_tree_invariants(ops in prop::collection::vec(op(), 1..60)) {
        let store = PrefixStore::new(Arc::new(Settings::default()));
        for op in &ops {
            apply(&store, op);
        }
        let prefixes = store.list_by_domain("default").unwrap();
        check_invariants(&prefixes)?;

        // The materialized forest attaches every stored prefix
        let forest = TreeBuilder::new().build(&prefixes).unwrap();
        prop_assert_eq!(forest.len(), prefixes.len());
        prop_assert!(forest.detached().is_empty());
    }

    #[test]
    fn test_longest_match_is_most_specific_container(
        ops in prop::collection::vec(op(), 1..40),
        query_addr in 0u32..0x0100_0000,
        query_len in 8u8..=32,
    ) {
        let store = PrefixStore::new(Arc::new(Settings::default()));
        for op in &ops {
            apply(&store, op);
        }
        let query = cidr_in_ten(query_addr, query_len);
        let prefixes = store.list_by_domain("default").unwrap();
        let expected = prefixes
            .iter()
            .filter(|p| p.cidr.contains(&query))
            .max_by_key(|p| p.cidr.mask_len())
            .map(|p| p.id.clone());

        let got = store.longest_match("default", &query).unwrap().map(|p| p.id);
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn test_identifiers_accept_generated_names(name in "[a-z0-9][a-z0-9.-]{0,30}") {
        prop_assert!(vrf_ipam::domain::validate_identifier(&name).is_ok());
    }
}
