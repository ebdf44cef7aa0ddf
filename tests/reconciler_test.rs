//! Tests for IngestionReconciler

use std::sync::Arc;

use rstest::rstest;

use vrf_ipam::application::hash::external_prefix_id;
use vrf_ipam::application::services::{IngestionReconciler, PrefixStore, UpsertAction};
use vrf_ipam::config::{DefaultDomainConfig, Settings};
use vrf_ipam::domain::{
    Cidr, DiscoveredSubnet, DomainError, ExternalAllocation, NewPrefix, Origin, Tags,
};
use vrf_ipam::util::testing;
use vrf_ipam::ApplicationError;

fn cidr(s: &str) -> Cidr {
    s.parse().expect("valid cidr")
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Fixture {
    store: Arc<PrefixStore>,
    reconciler: IngestionReconciler,
}

/// prod: 10.0.0.0/8 (root) > 10.0.0.0/16 (vpcs), vpc-1 reserved on 10.0.0.0/16.
fn fixture() -> Fixture {
    testing::init_test_setup();
    let settings = Arc::new(Settings {
        default_domain: DefaultDomainConfig {
            id: "prod".into(),
            description: "Production".into(),
        },
        ingest_threads: 4,
        ..Default::default()
    });
    let store = Arc::new(PrefixStore::new(Arc::clone(&settings)));
    store
        .insert(NewPrefix::manual("prod", cidr("10.0.0.0/8")).with_id("root"))
        .unwrap();
    store
        .insert(
            NewPrefix::manual("prod", cidr("10.0.0.0/16"))
                .with_id("vpcs")
                .with_parent("root"),
        )
        .unwrap();
    store
        .reserve_allocation(ExternalAllocation {
            resource_id: "vpc-1".into(),
            reserved_cidr: cidr("10.0.0.0/16"),
            routable: true,
            parent_prefix_id: "vpcs".into(),
        })
        .unwrap();
    let reconciler = IngestionReconciler::new(Arc::clone(&store), settings).unwrap();
    Fixture { store, reconciler }
}

#[test]
fn given_reserved_allocation_when_reconciling_twice_then_single_prefix() {
    // Arrange
    let f = fixture();

    // Act
    let first = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.1.0/24"), Tags::new())
        .unwrap();
    let second = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.1.0/24"), Tags::new())
        .unwrap();

    // Assert
    assert_eq!(first.action, UpsertAction::Created);
    assert_eq!(second.action, UpsertAction::Unchanged);
    assert_eq!(first.prefix_id, second.prefix_id);
    assert_eq!(first.domain_id, "prod");
    assert_eq!(f.store.list_by_domain("prod").unwrap().len(), 3);

    let prefix = f.store.get(&first.prefix_id).unwrap();
    assert_eq!(prefix.parent_id.as_deref(), Some("vpcs"));
    assert_eq!(prefix.depth, 2);
    assert_eq!(
        prefix.origin,
        Origin::External {
            resource_id: "vpc-1".into()
        }
    );
    assert_eq!(prefix.external_resource_id(), Some("vpc-1"));
    assert_eq!(
        prefix.id,
        external_prefix_id("vpc-1", &cidr("10.0.1.0/24"))
    );
}

#[test]
fn given_no_allocation_when_reconciling_then_no_allocation_found() {
    // Arrange
    let f = fixture();
    let before = f.store.list_by_domain("prod").unwrap();

    // Act
    let result = f
        .reconciler
        .reconcile("vpc-2", &cidr("172.16.0.0/24"), Tags::new());

    // Assert
    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::NoAllocationFound { .. }))
    ));
    assert_eq!(f.store.list_by_domain("prod").unwrap(), before);
    assert_eq!(f.store.list_domains().len(), 1);
}

#[test]
fn given_subnet_outside_reservation_when_reconciling_then_no_allocation_found() {
    // Arrange
    let f = fixture();

    // Act
    let result = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.1.0.0/24"), Tags::new());

    // Assert
    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::NoAllocationFound { .. }))
    ));
}

#[test]
fn given_existing_subnet_when_tags_change_then_updated_in_place() {
    // Arrange
    let f = fixture();
    let created = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.2.0/24"), tags(&[("az", "a")]))
        .unwrap();

    // Act
    let refreshed = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.2.0/24"), tags(&[("az", "b")]))
        .unwrap();

    // Assert
    assert_eq!(refreshed.action, UpsertAction::Updated);
    assert_eq!(refreshed.prefix_id, created.prefix_id);
    let prefix = f.store.get(&created.prefix_id).unwrap();
    assert_eq!(prefix.tags, tags(&[("az", "b")]));
    assert_eq!(f.store.list_by_domain("prod").unwrap().len(), 3);
}

/// Adds the non-routable reservation `vpc-dark` on 10.1.0.0/16 under prod.
fn reserve_dark(f: &Fixture) {
    f.store
        .insert(
            NewPrefix::manual("prod", cidr("10.1.0.0/16"))
                .with_id("dark")
                .with_parent("root"),
        )
        .unwrap();
    f.store
        .reserve_allocation(ExternalAllocation {
            resource_id: "vpc-dark".into(),
            reserved_cidr: cidr("10.1.0.0/16"),
            routable: false,
            parent_prefix_id: "dark".into(),
        })
        .unwrap();
}

#[test]
fn given_non_routable_allocation_when_reconciling_then_roots_in_isolated_domain() {
    // Arrange
    let f = fixture();
    reserve_dark(&f);

    // Act
    let first = f
        .reconciler
        .reconcile("vpc-dark", &cidr("10.1.0.0/20"), Tags::new())
        .unwrap();
    let sibling = f
        .reconciler
        .reconcile("vpc-dark", &cidr("10.1.16.0/20"), Tags::new())
        .unwrap();
    let again = f
        .reconciler
        .reconcile("vpc-dark", &cidr("10.1.0.0/20"), Tags::new())
        .unwrap();

    // Assert
    assert_eq!(first.domain_id, "isolated-vpc-dark");
    assert_eq!(again.action, UpsertAction::Unchanged);
    let domain = f.store.get_domain("isolated-vpc-dark").unwrap();
    assert!(!domain.routable);
    assert!(!domain.is_default);

    for id in [&first.prefix_id, &sibling.prefix_id] {
        let prefix = f.store.get(id).unwrap();
        assert!(prefix.is_root());
        assert_eq!(prefix.depth, 0);
        assert!(!prefix.routable);
    }
    assert_eq!(f.store.list_by_domain("prod").unwrap().len(), 3);
}

#[rstest]
#[case::supernet_first(["10.1.0.0/20", "10.1.1.0/24"])]
#[case::subnet_first(["10.1.1.0/24", "10.1.0.0/20"])]
fn given_nested_isolated_subnets_when_reconciling_in_any_order_then_later_one_rejected(
    #[case] order: [&str; 2],
) {
    // Arrange
    let f = fixture();
    reserve_dark(&f);

    // Act
    let earlier = f
        .reconciler
        .reconcile("vpc-dark", &cidr(order[0]), Tags::new());
    let later = f
        .reconciler
        .reconcile("vpc-dark", &cidr(order[1]), Tags::new());

    // Assert
    let earlier = earlier.unwrap();
    assert_eq!(earlier.action, UpsertAction::Created);
    assert!(matches!(
        later,
        Err(ApplicationError::Domain(DomainError::OverlapWithSibling { .. }))
    ));
    let stored = f.store.list_by_domain("isolated-vpc-dark").unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_root());
    assert_eq!(stored[0].cidr, cidr(order[0]));
}

#[test]
fn given_allocation_turns_non_routable_when_reconciling_then_moves_to_isolated_domain() {
    // Arrange
    let f = fixture();
    let created = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.3.0/24"), Tags::new())
        .unwrap();
    f.store
        .release_allocation("vpc-1", &cidr("10.0.0.0/16"))
        .unwrap();
    f.store
        .reserve_allocation(ExternalAllocation {
            resource_id: "vpc-1".into(),
            reserved_cidr: cidr("10.0.0.0/16"),
            routable: false,
            parent_prefix_id: "vpcs".into(),
        })
        .unwrap();

    // Act
    let moved = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.3.0/24"), Tags::new())
        .unwrap();

    // Assert
    assert_eq!(moved.prefix_id, created.prefix_id);
    assert_eq!(moved.action, UpsertAction::Updated);
    assert_eq!(moved.domain_id, "isolated-vpc-1");
    assert_eq!(f.store.domain_of(&created.prefix_id).unwrap(), "isolated-vpc-1");
    assert_eq!(f.store.list_by_domain("prod").unwrap().len(), 2);
    let prefix = f.store.get(&created.prefix_id).unwrap();
    assert!(!prefix.routable);
    assert_eq!(prefix.depth, 0);
}

#[test]
fn given_manual_prefix_at_derived_id_when_reconciling_then_rejected() {
    // Arrange
    let f = fixture();
    f.store
        .insert(
            NewPrefix::manual("prod", cidr("172.16.0.0/12"))
                .with_id(external_prefix_id("vpc-1", &cidr("10.0.4.0/24"))),
        )
        .unwrap();

    // Act
    let result = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.4.0/24"), Tags::new());

    // Assert
    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::InconsistentOrigin { .. }))
    ));
}

#[test]
fn given_overlapping_discoveries_when_reconciling_then_overlap_rejected() {
    // Arrange
    let f = fixture();
    f.reconciler
        .reconcile("vpc-1", &cidr("10.0.8.0/22"), Tags::new())
        .unwrap();

    // Act: a nested subnet would overlap its would-be sibling under "vpcs"
    let result = f
        .reconciler
        .reconcile("vpc-1", &cidr("10.0.9.0/24"), Tags::new());

    // Assert
    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::OverlapWithSibling { .. }))
    ));
}

#[test]
fn given_mixed_batch_when_reconciling_then_failures_skipped_and_rest_applied() {
    // Arrange
    let f = fixture();
    let subnet = |resource: &str, c: &str| DiscoveredSubnet {
        resource_id: resource.into(),
        cidr: c.into(),
        tags: Tags::new(),
    };
    let batch = vec![
        subnet("vpc-1", "10.0.1.0/24"),
        subnet("vpc-2", "172.16.0.0/24"),
        subnet("vpc-1", "10.0.2.0/24"),
        subnet("vpc-1", "not-a-cidr"),
        subnet("vpc-1", "10.0.1.0/24"),
        subnet("vpc-1", "10.0.3.1/24"),
    ];

    // Act
    let report = f.reconciler.reconcile_batch(batch);

    // Assert
    assert!(!report.is_clean());
    assert_eq!(report.applied.len(), 3);
    assert_eq!(report.count(UpsertAction::Created), 2);
    assert_eq!(report.count(UpsertAction::Unchanged), 1);
    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped.iter().any(|s| matches!(
        s.error,
        ApplicationError::Domain(DomainError::NoAllocationFound { .. })
    )));
    assert_eq!(
        report
            .skipped
            .iter()
            .filter(|s| matches!(s.error, ApplicationError::Domain(DomainError::InvalidCidr { .. })))
            .count(),
        2
    );
    assert_eq!(f.store.list_by_domain("prod").unwrap().len(), 4);
}

#[test]
fn given_invalid_resource_id_when_reconciling_then_invalid_identifier() {
    // Arrange
    let f = fixture();

    // Act
    let result = f
        .reconciler
        .reconcile("bad id", &cidr("10.0.1.0/24"), Tags::new());

    // Assert
    assert!(matches!(
        result,
        Err(ApplicationError::Domain(DomainError::InvalidIdentifier(_)))
    ));
}
