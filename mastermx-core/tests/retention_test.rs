//! Retention of snapshots and audit records

mod common;

use common::{sample_table, service};
use mastermx_core::{MasterService, Namespace, ObjectStore, VersionTag};

async fn save_n_times(service: &MasterService, clock: &mastermx_core::FixedClock, n: usize) {
    let mut version: Option<VersionTag> = None;
    for i in 0..n {
        let receipt = service
            .save_master(sample_table(1, i + 1), version.as_ref(), "ana", &format!("save {i}"))
            .await
            .unwrap();
        version = Some(receipt.new_version);
        clock.advance(chrono::Duration::minutes(1));
    }
}

#[tokio::test]
async fn test_prune_keeps_newest_and_archives_the_rest() {
    let (store, clock, service) = service();
    save_n_times(&service, &clock, 20).await;

    let snapshots = service.list_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 20);
    let newest: Vec<String> = snapshots.iter().take(15).map(|m| m.key.clone()).collect();

    let report = service
        .prune_older_than(Namespace::Snapshots, Some(15))
        .await
        .unwrap();
    assert_eq!(report.kept, newest);
    assert_eq!(report.archived.len(), 5);

    let remaining = store.keys("snapshots/").await;
    assert_eq!(remaining.len(), 15);
    for key in &newest {
        assert!(remaining.contains(key));
    }

    for (archived, original) in report.archived.iter().zip(&snapshots[15..]) {
        assert_eq!(archived.from, original.key);
        let day = original.last_modified.format("%Y-%m-%d");
        assert_eq!(archived.to, format!("archive/{day}/{}", original.key));
        // File name unchanged, content intact
        assert!(archived.to.ends_with(original.key.rsplit('/').next().unwrap()));
        assert_eq!(
            store.inner.get(&archived.to).await.unwrap().data.len() as u64,
            original.size
        );
    }
    assert_eq!(store.keys("archive/").await.len(), 5);

    // Running again changes nothing
    let again = service
        .prune_older_than(Namespace::Snapshots, Some(15))
        .await
        .unwrap();
    assert!(again.archived.is_empty());
    assert_eq!(again.kept, newest);
    assert_eq!(store.keys("archive/").await.len(), 5);
}

#[tokio::test]
async fn test_prune_audit_namespace_uses_configured_default() {
    let (store, clock, service) = service();
    save_n_times(&service, &clock, 3).await;

    let report = service
        .prune_older_than(Namespace::Audit, None)
        .await
        .unwrap();
    assert_eq!(report.kept.len(), 3);
    assert!(report.archived.is_empty());

    let report = service
        .prune_older_than(Namespace::Audit, Some(1))
        .await
        .unwrap();
    assert_eq!(report.archived.len(), 2);
    assert_eq!(store.keys("audit/").await.len(), 1);
    assert_eq!(service.audit_trail(None).await.unwrap().len(), 1);

    // Snapshots are a separate namespace
    assert_eq!(store.keys("snapshots/").await.len(), 3);
}

#[tokio::test]
async fn test_interrupted_relocation_is_completed() {
    let (store, clock, service) = service();
    save_n_times(&service, &clock, 3).await;
    let oldest = service.list_snapshots().await.unwrap().pop().unwrap();

    // A previous run copied the oldest snapshot but stopped before deleting it
    let day = oldest.last_modified.format("%Y-%m-%d");
    let destination = format!("archive/{day}/{}", oldest.key);
    store.inner.copy(&oldest.key, &destination).await.unwrap();

    let report = service
        .prune_older_than(Namespace::Snapshots, Some(2))
        .await
        .unwrap();
    assert_eq!(report.archived.len(), 1);
    assert_eq!(report.archived[0].to, destination);
    assert_eq!(store.keys("archive/").await, vec![destination]);
    assert_eq!(store.keys("snapshots/").await.len(), 2);
}

#[tokio::test]
async fn test_keep_larger_than_namespace_is_noop() {
    let (store, clock, service) = service();
    save_n_times(&service, &clock, 2).await;
    let report = service
        .prune_older_than(Namespace::Snapshots, Some(50))
        .await
        .unwrap();
    assert_eq!(report.kept.len(), 2);
    assert!(report.archived.is_empty());
    assert!(store.keys("archive/").await.is_empty());
}
