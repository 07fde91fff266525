//! End-to-end sync scenarios against in-memory clusters.
//!
//! Each test seeds both sides, runs reconciles the way the worker pool
//! would, and asserts the converged state of both clusters, the recorded
//! events, and the write patterns (idempotence means a repeated reconcile
//! performs no API mutation).

use serde_json::json;

use enclave_common::config::SyncerConfig;
use enclave_common::constants::{
    APPLY_ANNOTATION, HOST_PV_ANNOTATION, MANAGED_BY_LABEL, OWNER_SET_UID_ANNOTATION,
    REASON_SYNC_COLLISION, SYNCER_FINALIZER,
};

use enclave_syncer::client::{ClusterClient, Propagation};
use enclave_syncer::runtime::Outcome;
use enclave_syncer::testing::{test_object, TestHarness};
use enclave_syncer::types::{gvks, ObjKey};

fn service_body() -> serde_json::Value {
    json!({
        "spec": {
            "type": "ClusterIP",
            "selector": {"app": "web"},
            "ports": [{"port": 80, "targetPort": 8080}],
        }
    })
}

/// S1: creating a virtual Service projects it with all three markers, and
/// the host-assigned ClusterIP flows back within one reconcile.
#[tokio::test]
async fn create_projects_service_with_markers() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);

    let key = ObjKey::namespaced("ns", "svc");
    harness.sync(&gvks::service(), &key).await.unwrap();

    let host_objects = harness.host_cluster.all(&gvks::service());
    assert_eq!(host_objects.len(), 1);
    let projected = &host_objects[0];
    assert_eq!(projected.metadata.name.as_deref(), Some("svc-x-ns-x-vc"));
    assert_eq!(projected.metadata.namespace.as_deref(), Some("host-ns"));

    // marker integrity: all three markers present
    let labels = projected.metadata.labels.as_ref().unwrap();
    assert_eq!(labels.get(MANAGED_BY_LABEL), Some(&"vc".to_string()));
    let annotations = projected.metadata.annotations.as_ref().unwrap();
    let v_obj = harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        annotations.get(OWNER_SET_UID_ANNOTATION),
        v_obj.metadata.uid.as_ref()
    );
    assert!(annotations.contains_key(APPLY_ANNOTATION));

    // the virtual object now carries the syncer finalizer
    assert!(v_obj
        .metadata
        .finalizers
        .as_ref()
        .unwrap()
        .iter()
        .any(|f| f == SYNCER_FINALIZER));

    // the host assigns a cluster IP; one reconcile surfaces it virtually
    harness
        .host_cluster
        .patch_merge(
            &gvks::service(),
            Some("host-ns"),
            "svc-x-ns-x-vc",
            &json!({"spec": {"clusterIP": "10.201.7.7"}}),
        )
        .await
        .unwrap();
    harness.sync(&gvks::service(), &key).await.unwrap();

    let v_obj = harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        v_obj.data.pointer("/spec/clusterIP"),
        Some(&json!("10.201.7.7"))
    );
}

/// Idempotence: a reconcile repeated with no external change performs no
/// API mutation on either side.
#[tokio::test]
async fn repeated_reconcile_is_a_noop() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);

    let key = ObjKey::namespaced("ns", "svc");
    harness.sync(&gvks::service(), &key).await.unwrap();
    harness.sync(&gvks::service(), &key).await.unwrap();

    let host_writes = harness.host_cluster.writes();
    let virtual_writes = harness.virtual_cluster.writes();

    harness.sync(&gvks::service(), &key).await.unwrap();

    assert_eq!(harness.host_cluster.writes(), host_writes);
    assert_eq!(harness.virtual_cluster.writes(), virtual_writes);
}

/// S2: a pre-existing host object without markers at the destination name
/// is never touched; the virtual object gets a SyncCollision warning.
#[tokio::test]
async fn collision_with_foreign_host_object_is_terminal() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);
    // someone else's object at exactly the translated name
    harness.host_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("host-ns"),
        "svc-x-ns-x-vc",
        json!({"spec": {"type": "ClusterIP"}}),
    )]);

    let key = ObjKey::namespaced("ns", "svc");
    let err = harness.sync(&gvks::service(), &key).await.unwrap_err();
    assert!(!err.is_retryable());

    let events = harness.virtual_cluster.events();
    assert!(events.iter().any(|e| e.reason == REASON_SYNC_COLLISION));

    // the foreign object was not mutated or deleted
    assert_eq!(harness.host_cluster.writes(), 0);
    assert!(harness.host_cluster.deletions().is_empty());
}

/// S3: a host-side change to a mutation-allowed field surfaces on the
/// virtual object and is not reverted by later reconciles.
#[tokio::test]
async fn host_mutations_of_allowed_fields_are_preserved() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);

    let key = ObjKey::namespaced("ns", "svc");
    harness.sync(&gvks::service(), &key).await.unwrap();

    // an external actor patches the host service
    harness
        .host_cluster
        .patch_merge(
            &gvks::service(),
            Some("host-ns"),
            "svc-x-ns-x-vc",
            &json!({"spec": {"externalIPs": ["203.0.113.9"]}}),
        )
        .await
        .unwrap();

    harness.sync(&gvks::service(), &key).await.unwrap();

    // visible on the virtual object
    let v_obj = harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        v_obj.data.pointer("/spec/externalIPs"),
        Some(&json!(["203.0.113.9"]))
    );

    // and never reverted host-side by later reconciles
    harness.sync(&gvks::service(), &key).await.unwrap();
    let host = harness.host_cluster.all(&gvks::service());
    assert_eq!(
        host[0].data.pointer("/spec/externalIPs"),
        Some(&json!(["203.0.113.9"]))
    );
}

/// S4: deleting the virtual object cascades to the host with foreground
/// propagation, and the finalizer is held until the host confirms absence.
#[tokio::test]
async fn deletion_cascades_foreground_and_holds_finalizer() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);

    let key = ObjKey::namespaced("ns", "svc");
    harness.sync(&gvks::service(), &key).await.unwrap();

    // tenant deletes; the finalizer keeps the object in deleting state
    harness
        .virtual_cluster
        .delete(&gvks::service(), Some("ns"), "svc", Propagation::Background)
        .await
        .unwrap();
    let v_obj = harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .unwrap();
    assert!(v_obj.metadata.deletion_timestamp.is_some());

    // first pass issues the host delete and holds the finalizer
    let outcome = harness.sync(&gvks::service(), &key).await.unwrap();
    assert!(matches!(outcome, Outcome::RequeueAfter(_)));
    let host_deletes: Vec<_> = harness
        .host_cluster
        .deletions()
        .into_iter()
        .filter(|(stored, _)| stored.contains("svc-x-ns-x-vc"))
        .collect();
    assert_eq!(host_deletes.len(), 1);
    assert_eq!(host_deletes[0].1, Propagation::Foreground);

    // host cache confirms absence; the finalizer releases and the virtual
    // object goes away
    let outcome = harness.sync(&gvks::service(), &key).await.unwrap();
    assert_eq!(outcome, Outcome::Synced);
    assert!(harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .is_none());
}

/// S5: a PV pinned to a host name via annotation survives a syncer
/// restart through the mapping snapshot.
#[tokio::test]
async fn mapping_store_survives_restart() {
    let mut config = SyncerConfig::default();
    config.sync.to_host.persistent_volumes.enabled = true;

    let harness = TestHarness::new(config.clone());
    let mut pv = test_object(
        &gvks::persistent_volume(),
        None,
        "data-vol",
        json!({"spec": {"capacity": {"storage": "10Gi"}, "accessModes": ["ReadWriteOnce"]}}),
    );
    pv.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(HOST_PV_ANNOTATION.to_string(), "pv-host-0001".to_string());
    harness.virtual_cluster.seed(vec![pv]);

    let key = ObjKey::cluster("data-vol");
    harness.sync(&gvks::persistent_volume(), &key).await.unwrap();

    let host_pvs = harness.host_cluster.all(&gvks::persistent_volume());
    assert_eq!(host_pvs.len(), 1);
    assert_eq!(host_pvs[0].metadata.name.as_deref(), Some("pv-host-0001"));

    // snapshot, then "restart": new harness over the surviving clusters
    harness
        .ctx
        .mappings
        .flush(harness.host_cluster.as_ref(), "host-ns")
        .await
        .unwrap();

    let restarted = TestHarness::with_clusters(
        config,
        harness.virtual_cluster.clone(),
        harness.host_cluster.clone(),
    );
    restarted
        .ctx
        .mappings
        .load(restarted.host_cluster.as_ref(), "host-ns")
        .await
        .unwrap();

    // reverse lookup works on the very first post-restart reconcile
    assert_eq!(
        restarted
            .ctx
            .mappings
            .get_by_host(&gvks::persistent_volume(), &ObjKey::cluster("pv-host-0001")),
        Some(ObjKey::cluster("data-vol"))
    );

    let writes_before = restarted.host_cluster.writes();
    restarted.sync(&gvks::persistent_volume(), &key).await.unwrap();
    // converged already: no duplicate host PV, no extra writes
    assert_eq!(restarted.host_cluster.all(&gvks::persistent_volume()).len(), 1);
    assert_eq!(restarted.host_cluster.writes(), writes_before);
}

/// Identity uniqueness: two virtual PVs claiming one host PV halt the
/// kind before any data is overwritten.
#[tokio::test]
async fn double_claim_of_host_identity_is_fatal() {
    let mut config = SyncerConfig::default();
    config.sync.to_host.persistent_volumes.enabled = true;
    let harness = TestHarness::new(config);

    let mut first = test_object(&gvks::persistent_volume(), None, "vol-a", json!({"spec": {}}));
    first
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(HOST_PV_ANNOTATION.to_string(), "pv-host-0001".to_string());
    let mut second = test_object(&gvks::persistent_volume(), None, "vol-b", json!({"spec": {}}));
    second
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(HOST_PV_ANNOTATION.to_string(), "pv-host-0001".to_string());
    harness.virtual_cluster.seed(vec![first, second]);

    harness
        .sync(&gvks::persistent_volume(), &ObjKey::cluster("vol-a"))
        .await
        .unwrap();
    let err = harness
        .sync(&gvks::persistent_volume(), &ObjKey::cluster("vol-b"))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}

/// S6: after a relist replays every key, reconciling all of them with no
/// external change causes no writes and no spurious deletions.
#[tokio::test]
async fn relist_replay_causes_no_spurious_mutations() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![
        test_object(&gvks::service(), Some("ns"), "svc", service_body()),
        test_object(
            &gvks::config_map(),
            Some("ns"),
            "app-config",
            json!({"data": {"k": "v"}}),
        ),
        test_object(
            &gvks::secret(),
            Some("ns"),
            "db-creds",
            json!({"type": "Opaque", "data": {"p": "eA=="}}),
        ),
    ]);

    let keys = [
        (gvks::service(), ObjKey::namespaced("ns", "svc")),
        (gvks::config_map(), ObjKey::namespaced("ns", "app-config")),
        (gvks::secret(), ObjKey::namespaced("ns", "db-creds")),
    ];
    for (gvk, key) in &keys {
        harness.sync(gvk, key).await.unwrap();
    }
    let host_writes = harness.host_cluster.writes();
    let virtual_writes = harness.virtual_cluster.writes();

    // a watch expiry re-enqueues every observed key
    for (gvk, key) in &keys {
        harness.sync(gvk, key).await.unwrap();
    }

    assert_eq!(harness.host_cluster.writes(), host_writes);
    assert_eq!(harness.virtual_cluster.writes(), virtual_writes);
    assert!(harness.host_cluster.deletions().is_empty());
}

/// Bidirectional label round-trip: labels set on either side converge to
/// both within one reconcile; deletions propagate.
#[tokio::test]
async fn labels_round_trip_both_directions() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![test_object(
        &gvks::service(),
        Some("ns"),
        "svc",
        service_body(),
    )]);
    let key = ObjKey::namespaced("ns", "svc");
    harness.sync(&gvks::service(), &key).await.unwrap();

    // host side sets a label
    harness
        .host_cluster
        .patch_merge(
            &gvks::service(),
            Some("host-ns"),
            "svc-x-ns-x-vc",
            &json!({"metadata": {"labels": {"zone": "b"}}}),
        )
        .await
        .unwrap();
    harness.sync(&gvks::service(), &key).await.unwrap();

    let v_obj = harness
        .virtual_cluster
        .get(&gvks::service(), Some("ns"), "svc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        v_obj.metadata.labels.as_ref().unwrap().get("zone"),
        Some(&"b".to_string())
    );

    // virtual side sets a label
    harness
        .virtual_cluster
        .patch_merge(
            &gvks::service(),
            Some("ns"),
            "svc",
            &json!({"metadata": {"labels": {"team": "a"}}}),
        )
        .await
        .unwrap();
    harness.sync(&gvks::service(), &key).await.unwrap();

    let host = harness.host_cluster.all(&gvks::service());
    assert_eq!(
        host[0].metadata.labels.as_ref().unwrap().get("team"),
        Some(&"a".to_string())
    );

    // virtual deletion propagates to the host
    harness
        .virtual_cluster
        .patch_merge(
            &gvks::service(),
            Some("ns"),
            "svc",
            &json!({"metadata": {"labels": {"team": null}}}),
        )
        .await
        .unwrap();
    harness.sync(&gvks::service(), &key).await.unwrap();

    let host = harness.host_cluster.all(&gvks::service());
    assert!(!host[0]
        .metadata
        .labels
        .as_ref()
        .unwrap()
        .contains_key("team"));
}

/// Cross-kind dependencies: a pod waits for its ConfigMap to be projected
/// and then references it by translated name.
#[tokio::test]
async fn pods_wait_for_their_dependencies() {
    let harness = TestHarness::new(SyncerConfig::default());
    harness.virtual_cluster.seed(vec![
        test_object(
            &gvks::pod(),
            Some("ns"),
            "web-0",
            json!({
                "spec": {
                    "containers": [{"name": "app", "image": "app:v1"}],
                    "volumes": [{"name": "cfg", "configMap": {"name": "app-config"}}],
                }
            }),
        ),
        test_object(
            &gvks::config_map(),
            Some("ns"),
            "app-config",
            json!({"data": {"k": "v"}}),
        ),
    ]);

    let pod_key = ObjKey::namespaced("ns", "web-0");

    // dependency absent on the host: retry-after, no pod created
    let outcome = harness.sync(&gvks::pod(), &pod_key).await.unwrap();
    assert!(matches!(outcome, Outcome::RequeueAfter(_)));
    assert!(harness.host_cluster.all(&gvks::pod()).is_empty());

    // project the config map, then the pod follows
    harness
        .sync(&gvks::config_map(), &ObjKey::namespaced("ns", "app-config"))
        .await
        .unwrap();
    harness.sync(&gvks::pod(), &pod_key).await.unwrap();

    let host_pods = harness.host_cluster.all(&gvks::pod());
    assert_eq!(host_pods.len(), 1);
    assert_eq!(
        host_pods[0].data.pointer("/spec/volumes/0/configMap/name"),
        Some(&json!("app-config-x-ns-x-vc"))
    );
}

/// Virtualward node projection: only nodes running this cluster's pods
/// appear, and they withdraw when the pods leave.
#[tokio::test]
async fn nodes_project_only_while_hosting_our_pods() {
    let mut config = SyncerConfig::default();
    config.sync.from_host.nodes.enabled = true;
    let harness = TestHarness::new(config);

    let mut host_pod = test_object(
        &gvks::pod(),
        Some("host-ns"),
        "web-0-x-ns-x-vc",
        json!({"spec": {"nodeName": "node-a", "containers": []}}),
    );
    host_pod
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(MANAGED_BY_LABEL.to_string(), "vc".to_string());

    harness.host_cluster.seed(vec![
        test_object(
            &gvks::node(),
            None,
            "node-a",
            json!({"status": {"capacity": {"cpu": "8"}}}),
        ),
        host_pod,
    ]);

    let key = ObjKey::cluster("node-a");
    harness.sync(&gvks::node(), &key).await.unwrap();

    let virtual_nodes = harness.virtual_cluster.all(&gvks::node());
    assert_eq!(virtual_nodes.len(), 1);
    assert_eq!(
        virtual_nodes[0].data.pointer("/status/capacity/cpu"),
        Some(&json!("8"))
    );

    // last pod leaves the node: the projection withdraws
    harness
        .host_cluster
        .delete(&gvks::pod(), Some("host-ns"), "web-0-x-ns-x-vc", Propagation::Background)
        .await
        .unwrap();
    harness.sync(&gvks::node(), &key).await.unwrap();
    assert!(harness.virtual_cluster.all(&gvks::node()).is_empty());
}

/// Mirrored PVs are host-authoritative: virtual edits revert on the next
/// reconcile.
#[tokio::test]
async fn mirrored_pvs_revert_virtual_edits() {
    // default config mirrors PVs (toHost sync disabled)
    let harness = TestHarness::new(SyncerConfig::default());
    harness.host_cluster.seed(vec![test_object(
        &gvks::persistent_volume(),
        None,
        "pv-1",
        json!({"spec": {"capacity": {"storage": "10Gi"}}}),
    )]);

    let key = ObjKey::cluster("pv-1");
    harness.sync(&gvks::persistent_volume(), &key).await.unwrap();
    assert_eq!(harness.virtual_cluster.all(&gvks::persistent_volume()).len(), 1);

    // a tenant edits the mirrored object
    harness
        .virtual_cluster
        .patch_merge(
            &gvks::persistent_volume(),
            None,
            "pv-1",
            &json!({"spec": {"capacity": {"storage": "999Gi"}}}),
        )
        .await
        .unwrap();
    harness.sync(&gvks::persistent_volume(), &key).await.unwrap();

    let mirrored = harness.virtual_cluster.all(&gvks::persistent_volume());
    assert_eq!(
        mirrored[0].data.pointer("/spec/capacity/storage"),
        Some(&json!("10Gi"))
    );
}

/// Orphaned host projections (virtual object gone) are garbage-collected;
/// foreign host objects are ignored.
#[tokio::test]
async fn orphans_are_collected_and_foreign_objects_ignored() {
    let harness = TestHarness::new(SyncerConfig::default());

    // an orphan carrying our markers
    let mut orphan = test_object(
        &gvks::service(),
        Some("host-ns"),
        "gone-x-ns-x-vc",
        service_body(),
    );
    harness.translator().apply_markers(&mut orphan, "stale-uid");
    // a foreign object that happens to parse like one of ours
    let foreign = test_object(
        &gvks::service(),
        Some("host-ns"),
        "other-x-ns-x-vc",
        service_body(),
    );
    harness.host_cluster.seed(vec![orphan, foreign]);

    harness
        .sync(&gvks::service(), &ObjKey::namespaced("ns", "gone"))
        .await
        .unwrap();
    harness
        .sync(&gvks::service(), &ObjKey::namespaced("ns", "other"))
        .await
        .unwrap();

    let remaining = harness.host_cluster.all(&gvks::service());
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].metadata.name.as_deref(),
        Some("other-x-ns-x-vc")
    );
}
