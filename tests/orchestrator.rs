//! Integration tests for the deployment orchestrator: fresh deploys,
//! health-gated redeploys, wake/stop transitions and idle reaping, all
//! against the in-memory fakes in `common`.

mod common;

use common::{deploy, world};
use slipway::deploy::DeployRequest;
use slipway::error::Error;
use slipway::reaper::IdleReaper;
use slipway::store::DeploymentStatus;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_deploy_creates_running_deployment() {
    let w = world(45000, 45100);

    let record = w
        .orchestrator
        .deploy(DeployRequest {
            source_path: PathBuf::from("/tmp"),
            project_name: "My Demo App".to_string(),
            env: Some(HashMap::from([(
                "DATABASE_URL".to_string(),
                "postgres://x".to_string(),
            )])),
        })
        .await
        .unwrap();

    // subdomain: slug + 6-char suffix
    let (slug, suffix) = record.subdomain.rsplit_once('-').unwrap();
    assert_eq!(slug, "my-demo-app");
    assert_eq!(suffix.len(), 6);

    assert_eq!(record.status, DeploymentStatus::Running);
    assert!((45000..45100).contains(&record.host_port));
    assert_eq!(record.container_name, format!("slipway-{}", record.subdomain));

    // the container exists, runs, and got the env + port binding
    assert!(w.runtime.is_running(&record.container_id));
    let spec = w.runtime.spec_of(&record.container_id).unwrap();
    assert_eq!(spec.host_port, record.host_port);
    assert!(spec.env.contains(&"DATABASE_URL=postgres://x".to_string()));

    // edge got the vhost, cache got the write-through
    assert_eq!(
        w.edge.registrations(),
        vec![(record.subdomain.clone(), record.host_port)]
    );
    let snapshot = w.cache.get_snapshot(&record.id).unwrap();
    assert_eq!(snapshot.container_id, record.container_id);

    // and the store agrees
    let stored = w.store.get_by_subdomain(&record.subdomain).unwrap().unwrap();
    assert_eq!(stored.id, record.id);
}

#[tokio::test]
async fn test_deploy_host_ports_pairwise_distinct() {
    let w = world(45200, 45300);

    let mut ports = std::collections::HashSet::new();
    for i in 0..5 {
        let record = deploy(&w, &format!("app {}", i)).await;
        assert!(
            ports.insert(record.host_port),
            "port {} handed out twice",
            record.host_port
        );
    }
}

#[tokio::test]
async fn test_deploy_validation() {
    let w = world(45350, 45380);

    let err = w
        .orchestrator
        .deploy(DeployRequest {
            source_path: PathBuf::from("/tmp"),
            project_name: "   ".to_string(),
            env: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_deploy_start_failure_persists_nothing() {
    let w = world(45400, 45500);

    w.runtime.set_fail_next_start();
    let err = w
        .orchestrator
        .deploy(DeployRequest {
            source_path: PathBuf::from("/tmp"),
            project_name: "doomed".to_string(),
            env: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Runtime(_)));
    // no record persisted, no container left behind
    assert!(w.store.list_running().unwrap().is_empty());
    assert_eq!(w.runtime.count(), 0);
}

#[tokio::test]
async fn test_deploy_edge_failure_is_nonfatal() {
    let w = world(45550, 45650);
    w.edge.fail.store(true, std::sync::atomic::Ordering::SeqCst);

    let record = deploy(&w, "edgeless").await;

    assert_eq!(record.status, DeploymentStatus::Running);
    assert!(w.runtime.is_running(&record.container_id));
    assert!(w.edge.registrations().is_empty());
}

#[tokio::test]
async fn test_redeploy_swaps_revision() {
    let w = world(45700, 45800);
    let before = deploy(&w, "swapper").await;

    let new_env = HashMap::from([("FLAG".to_string(), "on".to_string())]);
    let after = w
        .orchestrator
        .redeploy(&before.id, Some(new_env.clone()))
        .await
        .unwrap();

    // a genuinely new revision under the same subdomain
    assert_eq!(after.subdomain, before.subdomain);
    assert_ne!(after.container_id, before.container_id);
    assert_ne!(after.image, before.image);
    assert_ne!(after.host_port, before.host_port);
    assert_eq!(after.env.as_ref().unwrap(), &new_env);
    assert_eq!(after.status, DeploymentStatus::Running);

    // new revision serves, old one is gone along with its image
    assert!(w.runtime.is_running(&after.container_id));
    assert!(w.runtime.was_removed(&before.container_id));
    assert!(w.runtime.removed_images().contains(&before.image));

    // the env image was layered over the stored base
    assert_eq!(w.builder.layered(), vec![(before.image.clone(), new_env)]);

    // edge re-registered for the new port, cache snapshot refreshed
    assert_eq!(
        w.edge.registrations().last().unwrap(),
        &(after.subdomain.clone(), after.host_port)
    );
    assert_eq!(
        w.cache.get_snapshot(&after.id).unwrap().container_id,
        after.container_id
    );
}

#[tokio::test]
async fn test_redeploy_health_gate_failure_keeps_old_revision() {
    let w = world(45850, 45950);
    let before = deploy(&w, "gated").await;

    w.runtime.set_unhealthy_next();
    let err = w.orchestrator.redeploy(&before.id, None).await.unwrap_err();
    assert!(matches!(err, Error::HealthCheck { .. }));

    // the record is unchanged from before the attempt
    let record = w.store.get(&before.id).unwrap().unwrap();
    assert_eq!(record.container_id, before.container_id);
    assert_eq!(record.image, before.image);
    assert_eq!(record.host_port, before.host_port);
    assert_eq!(record.status, DeploymentStatus::Running);

    // the old container still serves; the rejected one and its image are gone
    assert!(w.runtime.is_running(&before.container_id));
    assert_eq!(w.runtime.count(), 1);
    assert_eq!(w.runtime.removed_containers().len(), 1);
    assert_eq!(w.runtime.removed_images().len(), 1);
    assert!(!w.runtime.removed_images().contains(&before.image));
}

#[tokio::test]
async fn test_redeploy_unknown_id_is_not_found() {
    let w = world(46000, 46030);
    let err = w.orchestrator.redeploy("nope", None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = w.orchestrator.wake("nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_stop_and_wake_round_trip() {
    let w = world(46050, 46150);
    let record = deploy(&w, "sleeper").await;

    let stopped = w.orchestrator.stop(&record.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(!w.runtime.is_running(&record.container_id));

    // stopping refreshed the snapshot instead of leaving a stale "running"
    assert_eq!(
        w.cache.get_snapshot(&record.id).unwrap().status,
        DeploymentStatus::Stopped
    );

    let woken = w.orchestrator.wake(&record.id).await.unwrap();
    assert_eq!(woken.status, DeploymentStatus::Running);
    assert!(w.runtime.is_running(&record.container_id));
    assert_eq!(
        w.cache.get_snapshot(&record.id).unwrap().status,
        DeploymentStatus::Running
    );
}

#[tokio::test]
async fn test_wake_is_idempotent_when_running() {
    let w = world(46200, 46300);
    let record = deploy(&w, "awake").await;

    let woken = w.orchestrator.wake(&record.id).await.unwrap();
    assert_eq!(woken.container_id, record.container_id);
    assert!(w.runtime.is_running(&record.container_id));
}

#[tokio::test]
async fn test_reaper_stops_idle_deployments() {
    let w = world(46350, 46450);
    let record = deploy(&w, "idler").await;

    let (_tx, rx) = watch::channel(false);
    let reaper = IdleReaper::new(
        Arc::clone(&w.store),
        Arc::clone(&w.cache),
        Arc::clone(&w.orchestrator),
        Duration::ZERO, // everything is instantly idle
        Duration::from_secs(60),
        rx,
    );
    reaper.sweep().await;

    let stored = w.store.get(&record.id).unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Stopped);
    assert!(!w.runtime.is_running(&record.container_id));
    assert_eq!(
        w.cache.get_snapshot(&record.id).unwrap().status,
        DeploymentStatus::Stopped
    );
}

#[tokio::test]
async fn test_reaper_leaves_active_deployments_alone() {
    let w = world(46500, 46600);
    let record = deploy(&w, "busy").await;

    let (_tx, rx) = watch::channel(false);
    let reaper = IdleReaper::new(
        Arc::clone(&w.store),
        Arc::clone(&w.cache),
        Arc::clone(&w.orchestrator),
        Duration::from_secs(600),
        Duration::from_secs(60),
        rx,
    );
    reaper.sweep().await;

    let stored = w.store.get(&record.id).unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Running);
    assert!(w.runtime.is_running(&record.container_id));
}

#[tokio::test]
async fn test_reaper_continues_past_failures() {
    let w = world(46650, 46750);
    let a = deploy(&w, "first").await;
    let b = deploy(&w, "second").await;

    w.runtime.set_fail_stop(&a.container_id);

    let (_tx, rx) = watch::channel(false);
    let reaper = IdleReaper::new(
        Arc::clone(&w.store),
        Arc::clone(&w.cache),
        Arc::clone(&w.orchestrator),
        Duration::ZERO,
        Duration::from_secs(60),
        rx,
    );
    reaper.sweep().await;

    // the failed stop on `a` did not abort the rest of the sweep
    let stored_a = w.store.get(&a.id).unwrap().unwrap();
    assert_eq!(stored_a.status, DeploymentStatus::Running);
    let stored_b = w.store.get(&b.id).unwrap().unwrap();
    assert_eq!(stored_b.status, DeploymentStatus::Stopped);
    assert!(!w.runtime.is_running(&b.container_id));
}

#[tokio::test]
async fn test_cache_miss_matches_store_lookup() {
    let w = world(46800, 46900);
    let record = deploy(&w, "cached").await;

    // blow the cache away, then re-populate through the read path
    w.cache.delete(&slipway::cache::LookupCache::subdomain_key(
        &record.subdomain,
    ));
    w.cache.invalidate_snapshot(&record.id);
    assert!(w.cache.get_snapshot(&record.id).is_none());

    let stored = w.store.get_by_subdomain(&record.subdomain).unwrap().unwrap();
    w.cache.put_record(&stored);

    let snapshot = w.cache.get_snapshot(&record.id).unwrap();
    assert_eq!(snapshot.id, stored.id);
    assert_eq!(snapshot.subdomain, stored.subdomain);
    assert_eq!(snapshot.container_id, stored.container_id);
    assert_eq!(snapshot.host_port, stored.host_port);
    assert_eq!(snapshot.status, stored.status);
    assert_eq!(snapshot.last_active_at, stored.last_active_at);
}
