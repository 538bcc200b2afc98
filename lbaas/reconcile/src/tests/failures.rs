use super::*;
use bigip_lbaas_core::DeviceError;

#[tokio::test]
async fn device_failure_aborts_remaining_steps() {
    let h = harness(Options::default());
    let device = &h.devices[0];
    device.fail_next(
        is_create(ObjectKind::Member),
        DeviceError::Unknown("connection reset".into()),
    );

    let service = mk_service(Status::PendingCreate);
    let report = h.reconciler.reconcile(service.clone()).await.unwrap();

    assert_eq!(report.errors.len(), 1);
    let error = &report.errors[0];
    assert_eq!(error.device, "bigip-1");
    assert_eq!(error.step, Step::Member);
    assert_eq!(error.to_string(), "member failed on bigip-1: device fault: connection reset");

    // Entities before the failure completed; nothing after it was attempted.
    assert_eq!(
        report.outcomes,
        vec![
            (EntityRef::Pool("pool-1".into()), Outcome::Active),
            (
                EntityRef::Monitor {
                    pool: "pool-1".into(),
                    monitor: "mon-1".into(),
                },
                Outcome::Active
            ),
        ]
    );
    assert!(!device.contains(&vip_key()));
    assert!(members_of(device).is_empty());

    // Nothing is rolled back, and the next pass picks up where this one stopped.
    let report = h.reconciler.reconcile(service.clone()).await.unwrap();
    assert!(report.is_complete(), "{:?}", report.errors);
    assert_eq!(report.outcomes.len(), all_entities(&service).len());
    assert!(device.contains(&vip_key()));
}

#[tokio::test]
async fn errors_are_collected_per_device() {
    let h = harness(Options {
        devices: 2,
        ha_mode: HaMode::Pair,
        sync_mode: SyncMode::Replication,
        ..Options::default()
    });
    h.devices[1].fail_next(
        is_create(ObjectKind::Pool),
        DeviceError::Unknown("license expired".into()),
    );

    let report = h
        .reconciler
        .reconcile(mk_service(Status::PendingCreate))
        .await
        .unwrap();

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].device, "bigip-2");
    assert_eq!(report.errors[0].step, Step::Pool);
    // The first device was configured completely, but nothing completed everywhere.
    assert!(h.devices[0].contains(&vip_key()));
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn pool_still_in_use_is_not_destroyed() {
    let h = harness(Options::default());
    let device = &h.devices[0];
    let service = mk_service(Status::PendingCreate);
    h.reconciler.reconcile(service.clone()).await.unwrap();

    device.fail_next(
        is_delete(ObjectKind::Pool),
        DeviceError::InUse("pool /uuid_t1/uuid_pool-1".into()),
    );
    let report = h
        .reconciler
        .reconcile(with_status(service, Status::PendingDelete))
        .await
        .unwrap();

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].step, Step::Pool);
    assert_eq!(
        report.outcome(&EntityRef::Vip("vip-1".into())),
        Some(Outcome::Destroyed)
    );
    assert_eq!(report.outcome(&EntityRef::Pool("pool-1".into())), None);
    // The partition is only torn down once the pool is gone.
    assert!(device.has_folder("uuid_t1"));
}

#[tokio::test]
async fn partition_failure_is_reported_as_partition_step() {
    let h = harness(Options::default());
    h.devices[0].fail_next(
        |c| matches!(c, Call::CreateFolder(_)),
        DeviceError::Unknown("read-only".into()),
    );

    let report = h
        .reconciler
        .reconcile(mk_service(Status::PendingCreate))
        .await
        .unwrap();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].step, Step::Partition);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn vip_requires_a_gateway() {
    let h = harness(Options::default());
    let mut service = mk_service(Status::PendingCreate);
    service
        .subnets
        .get_mut(&SubnetId::from("sn-vip"))
        .expect("vip subnet")
        .gateway_ip = None;

    let report = h.reconciler.reconcile(service).await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].step, Step::Gateway);
    assert!(matches!(
        report.errors[0].source,
        StepError::SelfIp(SelfIpError::NoGateway(_))
    ));
    assert_eq!(report.outcome(&EntityRef::Vip("vip-1".into())), None);
}

#[tokio::test]
async fn missing_network_fails_the_self_ip_step() {
    let h = harness(Options::default());
    let mut service = mk_service(Status::PendingCreate);
    service.networks.remove(&NetworkId::from("net-members"));

    let report = h.reconciler.reconcile(service).await.unwrap();
    assert_eq!(report.errors[0].step, Step::SelfIp);
    assert!(matches!(
        report.errors[0].source,
        StepError::UnknownNetwork(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_sync_fails_the_pass() {
    let h = harness(Options {
        devices: 2,
        ha_mode: HaMode::Pair,
        ..Options::default()
    });
    h.devices[0].fail_syncs(4);

    let error = h
        .reconciler
        .reconcile(mk_service(Status::PendingCreate))
        .await
        .unwrap_err();
    assert_eq!(error.group, "dg-1");
    assert_eq!(error.attempts, 4);

    // The changes are still synced by the next pass, even though it changes nothing itself.
    h.reconciler
        .reconcile(mk_service(Status::PendingCreate))
        .await
        .unwrap();
    assert_eq!(
        h.devices[0]
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Sync { .. }))
            .count(),
        5
    );
}
