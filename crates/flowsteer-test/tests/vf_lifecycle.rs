//! SR-IOV VF lifecycle tests

use flowsteer::{
    FlowsteerConfig, FlowsteerError, MirrorStatus, Orchestrator, VfPhase, VfPollConfig, VfState,
    WarningKind,
};
use flowsteer_test::{devices, init_test_logging, ScratchDirs, TEST_IFACE};
use pretty_assertions::assert_eq;

fn config(dirs: &ScratchDirs) -> FlowsteerConfig {
    FlowsteerConfig {
        lock_dir: dirs.lock_dir(),
        state_dir: dirs.state_dir(),
        vf_poll: VfPollConfig {
            attempts: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..Default::default()
    }
}

/// Scenario: enable 2 VFs twice.
///
/// The second call finds the count already right, rewrites nothing and
/// returns the same interfaces.
#[tokio::test]
async fn test_enable_twice_is_stable() {
    init_test_logging();
    let dirs = ScratchDirs::new();
    let config = config(&dirs);
    let nic = devices::sriov_nic(8, 2);
    let orch = Orchestrator::new(&nic, &config);

    let first = orch.enable_vfs(TEST_IFACE, 2, None).await.unwrap();
    let second = orch.enable_vfs(TEST_IFACE, 2, None).await.unwrap();

    assert_eq!(first.names(), vec!["eth0v0", "eth0v1"]);
    assert_eq!(first.names(), second.names());
    assert_eq!(second.phase, VfPhase::Active);
    assert!(second.entries.iter().all(|v| v.state == VfState::Up));
    assert_eq!(nic.sriov_writes(), vec![2]);
    assert_eq!(nic.num_vfs(), 2);
    assert_eq!(
        nic.link_up_names(),
        vec!["eth0v0", "eth0v1", "eth0v0", "eth0v1"]
    );
}

#[tokio::test]
async fn test_resize_and_disable() {
    init_test_logging();
    let dirs = ScratchDirs::new();
    let config = config(&dirs);
    let nic = devices::sriov_nic(8, 0);
    let orch = Orchestrator::new(&nic, &config);

    orch.enable_vfs(TEST_IFACE, 4, None).await.unwrap();
    let set = orch.enable_vfs(TEST_IFACE, 1, None).await.unwrap();
    assert_eq!(set.names(), vec!["eth0v0"]);
    assert_eq!(nic.sriov_writes(), vec![4, 0, 1]);

    let set = orch.disable_vfs(TEST_IFACE).await.unwrap();
    assert_eq!(set.phase, VfPhase::Absent);
    assert_eq!(nic.num_vfs(), 0);

    nic.reset_history();
    orch.disable_vfs(TEST_IFACE).await.unwrap();
    assert_eq!(nic.mutation_count(), 0);
}

#[tokio::test]
async fn test_slow_materialization_times_out() {
    init_test_logging();
    let dirs = ScratchDirs::new();
    let config = config(&dirs);
    let nic = devices::sriov_nic(8, 50);
    let orch = Orchestrator::new(&nic, &config);

    let err = orch.enable_vfs(TEST_IFACE, 2, None).await.unwrap_err();
    assert!(matches!(err, FlowsteerError::VfMaterializationTimeout { vf_index: 0, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_count_limits() {
    init_test_logging();
    let dirs = ScratchDirs::new();
    let config = config(&dirs);

    let nic = devices::sriov_nic(4, 0);
    let orch = Orchestrator::new(&nic, &config);
    let err = orch.enable_vfs(TEST_IFACE, 5, None).await.unwrap_err();
    assert!(matches!(err, FlowsteerError::VfCountExceedsMax { max: 4, .. }));

    let plain = devices::xdp_nic();
    let orch = Orchestrator::new(&plain, &config);
    let err = orch.enable_vfs(TEST_IFACE, 1, None).await.unwrap_err();
    assert!(matches!(err, FlowsteerError::SriovUnsupported { .. }));
    assert_eq!(plain.mutation_count(), 0);
}

#[tokio::test]
async fn test_mirror_is_capability_gated() {
    init_test_logging();
    let dirs = ScratchDirs::new();
    let config = config(&dirs);

    let nic = devices::sriov_nic(4, 0);
    let orch = Orchestrator::new(&nic, &config);
    let set = orch.enable_vfs(TEST_IFACE, 2, Some((0, 1))).await.unwrap();
    assert!(matches!(set.mirror, Some(MirrorStatus::Unsupported { .. })));
    assert_eq!(set.warnings[0].kind, WarningKind::MirrorUnsupported);
    assert_eq!(nic.num_vfs(), 2);

    let capable = devices::sriov_nic(4, 0).with_mirror_support();
    let orch = Orchestrator::new(&capable, &config);
    let set = orch.enable_vfs(TEST_IFACE, 2, Some((0, 1))).await.unwrap();
    assert_eq!(
        set.mirror,
        Some(MirrorStatus::Applied {
            src: "eth0v0".to_string(),
            dst: "eth0v1".to_string(),
        })
    );
}
