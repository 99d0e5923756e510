use std::sync::Arc;

use anyhow::Result;
use hsa_dispatch::{
    DeviceConfig, DeviceRegistry, DispatchError, HsaDevice, KernelArg, TeardownReport,
};
use hsa_dispatch_tests::fixtures::{brig_work_dir, device_config, launch, open_device};
use hsa_dispatch_tests::{MockKernel, MockRuntime};

fn populated(runtime: &Arc<MockRuntime>, config: DeviceConfig) -> Result<HsaDevice<MockRuntime>> {
    runtime.register_kernel("a", MockKernel::new(0xa, 8));
    runtime.register_kernel("b", MockKernel::new(0xb, 0));
    let first = brig_work_dir(b"BRIG-1");
    let second = brig_work_dir(b"BRIG-2");
    let mut device = open_device(runtime, config);
    device.resolve_program_and_kernel(
        &launch(1, 1, "a", first.path()).with_args(vec![KernelArg::u64(1)]),
    )?;
    device.resolve_program_and_kernel(&launch(1, 2, "b", first.path()))?;
    device.resolve_program_and_kernel(
        &launch(2, 1, "a", second.path()).with_args(vec![KernelArg::u64(2)]),
    )?;
    Ok(device)
}

#[test]
fn teardown_releases_everything_and_reports_counts() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    let device = populated(&runtime, DeviceConfig::default())?;
    assert_eq!(runtime.live().queues, 1);

    let report = device.teardown()?;
    assert_eq!(
        report,
        TeardownReport {
            executables: 3,
            signals: 3,
            kernarg_buffers: 2,
            code_objects: 2,
            queues: 1,
        }
    );
    assert!(runtime.live().is_empty(), "leaked: {:?}", runtime.live());
    assert!(runtime.ordering_violations().is_empty());
    Ok(())
}

#[test]
fn dropping_an_open_device_releases_its_resources() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    let device = populated(&runtime, device_config(1, 1))?;
    assert!(!runtime.live().is_empty());

    drop(device);
    assert!(runtime.live().is_empty(), "leaked: {:?}", runtime.live());
    assert_eq!(runtime.calls("hsa_queue_destroy"), 1);
    Ok(())
}

#[test]
fn teardown_continues_past_failures_and_returns_the_first() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    let device = populated(&runtime, DeviceConfig::default())?;
    runtime.fail_on("hsa_signal_destroy");

    let err = device.teardown().unwrap_err();
    assert!(err.to_string().contains("hsa_signal_destroy"));
    let live = runtime.live();
    assert_eq!(live.signals, 3);
    assert_eq!(live.executables, 0);
    assert_eq!(live.code_objects, 0);
    assert_eq!(live.queues, 0);
    Ok(())
}

#[test]
fn registry_lists_discovered_agents() -> Result<()> {
    let runtime = MockRuntime::new();
    let registry = DeviceRegistry::discover(&runtime)?;
    assert_eq!(registry.len(), 1);
    let agent = registry.get(0).expect("one agent");
    assert_eq!(agent.name, "mock-gfx801");
    assert!(registry.get(1).is_none());
    assert_eq!(registry, DeviceRegistry::from_agents(vec![runtime.agent()]));
    Ok(())
}

#[test]
fn non_power_of_two_queue_size_is_rejected_before_creation() {
    let runtime = Arc::new(MockRuntime::new());
    let config = DeviceConfig {
        queue_size: 6,
        ..DeviceConfig::default()
    };
    let err = HsaDevice::open(Arc::clone(&runtime), &runtime.agent(), 0, config).unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(runtime.calls("hsa_queue_create"), 0);
}

#[test]
fn queue_granted_with_odd_size_is_destroyed_and_rejected() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.grant_queue_size(6);

    let err = HsaDevice::open(Arc::clone(&runtime), &runtime.agent(), 0, DeviceConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Runtime {
            step: "hsa_queue_create",
            ..
        }
    ));
    assert_eq!(runtime.calls("hsa_queue_destroy"), 1);
    assert_eq!(runtime.live().queues, 0);
}

#[test]
fn failed_cleanup_of_rejected_queue_keeps_the_creation_error() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.grant_queue_size(6);
    runtime.fail_on("hsa_queue_destroy");

    let err = HsaDevice::open(Arc::clone(&runtime), &runtime.agent(), 0, DeviceConfig::default())
        .unwrap_err();
    assert!(err.to_string().contains("queue size 6 is not a power of two"));
    assert_eq!(runtime.calls("hsa_queue_destroy"), 1);
}
