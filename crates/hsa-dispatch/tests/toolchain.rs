#![cfg(unix)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use hsa_dispatch::toolchain::{stage_path, BRIG_STAGE, HSAIL_STAGE};
use hsa_dispatch::{DeviceConfig, DispatchError, KernelArg};
use hsa_dispatch_tests::fixtures::{
    bitcode_work_dir, counting_toolchain, launch, open_device, tool_invocations,
    unreachable_toolchain,
};
use hsa_dispatch_tests::{MockKernel, MockRuntime};

// Writing a script while another test forks can make exec fail with ETXTBSY.
static SCRIPT_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toolchain_runs_once_per_work_dir_across_dispatches_and_devices() -> Result<()> {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let tools = tempfile::tempdir()?;
    let work = bitcode_work_dir();
    let config = DeviceConfig {
        toolchain: counting_toolchain(tools.path()),
        ..DeviceConfig::default()
    };
    let launch = launch(1, 1, "k", work.path()).with_args(vec![KernelArg::u32(9)]);

    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("k", MockKernel::new(0x1, 4));
    let mut first = open_device(&runtime, config.clone());
    first.resolve_program_and_kernel(&launch)?;
    first.resolve_program_and_kernel(&launch)?;
    assert_eq!(tool_invocations(tools.path()), ["llc", "asm"]);
    assert!(stage_path(work.path(), HSAIL_STAGE).exists());
    assert!(stage_path(work.path(), BRIG_STAGE).exists());

    let other_runtime = Arc::new(MockRuntime::new());
    other_runtime.register_kernel("k", MockKernel::new(0x1, 4));
    let mut second = open_device(&other_runtime, config);
    second.resolve_program_and_kernel(&launch)?;

    assert_eq!(tool_invocations(tools.path()), ["llc", "asm"]);
    assert_eq!(runtime.finalized_modules(), vec![b"BRIG".to_vec()]);
    assert_eq!(other_runtime.finalized_modules(), vec![b"BRIG".to_vec()]);

    first.teardown()?;
    second.teardown()?;
    Ok(())
}

#[test]
fn missing_tool_is_a_recoverable_error_that_caches_nothing() -> Result<()> {
    let _guard = SCRIPT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let tools = tempfile::tempdir()?;
    let work = bitcode_work_dir();
    let config = DeviceConfig {
        toolchain: unreachable_toolchain(tools.path()),
        ..DeviceConfig::default()
    };
    let runtime = Arc::new(MockRuntime::new());
    let mut device = open_device(&runtime, config);

    let err = device
        .resolve_program_and_kernel(&launch(1, 1, "k", work.path()))
        .unwrap_err();
    match &err {
        DispatchError::Toolchain { status, .. } => assert_eq!(*status, None),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_fatal());
    assert_eq!(device.cache_stats().programs, 0);
    assert_eq!(runtime.calls("hsa_ext_program_create"), 0);
    assert!(!stage_path(work.path(), BRIG_STAGE).exists());

    device.teardown()?;
    Ok(())
}

#[test]
fn missing_bitcode_is_an_io_error() -> Result<()> {
    let work = tempfile::tempdir()?;
    let runtime = Arc::new(MockRuntime::new());
    let mut device = open_device(&runtime, DeviceConfig::default());

    let err = device
        .resolve_program_and_kernel(&launch(1, 1, "k", work.path()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::Io { .. }));
    assert!(!err.is_fatal());
    assert_eq!(runtime.calls("hsa_ext_program_create"), 0);

    device.teardown()?;
    Ok(())
}
