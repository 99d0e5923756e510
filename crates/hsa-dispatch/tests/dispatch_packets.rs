use std::sync::Arc;

use anyhow::Result;
use hsa_dispatch::packet::{self, PacketBody, PACKET_TYPE_KERNEL_DISPATCH};
use hsa_dispatch::runtime::{SignalCondition, WaitState};
use hsa_dispatch::{
    Command, DeviceConfig, DispatchError, HostCommand, HsaRuntime, KernelArg, MemObject,
    Residency, UnimplementedFeature,
};
use hsa_dispatch_tests::fixtures::{brig_work_dir, launch, open_device};
use hsa_dispatch_tests::{MockKernel, MockRuntime};

fn scale_kernel() -> MockKernel {
    MockKernel::new(0xfeed, 20)
        .with_group_segment_size(64)
        .with_private_segment_size(32)
}

#[test]
fn packet_and_kernarg_match_the_launch() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("scale", scale_kernel());
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());
    let input = Arc::new(MemObject::new().with_device_address(0, 0x1000));
    let launch = launch(1, 1, "scale", work.path())
        .with_groups(&[4], &[16])
        .with_args(vec![
            KernelArg::i32(7),
            KernelArg::buffer(input),
            KernelArg::local(256),
        ]);

    let handle = device.resolve_program_and_kernel(&launch)?;
    assert_eq!(handle.group_segment_size, 320);
    assert_eq!(handle.private_segment_size, 32);
    assert_eq!(handle.completion_value, 0);

    let observed = runtime.observed_packets();
    assert_eq!(observed.len(), 1);
    let seen = &observed[0];
    assert_eq!(seen.write_index, handle.write_index);
    assert_eq!(seen.packet.packet_type(), PACKET_TYPE_KERNEL_DISPATCH);
    assert_eq!(seen.packet.header, packet::kernel_dispatch_header());
    assert_eq!(seen.packet.dimensions(), 1);
    assert_eq!(
        [
            seen.packet.workgroup_size_x,
            seen.packet.workgroup_size_y,
            seen.packet.workgroup_size_z
        ],
        [16, 1, 1]
    );
    assert_eq!(
        [
            seen.packet.grid_size_x,
            seen.packet.grid_size_y,
            seen.packet.grid_size_z
        ],
        [64, 1, 1]
    );
    assert_eq!(seen.packet.group_segment_size, 320);
    assert_eq!(seen.packet.private_segment_size, 32);
    assert_eq!(seen.packet.kernel_object, 0xfeed);
    assert_eq!(seen.packet.kernarg_address, handle.kernarg_address);
    assert_ne!(seen.packet.completion_signal, 0);

    let mut expected = Vec::new();
    expected.extend_from_slice(&7i32.to_le_bytes());
    expected.extend_from_slice(&0x1000u64.to_le_bytes());
    expected.extend_from_slice(&0u64.to_le_bytes());
    assert_eq!(seen.kernarg, expected);
    assert!(runtime.ordering_violations().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn three_dimensional_launch_sets_every_axis() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("grid", MockKernel::new(0x3d, 0));
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());

    device.resolve_program_and_kernel(
        &launch(1, 1, "grid", work.path()).with_groups(&[2, 3, 4], &[8, 4, 2]),
    )?;

    let seen = runtime.observed_packets().remove(0).packet;
    assert_eq!(seen.dimensions(), 3);
    assert_eq!(
        [seen.grid_size_x, seen.grid_size_y, seen.grid_size_z],
        [16, 12, 8]
    );
    assert_eq!(seen.kernarg_address, 0);

    device.teardown()?;
    Ok(())
}

#[test]
fn ring_wraps_without_overwriting_unconsumed_packets() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("step", MockKernel::new(0x5, 8));
    let work = brig_work_dir(b"BRIG");
    let config = DeviceConfig {
        queue_size: 4,
        ..DeviceConfig::default()
    };
    let mut device = open_device(&runtime, config);

    for value in 0..10u64 {
        let handle = device.resolve_program_and_kernel(
            &launch(1, 1, "step", work.path()).with_args(vec![KernelArg::u64(value)]),
        )?;
        assert_eq!(handle.write_index, value);
        assert_eq!(handle.completion_value, 0);
    }

    let observed = runtime.observed_packets();
    assert_eq!(observed.len(), 10);
    for (expected, seen) in observed.iter().enumerate() {
        assert_eq!(seen.write_index, expected as u64);
        assert_eq!(seen.kernarg, (expected as u64).to_le_bytes().to_vec());
    }
    assert!(runtime.ordering_violations().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn group_memory_beyond_the_agent_limit_is_rejected_before_submission() -> Result<()> {
    let runtime = Arc::new(MockRuntime::with_local_mem_size(128));
    runtime.register_kernel("scale", scale_kernel());
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());
    let input = Arc::new(MemObject::new().with_device_address(0, 0x1000));

    let err = device
        .resolve_program_and_kernel(&launch(1, 1, "scale", work.path()).with_args(vec![
            KernelArg::i32(1),
            KernelArg::buffer(input),
            KernelArg::local(128),
        ]))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::LocalMemoryExceeded {
            required: 192,
            available: 128
        }
    ));
    assert!(runtime.observed_packets().is_empty());

    device.teardown()?;
    assert!(runtime.live().is_empty());
    Ok(())
}

#[test]
fn image_argument_is_unimplemented_and_never_submitted() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("sample", MockKernel::new(0x9, 16));
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());

    let err = device
        .resolve_program_and_kernel(
            &launch(1, 1, "sample", work.path()).with_args(vec![KernelArg::Image]),
        )
        .unwrap_err();
    assert!(err.is_unimplemented());
    assert!(matches!(
        err,
        DispatchError::Unimplemented {
            feature: UnimplementedFeature::ImageArgument
        }
    ));
    assert!(runtime.observed_packets().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn buffer_without_device_address_is_an_invalid_argument() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("copy", MockKernel::new(0x9, 8));
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());
    let elsewhere = Arc::new(MemObject::new().with_device_address(1, 0x2000));

    let err = device
        .resolve_program_and_kernel(
            &launch(1, 1, "copy", work.path()).with_args(vec![KernelArg::buffer(elsewhere)]),
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument { index: 0, .. }));
    assert!(runtime.observed_packets().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn invalid_geometry_fails_before_any_kernel_is_built() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("k", MockKernel::new(0x1, 0));
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());

    let err = device
        .resolve_program_and_kernel(&launch(1, 1, "k", work.path()).with_groups(&[1], &[0]))
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidLaunch(_)));
    assert_eq!(runtime.created().executables, 0);
    assert!(runtime.observed_packets().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn host_commands_compile_and_submit_nothing() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    let mut device = open_device(&runtime, DeviceConfig::default());
    let command = Command::Host(HostCommand::CopyBuffer);

    assert!(device.compile_submitted_kernels(&command)?.is_none());
    assert!(device.submit(&command)?.is_none());
    assert_eq!(runtime.calls("hsa_ext_program_create"), 0);
    assert!(runtime.observed_packets().is_empty());

    device.teardown()?;
    Ok(())
}

#[test]
fn compile_then_run_dispatches_the_resolved_program() -> Result<()> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_kernel("k", MockKernel::new(0x77, 8));
    let work = brig_work_dir(b"BRIG");
    let mut device = open_device(&runtime, DeviceConfig::default());
    let command = Command::NdRangeKernel(
        launch(3, 1, "k", work.path()).with_args(vec![KernelArg::u64(11)]),
    );

    let program = device
        .compile_submitted_kernels(&command)?
        .expect("kernel command resolves a program");
    assert_eq!(runtime.calls("hsa_executable_create"), 0);

    let launch = command.kernel_launch().expect("kernel command");
    let handle = device.run(launch, program)?;
    assert_eq!(handle.kernel_object, 0x77);
    assert_eq!(handle.program_residency, Residency::Cached);

    let submitted = device
        .submit(&command)?
        .expect("kernel command dispatches");
    assert_eq!(submitted.write_index, handle.write_index + 1);
    assert_eq!(runtime.calls("hsa_ext_program_finalize"), 1);

    device.teardown()?;
    Ok(())
}

#[test]
fn write_index_advanced_before_publish_is_flagged() -> Result<()> {
    let runtime = MockRuntime::new();
    let queue = runtime.queue_create(runtime.agent().agent, 4)?;

    runtime.queue_store_write_index_relaxed(queue.handle, 1);

    assert_eq!(
        runtime.ordering_violations(),
        ["write index advanced to 1 before packet 0 was published"]
    );
    runtime.queue_destroy(queue.handle)?;
    Ok(())
}

#[test]
fn doorbell_rung_before_write_index_store_is_flagged() -> Result<()> {
    let runtime = MockRuntime::new();
    let queue = runtime.queue_create(runtime.agent().agent, 4)?;
    let completion = runtime.signal_create(1)?;
    let body = PacketBody {
        workgroup_size: [1, 1, 1],
        grid_size: [1, 1, 1],
        private_segment_size: 0,
        group_segment_size: 0,
        kernel_object: 0x1,
        kernarg_address: 0,
        completion_signal: completion.raw(),
    };
    let slot = queue.slot(0);
    // SAFETY: the queue is fresh and this test is its only producer.
    unsafe {
        packet::write_body(slot, &body);
        packet::publish(slot, packet::kernel_dispatch_header(), 1);
    }

    runtime.signal_store_relaxed(queue.doorbell, 0);
    let value = runtime.signal_wait_acquire(completion, SignalCondition::Lt, 1, WaitState::Active);

    assert_eq!(value, 0);
    let violations = runtime.ordering_violations();
    assert_eq!(violations.len(), 1, "{violations:?}");
    assert!(violations[0].starts_with("doorbell rung with 0 before write index advanced"));
    runtime.signal_destroy(completion)?;
    runtime.queue_destroy(queue.handle)?;
    Ok(())
}
