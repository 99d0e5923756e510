//! AQL packet submission.
//!
//! A dispatch reserves the next write index, fills the slot body, publishes the header with
//! release semantics, advances the write index, rings the doorbell and then blocks on the
//! completion signal. The device's `&mut` receiver makes this the only producer on its queue.

use serde::Serialize;

use crate::cache::{KernelMetadata, Residency};
use crate::command::KernelLaunch;
use crate::error::{DispatchError, DispatchResult, UnimplementedFeature};
use crate::kernarg::{marshal_kernel_args, total_group_segment_size};
use crate::packet::{self, PacketBody};
use crate::profiling;
use crate::runtime::{AgentDescriptor, HsaRuntime, QueueDescriptor, Signal, SignalCondition, WaitState};

/// Validated index space of a launch, in packet units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub dimensions: u16,
    pub workgroup_size: [u16; 3],
    pub grid_size: [u32; 3],
}

/// Checks that a launch fits the dispatch packet.
pub fn validate_launch(launch: &KernelLaunch) -> DispatchResult<LaunchGeometry> {
    if !(1..=3).contains(&launch.work_dim) {
        return Err(DispatchError::invalid_launch(format!(
            "work dimension {} is outside 1..=3",
            launch.work_dim
        )));
    }
    if !launch.automatic_local_sizes.is_empty() {
        return Err(DispatchError::unimplemented(
            UnimplementedFeature::AutomaticLocalBuffer,
        ));
    }

    let global_size = launch.global_size();
    let mut workgroup_size = [1u16; 3];
    let mut grid_size = [1u32; 3];
    for axis in 0..3 {
        let local = launch.local_size[axis];
        let groups = launch.num_groups[axis];
        if local == 0 || groups == 0 {
            return Err(DispatchError::invalid_launch(format!(
                "axis {axis} has {groups} groups of {local} work items"
            )));
        }
        workgroup_size[axis] = u16::try_from(local).map_err(|_| {
            DispatchError::invalid_launch(format!(
                "workgroup size {local} on axis {axis} exceeds {}",
                u16::MAX
            ))
        })?;
        grid_size[axis] = u32::try_from(global_size[axis]).map_err(|_| {
            DispatchError::invalid_launch(format!(
                "grid of {groups} x {local} on axis {axis} exceeds {}",
                u32::MAX
            ))
        })?;
    }

    Ok(LaunchGeometry {
        dimensions: launch.work_dim as u16,
        workgroup_size,
        grid_size,
    })
}

/// Rejects group segments the agent cannot back.
pub fn check_local_memory(group_segment_size: u32, available: u64) -> DispatchResult<()> {
    if u64::from(group_segment_size) > available {
        return Err(DispatchError::LocalMemoryExceeded {
            required: u64::from(group_segment_size),
            available,
        });
    }
    Ok(())
}

/// Fully resolved packet contents for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRequest {
    pub geometry: LaunchGeometry,
    pub kernel_object: u64,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernarg_address: u64,
    pub completion_signal: Signal,
}

/// Queue position and final signal value of a completed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub write_index: u64,
    pub completion_value: i64,
}

/// Submits one kernel dispatch packet and blocks until the completion signal drops below 1.
pub fn submit_and_wait<R: HsaRuntime + ?Sized>(
    runtime: &R,
    queue: &QueueDescriptor,
    request: &DispatchRequest,
) -> DispatchResult<Completion> {
    let _scope = profiling::dispatch_scope("hsa_dispatch.submit_and_wait");
    runtime.signal_store_relaxed(request.completion_signal, 1);

    let write_index = runtime.queue_load_write_index_relaxed(queue.handle);
    while write_index.wrapping_sub(runtime.queue_load_read_index_acquire(queue.handle))
        >= u64::from(queue.size)
    {
        std::thread::yield_now();
    }

    let geometry = &request.geometry;
    let body = PacketBody {
        workgroup_size: geometry.workgroup_size,
        grid_size: geometry.grid_size,
        private_segment_size: request.private_segment_size,
        group_segment_size: request.group_segment_size,
        kernel_object: request.kernel_object,
        kernarg_address: request.kernarg_address,
        completion_signal: request.completion_signal.raw(),
    };
    let slot = queue.slot(write_index);
    // SAFETY: the slot was consumed (read index is past it) and this device is the only
    // producer, so nothing else reads or writes it until the header is published.
    unsafe {
        packet::write_body(slot, &body);
        packet::publish(slot, packet::kernel_dispatch_header(), geometry.dimensions);
    }
    runtime.queue_store_write_index_relaxed(queue.handle, write_index + 1);
    runtime.signal_store_relaxed(queue.doorbell, write_index as i64);
    tracing::debug!(
        write_index,
        kernel_object = request.kernel_object,
        group_segment_size = request.group_segment_size,
        "dispatch packet submitted"
    );

    let completion_value = loop {
        let value = runtime.signal_wait_acquire(
            request.completion_signal,
            SignalCondition::Lt,
            1,
            WaitState::Active,
        );
        if value < 1 {
            break value;
        }
    };

    Ok(Completion {
        write_index,
        completion_value,
    })
}

/// Outcome of a completed kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchHandle {
    pub write_index: u64,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub program_residency: Residency,
    pub kernel_residency: Residency,
    pub completion_value: i64,
}

/// Agent, queue and device index a launch runs on.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTarget<'a> {
    pub agent: &'a AgentDescriptor,
    pub queue: &'a QueueDescriptor,
    pub device_index: usize,
}

/// Marshals `launch` into the kernel's kernarg buffer and runs it to completion.
pub fn dispatch_kernel<R: HsaRuntime + ?Sized>(
    runtime: &R,
    target: DispatchTarget<'_>,
    launch: &KernelLaunch,
    geometry: LaunchGeometry,
    metadata: &mut KernelMetadata<'_>,
    program_residency: Residency,
) -> DispatchResult<DispatchHandle> {
    let kernel_residency = metadata.residency();
    let data = metadata.data_mut();

    // SAFETY: the kernarg buffer is host-accessible and the last dispatch that read it has
    // completed, because every dispatch waits for its completion signal.
    let kernarg_bytes = unsafe { data.kernarg.bytes_mut() };
    let marshalled = marshal_kernel_args(kernarg_bytes, &launch.args, target.device_index)?;
    let group_segment_size =
        total_group_segment_size(data.static_group_segment_size, marshalled.dynamic_group_size)?;
    check_local_memory(group_segment_size, target.agent.local_mem_size)?;

    let request = DispatchRequest {
        geometry,
        kernel_object: data.kernel_object,
        private_segment_size: data.private_segment_size,
        group_segment_size,
        kernarg_address: data.kernarg.address,
        completion_signal: data.completion_signal,
    };
    let completion = submit_and_wait(runtime, target.queue, &request)?;

    Ok(DispatchHandle {
        write_index: completion.write_index,
        kernel_object: request.kernel_object,
        kernarg_address: request.kernarg_address,
        private_segment_size: request.private_segment_size,
        group_segment_size,
        program_residency,
        kernel_residency,
        completion_value: completion.completion_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{KernelId, ProgramId};

    fn launch() -> KernelLaunch {
        KernelLaunch::new(ProgramId(1), "/tmp/work", KernelId(1), "k")
    }

    #[test]
    fn geometry_multiplies_groups_by_local_size() {
        let geometry = validate_launch(&launch().with_groups(&[8, 2, 3], &[32, 4, 1])).unwrap();
        assert_eq!(geometry.dimensions, 3);
        assert_eq!(geometry.workgroup_size, [32, 4, 1]);
        assert_eq!(geometry.grid_size, [256, 8, 3]);
    }

    #[test]
    fn oversized_workgroup_is_rejected() {
        let err = validate_launch(&launch().with_groups(&[1], &[70_000])).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidLaunch(_)));
    }

    #[test]
    fn grid_beyond_u32_is_rejected() {
        let err = validate_launch(&launch().with_groups(&[1 << 24], &[1024])).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidLaunch(_)));
    }

    #[test]
    fn grid_overflowing_u64_is_rejected_not_wrapped() {
        let err = validate_launch(&launch().with_groups(&[u64::MAX], &[2])).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidLaunch(_)));
    }

    #[test]
    fn zero_and_four_dimensional_launches_are_rejected() {
        let mut zero = launch();
        zero.work_dim = 0;
        assert!(validate_launch(&zero).is_err());
        let err = validate_launch(&launch().with_groups(&[1, 1, 1, 1], &[1])).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidLaunch(_)));
    }

    #[test]
    fn automatic_locals_are_unimplemented() {
        let mut with_auto = launch();
        with_auto.automatic_local_sizes = vec![64];
        let err = validate_launch(&with_auto).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Unimplemented {
                feature: UnimplementedFeature::AutomaticLocalBuffer
            }
        ));
    }

    #[test]
    fn local_memory_limit_is_inclusive() {
        assert!(check_local_memory(65_536, 65_536).is_ok());
        assert!(matches!(
            check_local_memory(65_537, 65_536),
            Err(DispatchError::LocalMemoryExceeded { .. })
        ));
    }
}
