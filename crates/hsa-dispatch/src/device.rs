use std::sync::Arc;

use crate::cache::{CacheStats, ProgramCache, ResolvedProgram, TeardownReport};
use crate::command::{Command, KernelLaunch};
use crate::config::DeviceConfig;
use crate::dispatch::{dispatch_kernel, validate_launch, DispatchHandle, DispatchTarget};
use crate::error::{DispatchError, DispatchResult};
use crate::runtime::{AgentDescriptor, HsaRuntime, QueueDescriptor};
use crate::toolchain::compile_module_to_brig;

/// Kernel agents found on the system, indexed by device index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    agents: Vec<AgentDescriptor>,
}

impl DeviceRegistry {
    pub fn discover<R: HsaRuntime + ?Sized>(runtime: &R) -> DispatchResult<Self> {
        let agents = runtime.discover_agents()?;
        for (index, agent) in agents.iter().enumerate() {
            tracing::info!(
                device_index = index,
                name = %agent.name,
                profile = ?agent.profile,
                local_mem_size = agent.local_mem_size,
                "registered HSA agent"
            );
        }
        Ok(Self::from_agents(agents))
    }

    pub fn from_agents(agents: Vec<AgentDescriptor>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn get(&self, device_index: usize) -> Option<&AgentDescriptor> {
        self.agents.get(device_index)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// One HSA kernel agent with its dispatch queue and program/kernel cache.
///
/// Every operation takes `&mut self`: the device is the single producer on its queue and the
/// only mutator of its cache. [`HsaDevice::teardown`] releases everything and reports what was
/// freed; dropping the device without it performs the same release and logs failures.
pub struct HsaDevice<R: HsaRuntime + ?Sized> {
    runtime: Arc<R>,
    agent: AgentDescriptor,
    device_index: usize,
    queue: QueueDescriptor,
    cache: ProgramCache,
    config: DeviceConfig,
    torn_down: bool,
}

impl<R: HsaRuntime + ?Sized> std::fmt::Debug for HsaDevice<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsaDevice")
            .field("agent", &self.agent.name)
            .field("device_index", &self.device_index)
            .field("queue", &self.queue)
            .field("cache", &self.cache.stats())
            .finish()
    }
}

impl<R: HsaRuntime + ?Sized> HsaDevice<R> {
    /// Creates the dispatch queue for `agent`.
    pub fn open(
        runtime: Arc<R>,
        agent: &AgentDescriptor,
        device_index: usize,
        config: DeviceConfig,
    ) -> DispatchResult<Self> {
        config.validate()?;
        let queue = runtime
            .queue_create(agent.agent, config.queue_size)
            .inspect_err(|err| tracing::error!(error = %err, "failed to create dispatch queue"))?;
        if !queue.size.is_power_of_two() {
            if let Err(err) = runtime.queue_destroy(queue.handle) {
                tracing::warn!(error = %err, "failed to destroy rejected dispatch queue");
            }
            return Err(DispatchError::runtime(
                "hsa_queue_create",
                0,
                format!("queue size {} is not a power of two", queue.size),
            ));
        }
        tracing::info!(
            device_index,
            agent = %agent.name,
            queue_size = queue.size,
            "opened HSA device"
        );
        Ok(Self {
            runtime,
            agent: agent.clone(),
            device_index,
            queue,
            cache: ProgramCache::new(config.cache),
            config,
            torn_down: false,
        })
    }

    pub fn agent(&self) -> &AgentDescriptor {
        &self.agent
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Compile phase of a command: resolves the program of a kernel launch.
    ///
    /// Host commands need no compilation and yield `None`.
    pub fn compile_submitted_kernels(
        &mut self,
        command: &Command,
    ) -> DispatchResult<Option<ResolvedProgram>> {
        match command {
            Command::NdRangeKernel(launch) => self.compile_program(launch).map(Some),
            Command::Host(host) => {
                tracing::trace!(command = host.as_str(), "no kernels to compile");
                Ok(None)
            }
        }
    }

    /// Dispatch phase of a kernel launch whose program was resolved by
    /// [`HsaDevice::compile_submitted_kernels`].
    ///
    /// A transient code object is destroyed after the dispatch, whether it succeeded or not.
    pub fn run(
        &mut self,
        launch: &KernelLaunch,
        program: ResolvedProgram,
    ) -> DispatchResult<DispatchHandle> {
        let dispatched = self.dispatch_resolved(launch, &program);
        let released = program.release(&*self.runtime);
        let handle = dispatched?;
        released.inspect_err(|err| {
            tracing::error!(error = %err, "failed to destroy transient code object")
        })?;
        Ok(handle)
    }

    /// Compiles and runs a command. Host commands yield `None`.
    pub fn submit(&mut self, command: &Command) -> DispatchResult<Option<DispatchHandle>> {
        match command {
            Command::NdRangeKernel(launch) => self.resolve_program_and_kernel(launch).map(Some),
            Command::Host(host) => {
                tracing::trace!(command = host.as_str(), "ignoring host command");
                Ok(None)
            }
        }
    }

    /// Compile, cache, marshal, submit and wait for one kernel launch.
    pub fn resolve_program_and_kernel(
        &mut self,
        launch: &KernelLaunch,
    ) -> DispatchResult<DispatchHandle> {
        let program = self.compile_program(launch)?;
        self.run(launch, program)
    }

    fn compile_program(&mut self, launch: &KernelLaunch) -> DispatchResult<ResolvedProgram> {
        let toolchain = &self.config.toolchain;
        self.cache
            .resolve_program(&*self.runtime, &self.agent, launch.program, || {
                compile_module_to_brig(&launch.work_dir, toolchain).map(|artifact| artifact.blob)
            })
            .inspect_err(|err| {
                tracing::error!(
                    program = launch.program.0,
                    kernel = %launch.kernel_name,
                    fatal = err.is_fatal(),
                    error = %err,
                    "program resolution failed"
                )
            })
    }

    fn dispatch_resolved(
        &mut self,
        launch: &KernelLaunch,
        program: &ResolvedProgram,
    ) -> DispatchResult<DispatchHandle> {
        let result = self.try_dispatch(launch, program);
        result.inspect_err(|err| {
            tracing::error!(
                program = launch.program.0,
                kernel = %launch.kernel_name,
                fatal = err.is_fatal(),
                error = %err,
                "kernel dispatch failed"
            )
        })
    }

    fn try_dispatch(
        &mut self,
        launch: &KernelLaunch,
        program: &ResolvedProgram,
    ) -> DispatchResult<DispatchHandle> {
        let geometry = validate_launch(launch)?;
        let runtime = &*self.runtime;
        let mut metadata = self.cache.resolve_kernel(
            runtime,
            &self.agent,
            program.code_object,
            launch.kernel,
            &launch.kernel_name,
        )?;
        let target = DispatchTarget {
            agent: &self.agent,
            queue: &self.queue,
            device_index: self.device_index,
        };
        let dispatched = dispatch_kernel(
            runtime,
            target,
            launch,
            geometry,
            &mut metadata,
            program.residency,
        );
        let released = metadata.release(runtime);
        let handle = dispatched?;
        released?;
        Ok(handle)
    }

    /// Releases every cached executable, signal, kernarg buffer and code object, then the
    /// queue.
    ///
    /// Release continues past failures; the first one is returned.
    pub fn teardown(mut self) -> DispatchResult<TeardownReport> {
        self.release_all()
    }

    fn release_all(&mut self) -> DispatchResult<TeardownReport> {
        self.torn_down = true;
        let mut report = TeardownReport::default();
        let cached = self.cache.release_all(&*self.runtime, &mut report);
        report.queues += 1;
        let queue = self.runtime.queue_destroy(self.queue.handle);
        tracing::info!(
            device_index = self.device_index,
            executables = report.executables,
            code_objects = report.code_objects,
            "HSA device torn down"
        );
        cached?;
        queue?;
        Ok(report)
    }
}

impl<R: HsaRuntime + ?Sized> Drop for HsaDevice<R> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.release_all() {
            tracing::error!(error = %err, "HSA device teardown on drop failed");
        }
    }
}
