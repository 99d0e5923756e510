//! Two-level program and kernel cache.
//!
//! Programs map to their finalized code object; each cached program owns a bounded map of
//! per-kernel dispatch data. Entries are append-only and live until teardown. When a level is
//! full the requested record is built anyway, marked [`Residency::Transient`], and released by
//! the device once the dispatch that needed it completes.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::command::{KernelId, ProgramId};
use crate::config::CacheConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::profiling;
use crate::runtime::{
    AgentDescriptor, CodeObject, Executable, ExecutableSymbol, HsaRuntime, KernelSymbolInfo,
    Signal, SymbolKind,
};

/// Where a program or kernel record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Residency {
    /// Owned by the cache until teardown.
    Cached,
    /// Owned by the current dispatch and released after it.
    Transient,
}

/// Kernarg allocation from the agent's kernarg region.
#[derive(Debug, PartialEq, Eq)]
pub struct KernargBuffer {
    pub address: u64,
    pub size: usize,
}

impl KernargBuffer {
    /// # Safety
    /// `address` must be host-accessible memory of `size` bytes that nothing else is reading
    /// or writing, i.e. no dispatch using this buffer is in flight.
    pub unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        if self.size == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.address as *mut u8, self.size)
    }
}

/// Everything needed to dispatch one kernel of one program.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelDispatchData {
    pub kernel: KernelId,
    pub executable: Executable,
    pub kernel_object: u64,
    pub private_segment_size: u32,
    pub static_group_segment_size: u32,
    pub completion_signal: Signal,
    pub kernarg: KernargBuffer,
}

/// Symbol name of a kernel inside a finalized program.
pub fn kernel_symbol_name(kernel_name: &str) -> String {
    format!("&{kernel_name}")
}

impl KernelDispatchData {
    /// Loads `code_object` into a fresh executable and collects the kernel's dispatch data.
    ///
    /// On failure everything created so far is released before the error is returned.
    pub fn build<R: HsaRuntime + ?Sized>(
        runtime: &R,
        agent: &AgentDescriptor,
        code_object: CodeObject,
        kernel: KernelId,
        kernel_name: &str,
    ) -> DispatchResult<Self> {
        let executable = runtime.executable_create()?;
        let info = match load_kernel_symbol(runtime, agent, executable, code_object, kernel_name)
        {
            Ok(info) => info,
            Err(err) => {
                discard(runtime.executable_destroy(executable), "executable");
                return Err(err);
            }
        };

        let kernarg_size = info.kernarg_segment_size as usize;
        let kernarg_address = if kernarg_size == 0 {
            0
        } else {
            match runtime.memory_allocate(agent.regions.kernarg, kernarg_size) {
                Ok(address) => address,
                Err(err) => {
                    discard(runtime.executable_destroy(executable), "executable");
                    return Err(err);
                }
            }
        };
        let kernarg = KernargBuffer {
            address: kernarg_address,
            size: kernarg_size,
        };

        let completion_signal = match runtime.signal_create(1) {
            Ok(signal) => signal,
            Err(err) => {
                discard(free_kernarg(runtime, &kernarg), "kernarg buffer");
                discard(runtime.executable_destroy(executable), "executable");
                return Err(err);
            }
        };

        tracing::debug!(
            kernel = kernel_name,
            kernel_object = info.kernel_object,
            kernarg_size,
            group_segment_size = info.group_segment_size,
            private_segment_size = info.private_segment_size,
            "built kernel dispatch data"
        );
        Ok(Self {
            kernel,
            executable,
            kernel_object: info.kernel_object,
            private_segment_size: info.private_segment_size,
            static_group_segment_size: info.group_segment_size,
            completion_signal,
            kernarg,
        })
    }

    /// Destroys the executable and signal and frees the kernarg buffer.
    ///
    /// Every release is attempted; the first failure is returned.
    pub fn release<R: HsaRuntime + ?Sized>(self, runtime: &R) -> DispatchResult<()> {
        let results = [
            runtime.executable_destroy(self.executable),
            runtime.signal_destroy(self.completion_signal),
            free_kernarg(runtime, &self.kernarg),
        ];
        results.into_iter().collect()
    }
}

fn load_kernel_symbol<R: HsaRuntime + ?Sized>(
    runtime: &R,
    agent: &AgentDescriptor,
    executable: Executable,
    code_object: CodeObject,
    kernel_name: &str,
) -> DispatchResult<KernelSymbolInfo> {
    runtime.executable_load_code_object(executable, agent.agent, code_object)?;
    runtime.executable_freeze(executable)?;
    let symbol_name = kernel_symbol_name(kernel_name);
    let symbol: ExecutableSymbol = runtime.executable_symbol(executable, agent.agent, &symbol_name)?;
    match runtime.symbol_kind(symbol)? {
        SymbolKind::Kernel => runtime.kernel_symbol_info(symbol),
        other => Err(DispatchError::SymbolKind {
            symbol: symbol_name,
            kind: other.as_str(),
        }),
    }
}

fn free_kernarg<R: HsaRuntime + ?Sized>(runtime: &R, kernarg: &KernargBuffer) -> DispatchResult<()> {
    if kernarg.size == 0 {
        return Ok(());
    }
    runtime.memory_free(kernarg.address)
}

fn discard(result: DispatchResult<()>, what: &'static str) {
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to release partially built {what}");
    }
}

/// Finalizes one BRIG module into a program code object for `agent`.
///
/// The extension program is destroyed on every path once it exists.
pub fn finalize_program<R: HsaRuntime + ?Sized>(
    runtime: &R,
    agent: &AgentDescriptor,
    module: &[u8],
) -> DispatchResult<CodeObject> {
    let _scope = profiling::compile_scope("hsa_dispatch.finalize");
    let program = runtime.program_create()?;
    let finalized = runtime
        .program_add_module(program, module)
        .and_then(|()| runtime.agent_isa(agent.agent))
        .and_then(|isa| runtime.program_finalize(program, isa));
    let destroyed = runtime.program_destroy(program);
    let code_object = finalized?;
    if let Err(err) = destroyed {
        discard(runtime.code_object_destroy(code_object), "code object");
        return Err(err);
    }
    Ok(code_object)
}

/// Program code object resolved for a launch.
///
/// Not `Clone`: a transient code object is destroyed exactly once, by
/// [`ResolvedProgram::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub program: ProgramId,
    pub code_object: CodeObject,
    pub residency: Residency,
}

impl ResolvedProgram {
    /// Destroys a transient code object; cached ones stay with the cache.
    pub fn release<R: HsaRuntime + ?Sized>(self, runtime: &R) -> DispatchResult<()> {
        match self.residency {
            Residency::Cached => Ok(()),
            Residency::Transient => {
                tracing::debug!(program = self.program.0, "destroying transient code object");
                runtime.code_object_destroy(self.code_object)
            }
        }
    }
}

/// Dispatch data for one launch, borrowed from the cache or owned by the caller.
#[derive(Debug)]
pub enum KernelMetadata<'a> {
    Cached(&'a mut KernelDispatchData),
    Transient(KernelDispatchData),
}

impl KernelMetadata<'_> {
    pub fn data(&self) -> &KernelDispatchData {
        match self {
            KernelMetadata::Cached(data) => data,
            KernelMetadata::Transient(data) => data,
        }
    }

    pub fn data_mut(&mut self) -> &mut KernelDispatchData {
        match self {
            KernelMetadata::Cached(data) => data,
            KernelMetadata::Transient(data) => data,
        }
    }

    pub fn residency(&self) -> Residency {
        match self {
            KernelMetadata::Cached(_) => Residency::Cached,
            KernelMetadata::Transient(_) => Residency::Transient,
        }
    }

    /// Releases transient dispatch data; cached data stays with the cache.
    pub fn release<R: HsaRuntime + ?Sized>(self, runtime: &R) -> DispatchResult<()> {
        match self {
            KernelMetadata::Cached(_) => Ok(()),
            KernelMetadata::Transient(data) => data.release(runtime),
        }
    }
}

#[derive(Debug)]
struct ProgramEntry {
    code_object: CodeObject,
    kernels: HashMap<KernelId, KernelDispatchData>,
}

/// Occupancy snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub programs: usize,
    pub program_capacity: usize,
    pub kernel_capacity: usize,
    /// Cached kernels per program identity.
    pub kernels: BTreeMap<u64, usize>,
}

/// Counts of resources released at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub executables: usize,
    pub signals: usize,
    pub kernarg_buffers: usize,
    pub code_objects: usize,
    pub queues: usize,
}

#[derive(Debug)]
pub struct ProgramCache {
    config: CacheConfig,
    programs: HashMap<ProgramId, ProgramEntry>,
    by_code_object: HashMap<CodeObject, ProgramId>,
}

impl ProgramCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            programs: HashMap::new(),
            by_code_object: HashMap::new(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Returns the cached code object for `program`, or finalizes the module from
    /// `load_module` and caches it while capacity remains.
    ///
    /// `load_module` only runs on a miss.
    pub fn resolve_program<R, F>(
        &mut self,
        runtime: &R,
        agent: &AgentDescriptor,
        program: ProgramId,
        load_module: F,
    ) -> DispatchResult<ResolvedProgram>
    where
        R: HsaRuntime + ?Sized,
        F: FnOnce() -> DispatchResult<Vec<u8>>,
    {
        if let Some(entry) = self.programs.get(&program) {
            profiling::cache_event("hsa_dispatch.program_hit");
            tracing::debug!(program = program.0, "program cache hit");
            return Ok(ResolvedProgram {
                program,
                code_object: entry.code_object,
                residency: Residency::Cached,
            });
        }
        profiling::cache_event("hsa_dispatch.program_miss");

        let module = load_module()?;
        let code_object = finalize_program(runtime, agent, &module)?;

        if self.programs.len() < self.config.program_capacity {
            self.programs.insert(
                program,
                ProgramEntry {
                    code_object,
                    kernels: HashMap::new(),
                },
            );
            self.by_code_object.insert(code_object, program);
            tracing::debug!(program = program.0, "cached finalized program");
            Ok(ResolvedProgram {
                program,
                code_object,
                residency: Residency::Cached,
            })
        } else {
            profiling::cache_event("hsa_dispatch.program_transient");
            tracing::warn!(
                program = program.0,
                capacity = self.config.program_capacity,
                "program cache full; code object and its kernels are transient"
            );
            Ok(ResolvedProgram {
                program,
                code_object,
                residency: Residency::Transient,
            })
        }
    }

    /// Returns dispatch data for `kernel` of the program that owns `code_object`.
    ///
    /// A hit returns the existing record unchanged. Misses are cached while the program's
    /// kernel map has room; otherwise, or when the program itself is not cached, the record
    /// is transient.
    pub fn resolve_kernel<'a, R: HsaRuntime + ?Sized>(
        &'a mut self,
        runtime: &R,
        agent: &AgentDescriptor,
        code_object: CodeObject,
        kernel: KernelId,
        kernel_name: &str,
    ) -> DispatchResult<KernelMetadata<'a>> {
        let kernel_capacity = self.config.kernel_capacity;
        let entry = match self.by_code_object.get(&code_object) {
            Some(program) => self.programs.get_mut(program),
            None => None,
        };
        let Some(entry) = entry else {
            profiling::cache_event("hsa_dispatch.kernel_transient");
            let data = KernelDispatchData::build(runtime, agent, code_object, kernel, kernel_name)?;
            return Ok(KernelMetadata::Transient(data));
        };

        let at_capacity = entry.kernels.len() >= kernel_capacity;
        match entry.kernels.entry(kernel) {
            Entry::Occupied(slot) => {
                profiling::cache_event("hsa_dispatch.kernel_hit");
                tracing::debug!(kernel = kernel_name, "kernel cache hit");
                Ok(KernelMetadata::Cached(slot.into_mut()))
            }
            Entry::Vacant(slot) if !at_capacity => {
                profiling::cache_event("hsa_dispatch.kernel_miss");
                let data =
                    KernelDispatchData::build(runtime, agent, code_object, kernel, kernel_name)?;
                Ok(KernelMetadata::Cached(slot.insert(data)))
            }
            Entry::Vacant(_) => {
                profiling::cache_event("hsa_dispatch.kernel_transient");
                tracing::debug!(
                    kernel = kernel_name,
                    capacity = kernel_capacity,
                    "kernel cache full; building transient dispatch data"
                );
                let data =
                    KernelDispatchData::build(runtime, agent, code_object, kernel, kernel_name)?;
                Ok(KernelMetadata::Transient(data))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            programs: self.programs.len(),
            program_capacity: self.config.program_capacity,
            kernel_capacity: self.config.kernel_capacity,
            kernels: self
                .programs
                .iter()
                .map(|(program, entry)| (program.0, entry.kernels.len()))
                .collect(),
        }
    }

    /// Releases every cached kernel before the code object it was loaded from.
    ///
    /// Releasing continues past failures; the first failure is returned after the cache has
    /// been emptied.
    pub fn release_all<R: HsaRuntime + ?Sized>(
        &mut self,
        runtime: &R,
        report: &mut TeardownReport,
    ) -> DispatchResult<()> {
        let mut first_error = None;
        let mut record = |result: DispatchResult<()>| {
            if let Err(err) = result {
                tracing::error!(error = %err, "teardown release failed");
                first_error.get_or_insert(err);
            }
        };

        self.by_code_object.clear();
        for (program, entry) in self.programs.drain() {
            for (_, data) in entry.kernels {
                report.executables += 1;
                report.signals += 1;
                if data.kernarg.size > 0 {
                    report.kernarg_buffers += 1;
                }
                record(data.release(runtime));
            }
            tracing::debug!(program = program.0, "destroying cached code object");
            report.code_objects += 1;
            record(runtime.code_object_destroy(entry.code_object));
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_symbols_carry_ampersand_prefix() {
        assert_eq!(kernel_symbol_name("vec_add"), "&vec_add");
    }

    #[test]
    fn empty_kernarg_buffer_is_an_empty_slice() {
        let mut buffer = KernargBuffer { address: 0, size: 0 };
        assert!(unsafe { buffer.bytes_mut() }.is_empty());
    }

    #[test]
    fn stats_of_empty_cache_report_capacities() {
        let cache = ProgramCache::new(CacheConfig {
            program_capacity: 3,
            kernel_capacity: 5,
        });
        let stats = cache.stats();
        assert_eq!(stats.programs, 0);
        assert_eq!((stats.program_capacity, stats.kernel_capacity), (3, 5));
        assert!(stats.kernels.is_empty());
    }
}
