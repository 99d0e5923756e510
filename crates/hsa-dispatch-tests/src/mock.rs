//! In-process HSA runtime that tracks every resource it hands out.
//!
//! Each queue gets a consumer thread that behaves like a packet processor: it waits on the
//! doorbell, acquires the packet header, snapshots the packet and its kernarg bytes, and
//! decrements the completion signal. Producer-side ordering mistakes (index advanced before
//! the header, doorbell rung before the index) are recorded as violations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use hsa_dispatch::packet::{self, KernelDispatchPacket, PACKET_TYPE_KERNEL_DISPATCH};
use hsa_dispatch::runtime::{
    Agent, AgentDescriptor, CodeObject, Executable, ExecutableSymbol, ExtProgram, HsaRuntime, Isa,
    KernelSymbolInfo, MemoryRegions, Profile, QueueDescriptor, QueueHandle, Region, Signal,
    SignalCondition, SymbolKind, WaitState,
};
use hsa_dispatch::{DispatchError, DispatchResult};

pub const MOCK_STATUS_ERROR: u32 = 0x1000;
pub const MOCK_LOCAL_MEM_SIZE: u64 = 64 * 1024;
pub const MOCK_ISA: u64 = 0x15a;

/// Symbol properties served for a kernel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockKernel {
    pub kind: SymbolKind,
    pub kernel_object: u64,
    pub kernarg_segment_size: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
}

impl MockKernel {
    pub fn new(kernel_object: u64, kernarg_segment_size: u32) -> Self {
        Self {
            kind: SymbolKind::Kernel,
            kernel_object,
            kernarg_segment_size,
            group_segment_size: 0,
            private_segment_size: 0,
        }
    }

    pub fn with_group_segment_size(mut self, size: u32) -> Self {
        self.group_segment_size = size;
        self
    }

    pub fn with_private_segment_size(mut self, size: u32) -> Self {
        self.private_segment_size = size;
        self
    }

    pub fn with_kind(mut self, kind: SymbolKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Resource totals, either currently live or created over the mock's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub ext_programs: usize,
    pub code_objects: usize,
    pub executables: usize,
    pub signals: usize,
    pub kernarg_buffers: usize,
    pub queues: usize,
}

impl ResourceCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A packet as the consumer saw it after acquiring its header.
#[derive(Debug, Clone)]
pub struct ObservedPacket {
    pub write_index: u64,
    pub packet: KernelDispatchPacket,
    /// Kernarg bytes at consumption time; empty when the address is not a live allocation.
    pub kernarg: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SignalCell {
    value: Mutex<i64>,
    changed: Condvar,
}

impl SignalCell {
    fn new(value: i64) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        })
    }

    fn store(&self, value: i64) {
        *lock(&self.value) = value;
        self.changed.notify_all();
    }

    fn subtract(&self, amount: i64) {
        *lock(&self.value) -= amount;
        self.changed.notify_all();
    }

    fn wait_until(&self, done: impl Fn(i64) -> bool) -> i64 {
        let guard = lock(&self.value);
        let guard = self
            .changed
            .wait_while(guard, |value| !done(*value))
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }

    /// Waits for `value >= target`; returns false if `shutdown` ended the wait first.
    fn wait_at_least(&self, target: i64, shutdown: &AtomicBool) -> bool {
        let guard = lock(&self.value);
        let guard = self
            .changed
            .wait_while(guard, |value| {
                *value < target && !shutdown.load(Ordering::SeqCst)
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard >= target
    }
}

struct MockQueue {
    ring: usize,
    size: u32,
    write_index: AtomicU64,
    read_index: AtomicU64,
    doorbell: Signal,
    doorbell_cell: Arc<SignalCell>,
    shutdown: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl MockQueue {
    fn slot(&self, index: u64) -> *mut KernelDispatchPacket {
        let offset = (index & (u64::from(self.size) - 1)) as usize;
        // SAFETY: offset is below `size`, the ring length.
        unsafe { (self.ring as *mut KernelDispatchPacket).add(offset) }
    }

    fn stop(&self) {
        {
            let _guard = lock(&self.doorbell_cell.value);
            self.shutdown.store(true, Ordering::SeqCst);
        }
        self.doorbell_cell.changed.notify_all();
        if let Some(consumer) = lock(&self.consumer).take() {
            let _ = consumer.join();
        }
    }
}

impl Drop for MockQueue {
    fn drop(&mut self) {
        let ring = std::ptr::slice_from_raw_parts_mut(
            self.ring as *mut KernelDispatchPacket,
            self.size as usize,
        );
        // SAFETY: `ring` came from `Box::into_raw` in `queue_create` and is freed once.
        drop(unsafe { Box::from_raw(ring) });
    }
}

struct MockExecutable {
    frozen: bool,
    code_object: Option<u64>,
}

struct KernargAllocation {
    storage: Box<[u128]>,
    size: usize,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    kernels: HashMap<String, MockKernel>,
    failing: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
    ext_programs: HashMap<u64, Vec<Vec<u8>>>,
    finalized_modules: Vec<Vec<u8>>,
    code_objects: HashSet<u64>,
    executables: HashMap<u64, MockExecutable>,
    symbols: HashMap<u64, MockKernel>,
    signals: HashMap<u64, Arc<SignalCell>>,
    kernarg: HashMap<u64, KernargAllocation>,
    queues: HashMap<u64, Arc<MockQueue>>,
    doorbells: HashMap<u64, u64>,
    granted_queue_size: Option<u32>,
    created: ResourceCounts,
    observed: Vec<ObservedPacket>,
    violations: Vec<String>,
}

impl State {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }
}

struct Shared {
    agent: AgentDescriptor,
    state: Mutex<State>,
}

impl Shared {
    fn violation(&self, message: String) {
        lock(&self.state).violations.push(message);
    }
}

/// Resource-tracking [`HsaRuntime`] with one GPU agent.
pub struct MockRuntime {
    shared: Arc<Shared>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        let queues: Vec<_> = lock(&self.shared.state).queues.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.stop();
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_local_mem_size(MOCK_LOCAL_MEM_SIZE)
    }

    pub fn with_local_mem_size(local_mem_size: u64) -> Self {
        let agent = AgentDescriptor {
            agent: Agent(1),
            name: "mock-gfx801".to_string(),
            profile: Profile::Full,
            regions: MemoryRegions {
                global: Region(10),
                kernarg: Region(11),
                group: Region(12),
            },
            local_mem_size,
        };
        Self {
            shared: Arc::new(Shared {
                agent,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn agent(&self) -> AgentDescriptor {
        self.shared.agent.clone()
    }

    /// Serves `kernel` for symbol `&name`.
    pub fn register_kernel(&self, name: &str, kernel: MockKernel) {
        lock(&self.shared.state)
            .kernels
            .insert(format!("&{name}"), kernel);
    }

    /// Makes every later call of `step` fail until [`MockRuntime::clear_failures`].
    pub fn fail_on(&self, step: &'static str) {
        lock(&self.shared.state).failing.insert(step);
    }

    /// Makes later queues report `size` slots regardless of the requested size.
    pub fn grant_queue_size(&self, size: u32) {
        lock(&self.shared.state).granted_queue_size = Some(size);
    }

    pub fn clear_failures(&self) {
        lock(&self.shared.state).failing.clear();
    }

    pub fn calls(&self, step: &str) -> usize {
        lock(&self.shared.state)
            .calls
            .get(step)
            .copied()
            .unwrap_or(0)
    }

    pub fn live(&self) -> ResourceCounts {
        let state = lock(&self.shared.state);
        ResourceCounts {
            ext_programs: state.ext_programs.len(),
            code_objects: state.code_objects.len(),
            executables: state.executables.len(),
            signals: state.signals.len(),
            kernarg_buffers: state.kernarg.len(),
            queues: state.queues.len(),
        }
    }

    pub fn created(&self) -> ResourceCounts {
        lock(&self.shared.state).created
    }

    pub fn finalized_modules(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.state).finalized_modules.clone()
    }

    pub fn observed_packets(&self) -> Vec<ObservedPacket> {
        lock(&self.shared.state).observed.clone()
    }

    pub fn ordering_violations(&self) -> Vec<String> {
        lock(&self.shared.state).violations.clone()
    }

    fn enter(&self, step: &'static str) -> DispatchResult<MutexGuard<'_, State>> {
        let mut state = lock(&self.shared.state);
        *state.calls.entry(step).or_insert(0) += 1;
        if state.failing.contains(step) {
            return Err(DispatchError::runtime(step, MOCK_STATUS_ERROR, "injected failure"));
        }
        Ok(state)
    }

    fn queue(&self, handle: QueueHandle) -> Option<Arc<MockQueue>> {
        lock(&self.shared.state).queues.get(&handle.raw()).cloned()
    }
}

fn invalid(step: &'static str, message: impl Into<String>) -> DispatchError {
    DispatchError::runtime(step, MOCK_STATUS_ERROR, message)
}

impl HsaRuntime for MockRuntime {
    fn discover_agents(&self) -> DispatchResult<Vec<AgentDescriptor>> {
        drop(self.enter("hsa_iterate_agents")?);
        Ok(vec![self.shared.agent.clone()])
    }

    fn agent_isa(&self, agent: Agent) -> DispatchResult<Isa> {
        let step = "hsa_agent_get_info(ISA)";
        drop(self.enter(step)?);
        if agent != self.shared.agent.agent {
            return Err(invalid(step, "unknown agent"));
        }
        Ok(Isa(MOCK_ISA))
    }

    fn program_create(&self) -> DispatchResult<ExtProgram> {
        let mut state = self.enter("hsa_ext_program_create")?;
        let handle = state.next_handle();
        state.ext_programs.insert(handle, Vec::new());
        state.created.ext_programs += 1;
        Ok(ExtProgram(handle))
    }

    fn program_add_module(&self, program: ExtProgram, module: &[u8]) -> DispatchResult<()> {
        let step = "hsa_ext_program_add_module";
        let mut state = self.enter(step)?;
        let modules = state
            .ext_programs
            .get_mut(&program.raw())
            .ok_or_else(|| invalid(step, "unknown program"))?;
        modules.push(module.to_vec());
        Ok(())
    }

    fn program_finalize(&self, program: ExtProgram, isa: Isa) -> DispatchResult<CodeObject> {
        let step = "hsa_ext_program_finalize";
        let mut state = self.enter(step)?;
        if isa.raw() != MOCK_ISA {
            return Err(invalid(step, "unknown ISA"));
        }
        let modules = state
            .ext_programs
            .get(&program.raw())
            .cloned()
            .ok_or_else(|| invalid(step, "unknown program"))?;
        if modules.is_empty() {
            return Err(invalid(step, "program has no modules"));
        }
        state.finalized_modules.extend(modules);
        let handle = state.next_handle();
        state.code_objects.insert(handle);
        state.created.code_objects += 1;
        Ok(CodeObject(handle))
    }

    fn program_destroy(&self, program: ExtProgram) -> DispatchResult<()> {
        let step = "hsa_ext_program_destroy";
        let mut state = self.enter(step)?;
        state
            .ext_programs
            .remove(&program.raw())
            .map(|_| ())
            .ok_or_else(|| invalid(step, "unknown program"))
    }

    fn code_object_destroy(&self, code_object: CodeObject) -> DispatchResult<()> {
        let step = "hsa_code_object_destroy";
        let mut state = self.enter(step)?;
        let in_use = state
            .executables
            .values()
            .any(|exe| exe.code_object == Some(code_object.raw()));
        if in_use {
            state.violations.push(format!(
                "code object {:#x} destroyed while an executable still holds it",
                code_object.raw()
            ));
        }
        if state.code_objects.remove(&code_object.raw()) {
            Ok(())
        } else {
            Err(invalid(step, "unknown code object"))
        }
    }

    fn executable_create(&self) -> DispatchResult<Executable> {
        let mut state = self.enter("hsa_executable_create")?;
        let handle = state.next_handle();
        state.executables.insert(
            handle,
            MockExecutable {
                frozen: false,
                code_object: None,
            },
        );
        state.created.executables += 1;
        Ok(Executable(handle))
    }

    fn executable_load_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        code_object: CodeObject,
    ) -> DispatchResult<()> {
        let step = "hsa_executable_load_code_object";
        let mut state = self.enter(step)?;
        if agent != self.shared.agent.agent {
            return Err(invalid(step, "unknown agent"));
        }
        if !state.code_objects.contains(&code_object.raw()) {
            return Err(invalid(step, "unknown code object"));
        }
        let exe = state
            .executables
            .get_mut(&executable.raw())
            .ok_or_else(|| invalid(step, "unknown executable"))?;
        if exe.frozen {
            return Err(invalid(step, "executable is frozen"));
        }
        exe.code_object = Some(code_object.raw());
        Ok(())
    }

    fn executable_freeze(&self, executable: Executable) -> DispatchResult<()> {
        let step = "hsa_executable_freeze";
        let mut state = self.enter(step)?;
        let exe = state
            .executables
            .get_mut(&executable.raw())
            .ok_or_else(|| invalid(step, "unknown executable"))?;
        exe.frozen = true;
        Ok(())
    }

    fn executable_symbol(
        &self,
        executable: Executable,
        _agent: Agent,
        name: &str,
    ) -> DispatchResult<ExecutableSymbol> {
        let step = "hsa_executable_get_symbol";
        let mut state = self.enter(step)?;
        let exe = state
            .executables
            .get(&executable.raw())
            .ok_or_else(|| invalid(step, "unknown executable"))?;
        if !exe.frozen || exe.code_object.is_none() {
            return Err(invalid(step, "executable is not loaded and frozen"));
        }
        let kernel = *state
            .kernels
            .get(name)
            .ok_or_else(|| invalid(step, format!("no symbol named {name}")))?;
        let handle = state.next_handle();
        state.symbols.insert(handle, kernel);
        Ok(ExecutableSymbol(handle))
    }

    fn symbol_kind(&self, symbol: ExecutableSymbol) -> DispatchResult<SymbolKind> {
        let step = "hsa_executable_symbol_get_info(TYPE)";
        let state = self.enter(step)?;
        state
            .symbols
            .get(&symbol.raw())
            .map(|kernel| kernel.kind)
            .ok_or_else(|| invalid(step, "unknown symbol"))
    }

    fn kernel_symbol_info(&self, symbol: ExecutableSymbol) -> DispatchResult<KernelSymbolInfo> {
        let step = "hsa_executable_symbol_get_info(KERNEL)";
        let state = self.enter(step)?;
        let kernel = state
            .symbols
            .get(&symbol.raw())
            .ok_or_else(|| invalid(step, "unknown symbol"))?;
        Ok(KernelSymbolInfo {
            kernel_object: kernel.kernel_object,
            kernarg_segment_size: kernel.kernarg_segment_size,
            group_segment_size: kernel.group_segment_size,
            private_segment_size: kernel.private_segment_size,
        })
    }

    fn executable_destroy(&self, executable: Executable) -> DispatchResult<()> {
        let step = "hsa_executable_destroy";
        let mut state = self.enter(step)?;
        state
            .executables
            .remove(&executable.raw())
            .map(|_| ())
            .ok_or_else(|| invalid(step, "unknown executable"))
    }

    fn signal_create(&self, initial_value: i64) -> DispatchResult<Signal> {
        let mut state = self.enter("hsa_signal_create")?;
        let handle = state.next_handle();
        state.signals.insert(handle, SignalCell::new(initial_value));
        state.created.signals += 1;
        Ok(Signal(handle))
    }

    fn signal_store_relaxed(&self, signal: Signal, value: i64) {
        let cell = {
            let mut state = lock(&self.shared.state);
            if let Some(queue) = state.doorbells.get(&signal.raw()).copied() {
                let queue = state.queues.get(&queue).cloned();
                match queue {
                    Some(queue) => {
                        let write_index = queue.write_index.load(Ordering::SeqCst);
                        if write_index <= value as u64 {
                            state.violations.push(format!(
                                "doorbell rung with {value} before write index advanced past it \
                                 (write index {write_index})"
                            ));
                        }
                        Some(Arc::clone(&queue.doorbell_cell))
                    }
                    None => None,
                }
            } else {
                state.signals.get(&signal.raw()).cloned()
            }
        };
        match cell {
            Some(cell) => cell.store(value),
            None => self
                .shared
                .violation(format!("store to unknown signal {:#x}", signal.raw())),
        }
    }

    fn signal_wait_acquire(
        &self,
        signal: Signal,
        condition: SignalCondition,
        compare_value: i64,
        _wait_state: WaitState,
    ) -> i64 {
        let cell = lock(&self.shared.state).signals.get(&signal.raw()).cloned();
        let Some(cell) = cell else {
            self.shared
                .violation(format!("wait on unknown signal {:#x}", signal.raw()));
            return 0;
        };
        cell.wait_until(|value| match condition {
            SignalCondition::Eq => value == compare_value,
            SignalCondition::Ne => value != compare_value,
            SignalCondition::Lt => value < compare_value,
            SignalCondition::Gte => value >= compare_value,
        })
    }

    fn signal_destroy(&self, signal: Signal) -> DispatchResult<()> {
        let step = "hsa_signal_destroy";
        let mut state = self.enter(step)?;
        state
            .signals
            .remove(&signal.raw())
            .map(|_| ())
            .ok_or_else(|| invalid(step, "unknown signal"))
    }

    fn memory_allocate(&self, region: Region, size: usize) -> DispatchResult<u64> {
        let step = "hsa_memory_allocate";
        let mut state = self.enter(step)?;
        if region != self.shared.agent.regions.kernarg {
            return Err(invalid(step, "only the kernarg region is backed by the mock"));
        }
        let storage = vec![0u128; size.div_ceil(16).max(1)].into_boxed_slice();
        let address = storage.as_ptr() as u64;
        state.kernarg.insert(address, KernargAllocation { storage, size });
        state.created.kernarg_buffers += 1;
        Ok(address)
    }

    fn memory_free(&self, address: u64) -> DispatchResult<()> {
        let step = "hsa_memory_free";
        let mut state = self.enter(step)?;
        state
            .kernarg
            .remove(&address)
            .map(|_| ())
            .ok_or_else(|| invalid(step, "unknown allocation"))
    }

    fn queue_create(&self, agent: Agent, size: u32) -> DispatchResult<QueueDescriptor> {
        let step = "hsa_queue_create";
        let mut state = self.enter(step)?;
        if agent != self.shared.agent.agent {
            return Err(invalid(step, "unknown agent"));
        }
        if !size.is_power_of_two() {
            return Err(invalid(step, "queue size must be a power of two"));
        }
        let size = state.granted_queue_size.unwrap_or(size);

        let ring: Box<[KernelDispatchPacket]> =
            vec![KernelDispatchPacket::invalid(); size as usize].into_boxed_slice();
        let ring = Box::into_raw(ring) as *mut KernelDispatchPacket;
        let handle = QueueHandle(state.next_handle());
        let doorbell = Signal(state.next_handle());
        let queue = Arc::new(MockQueue {
            ring: ring as usize,
            size,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            doorbell,
            doorbell_cell: SignalCell::new(-1),
            shutdown: AtomicBool::new(false),
            consumer: Mutex::new(None),
        });
        state.queues.insert(handle.raw(), Arc::clone(&queue));
        state.doorbells.insert(doorbell.raw(), handle.raw());
        state.created.queues += 1;
        drop(state);

        let consumer = {
            let shared = Arc::clone(&self.shared);
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name(format!("mock-aql-{:#x}", handle.raw()))
                .spawn(move || consume(&shared, &queue))
                .map_err(|err| invalid(step, format!("failed to spawn consumer: {err}")))?
        };
        *lock(&queue.consumer) = Some(consumer);

        // SAFETY: the ring holds `size` packets and lives as long as the queue.
        Ok(unsafe { QueueDescriptor::new(handle, ring, size, doorbell) })
    }

    fn queue_destroy(&self, queue: QueueHandle) -> DispatchResult<()> {
        let step = "hsa_queue_destroy";
        let removed = {
            let mut state = self.enter(step)?;
            let removed = state.queues.remove(&queue.raw());
            if let Some(removed) = &removed {
                state.doorbells.remove(&removed.doorbell.raw());
            }
            removed
        };
        let removed = removed.ok_or_else(|| invalid(step, "unknown queue"))?;
        removed.stop();
        Ok(())
    }

    fn queue_load_write_index_relaxed(&self, queue: QueueHandle) -> u64 {
        match self.queue(queue) {
            Some(queue) => queue.write_index.load(Ordering::Relaxed),
            None => {
                self.shared
                    .violation(format!("write index load on unknown queue {:#x}", queue.raw()));
                0
            }
        }
    }

    fn queue_store_write_index_relaxed(&self, queue: QueueHandle, value: u64) {
        let Some(queue) = self.queue(queue) else {
            self.shared
                .violation(format!("write index store on unknown queue {:#x}", queue.raw()));
            return;
        };
        if value > 0 {
            // SAFETY: slot pointers stay inside the ring; the header word is read atomically.
            let (header, _) = unsafe { packet::load_header_acquire(queue.slot(value - 1)) };
            if packet::packet_type(header) != PACKET_TYPE_KERNEL_DISPATCH {
                self.shared.violation(format!(
                    "write index advanced to {value} before packet {} was published",
                    value - 1
                ));
            }
        }
        queue.write_index.store(value, Ordering::Relaxed);
    }

    fn queue_load_read_index_acquire(&self, queue: QueueHandle) -> u64 {
        match self.queue(queue) {
            Some(queue) => queue.read_index.load(Ordering::Acquire),
            None => {
                self.shared
                    .violation(format!("read index load on unknown queue {:#x}", queue.raw()));
                0
            }
        }
    }
}

fn consume(shared: &Shared, queue: &MockQueue) {
    loop {
        let read_index = queue.read_index.load(Ordering::Acquire);
        if !queue
            .doorbell_cell
            .wait_at_least(read_index as i64, &queue.shutdown)
        {
            return;
        }

        let slot = queue.slot(read_index);
        // SAFETY: slot is inside the ring; the header word is read atomically.
        let (mut header, _) = unsafe { packet::load_header_acquire(slot) };
        if packet::packet_type(header) != PACKET_TYPE_KERNEL_DISPATCH {
            shared.violation(format!(
                "doorbell covered packet {read_index} before its header was published"
            ));
            while packet::packet_type(header) != PACKET_TYPE_KERNEL_DISPATCH {
                if queue.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::yield_now();
                // SAFETY: as above.
                header = unsafe { packet::load_header_acquire(slot) }.0;
            }
        }

        // SAFETY: the header was acquired, so the body is complete, and the producer does not
        // touch this slot again until the read index moves past it.
        let observed_packet = unsafe { slot.read() };
        let completion = {
            let mut state = lock(&shared.state);
            let kernarg = state
                .kernarg
                .get(&observed_packet.kernarg_address)
                .map(|allocation| {
                    // SAFETY: the allocation is live and at least `size` bytes long.
                    unsafe {
                        std::slice::from_raw_parts(
                            allocation.storage.as_ptr() as *const u8,
                            allocation.size,
                        )
                    }
                    .to_vec()
                })
                .unwrap_or_default();
            state.observed.push(ObservedPacket {
                write_index: read_index,
                packet: observed_packet,
                kernarg,
            });
            state.signals.get(&observed_packet.completion_signal).cloned()
        };

        // SAFETY: the slot was fully read above.
        unsafe { packet::invalidate(slot) };
        queue.read_index.store(read_index + 1, Ordering::Release);

        match completion {
            Some(signal) => signal.subtract(1),
            None => shared.violation(format!(
                "packet {read_index} names unknown completion signal {:#x}",
                observed_packet.completion_signal
            )),
        }
    }
}
