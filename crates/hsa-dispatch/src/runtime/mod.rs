//! The seam between the dispatch pipeline and an HSA implementation.
//!
//! [`HsaRuntime`] names exactly the runtime calls the pipeline makes. The production
//! implementation is [`hsa::HsaLibrary`], which loads the vendor runtime at run time; test
//! suites plug in a resource-tracking mock.

pub mod hsa;

use crate::error::DispatchResult;
use crate::packet::KernelDispatchPacket;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// Kernel agent (a GPU that accepts dispatch packets).
    Agent
);
opaque_handle!(Region);
opaque_handle!(
    /// Instruction set architecture of an agent.
    Isa
);
opaque_handle!(
    /// Finalizer extension program under construction.
    ExtProgram
);
opaque_handle!(
    /// Finalized machine code for a whole program.
    CodeObject
);
opaque_handle!(Executable);
opaque_handle!(ExecutableSymbol);
opaque_handle!(Signal);
opaque_handle!(QueueHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Kernel,
    IndirectFunction,
    Unknown(u32),
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Variable => "variable",
            SymbolKind::Kernel => "kernel",
            SymbolKind::IndirectFunction => "indirect function",
            SymbolKind::Unknown(_) => "unknown",
        }
    }
}

/// Dispatch properties read from a resolved kernel symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSymbolInfo {
    pub kernel_object: u64,
    pub kernarg_segment_size: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCondition {
    Eq,
    Ne,
    Lt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Blocked,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Base,
    Full,
}

/// Memory regions of an agent, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegions {
    pub global: Region,
    /// Region flagged for kernel arguments; kernarg buffers must come from here.
    pub kernarg: Region,
    pub group: Region,
}

/// Everything the device context needs to know about one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub agent: Agent,
    pub name: String,
    pub profile: Profile,
    pub regions: MemoryRegions,
    /// Size of the group region, i.e. the local memory available to one workgroup.
    pub local_mem_size: u64,
}

/// User-mode queue as seen by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub handle: QueueHandle,
    // Stored as usize so descriptors stay Send/Sync; points at `size` packets.
    base_address: usize,
    pub size: u32,
    pub doorbell: Signal,
}

impl QueueDescriptor {
    /// # Safety
    /// `base_address` must point at a ring of `size` dispatch packets that stays valid until
    /// the queue is destroyed, and `size` must be a power of two.
    pub unsafe fn new(
        handle: QueueHandle,
        base_address: *mut KernelDispatchPacket,
        size: u32,
        doorbell: Signal,
    ) -> Self {
        Self {
            handle,
            base_address: base_address as usize,
            size,
            doorbell,
        }
    }

    pub fn base_address(&self) -> *mut KernelDispatchPacket {
        self.base_address as *mut KernelDispatchPacket
    }

    pub fn mask(&self) -> u64 {
        u64::from(self.size) - 1
    }

    /// Packet slot for a write index.
    pub fn slot(&self, index: u64) -> *mut KernelDispatchPacket {
        // SAFETY: the masked index is below `size`, so the offset stays inside the ring.
        unsafe { self.base_address().add((index & self.mask()) as usize) }
    }
}

/// HSA operations used by the compile/cache/dispatch pipeline.
///
/// Every fallible call reports the failing step through
/// [`crate::DispatchError::Runtime`]. Queue-index and signal-store operations mirror the
/// hardware primitives and cannot fail.
pub trait HsaRuntime: Send + Sync {
    /// GPU agents that support kernel dispatch, with their memory regions.
    fn discover_agents(&self) -> DispatchResult<Vec<AgentDescriptor>>;
    fn agent_isa(&self, agent: Agent) -> DispatchResult<Isa>;

    fn program_create(&self) -> DispatchResult<ExtProgram>;
    fn program_add_module(&self, program: ExtProgram, module: &[u8]) -> DispatchResult<()>;
    fn program_finalize(&self, program: ExtProgram, isa: Isa) -> DispatchResult<CodeObject>;
    fn program_destroy(&self, program: ExtProgram) -> DispatchResult<()>;
    fn code_object_destroy(&self, code_object: CodeObject) -> DispatchResult<()>;

    fn executable_create(&self) -> DispatchResult<Executable>;
    fn executable_load_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        code_object: CodeObject,
    ) -> DispatchResult<()>;
    fn executable_freeze(&self, executable: Executable) -> DispatchResult<()>;
    fn executable_symbol(
        &self,
        executable: Executable,
        agent: Agent,
        name: &str,
    ) -> DispatchResult<ExecutableSymbol>;
    fn symbol_kind(&self, symbol: ExecutableSymbol) -> DispatchResult<SymbolKind>;
    fn kernel_symbol_info(&self, symbol: ExecutableSymbol) -> DispatchResult<KernelSymbolInfo>;
    fn executable_destroy(&self, executable: Executable) -> DispatchResult<()>;

    fn signal_create(&self, initial_value: i64) -> DispatchResult<Signal>;
    fn signal_store_relaxed(&self, signal: Signal, value: i64);
    fn signal_wait_acquire(
        &self,
        signal: Signal,
        condition: SignalCondition,
        compare_value: i64,
        wait_state: WaitState,
    ) -> i64;
    fn signal_destroy(&self, signal: Signal) -> DispatchResult<()>;

    /// Returns the host-visible address of `size` bytes allocated in `region`.
    fn memory_allocate(&self, region: Region, size: usize) -> DispatchResult<u64>;
    fn memory_free(&self, address: u64) -> DispatchResult<()>;

    fn queue_create(&self, agent: Agent, size: u32) -> DispatchResult<QueueDescriptor>;
    fn queue_destroy(&self, queue: QueueHandle) -> DispatchResult<()>;
    fn queue_load_write_index_relaxed(&self, queue: QueueHandle) -> u64;
    fn queue_store_write_index_relaxed(&self, queue: QueueHandle, value: u64);
    fn queue_load_read_index_acquire(&self, queue: QueueHandle) -> u64;
}
