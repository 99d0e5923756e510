use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::ptr;

use libloading::Library;

use crate::error::{DispatchError, DispatchResult};
use crate::packet::KernelDispatchPacket;

use super::{
    Agent, AgentDescriptor, CodeObject, Executable, ExecutableSymbol, ExtProgram, HsaRuntime, Isa,
    KernelSymbolInfo, MemoryRegions, Profile, QueueDescriptor, QueueHandle, Region, Signal,
    SignalCondition, SymbolKind, WaitState,
};

type HsaStatus = u32;

const HSA_STATUS_SUCCESS: HsaStatus = 0;
const HSA_STATUS_INFO_BREAK: HsaStatus = 1;

const HSA_AGENT_INFO_NAME: u32 = 0;
const HSA_AGENT_INFO_FEATURE: u32 = 2;
const HSA_AGENT_INFO_PROFILE: u32 = 4;
const HSA_AGENT_INFO_DEVICE: u32 = 17;
const HSA_AGENT_INFO_ISA: u32 = 19;
const HSA_DEVICE_TYPE_GPU: u32 = 1;
const HSA_AGENT_FEATURE_KERNEL_DISPATCH: u32 = 1;

const HSA_REGION_INFO_SEGMENT: u32 = 0;
const HSA_REGION_INFO_GLOBAL_FLAGS: u32 = 1;
const HSA_REGION_INFO_SIZE: u32 = 2;
const HSA_REGION_SEGMENT_GLOBAL: u32 = 0;
const HSA_REGION_SEGMENT_GROUP: u32 = 3;
const HSA_REGION_GLOBAL_FLAG_KERNARG: u32 = 1;

const HSA_MACHINE_MODEL_LARGE: u32 = 1;
const HSA_PROFILE_BASE: u32 = 0;
const HSA_PROFILE_FULL: u32 = 1;
const HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT: u32 = 0;
const HSA_CODE_OBJECT_TYPE_PROGRAM: u32 = 0;
const HSA_EXECUTABLE_STATE_UNFROZEN: u32 = 0;

const HSA_EXECUTABLE_SYMBOL_INFO_TYPE: u32 = 0;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE: u32 = 11;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE: u32 = 13;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE: u32 = 14;
const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT: u32 = 22;
const HSA_SYMBOL_KIND_VARIABLE: u32 = 0;
const HSA_SYMBOL_KIND_KERNEL: u32 = 1;
const HSA_SYMBOL_KIND_INDIRECT_FUNCTION: u32 = 2;

const HSA_QUEUE_TYPE_MULTI: u32 = 0;
const HSA_WAIT_STATE_BLOCKED: u32 = 0;
const HSA_WAIT_STATE_ACTIVE: u32 = 1;

/// `hsa_queue_t`.
#[repr(C)]
#[allow(dead_code)]
struct RawQueue {
    queue_type: u32,
    features: u32,
    base_address: *mut c_void,
    doorbell_signal: u64,
    size: u32,
    reserved1: u32,
    id: u64,
}

/// `hsa_ext_control_directives_t`, passed by value to the finalizer.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ControlDirectives {
    control_directives_mask: u64,
    break_exceptions_mask: u16,
    detect_exceptions_mask: u16,
    max_dynamic_group_size: u32,
    max_flat_grid_size: u64,
    max_flat_workgroup_size: u32,
    reserved1: u32,
    required_grid_size: [u64; 3],
    required_workgroup_size: [u32; 3],
    required_dim: u8,
    reserved2: [u8; 75],
}

const _: () = assert!(std::mem::size_of::<ControlDirectives>() == 144);

impl ControlDirectives {
    fn zeroed() -> Self {
        Self {
            control_directives_mask: 0,
            break_exceptions_mask: 0,
            detect_exceptions_mask: 0,
            max_dynamic_group_size: 0,
            max_flat_grid_size: 0,
            max_flat_workgroup_size: 0,
            reserved1: 0,
            required_grid_size: [0; 3],
            required_workgroup_size: [0; 3],
            required_dim: 0,
            reserved2: [0; 75],
        }
    }
}

type IterateCallback = unsafe extern "C" fn(handle: u64, data: *mut c_void) -> HsaStatus;
type QueueErrorCallback =
    unsafe extern "C" fn(status: HsaStatus, queue: *mut RawQueue, data: *mut c_void);

type HsaInitFn = unsafe extern "C" fn() -> HsaStatus;
type HsaShutDownFn = unsafe extern "C" fn() -> HsaStatus;
type HsaStatusStringFn =
    unsafe extern "C" fn(status: HsaStatus, status_string: *mut *const c_char) -> HsaStatus;
type HsaIterateAgentsFn =
    unsafe extern "C" fn(callback: IterateCallback, data: *mut c_void) -> HsaStatus;
type HsaAgentGetInfoFn =
    unsafe extern "C" fn(agent: u64, attribute: u32, value: *mut c_void) -> HsaStatus;
type HsaAgentIterateRegionsFn =
    unsafe extern "C" fn(agent: u64, callback: IterateCallback, data: *mut c_void) -> HsaStatus;
type HsaRegionGetInfoFn =
    unsafe extern "C" fn(region: u64, attribute: u32, value: *mut c_void) -> HsaStatus;
type HsaExtProgramCreateFn = unsafe extern "C" fn(
    machine_model: u32,
    profile: u32,
    rounding_mode: u32,
    options: *const c_char,
    program: *mut u64,
) -> HsaStatus;
type HsaExtProgramAddModuleFn =
    unsafe extern "C" fn(program: u64, module: *const c_void) -> HsaStatus;
type HsaExtProgramFinalizeFn = unsafe extern "C" fn(
    program: u64,
    isa: u64,
    call_convention: i32,
    control_directives: ControlDirectives,
    options: *const c_char,
    code_object_type: u32,
    code_object: *mut u64,
) -> HsaStatus;
type HsaExtProgramDestroyFn = unsafe extern "C" fn(program: u64) -> HsaStatus;
type HsaCodeObjectDestroyFn = unsafe extern "C" fn(code_object: u64) -> HsaStatus;
type HsaExecutableCreateFn = unsafe extern "C" fn(
    profile: u32,
    executable_state: u32,
    options: *const c_char,
    executable: *mut u64,
) -> HsaStatus;
type HsaExecutableLoadCodeObjectFn = unsafe extern "C" fn(
    executable: u64,
    agent: u64,
    code_object: u64,
    options: *const c_char,
) -> HsaStatus;
type HsaExecutableFreezeFn =
    unsafe extern "C" fn(executable: u64, options: *const c_char) -> HsaStatus;
type HsaExecutableGetSymbolFn = unsafe extern "C" fn(
    executable: u64,
    module_name: *const c_char,
    symbol_name: *const c_char,
    agent: u64,
    call_convention: i32,
    symbol: *mut u64,
) -> HsaStatus;
type HsaExecutableSymbolGetInfoFn =
    unsafe extern "C" fn(symbol: u64, attribute: u32, value: *mut c_void) -> HsaStatus;
type HsaExecutableDestroyFn = unsafe extern "C" fn(executable: u64) -> HsaStatus;
type HsaSignalCreateFn = unsafe extern "C" fn(
    initial_value: i64,
    num_consumers: u32,
    consumers: *const u64,
    signal: *mut u64,
) -> HsaStatus;
type HsaSignalDestroyFn = unsafe extern "C" fn(signal: u64) -> HsaStatus;
type HsaSignalStoreRelaxedFn = unsafe extern "C" fn(signal: u64, value: i64);
type HsaSignalWaitAcquireFn = unsafe extern "C" fn(
    signal: u64,
    condition: u32,
    compare_value: i64,
    timeout_hint: u64,
    wait_state_hint: u32,
) -> i64;
type HsaMemoryAllocateFn =
    unsafe extern "C" fn(region: u64, size: usize, ptr: *mut *mut c_void) -> HsaStatus;
type HsaMemoryFreeFn = unsafe extern "C" fn(ptr: *mut c_void) -> HsaStatus;
type HsaQueueCreateFn = unsafe extern "C" fn(
    agent: u64,
    size: u32,
    queue_type: u32,
    callback: Option<QueueErrorCallback>,
    data: *mut c_void,
    private_segment_size: u32,
    group_segment_size: u32,
    queue: *mut *mut RawQueue,
) -> HsaStatus;
type HsaQueueDestroyFn = unsafe extern "C" fn(queue: *mut RawQueue) -> HsaStatus;
type HsaQueueLoadIndexFn = unsafe extern "C" fn(queue: *const RawQueue) -> u64;
type HsaQueueStoreIndexFn = unsafe extern "C" fn(queue: *const RawQueue, value: u64);

struct HsaFns {
    hsa_init: HsaInitFn,
    hsa_shut_down: HsaShutDownFn,
    hsa_status_string: HsaStatusStringFn,
    hsa_iterate_agents: HsaIterateAgentsFn,
    hsa_agent_get_info: HsaAgentGetInfoFn,
    hsa_agent_iterate_regions: HsaAgentIterateRegionsFn,
    hsa_region_get_info: HsaRegionGetInfoFn,
    hsa_ext_program_create: HsaExtProgramCreateFn,
    hsa_ext_program_add_module: HsaExtProgramAddModuleFn,
    hsa_ext_program_finalize: HsaExtProgramFinalizeFn,
    hsa_ext_program_destroy: HsaExtProgramDestroyFn,
    hsa_code_object_destroy: HsaCodeObjectDestroyFn,
    hsa_executable_create: HsaExecutableCreateFn,
    hsa_executable_load_code_object: HsaExecutableLoadCodeObjectFn,
    hsa_executable_freeze: HsaExecutableFreezeFn,
    hsa_executable_get_symbol: HsaExecutableGetSymbolFn,
    hsa_executable_symbol_get_info: HsaExecutableSymbolGetInfoFn,
    hsa_executable_destroy: HsaExecutableDestroyFn,
    hsa_signal_create: HsaSignalCreateFn,
    hsa_signal_destroy: HsaSignalDestroyFn,
    hsa_signal_store_relaxed: HsaSignalStoreRelaxedFn,
    hsa_signal_wait_acquire: HsaSignalWaitAcquireFn,
    hsa_memory_allocate: HsaMemoryAllocateFn,
    hsa_memory_free: HsaMemoryFreeFn,
    hsa_queue_create: HsaQueueCreateFn,
    hsa_queue_destroy: HsaQueueDestroyFn,
    hsa_queue_load_write_index_relaxed: HsaQueueLoadIndexFn,
    hsa_queue_store_write_index_relaxed: HsaQueueStoreIndexFn,
    hsa_queue_load_read_index_acquire: HsaQueueLoadIndexFn,
}

/// HSA runtime loaded from the system's `libhsa-runtime64`.
///
/// `hsa_init` runs on load and `hsa_shut_down` on drop; everything created through this
/// library must be released before it is dropped.
pub struct HsaLibrary {
    _runtime: Library,
    _finalizer: Option<Library>,
    fns: HsaFns,
}

impl fmt::Debug for HsaLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsaLibrary")
            .field("finalizer_library", &self._finalizer.is_some())
            .finish()
    }
}

impl Drop for HsaLibrary {
    fn drop(&mut self) {
        // SAFETY: hsa_init succeeded in `load`; shut_down balances it exactly once.
        let _ = unsafe { (self.fns.hsa_shut_down)() };
    }
}

impl HsaLibrary {
    pub fn load() -> DispatchResult<Self> {
        let runtime = load_library(&["libhsa-runtime64.so.1", "libhsa-runtime64.so"])?;
        let finalizer = load_library(&["libhsa-ext-finalize64.so.1", "libhsa-ext-finalize64.so"]).ok();
        let libs: Vec<&Library> = std::iter::once(&runtime).chain(finalizer.as_ref()).collect();

        let fns = HsaFns {
            hsa_init: load_symbol(&libs, b"hsa_init\0")?,
            hsa_shut_down: load_symbol(&libs, b"hsa_shut_down\0")?,
            hsa_status_string: load_symbol(&libs, b"hsa_status_string\0")?,
            hsa_iterate_agents: load_symbol(&libs, b"hsa_iterate_agents\0")?,
            hsa_agent_get_info: load_symbol(&libs, b"hsa_agent_get_info\0")?,
            hsa_agent_iterate_regions: load_symbol(&libs, b"hsa_agent_iterate_regions\0")?,
            hsa_region_get_info: load_symbol(&libs, b"hsa_region_get_info\0")?,
            hsa_ext_program_create: load_symbol(&libs, b"hsa_ext_program_create\0")?,
            hsa_ext_program_add_module: load_symbol(&libs, b"hsa_ext_program_add_module\0")?,
            hsa_ext_program_finalize: load_symbol(&libs, b"hsa_ext_program_finalize\0")?,
            hsa_ext_program_destroy: load_symbol(&libs, b"hsa_ext_program_destroy\0")?,
            hsa_code_object_destroy: load_symbol(&libs, b"hsa_code_object_destroy\0")?,
            hsa_executable_create: load_symbol(&libs, b"hsa_executable_create\0")?,
            hsa_executable_load_code_object: load_symbol(
                &libs,
                b"hsa_executable_load_code_object\0",
            )?,
            hsa_executable_freeze: load_symbol(&libs, b"hsa_executable_freeze\0")?,
            hsa_executable_get_symbol: load_symbol(&libs, b"hsa_executable_get_symbol\0")?,
            hsa_executable_symbol_get_info: load_symbol(
                &libs,
                b"hsa_executable_symbol_get_info\0",
            )?,
            hsa_executable_destroy: load_symbol(&libs, b"hsa_executable_destroy\0")?,
            hsa_signal_create: load_symbol(&libs, b"hsa_signal_create\0")?,
            hsa_signal_destroy: load_symbol(&libs, b"hsa_signal_destroy\0")?,
            hsa_signal_store_relaxed: load_symbol(&libs, b"hsa_signal_store_relaxed\0")?,
            hsa_signal_wait_acquire: load_symbol(&libs, b"hsa_signal_wait_acquire\0")?,
            hsa_memory_allocate: load_symbol(&libs, b"hsa_memory_allocate\0")?,
            hsa_memory_free: load_symbol(&libs, b"hsa_memory_free\0")?,
            hsa_queue_create: load_symbol(&libs, b"hsa_queue_create\0")?,
            hsa_queue_destroy: load_symbol(&libs, b"hsa_queue_destroy\0")?,
            hsa_queue_load_write_index_relaxed: load_symbol(
                &libs,
                b"hsa_queue_load_write_index_relaxed\0",
            )?,
            hsa_queue_store_write_index_relaxed: load_symbol(
                &libs,
                b"hsa_queue_store_write_index_relaxed\0",
            )?,
            hsa_queue_load_read_index_acquire: load_symbol(
                &libs,
                b"hsa_queue_load_read_index_acquire\0",
            )?,
        };

        // SAFETY: hsa_init takes no arguments and may be called before any other HSA API.
        let status = unsafe { (fns.hsa_init)() };
        if status != HSA_STATUS_SUCCESS {
            return Err(DispatchError::LibraryUnavailable(format!(
                "hsa_init failed with status {status:#x}"
            )));
        }

        Ok(Self {
            _runtime: runtime,
            _finalizer: finalizer,
            fns,
        })
    }

    pub fn is_available() -> bool {
        Self::load().is_ok()
    }

    fn check(&self, status: HsaStatus, step: &'static str) -> DispatchResult<()> {
        if status == HSA_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(DispatchError::runtime(step, status, self.status_message(status)))
        }
    }

    fn status_message(&self, status: HsaStatus) -> String {
        let mut message: *const c_char = ptr::null();
        // SAFETY: `message` is a valid out pointer; the runtime returns a static string.
        let rc = unsafe { (self.fns.hsa_status_string)(status, &mut message) };
        if rc != HSA_STATUS_SUCCESS || message.is_null() {
            return "unknown status".to_string();
        }
        // SAFETY: non-null pointer to a NUL-terminated string owned by the runtime.
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }

    fn agent_info<T: Copy + Default>(
        &self,
        agent: u64,
        attribute: u32,
        step: &'static str,
    ) -> DispatchResult<T> {
        let mut value = T::default();
        // SAFETY: `value` has the size the runtime writes for `attribute`.
        let status = unsafe {
            (self.fns.hsa_agent_get_info)(agent, attribute, &mut value as *mut T as *mut c_void)
        };
        self.check(status, step)?;
        Ok(value)
    }

    fn region_info<T: Copy + Default>(
        &self,
        region: u64,
        attribute: u32,
        step: &'static str,
    ) -> DispatchResult<T> {
        let mut value = T::default();
        // SAFETY: `value` has the size the runtime writes for `attribute`.
        let status = unsafe {
            (self.fns.hsa_region_get_info)(region, attribute, &mut value as *mut T as *mut c_void)
        };
        self.check(status, step)?;
        Ok(value)
    }

    fn symbol_info<T: Copy + Default>(
        &self,
        symbol: ExecutableSymbol,
        attribute: u32,
        step: &'static str,
    ) -> DispatchResult<T> {
        let mut value = T::default();
        // SAFETY: `value` has the size the runtime writes for `attribute`.
        let status = unsafe {
            (self.fns.hsa_executable_symbol_get_info)(
                symbol.raw(),
                attribute,
                &mut value as *mut T as *mut c_void,
            )
        };
        self.check(status, step)?;
        Ok(value)
    }

    fn describe_agent(&self, agent: u64) -> DispatchResult<AgentDescriptor> {
        let mut raw_name = [0u8; 64];
        // SAFETY: the agent name attribute is a 64-byte character array.
        let status = unsafe {
            (self.fns.hsa_agent_get_info)(
                agent,
                HSA_AGENT_INFO_NAME,
                raw_name.as_mut_ptr() as *mut c_void,
            )
        };
        self.check(status, "hsa_agent_get_info(NAME)")?;
        let name_len = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
        let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();

        let profile: u32 = self.agent_info(agent, HSA_AGENT_INFO_PROFILE, "hsa_agent_get_info(PROFILE)")?;
        let profile = if profile == HSA_PROFILE_BASE {
            Profile::Base
        } else {
            Profile::Full
        };

        let mut scan = RegionScan {
            fns: &self.fns,
            global: None,
            kernarg: None,
            group: None,
        };
        // SAFETY: `scan` outlives the iteration and the callback only touches it.
        let status = unsafe {
            (self.fns.hsa_agent_iterate_regions)(
                agent,
                collect_region,
                &mut scan as *mut RegionScan as *mut c_void,
            )
        };
        self.check(status, "hsa_agent_iterate_regions")?;

        let missing = |what: &str| {
            DispatchError::runtime(
                "hsa_agent_iterate_regions",
                HSA_STATUS_SUCCESS,
                format!("agent '{name}' exposes no {what} region"),
            )
        };
        let kernarg = scan.kernarg.ok_or_else(|| missing("kernarg"))?;
        let global = scan.global.or(scan.kernarg).ok_or_else(|| missing("global"))?;
        let group = scan.group.ok_or_else(|| missing("group"))?;
        let local_mem_size: usize =
            self.region_info(group, HSA_REGION_INFO_SIZE, "hsa_region_get_info(SIZE)")?;

        Ok(AgentDescriptor {
            agent: Agent(agent),
            name,
            profile,
            regions: MemoryRegions {
                global: Region(global),
                kernarg: Region(kernarg),
                group: Region(group),
            },
            local_mem_size: local_mem_size as u64,
        })
    }
}

struct AgentScan<'a> {
    fns: &'a HsaFns,
    agents: Vec<u64>,
}

struct RegionScan<'a> {
    fns: &'a HsaFns,
    global: Option<u64>,
    kernarg: Option<u64>,
    group: Option<u64>,
}

unsafe extern "C" fn collect_agent(agent: u64, data: *mut c_void) -> HsaStatus {
    // SAFETY: `data` is the `AgentScan` passed to hsa_iterate_agents by `discover_agents`.
    let scan = unsafe { &mut *(data as *mut AgentScan<'_>) };
    let mut device_type: u32 = u32::MAX;
    let mut features: u32 = 0;
    // SAFETY: both attributes are 32-bit enums.
    unsafe {
        let status = (scan.fns.hsa_agent_get_info)(
            agent,
            HSA_AGENT_INFO_DEVICE,
            &mut device_type as *mut u32 as *mut c_void,
        );
        if status != HSA_STATUS_SUCCESS {
            return status;
        }
        let status = (scan.fns.hsa_agent_get_info)(
            agent,
            HSA_AGENT_INFO_FEATURE,
            &mut features as *mut u32 as *mut c_void,
        );
        if status != HSA_STATUS_SUCCESS {
            return status;
        }
    }
    if device_type == HSA_DEVICE_TYPE_GPU && features & HSA_AGENT_FEATURE_KERNEL_DISPATCH != 0 {
        scan.agents.push(agent);
    }
    HSA_STATUS_SUCCESS
}

unsafe extern "C" fn collect_region(region: u64, data: *mut c_void) -> HsaStatus {
    // SAFETY: `data` is the `RegionScan` passed to hsa_agent_iterate_regions.
    let scan = unsafe { &mut *(data as *mut RegionScan<'_>) };
    let mut segment: u32 = u32::MAX;
    // SAFETY: the segment attribute is a 32-bit enum.
    let status = unsafe {
        (scan.fns.hsa_region_get_info)(
            region,
            HSA_REGION_INFO_SEGMENT,
            &mut segment as *mut u32 as *mut c_void,
        )
    };
    if status != HSA_STATUS_SUCCESS {
        return status;
    }

    match segment {
        HSA_REGION_SEGMENT_GLOBAL => {
            let mut flags: u32 = 0;
            // SAFETY: the global flags attribute is a 32-bit mask.
            let status = unsafe {
                (scan.fns.hsa_region_get_info)(
                    region,
                    HSA_REGION_INFO_GLOBAL_FLAGS,
                    &mut flags as *mut u32 as *mut c_void,
                )
            };
            if status != HSA_STATUS_SUCCESS {
                return status;
            }
            if flags & HSA_REGION_GLOBAL_FLAG_KERNARG != 0 {
                scan.kernarg.get_or_insert(region);
            } else {
                scan.global.get_or_insert(region);
            }
        }
        HSA_REGION_SEGMENT_GROUP => {
            scan.group.get_or_insert(region);
        }
        _ => {}
    }
    HSA_STATUS_SUCCESS
}

unsafe extern "C" fn log_queue_error(status: HsaStatus, queue: *mut RawQueue, _data: *mut c_void) {
    let id = if queue.is_null() {
        0
    } else {
        // SAFETY: the runtime passes the queue that raised the error.
        unsafe { (*queue).id }
    };
    tracing::error!(status, queue = id, "HSA queue reported an error");
}

impl HsaRuntime for HsaLibrary {
    fn discover_agents(&self) -> DispatchResult<Vec<AgentDescriptor>> {
        let mut scan = AgentScan {
            fns: &self.fns,
            agents: Vec::new(),
        };
        // SAFETY: `scan` outlives the iteration and the callback only touches it.
        let status = unsafe {
            (self.fns.hsa_iterate_agents)(collect_agent, &mut scan as *mut AgentScan as *mut c_void)
        };
        if status != HSA_STATUS_INFO_BREAK {
            self.check(status, "hsa_iterate_agents")?;
        }
        tracing::info!(agents = scan.agents.len(), "discovered HSA kernel agents");
        scan.agents
            .into_iter()
            .map(|agent| self.describe_agent(agent))
            .collect()
    }

    fn agent_isa(&self, agent: Agent) -> DispatchResult<Isa> {
        let isa: u64 = self.agent_info(agent.raw(), HSA_AGENT_INFO_ISA, "hsa_agent_get_info(ISA)")?;
        Ok(Isa(isa))
    }

    fn program_create(&self) -> DispatchResult<ExtProgram> {
        let mut program = 0u64;
        // SAFETY: `program` is a valid out pointer; options may be null.
        let status = unsafe {
            (self.fns.hsa_ext_program_create)(
                HSA_MACHINE_MODEL_LARGE,
                HSA_PROFILE_FULL,
                HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT,
                ptr::null(),
                &mut program,
            )
        };
        self.check(status, "hsa_ext_program_create")?;
        Ok(ExtProgram(program))
    }

    fn program_add_module(&self, program: ExtProgram, module: &[u8]) -> DispatchResult<()> {
        // SAFETY: the finalizer copies what it needs from the BRIG module during the call.
        let status = unsafe {
            (self.fns.hsa_ext_program_add_module)(program.raw(), module.as_ptr() as *const c_void)
        };
        self.check(status, "hsa_ext_program_add_module")
    }

    fn program_finalize(&self, program: ExtProgram, isa: Isa) -> DispatchResult<CodeObject> {
        let options = c"";
        let mut code_object = 0u64;
        // SAFETY: directives are passed by value, options is NUL-terminated, out pointer valid.
        let status = unsafe {
            (self.fns.hsa_ext_program_finalize)(
                program.raw(),
                isa.raw(),
                0,
                ControlDirectives::zeroed(),
                options.as_ptr(),
                HSA_CODE_OBJECT_TYPE_PROGRAM,
                &mut code_object,
            )
        };
        self.check(status, "hsa_ext_program_finalize")?;
        Ok(CodeObject(code_object))
    }

    fn program_destroy(&self, program: ExtProgram) -> DispatchResult<()> {
        // SAFETY: program was created by hsa_ext_program_create and is destroyed once.
        let status = unsafe { (self.fns.hsa_ext_program_destroy)(program.raw()) };
        self.check(status, "hsa_ext_program_destroy")
    }

    fn code_object_destroy(&self, code_object: CodeObject) -> DispatchResult<()> {
        // SAFETY: no executable created from this code object is alive any more.
        let status = unsafe { (self.fns.hsa_code_object_destroy)(code_object.raw()) };
        self.check(status, "hsa_code_object_destroy")
    }

    fn executable_create(&self) -> DispatchResult<Executable> {
        let options = c"";
        let mut executable = 0u64;
        // SAFETY: options is NUL-terminated and the out pointer is valid.
        let status = unsafe {
            (self.fns.hsa_executable_create)(
                HSA_PROFILE_FULL,
                HSA_EXECUTABLE_STATE_UNFROZEN,
                options.as_ptr(),
                &mut executable,
            )
        };
        self.check(status, "hsa_executable_create")?;
        Ok(Executable(executable))
    }

    fn executable_load_code_object(
        &self,
        executable: Executable,
        agent: Agent,
        code_object: CodeObject,
    ) -> DispatchResult<()> {
        let options = c"";
        // SAFETY: all handles are live; options is NUL-terminated.
        let status = unsafe {
            (self.fns.hsa_executable_load_code_object)(
                executable.raw(),
                agent.raw(),
                code_object.raw(),
                options.as_ptr(),
            )
        };
        self.check(status, "hsa_executable_load_code_object")
    }

    fn executable_freeze(&self, executable: Executable) -> DispatchResult<()> {
        // SAFETY: executable handle is live; options may be null.
        let status = unsafe { (self.fns.hsa_executable_freeze)(executable.raw(), ptr::null()) };
        self.check(status, "hsa_executable_freeze")
    }

    fn executable_symbol(
        &self,
        executable: Executable,
        agent: Agent,
        name: &str,
    ) -> DispatchResult<ExecutableSymbol> {
        let c_name = CString::new(name).map_err(|_| {
            DispatchError::runtime("hsa_executable_get_symbol", 0, "kernel symbol contains NUL byte")
        })?;
        let mut symbol = 0u64;
        // SAFETY: module name may be null for program-scope lookups; out pointer is valid.
        let status = unsafe {
            (self.fns.hsa_executable_get_symbol)(
                executable.raw(),
                ptr::null(),
                c_name.as_ptr(),
                agent.raw(),
                0,
                &mut symbol,
            )
        };
        self.check(status, "hsa_executable_get_symbol")?;
        Ok(ExecutableSymbol(symbol))
    }

    fn symbol_kind(&self, symbol: ExecutableSymbol) -> DispatchResult<SymbolKind> {
        let kind: u32 = self.symbol_info(
            symbol,
            HSA_EXECUTABLE_SYMBOL_INFO_TYPE,
            "hsa_executable_symbol_get_info(TYPE)",
        )?;
        Ok(match kind {
            HSA_SYMBOL_KIND_VARIABLE => SymbolKind::Variable,
            HSA_SYMBOL_KIND_KERNEL => SymbolKind::Kernel,
            HSA_SYMBOL_KIND_INDIRECT_FUNCTION => SymbolKind::IndirectFunction,
            other => SymbolKind::Unknown(other),
        })
    }

    fn kernel_symbol_info(&self, symbol: ExecutableSymbol) -> DispatchResult<KernelSymbolInfo> {
        Ok(KernelSymbolInfo {
            kernel_object: self.symbol_info(
                symbol,
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT,
                "hsa_executable_symbol_get_info(KERNEL_OBJECT)",
            )?,
            group_segment_size: self.symbol_info(
                symbol,
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE,
                "hsa_executable_symbol_get_info(KERNEL_GROUP_SEGMENT_SIZE)",
            )?,
            private_segment_size: self.symbol_info(
                symbol,
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE,
                "hsa_executable_symbol_get_info(KERNEL_PRIVATE_SEGMENT_SIZE)",
            )?,
            kernarg_segment_size: self.symbol_info(
                symbol,
                HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE,
                "hsa_executable_symbol_get_info(KERNEL_KERNARG_SEGMENT_SIZE)",
            )?,
        })
    }

    fn executable_destroy(&self, executable: Executable) -> DispatchResult<()> {
        // SAFETY: executable handle is live and destroyed once.
        let status = unsafe { (self.fns.hsa_executable_destroy)(executable.raw()) };
        self.check(status, "hsa_executable_destroy")
    }

    fn signal_create(&self, initial_value: i64) -> DispatchResult<Signal> {
        let mut signal = 0u64;
        // SAFETY: zero consumers with a null list means any agent may consume the signal.
        let status =
            unsafe { (self.fns.hsa_signal_create)(initial_value, 0, ptr::null(), &mut signal) };
        self.check(status, "hsa_signal_create")?;
        Ok(Signal(signal))
    }

    fn signal_store_relaxed(&self, signal: Signal, value: i64) {
        // SAFETY: signal handle is live.
        unsafe { (self.fns.hsa_signal_store_relaxed)(signal.raw(), value) }
    }

    fn signal_wait_acquire(
        &self,
        signal: Signal,
        condition: SignalCondition,
        compare_value: i64,
        wait_state: WaitState,
    ) -> i64 {
        let condition = match condition {
            SignalCondition::Eq => 0,
            SignalCondition::Ne => 1,
            SignalCondition::Lt => 2,
            SignalCondition::Gte => 3,
        };
        let wait_state = match wait_state {
            WaitState::Blocked => HSA_WAIT_STATE_BLOCKED,
            WaitState::Active => HSA_WAIT_STATE_ACTIVE,
        };
        // SAFETY: signal handle is live; u64::MAX requests no timeout.
        unsafe {
            (self.fns.hsa_signal_wait_acquire)(
                signal.raw(),
                condition,
                compare_value,
                u64::MAX,
                wait_state,
            )
        }
    }

    fn signal_destroy(&self, signal: Signal) -> DispatchResult<()> {
        // SAFETY: signal handle is live and no packet references it any more.
        let status = unsafe { (self.fns.hsa_signal_destroy)(signal.raw()) };
        self.check(status, "hsa_signal_destroy")
    }

    fn memory_allocate(&self, region: Region, size: usize) -> DispatchResult<u64> {
        let mut address: *mut c_void = ptr::null_mut();
        // SAFETY: `address` is a valid out pointer.
        let status = unsafe { (self.fns.hsa_memory_allocate)(region.raw(), size, &mut address) };
        self.check(status, "hsa_memory_allocate")?;
        Ok(address as u64)
    }

    fn memory_free(&self, address: u64) -> DispatchResult<()> {
        // SAFETY: address came from hsa_memory_allocate and is freed once.
        let status = unsafe { (self.fns.hsa_memory_free)(address as *mut c_void) };
        self.check(status, "hsa_memory_free")
    }

    fn queue_create(&self, agent: Agent, size: u32) -> DispatchResult<QueueDescriptor> {
        let mut queue: *mut RawQueue = ptr::null_mut();
        // SAFETY: out pointer is valid; u32::MAX lets the runtime pick segment sizes.
        let status = unsafe {
            (self.fns.hsa_queue_create)(
                agent.raw(),
                size,
                HSA_QUEUE_TYPE_MULTI,
                Some(log_queue_error),
                ptr::null_mut(),
                u32::MAX,
                u32::MAX,
                &mut queue,
            )
        };
        self.check(status, "hsa_queue_create")?;
        // SAFETY: the runtime returned a live queue; its ring holds `size` 64-byte packets.
        unsafe {
            let raw = &*queue;
            Ok(QueueDescriptor::new(
                QueueHandle(queue as u64),
                raw.base_address as *mut KernelDispatchPacket,
                raw.size,
                Signal(raw.doorbell_signal),
            ))
        }
    }

    fn queue_destroy(&self, queue: QueueHandle) -> DispatchResult<()> {
        // SAFETY: queue was created by hsa_queue_create and is destroyed once.
        let status = unsafe { (self.fns.hsa_queue_destroy)(queue.raw() as *mut RawQueue) };
        self.check(status, "hsa_queue_destroy")
    }

    fn queue_load_write_index_relaxed(&self, queue: QueueHandle) -> u64 {
        // SAFETY: queue handle is live.
        unsafe { (self.fns.hsa_queue_load_write_index_relaxed)(queue.raw() as *const RawQueue) }
    }

    fn queue_store_write_index_relaxed(&self, queue: QueueHandle, value: u64) {
        // SAFETY: queue handle is live.
        unsafe {
            (self.fns.hsa_queue_store_write_index_relaxed)(queue.raw() as *const RawQueue, value)
        }
    }

    fn queue_load_read_index_acquire(&self, queue: QueueHandle) -> u64 {
        // SAFETY: queue handle is live.
        unsafe { (self.fns.hsa_queue_load_read_index_acquire)(queue.raw() as *const RawQueue) }
    }
}

fn load_library(candidates: &[&str]) -> DispatchResult<Library> {
    for candidate in candidates {
        // SAFETY: loading only checks that the library exists; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(DispatchError::LibraryUnavailable(format!(
        "failed to load any of {}",
        candidates.join(", ")
    )))
}

fn load_symbol<T: Copy>(libs: &[&Library], name: &'static [u8]) -> DispatchResult<T> {
    for lib in libs {
        // SAFETY: Caller provides the symbol type declared by the HSA headers.
        if let Ok(sym) = unsafe { lib.get::<T>(name) } {
            return Ok(*sym);
        }
    }
    Err(DispatchError::LibraryUnavailable(format!(
        "failed to resolve HSA symbol {}",
        String::from_utf8_lossy(&name[..name.len().saturating_sub(1)])
    )))
}
