//! Kernel compile, cache and dispatch for HSA GPU agents.
//!
//! A [`Command::NdRangeKernel`] flows through four stages: the external toolchain lowers the
//! program's `parallel.bc` to BRIG, the [`cache::ProgramCache`] finalizes and keeps the code
//! object and per-kernel dispatch data, [`kernarg`] writes the arguments into the kernarg
//! segment, and [`dispatch`] publishes an AQL packet and waits for completion.
//!
//! All runtime calls go through the [`HsaRuntime`] trait; [`HsaLibrary`] binds it to the
//! system's HSA runtime at run time.

pub mod cache;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernarg;
pub mod packet;
pub mod profiling;
pub mod runtime;
pub mod toolchain;

pub use cache::{CacheStats, KernelMetadata, ProgramCache, Residency, ResolvedProgram, TeardownReport};
pub use command::{Command, HostCommand, KernelArg, KernelId, KernelLaunch, MemObject, ProgramId};
pub use config::{CacheConfig, DeviceConfig, ToolchainConfig};
pub use device::{DeviceRegistry, HsaDevice};
pub use dispatch::DispatchHandle;
pub use error::{DispatchError, DispatchResult, UnimplementedFeature};
pub use runtime::hsa::HsaLibrary;
pub use runtime::{AgentDescriptor, HsaRuntime};
pub use toolchain::{compile_module_to_brig, BrigArtifact};
