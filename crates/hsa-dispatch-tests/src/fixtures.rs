use std::path::Path;
use std::sync::Arc;

use hsa_dispatch::toolchain::{stage_path, BRIG_STAGE, PARALLEL_BC_FILENAME};
use hsa_dispatch::{
    CacheConfig, DeviceConfig, HsaDevice, KernelId, KernelLaunch, ProgramId, ToolchainConfig,
};
use tempfile::TempDir;

use crate::mock::MockRuntime;

/// Work directory whose `parallel.bc.brig` already exists, so no tool runs.
pub fn brig_work_dir(brig: &[u8]) -> TempDir {
    let dir = tempfile::tempdir().expect("failed to create work dir");
    std::fs::write(stage_path(dir.path(), BRIG_STAGE), brig).expect("failed to seed BRIG");
    dir
}

/// Work directory holding only `parallel.bc`.
pub fn bitcode_work_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("failed to create work dir");
    std::fs::write(dir.path().join(PARALLEL_BC_FILENAME), b"BC\xc0\xde")
        .expect("failed to seed bitcode");
    dir
}

/// Toolchain whose tools do not exist; any invocation fails.
pub fn unreachable_toolchain(dir: &Path) -> ToolchainConfig {
    ToolchainConfig {
        llc: dir.join("no-such-llc"),
        hsail_asm: dir.join("no-such-hsailasm"),
        llc_extra_args: Vec::new(),
    }
}

/// Fake `llc`/`HSAILasm` pair that appends one line per run to `<tools>/invocations`.
#[cfg(unix)]
pub fn counting_toolchain(tools: &Path) -> ToolchainConfig {
    use std::os::unix::fs::PermissionsExt;

    let log = tools.join("invocations");
    let write_tool = |name: &str, body: String| {
        let path = tools.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write tool");
        let mut perms = std::fs::metadata(&path).expect("tool metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("failed to chmod tool");
        path
    };
    let llc = write_tool(
        "llc",
        format!(
            r#"echo llc >> "{}"; while [ "$1" != "-o" ]; do shift; done; echo hsail > "$2""#,
            log.display()
        ),
    );
    let hsail_asm = write_tool(
        "HSAILasm",
        format!(r#"echo asm >> "{}"; printf BRIG > "$2""#, log.display()),
    );
    ToolchainConfig {
        llc,
        hsail_asm,
        llc_extra_args: Vec::new(),
    }
}

/// Lines written by [`counting_toolchain`] so far.
pub fn tool_invocations(tools: &Path) -> Vec<String> {
    std::fs::read_to_string(tools.join("invocations"))
        .map(|log| log.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn device_config(program_capacity: usize, kernel_capacity: usize) -> DeviceConfig {
    DeviceConfig {
        cache: CacheConfig {
            program_capacity,
            kernel_capacity,
        },
        ..DeviceConfig::default()
    }
}

pub fn open_device(runtime: &Arc<MockRuntime>, config: DeviceConfig) -> HsaDevice<MockRuntime> {
    HsaDevice::open(Arc::clone(runtime), &runtime.agent(), 0, config).expect("failed to open device")
}

pub fn launch(program: u64, kernel: u64, name: &str, work_dir: &Path) -> KernelLaunch {
    KernelLaunch::new(ProgramId(program), work_dir, KernelId(kernel), name)
}
