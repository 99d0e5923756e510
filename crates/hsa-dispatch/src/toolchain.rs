use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ToolchainConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::profiling;

pub const PARALLEL_BC_FILENAME: &str = "parallel.bc";
pub const HSAIL_STAGE: &str = "hsail";
pub const BRIG_STAGE: &str = "brig";
/// Assembler output before it is known to be complete.
pub const BRIG_PARTIAL_STAGE: &str = "brig.partial";

/// BRIG module ready for finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrigArtifact {
    pub path: PathBuf,
    pub blob: Vec<u8>,
    /// The `.brig` file already existed and no tool was run.
    pub reused: bool,
}

/// `<work_dir>/parallel.bc.<stage>`.
pub fn stage_path(work_dir: &Path, stage: &str) -> PathBuf {
    work_dir.join(format!("{PARALLEL_BC_FILENAME}.{stage}"))
}

/// Lowers `<work_dir>/parallel.bc` to BRIG, or reuses an existing `parallel.bc.brig`.
///
/// Reuse is keyed on the path only; the caller owns staleness of the work directory.
pub fn compile_module_to_brig(
    work_dir: &Path,
    config: &ToolchainConfig,
) -> DispatchResult<BrigArtifact> {
    let brig_path = stage_path(work_dir, BRIG_STAGE);

    let reused = brig_path.exists();
    if reused {
        profiling::cache_event("hsa_dispatch.brig_hit_disk");
        tracing::debug!(path = %brig_path.display(), "reusing BRIG artifact");
    } else {
        profiling::cache_event("hsa_dispatch.brig_miss_disk");
        let bc_path = work_dir.join(PARALLEL_BC_FILENAME);
        if !bc_path.exists() {
            return Err(DispatchError::io(
                &bc_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "kernel bytecode not found"),
            ));
        }
        let hsail_path = stage_path(work_dir, HSAIL_STAGE);

        let _compile_scope = profiling::compile_scope("hsa_dispatch.compile_brig");
        let mut lower = Command::new(&config.llc);
        lower
            .arg("-O2")
            .arg("-march=hsail64")
            .arg("-filetype=asm")
            .args(&config.llc_extra_args)
            .arg("-o")
            .arg(&hsail_path)
            .arg(&bc_path);
        run_tool(&config.llc, lower)?;

        // Only a successful assembly may appear at the reused path.
        let partial_path = stage_path(work_dir, BRIG_PARTIAL_STAGE);
        let mut assemble = Command::new(&config.hsail_asm);
        assemble.arg("-o").arg(&partial_path).arg(&hsail_path);
        if let Err(err) = run_tool(&config.hsail_asm, assemble) {
            remove_partial(&partial_path);
            return Err(err);
        }
        std::fs::rename(&partial_path, &brig_path)
            .map_err(|err| DispatchError::io(&brig_path, err))?;
        tracing::info!(path = %brig_path.display(), "compiled BRIG artifact");
    }

    let blob = std::fs::read(&brig_path).map_err(|err| DispatchError::io(&brig_path, err))?;
    Ok(BrigArtifact {
        path: brig_path,
        blob,
        reused,
    })
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial BRIG artifact"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove partial BRIG artifact")
        }
    }
}

fn run_tool(tool: &Path, mut command: Command) -> DispatchResult<()> {
    let name = tool.display().to_string();
    let output = command.output().map_err(|err| {
        DispatchError::toolchain(name.clone(), None, format!("failed to run {name}: {err}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(tool = %name, status = ?output.status.code(), "toolchain step failed");
        return Err(DispatchError::toolchain(name, output.status.code(), stderr.trim()));
    }
    tracing::debug!(tool = %name, "toolchain step succeeded");
    Ok(())
}
