//! Commands handed to the device by the host runtime.
//!
//! Only [`Command::NdRangeKernel`] reaches the compile/cache/dispatch pipeline; every other
//! command kind is executed by the host runtime and ignored here.

use std::path::PathBuf;
use std::sync::Arc;

/// Stable identity of a program for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Stable identity of a kernel within its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

/// Buffer with one device-resident address per device index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemObject {
    device_addresses: Vec<Option<u64>>,
}

impl MemObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_address(mut self, device_index: usize, address: u64) -> Self {
        self.set_device_address(device_index, address);
        self
    }

    pub fn set_device_address(&mut self, device_index: usize, address: u64) {
        if self.device_addresses.len() <= device_index {
            self.device_addresses.resize(device_index + 1, None);
        }
        self.device_addresses[device_index] = Some(address);
    }

    pub fn device_address(&self, device_index: usize) -> Option<u64> {
        self.device_addresses.get(device_index).copied().flatten()
    }
}

/// One kernel argument, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    /// Value bytes copied verbatim.
    Scalar(Vec<u8>),
    /// Global buffer; `None` is a null pointer.
    Buffer(Option<Arc<MemObject>>),
    /// Dynamically sized local buffer of `size` bytes.
    Local { size: u64 },
    Image,
    Sampler,
}

impl KernelArg {
    pub fn i32(value: i32) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn u32(value: u32) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn u64(value: u64) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn f32(value: f32) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn buffer(mem: Arc<MemObject>) -> Self {
        KernelArg::Buffer(Some(mem))
    }

    pub fn null_buffer() -> Self {
        KernelArg::Buffer(None)
    }

    pub fn local(size: u64) -> Self {
        KernelArg::Local { size }
    }
}

/// An NDRange kernel launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub program: ProgramId,
    /// Directory holding `parallel.bc` and the derived stage artifacts.
    pub work_dir: PathBuf,
    pub kernel: KernelId,
    /// Kernel name without the `&` symbol prefix.
    pub kernel_name: String,
    pub args: Vec<KernelArg>,
    pub work_dim: u32,
    pub local_size: [u64; 3],
    pub num_groups: [u64; 3],
    /// Sizes of local buffers the kernel declares itself; not supported.
    pub automatic_local_sizes: Vec<u64>,
}

impl KernelLaunch {
    /// One-dimensional launch of a single work item.
    pub fn new(
        program: ProgramId,
        work_dir: impl Into<PathBuf>,
        kernel: KernelId,
        kernel_name: impl Into<String>,
    ) -> Self {
        Self {
            program,
            work_dir: work_dir.into(),
            kernel,
            kernel_name: kernel_name.into(),
            args: Vec::new(),
            work_dim: 1,
            local_size: [1; 3],
            num_groups: [1; 3],
            automatic_local_sizes: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<KernelArg>) -> Self {
        self.args = args;
        self
    }

    /// Sets the range as workgroup counts and sizes; missing axes default to 1.
    pub fn with_groups(mut self, num_groups: &[u64], local_size: &[u64]) -> Self {
        self.work_dim = num_groups.len().max(local_size.len()) as u32;
        self.num_groups = [1; 3];
        self.local_size = [1; 3];
        for (axis, value) in num_groups.iter().take(3).enumerate() {
            self.num_groups[axis] = *value;
        }
        for (axis, value) in local_size.iter().take(3).enumerate() {
            self.local_size[axis] = *value;
        }
        self
    }

    /// Work items along each axis; saturates instead of wrapping.
    pub fn global_size(&self) -> [u64; 3] {
        [
            self.num_groups[0].saturating_mul(self.local_size[0]),
            self.num_groups[1].saturating_mul(self.local_size[1]),
            self.num_groups[2].saturating_mul(self.local_size[2]),
        ]
    }
}

/// Commands the host runtime executes without this device's dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    MapBuffer,
    UnmapBuffer,
    Marker,
    Barrier,
}

impl HostCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostCommand::ReadBuffer => "read_buffer",
            HostCommand::WriteBuffer => "write_buffer",
            HostCommand::CopyBuffer => "copy_buffer",
            HostCommand::MapBuffer => "map_buffer",
            HostCommand::UnmapBuffer => "unmap_buffer",
            HostCommand::Marker => "marker",
            HostCommand::Barrier => "barrier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NdRangeKernel(KernelLaunch),
    Host(HostCommand),
}

impl Command {
    pub fn kernel_launch(&self) -> Option<&KernelLaunch> {
        match self {
            Command::NdRangeKernel(launch) => Some(launch),
            Command::Host(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_object_addresses_are_per_device() {
        let mem = MemObject::new().with_device_address(2, 0x4000);
        assert_eq!(mem.device_address(2), Some(0x4000));
        assert_eq!(mem.device_address(0), None);
        assert_eq!(mem.device_address(7), None);
    }

    #[test]
    fn groups_fill_missing_axes_with_one() {
        let launch = KernelLaunch::new(ProgramId(1), "/tmp", KernelId(1), "k")
            .with_groups(&[4, 2], &[64, 8]);
        assert_eq!(launch.work_dim, 2);
        assert_eq!(launch.num_groups, [4, 2, 1]);
        assert_eq!(launch.global_size(), [256, 16, 1]);
    }

    #[test]
    fn host_commands_carry_no_kernel() {
        assert!(Command::Host(HostCommand::Marker).kernel_launch().is_none());
    }
}
