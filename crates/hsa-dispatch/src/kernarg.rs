//! Kernel argument marshalling into the kernarg segment.

use crate::command::KernelArg;
use crate::error::{DispatchError, DispatchResult, UnimplementedFeature};

/// Cursor over a kernarg buffer that refuses to write past its end.
#[derive(Debug)]
pub struct KernargWriter<'a> {
    buf: &'a mut [u8],
    cursor: usize,
    arg_index: usize,
}

impl<'a> KernargWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            cursor: 0,
            arg_index: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn write_u64(&mut self, value: u64) -> DispatchResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> DispatchResult<()> {
        if bytes.len() > self.remaining() {
            return Err(DispatchError::KernargOverflow {
                index: self.arg_index,
                offset: self.cursor,
                required: bytes.len(),
                capacity: self.buf.len(),
            });
        }
        let end = self.cursor + bytes.len();
        self.buf[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;
        Ok(())
    }
}

/// Result of writing every argument of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalledArgs {
    pub bytes_written: usize,
    /// Bytes of group memory claimed by local arguments.
    pub dynamic_group_size: u64,
}

/// Writes `args` in declaration order.
///
/// Local arguments receive their offset in the dynamic group segment, which grows from 0.
/// Buffers resolve to the address registered for `device_index`.
pub fn marshal_kernel_args(
    buf: &mut [u8],
    args: &[KernelArg],
    device_index: usize,
) -> DispatchResult<MarshalledArgs> {
    let mut writer = KernargWriter::new(buf);
    let mut dynamic_group_size = 0u64;

    for (index, arg) in args.iter().enumerate() {
        writer.arg_index = index;
        match arg {
            KernelArg::Local { size } => {
                writer.write_u64(dynamic_group_size)?;
                dynamic_group_size = dynamic_group_size.saturating_add(*size);
            }
            KernelArg::Buffer(None) => writer.write_u64(0)?,
            KernelArg::Buffer(Some(mem)) => {
                let address = mem.device_address(device_index).ok_or_else(|| {
                    DispatchError::invalid_argument(
                        index,
                        format!("buffer has no address on device {device_index}"),
                    )
                })?;
                writer.write_u64(address)?;
            }
            KernelArg::Image => {
                return Err(DispatchError::unimplemented(
                    UnimplementedFeature::ImageArgument,
                ))
            }
            KernelArg::Sampler => {
                return Err(DispatchError::unimplemented(
                    UnimplementedFeature::SamplerArgument,
                ))
            }
            KernelArg::Scalar(bytes) => writer.write_bytes(bytes)?,
        }
    }

    Ok(MarshalledArgs {
        bytes_written: writer.position(),
        dynamic_group_size,
    })
}

/// Static plus dynamic group segment, as stored in the dispatch packet.
pub fn total_group_segment_size(static_size: u32, dynamic_size: u64) -> DispatchResult<u32> {
    let total = u64::from(static_size).saturating_add(dynamic_size);
    u32::try_from(total).map_err(|_| DispatchError::LocalMemoryExceeded {
        required: total,
        available: u64::from(u32::MAX),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::MemObject;

    #[test]
    fn scalar_pointer_local_layout() {
        let mem = Arc::new(MemObject::new().with_device_address(0, 0x1000));
        let args = vec![KernelArg::i32(7), KernelArg::buffer(mem), KernelArg::local(256)];
        let mut buf = [0xAAu8; 20];

        let marshalled = marshal_kernel_args(&mut buf, &args, 0).expect("marshal");

        assert_eq!(&buf[0..4], &[7, 0, 0, 0]);
        assert_eq!(&buf[4..12], &0x1000u64.to_le_bytes());
        assert_eq!(&buf[12..20], &[0u8; 8]);
        assert_eq!(marshalled.bytes_written, 20);
        assert_eq!(marshalled.dynamic_group_size, 256);
        assert_eq!(total_group_segment_size(64, marshalled.dynamic_group_size).unwrap(), 320);
    }

    #[test]
    fn local_offsets_accumulate() {
        let args = vec![KernelArg::local(128), KernelArg::local(64), KernelArg::local(32)];
        let mut buf = [0u8; 24];
        let marshalled = marshal_kernel_args(&mut buf, &args, 0).expect("marshal");
        assert_eq!(&buf[8..16], &128u64.to_le_bytes());
        assert_eq!(&buf[16..24], &192u64.to_le_bytes());
        assert_eq!(marshalled.dynamic_group_size, 224);
    }

    #[test]
    fn null_buffer_writes_eight_zero_bytes() {
        let mut buf = [0xFFu8; 8];
        marshal_kernel_args(&mut buf, &[KernelArg::null_buffer()], 0).expect("marshal");
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn one_byte_short_buffer_overflows_without_writing_past_bound() {
        let mut backing = [0xEEu8; 12];
        let (kernarg, guard) = backing.split_at_mut(11);
        let args = vec![KernelArg::i32(1), KernelArg::u64(2)];

        let err = marshal_kernel_args(kernarg, &args, 0).unwrap_err();
        assert!(err.is_fatal());
        match err {
            DispatchError::KernargOverflow {
                index,
                offset,
                required,
                capacity,
            } => {
                assert_eq!((index, offset, required, capacity), (1, 4, 8, 11));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(guard, &[0xEE]);
        assert_eq!(&kernarg[4..], &[0xEE; 7]);
    }

    #[test]
    fn image_and_sampler_are_unimplemented() {
        let mut buf = [0u8; 16];
        let err = marshal_kernel_args(&mut buf, &[KernelArg::Image], 0).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Unimplemented {
                feature: UnimplementedFeature::ImageArgument
            }
        ));
        let err = marshal_kernel_args(&mut buf, &[KernelArg::u32(1), KernelArg::Sampler], 0)
            .unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[test]
    fn buffer_without_device_address_is_invalid() {
        let mem = Arc::new(MemObject::new().with_device_address(1, 0x2000));
        let mut buf = [0u8; 8];
        let err = marshal_kernel_args(&mut buf, &[KernelArg::buffer(mem)], 0).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument { index: 0, .. }));
    }

    #[test]
    fn group_total_beyond_u32_is_reported() {
        let err = total_group_segment_size(16, u64::from(u32::MAX)).unwrap_err();
        assert!(matches!(err, DispatchError::LocalMemoryExceeded { .. }));
    }
}
