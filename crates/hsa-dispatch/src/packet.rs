//! AQL kernel dispatch packet layout and publication.

use std::mem::{offset_of, size_of};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};

pub const PACKET_TYPE_VENDOR_SPECIFIC: u16 = 0;
pub const PACKET_TYPE_INVALID: u16 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

pub const PACKET_HEADER_TYPE: u16 = 0;
pub const PACKET_HEADER_BARRIER: u16 = 8;
pub const PACKET_HEADER_ACQUIRE_FENCE_SCOPE: u16 = 9;
pub const PACKET_HEADER_RELEASE_FENCE_SCOPE: u16 = 11;

pub const FENCE_SCOPE_NONE: u16 = 0;
pub const FENCE_SCOPE_AGENT: u16 = 1;
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

pub const KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS: u16 = 0;

/// `hsa_kernel_dispatch_packet_t`, 64 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

const _: () = {
    assert!(size_of::<KernelDispatchPacket>() == 64);
    assert!(offset_of!(KernelDispatchPacket, setup) == 2);
    assert!(offset_of!(KernelDispatchPacket, workgroup_size_x) == 4);
    assert!(offset_of!(KernelDispatchPacket, grid_size_x) == 12);
    assert!(offset_of!(KernelDispatchPacket, private_segment_size) == 24);
    assert!(offset_of!(KernelDispatchPacket, group_segment_size) == 28);
    assert!(offset_of!(KernelDispatchPacket, kernel_object) == 32);
    assert!(offset_of!(KernelDispatchPacket, kernarg_address) == 40);
    assert!(offset_of!(KernelDispatchPacket, completion_signal) == 56);
};

impl KernelDispatchPacket {
    pub fn invalid() -> Self {
        Self {
            header: PACKET_TYPE_INVALID << PACKET_HEADER_TYPE,
            ..Self::default()
        }
    }

    pub fn packet_type(&self) -> u16 {
        packet_type(self.header)
    }

    pub fn dimensions(&self) -> u16 {
        (self.setup >> KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS) & 0x3
    }
}

pub fn packet_type(header: u16) -> u16 {
    (header >> PACKET_HEADER_TYPE) & 0xff
}

/// Kernel dispatch with system-scope acquire and release fences.
pub fn kernel_dispatch_header() -> u16 {
    (PACKET_TYPE_KERNEL_DISPATCH << PACKET_HEADER_TYPE)
        | (FENCE_SCOPE_SYSTEM << PACKET_HEADER_ACQUIRE_FENCE_SCOPE)
        | (FENCE_SCOPE_SYSTEM << PACKET_HEADER_RELEASE_FENCE_SCOPE)
}

/// All packet fields the consumer reads after it has observed the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketBody {
    pub workgroup_size: [u16; 3],
    pub grid_size: [u32; 3],
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub completion_signal: u64,
}

/// Writes every field after the header/setup word.
///
/// # Safety
/// `slot` must point at a packet slot owned by the caller: reserved and not yet published,
/// with its header still marking it invalid so the consumer does not read it concurrently.
pub unsafe fn write_body(slot: *mut KernelDispatchPacket, body: &PacketBody) {
    addr_of_mut!((*slot).workgroup_size_x).write(body.workgroup_size[0]);
    addr_of_mut!((*slot).workgroup_size_y).write(body.workgroup_size[1]);
    addr_of_mut!((*slot).workgroup_size_z).write(body.workgroup_size[2]);
    addr_of_mut!((*slot).reserved0).write(0);
    addr_of_mut!((*slot).grid_size_x).write(body.grid_size[0]);
    addr_of_mut!((*slot).grid_size_y).write(body.grid_size[1]);
    addr_of_mut!((*slot).grid_size_z).write(body.grid_size[2]);
    addr_of_mut!((*slot).private_segment_size).write(body.private_segment_size);
    addr_of_mut!((*slot).group_segment_size).write(body.group_segment_size);
    addr_of_mut!((*slot).kernel_object).write(body.kernel_object);
    addr_of_mut!((*slot).kernarg_address).write(body.kernarg_address);
    addr_of_mut!((*slot).reserved2).write(0);
    addr_of_mut!((*slot).completion_signal).write(body.completion_signal);
}

/// Publishes header and setup as one 32-bit release store.
///
/// Every earlier write to the slot happens-before a consumer that acquires the header.
///
/// # Safety
/// `slot` must be a valid, 4-byte aligned packet slot whose body was written by
/// [`write_body`] on this thread.
pub unsafe fn publish(slot: *mut KernelDispatchPacket, header: u16, setup: u16) {
    let word = AtomicU32::from_ptr(slot.cast::<u32>());
    word.store(u32::from(header) | (u32::from(setup) << 16), Ordering::Release);
}

/// Reads the header word with acquire ordering, as a packet processor does.
///
/// # Safety
/// `slot` must be a valid, 4-byte aligned packet slot.
pub unsafe fn load_header_acquire(slot: *mut KernelDispatchPacket) -> (u16, u16) {
    let word = AtomicU32::from_ptr(slot.cast::<u32>()).load(Ordering::Acquire);
    (word as u16, (word >> 16) as u16)
}

/// Marks a consumed slot invalid again.
///
/// # Safety
/// `slot` must be a valid, 4-byte aligned packet slot the caller has finished reading.
pub unsafe fn invalidate(slot: *mut KernelDispatchPacket) {
    let word = AtomicU32::from_ptr(slot.cast::<u32>());
    word.store(u32::from(PACKET_TYPE_INVALID << PACKET_HEADER_TYPE), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_header_encodes_type_and_system_fences() {
        let header = kernel_dispatch_header();
        assert_eq!(packet_type(header), PACKET_TYPE_KERNEL_DISPATCH);
        assert_eq!((header >> PACKET_HEADER_ACQUIRE_FENCE_SCOPE) & 0x3, FENCE_SCOPE_SYSTEM);
        assert_eq!((header >> PACKET_HEADER_RELEASE_FENCE_SCOPE) & 0x3, FENCE_SCOPE_SYSTEM);
        assert_eq!((header >> PACKET_HEADER_BARRIER) & 0x1, 0);
    }

    #[test]
    fn body_then_publish_produces_complete_packet() {
        let mut packet = KernelDispatchPacket::invalid();
        let body = PacketBody {
            workgroup_size: [64, 2, 1],
            grid_size: [256, 4, 1],
            private_segment_size: 16,
            group_segment_size: 272,
            kernel_object: 0xdead_0000,
            kernarg_address: 0x7000,
            completion_signal: 9,
        };
        let slot: *mut KernelDispatchPacket = &mut packet;
        unsafe {
            write_body(slot, &body);
            assert_eq!(load_header_acquire(slot).0, PACKET_TYPE_INVALID);
            publish(slot, kernel_dispatch_header(), 2);
        }

        assert_eq!(packet.packet_type(), PACKET_TYPE_KERNEL_DISPATCH);
        assert_eq!(packet.dimensions(), 2);
        assert_eq!(packet.workgroup_size_x, 64);
        assert_eq!(packet.grid_size_y, 4);
        assert_eq!(packet.group_segment_size, 272);
        assert_eq!(packet.kernarg_address, 0x7000);
        assert_eq!(packet.completion_signal, 9);

        unsafe { invalidate(slot) };
        assert_eq!(packet.packet_type(), PACKET_TYPE_INVALID);
        assert_eq!(packet.setup, 0);
    }
}
