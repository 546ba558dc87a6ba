//! macOS backend: task-port region walking and out-of-task reads.
//!
//! Region enumeration walks the target task's virtual memory map with
//! `mach_vm_region` and keeps only writable regions tagged for the
//! small-object nano allocator, which is where the client keeps its key
//! structure on this platform. Bytes are copied out of the task with
//! `mach_vm_read_overwrite`.

use std::mem;
use std::os::raw::c_int;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::message::mach_msg_type_number_t;
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region};
use mach2::vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_extended_info_data_t, vm_region_info_t, VM_REGION_EXTENDED_INFO};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

use crate::backend::{MemoryBackend, RegionReader, READ_ATTEMPTS};
use crate::error::{ExtractError, ExtractResult};
use crate::region::{filter_candidate_regions, MemoryRegion, Protection, RegionBuffer, RegionClass};

/// Allocator tag of the nano malloc zone (mach/vm_statistics.h).
const VM_MEMORY_MALLOC_NANO: u32 = 11;

/// KERN_PROTECTION_FAILURE: the page exists but forbids the access.
const KERN_PROTECTION: kern_return_t = 2;

/// Owned task port, deallocated on drop.
struct TaskPort(mach_port_t);

impl TaskPort {
    fn acquire(pid: u32) -> ExtractResult<Self> {
        let mut port: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe { task_for_pid(mach_task_self(), pid as c_int, &mut port) };
        if kr != KERN_SUCCESS {
            // task_for_pid refuses for both privilege and entitlement
            // reasons; the pipeline's liveness probe has already ruled out
            // a dead target.
            return Err(ExtractError::PermissionDenied);
        }
        Ok(TaskPort(port))
    }
}

impl Drop for TaskPort {
    fn drop(&mut self) {
        if self.0 != MACH_PORT_NULL {
            unsafe {
                mach2::mach_port::mach_port_deallocate(mach_task_self(), self.0);
            }
        }
    }
}

pub struct MachBackend;

impl MachBackend {
    pub fn new() -> Self {
        MachBackend
    }
}

impl Default for MachBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for MachBackend {
    fn name(&self) -> &'static str {
        "mach"
    }

    fn probe(&self, pid: u32) -> ExtractResult<()> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Err(ExtractError::TargetOffline),
            // EPERM: the process exists but is not ours; the task port
            // acquisition decides whether we may inspect it.
            _ => Ok(()),
        }
    }

    fn enumerate(&self, pid: u32) -> ExtractResult<Vec<MemoryRegion>> {
        let task = TaskPort::acquire(pid)?;
        let mut regions = Vec::new();
        let mut address: mach_vm_address_t = 0;

        loop {
            let mut size: mach_vm_size_t = 0;
            let mut info: vm_region_extended_info_data_t = unsafe { mem::zeroed() };
            let mut count = (mem::size_of::<vm_region_extended_info_data_t>()
                / mem::size_of::<c_int>()) as mach_msg_type_number_t;
            let mut object_name: mach_port_t = MACH_PORT_NULL;

            let kr = unsafe {
                mach_vm_region(
                    task.0,
                    &mut address,
                    &mut size,
                    VM_REGION_EXTENDED_INFO,
                    &mut info as *mut _ as vm_region_info_t,
                    &mut count,
                    &mut object_name,
                )
            };
            if kr != KERN_SUCCESS {
                // End of the address space (or the task died mid-walk with
                // an empty map, which the caller reports as no regions).
                break;
            }

            if info.user_tag == VM_MEMORY_MALLOC_NANO {
                regions.push(MemoryRegion {
                    start: address,
                    end: address + size,
                    perms: prot_to_protection(info.protection),
                    class: RegionClass::Heap,
                    label: Some("malloc-nano".to_string()),
                });
            }

            address += size;
        }

        Ok(filter_candidate_regions(regions))
    }

    fn open_reader(&self, pid: u32) -> ExtractResult<Box<dyn RegionReader>> {
        Ok(Box::new(MachReader { task: TaskPort::acquire(pid)? }))
    }
}

/// Byte source copying out of a foreign task.
pub struct MachReader {
    task: TaskPort,
}

// The port name is a plain integer handle; reads through it are kernel
// calls with no client-side state.
unsafe impl Send for MachReader {}
unsafe impl Sync for MachReader {}

impl MachReader {
    fn read_exact(&self, addr: u64, buf: &mut [u8]) -> ExtractResult<()> {
        let want = buf.len() as mach_vm_size_t;
        let mut last_kr = KERN_SUCCESS;
        for _ in 0..READ_ATTEMPTS {
            let mut out_size: mach_vm_size_t = 0;
            let kr = unsafe {
                mach_vm_read_overwrite(
                    self.task.0,
                    addr,
                    want,
                    buf.as_mut_ptr() as mach_vm_address_t,
                    &mut out_size,
                )
            };
            if kr == KERN_SUCCESS && out_size == want {
                return Ok(());
            }
            last_kr = kr;
        }
        if last_kr == KERN_PROTECTION {
            Err(ExtractError::PermissionDenied)
        } else {
            Err(ExtractError::internal(format!(
                "task read of {want} bytes at {addr:#x} failed (kern {last_kr})"
            )))
        }
    }
}

impl RegionReader for MachReader {
    fn read_region(&self, region: &MemoryRegion) -> ExtractResult<RegionBuffer> {
        let mut data = vec![0u8; region.size() as usize];
        self.read_exact(region.start, &mut data)?;
        Ok(RegionBuffer { start: region.start, class: region.class, data })
    }

    fn point_read(&self, addr: u64, len: usize) -> ExtractResult<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.read_exact(addr, &mut data)?;
        Ok(data)
    }
}

fn prot_to_protection(prot: vm_prot_t) -> Protection {
    Protection {
        read: prot & VM_PROT_READ != 0,
        write: prot & VM_PROT_WRITE != 0,
        execute: prot & VM_PROT_EXECUTE != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prot_bits() {
        let rw = prot_to_protection(VM_PROT_READ | VM_PROT_WRITE);
        assert!(rw.is_read_write());
        assert!(!rw.execute);

        let rx = prot_to_protection(VM_PROT_READ | VM_PROT_EXECUTE);
        assert!(!rx.is_read_write());
        assert!(rx.execute);
    }

    #[test]
    fn test_read_own_memory() {
        let backend = MachBackend::new();
        let reader = backend.open_reader(std::process::id()).unwrap();
        let local = vec![0x5Au8; 64];
        let got = reader.point_read(local.as_ptr() as u64, 32).unwrap();
        assert_eq!(got, vec![0x5Au8; 32]);
    }
}
