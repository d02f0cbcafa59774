//! Host-memory stand-in for accelerator memory, shared by the CPU runtimes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{DeviceAddress, DeviceBuffer, SessionError, SessionResult};

const BASE_ADDRESS: u64 = 0x1000;
const ALIGNMENT: u64 = 256;

#[derive(Default)]
struct ArenaInner {
    capacity: Option<usize>,
    used: usize,
    next: u64,
    slots: HashMap<u64, Vec<u8>>,
}

/// Addressable pool of host allocations with an optional capacity limit.
#[derive(Clone, Default)]
pub struct HostArena {
    inner: Arc<Mutex<ArenaInner>>,
}

impl HostArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        let arena = Self::default();
        arena.lock().capacity = Some(bytes);
        arena
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate(&self, byte_len: usize) -> SessionResult<HostBuffer> {
        let mut inner = self.lock();
        if let Some(capacity) = inner.capacity {
            let available = capacity.saturating_sub(inner.used);
            if byte_len > available {
                return Err(SessionError::Allocation {
                    requested: byte_len,
                    available,
                });
            }
        }

        let address = BASE_ADDRESS + inner.next;
        inner.next += (byte_len as u64).div_ceil(ALIGNMENT).max(1) * ALIGNMENT;
        inner.used += byte_len;
        inner.slots.insert(address, vec![0u8; byte_len]);

        Ok(HostBuffer {
            arena: self.clone(),
            address: DeviceAddress(address),
            byte_len,
        })
    }

    pub fn write(&self, address: DeviceAddress, src: &[u8]) -> SessionResult<()> {
        let mut inner = self.lock();
        let slot = slot_mut(&mut inner, address)?;
        if slot.len() != src.len() {
            return Err(SessionError::InputSize {
                expected: slot.len(),
                actual: src.len(),
            });
        }
        slot.copy_from_slice(src);
        Ok(())
    }

    pub fn read(&self, address: DeviceAddress, dst: &mut [u8]) -> SessionResult<()> {
        let mut inner = self.lock();
        let slot = slot_mut(&mut inner, address)?;
        if slot.len() != dst.len() {
            return Err(SessionError::Device {
                op: "copy_to_host",
                message: format!(
                    "host buffer is {} bytes, device buffer is {}",
                    dst.len(),
                    slot.len()
                ),
            });
        }
        dst.copy_from_slice(slot);
        Ok(())
    }

    /// Runs `f` over the input slot and a mutable output slot.
    pub fn with_slots<T>(
        &self,
        input: DeviceAddress,
        output: DeviceAddress,
        f: impl FnOnce(&[u8], &mut [u8]) -> T,
    ) -> SessionResult<T> {
        if input == output {
            return Err(SessionError::Device {
                op: "enqueue",
                message: "input and output bindings alias the same buffer".to_string(),
            });
        }
        let mut inner = self.lock();
        let mut out = inner.slots.remove(&output.0).ok_or_else(|| unknown(output))?;
        let result = match inner.slots.get(&input.0) {
            Some(src) => Ok(f(src, &mut out)),
            None => Err(unknown(input)),
        };
        inner.slots.insert(output.0, out);
        result
    }

    pub fn used(&self) -> usize {
        self.lock().used
    }

    fn free(&self, address: DeviceAddress) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.remove(&address.0) {
            inner.used -= slot.len();
        }
    }
}

fn slot_mut(inner: &mut ArenaInner, address: DeviceAddress) -> SessionResult<&mut Vec<u8>> {
    inner.slots.get_mut(&address.0).ok_or_else(|| unknown(address))
}

fn unknown(address: DeviceAddress) -> SessionError {
    SessionError::Device {
        op: "bind",
        message: format!("no allocation at address {:#x}", address.0),
    }
}

/// Allocation in a [`HostArena`]; released when dropped.
pub struct HostBuffer {
    arena: HostArena,
    address: DeviceAddress,
    byte_len: usize,
}

impl DeviceBuffer for HostBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        self.arena.free(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_limits_allocations_and_drop_frees() {
        let arena = HostArena::with_capacity(100);
        let a = arena.allocate(60).unwrap();
        let err = arena.allocate(60).err().unwrap();
        assert!(matches!(
            err,
            SessionError::Allocation {
                requested: 60,
                available: 40
            }
        ));
        drop(a);
        assert_eq!(arena.used(), 0);
        arena.allocate(60).unwrap();
    }

    #[test]
    fn addresses_are_distinct_and_aligned() {
        let arena = HostArena::new();
        let a = arena.allocate(3).unwrap();
        let b = arena.allocate(300).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.address().0 % ALIGNMENT, 0);
        assert_eq!(b.address().0 % ALIGNMENT, 0);
    }

    #[test]
    fn write_read_and_kernel_access() {
        let arena = HostArena::new();
        let input = arena.allocate(4).unwrap();
        let output = arena.allocate(4).unwrap();
        arena.write(input.address(), &[1, 2, 3, 4]).unwrap();
        arena
            .with_slots(input.address(), output.address(), |src, dst| {
                for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
                    *d = *s;
                }
            })
            .unwrap();
        let mut host = [0u8; 4];
        arena.read(output.address(), &mut host).unwrap();
        assert_eq!(host, [4, 3, 2, 1]);
    }

    #[test]
    fn unknown_address_is_a_device_error() {
        let arena = HostArena::new();
        let input = arena.allocate(4).unwrap();
        let err = arena
            .with_slots(input.address(), DeviceAddress(0xdead), |_, _| ())
            .unwrap_err();
        assert!(matches!(err, SessionError::Device { .. }));
        assert!(arena.write(DeviceAddress(0xdead), &[0]).is_err());
    }
}
