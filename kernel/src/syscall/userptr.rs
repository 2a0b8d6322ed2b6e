//! Userspace pointer validation and typed user copies
//!
//! This module provides safe functions for reading and writing userspace memory
//! from kernel context, with proper validation to prevent:
//! - Reading/writing kernel memory via malicious userspace pointers
//! - Integer overflow attacks in pointer arithmetic
//!
//! The byte movement itself is the platform's job; values cross the
//! boundary as `bytemuck::Pod` so no layout assumptions leak out of here.

use bytemuck::Pod;

use crate::error::Error;
use crate::task::Cpu;

/// Userspace address range - below the kernel split
/// On x86_64, the canonical address split is at 0x0000_8000_0000_0000
/// Addresses at or above this value are kernel addresses
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Validate that `[addr, addr + len)` lies entirely in user space
///
/// # Returns
/// * `Ok(())` if the range is valid
/// * `Err(Error::Fault)` otherwise
///
/// # Validation Checks
/// 1. Address is not null
/// 2. Address is within userspace range
/// 3. Address + len doesn't overflow or cross into kernel space
pub fn validate_user_range(addr: u64, len: u64) -> Result<(), Error> {
    if addr == 0 {
        return Err(Error::Fault);
    }

    if addr >= USER_SPACE_END {
        return Err(Error::Fault);
    }

    if addr.checked_add(len).map_or(true, |end| end > USER_SPACE_END) {
        return Err(Error::Fault);
    }

    Ok(())
}

/// Copy a `T` in from user address `addr`
pub fn read_user<T: Pod>(cpu: &Cpu, addr: u64) -> Result<T, Error> {
    let mut value = T::zeroed();
    validate_user_range(addr, core::mem::size_of::<T>() as u64)?;
    cpu.platform()
        .copy_from_user(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

/// Copy `value` out to user address `addr`
pub fn write_user<T: Pod>(cpu: &Cpu, addr: u64, value: &T) -> Result<(), Error> {
    validate_user_range(addr, core::mem::size_of::<T>() as u64)?;
    cpu.platform().copy_to_user(addr, bytemuck::bytes_of(value))
}
