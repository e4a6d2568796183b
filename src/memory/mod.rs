//! 宿主内存访问层
//!
//! 外部数据结构所在的地址空间只能通过 [`HostMemory`] trait 访问。
//! 所有读写都按字节范围做边界检查，越界或访问未分配区域会返回
//! [`MemoryError`]，而不是读到相邻对象的数据。
//!
//! 指针宽度固定为 8 字节，小端序。

pub mod arena;

pub use arena::ArenaMemory;

use std::fmt;
use thiserror::Error;

/// 指针宽度（字节）
pub const POINTER_SIZE: usize = 8;

/// 调试分配器使用的未初始化填充值
///
/// 读到这个值的指针一律视为未初始化，绝不解引用。
pub const UNINIT_PATTERN: u64 = 0xd2d2_d2d2_d2d2_d2d2;

/// 未初始化填充字节
pub const UNINIT_BYTE: u8 = 0xd2;

/// 宿主地址
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 是否为调试分配器的毒化值
    pub fn is_uninit(self) -> bool {
        self.0 == UNINIT_PATTERN
    }

    /// 偏移 `bytes` 个字节
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0.wrapping_add(bytes as u64))
    }

    /// 带符号偏移，溢出时返回 `None`
    pub fn checked_displace(self, bytes: i64) -> Option<Address> {
        self.0.checked_add_signed(bytes).map(Address)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 内存访问错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Null address access ({len} bytes)")]
    Null { len: usize },

    #[error("Uninitialized address {0}")]
    Uninitialized(Address),

    #[error("Unmapped address {address} ({len} bytes)")]
    Unmapped { address: Address, len: usize },

    #[error("Access at {address} overruns block by {overrun} bytes")]
    OutOfBounds { address: Address, overrun: usize },

    #[error("Invalid free of {0}")]
    InvalidFree(Address),

    #[error("Out of memory: requested {0} bytes")]
    OutOfMemory(usize),
}

/// 内存结果类型别名
pub type MemoryResult<T> = Result<T, MemoryError>;

/// 宿主地址空间
///
/// 实现者负责边界检查；上层代码从不做裸指针运算。
pub trait HostMemory: Send {
    /// 读取 `buf.len()` 个字节
    fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult<()>;

    /// 写入 `data`
    fn write(&mut self, address: Address, data: &[u8]) -> MemoryResult<()>;

    /// 分配一块清零的内存
    fn allocate(&mut self, size: usize, align: usize) -> MemoryResult<Address>;

    /// 释放 `allocate` 返回的块
    fn free(&mut self, address: Address) -> MemoryResult<()>;

    /// `[address, address + len)` 是否完全可访问
    fn contains(&self, address: Address, len: usize) -> bool;

    /// 存活的分配块数；不跟踪分配的实现返回 `None`
    fn live_blocks(&self) -> Option<usize> {
        None
    }

    // ========================================================================
    // 定宽读写
    // ========================================================================

    fn read_bytes(&self, address: Address, len: usize) -> MemoryResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, address: Address) -> MemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u64(&self, address: Address) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&mut self, address: Address, value: u64) -> MemoryResult<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// 读取指针值（不检查毒化值）
    fn read_ptr(&self, address: Address) -> MemoryResult<Address> {
        self.read_u64(address).map(Address)
    }

    fn write_ptr(&mut self, address: Address, value: Address) -> MemoryResult<()> {
        self.write_u64(address, value.0)
    }

    /// 将 `len` 个字节置为同一个值
    fn fill(&mut self, address: Address, byte: u8, len: usize) -> MemoryResult<()> {
        self.write(address, &vec![byte; len])
    }

    /// 块内复制，源与目标可以重叠
    fn copy_within(&mut self, dst: Address, src: Address, len: usize) -> MemoryResult<()> {
        let bytes = self.read_bytes(src, len)?;
        self.write(dst, &bytes)
    }
}

/// 读取按小端序存储的无符号整数，宽度 1..=8
pub fn read_uint(mem: &dyn HostMemory, address: Address, width: usize) -> MemoryResult<u64> {
    let mut buf = [0u8; 8];
    mem.read(address, &mut buf[..width])?;
    Ok(u64::from_le_bytes(buf))
}

/// 以小端序写入整数的低 `width` 字节
pub fn write_uint(
    mem: &mut dyn HostMemory,
    address: Address,
    width: usize,
    value: u64,
) -> MemoryResult<()> {
    let bytes = value.to_le_bytes();
    mem.write(address, &bytes[..width])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address(0x1000).to_string(), "0x1000");
        assert!(Address::NULL.is_null());
        assert!(Address(UNINIT_PATTERN).is_uninit());
    }

    #[test]
    fn test_checked_displace() {
        assert_eq!(Address(16).checked_displace(-8), Some(Address(8)));
        assert_eq!(Address(4).checked_displace(-8), None);
    }

    #[test]
    fn test_uint_helpers() {
        let mut mem = ArenaMemory::new();
        let addr = mem.allocate(8, 8).unwrap();
        write_uint(&mut mem, addr, 2, 0x1_2345).unwrap();
        assert_eq!(read_uint(&mem, addr, 2).unwrap(), 0x2345);
        assert_eq!(read_uint(&mem, addr, 4).unwrap(), 0x2345);
    }
}
