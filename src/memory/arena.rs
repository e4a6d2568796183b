//! 带边界检查的块式地址空间

use super::{Address, HostMemory, MemoryError, MemoryResult};
use std::collections::BTreeMap;

/// 起始地址，远离 0 以便空指针解引用总是失败
const ARENA_BASE: u64 = 0x1000_0000;

/// 块之间的保护间隔
const GUARD_GAP: u64 = 64;

/// 单次分配上限
const MAX_ALLOCATION: usize = 1 << 30;

/// 块式宿主内存
///
/// 每次分配得到独立的块，块之间留有保护间隔，跨块访问会报
/// [`MemoryError::OutOfBounds`]。释放后的地址不会被复用。
#[derive(Debug)]
pub struct ArenaMemory {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
    allocated_bytes: usize,
}

impl Default for ArenaMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaMemory {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: ARENA_BASE,
            allocated_bytes: 0,
        }
    }

    /// 当前存活块数量
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// 当前已分配字节数
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// 定位包含 `address` 的块，返回 (块基址, 块内偏移)
    fn locate(&self, address: Address, len: usize) -> MemoryResult<(u64, usize)> {
        if address.is_null() {
            return Err(MemoryError::Null { len });
        }
        if address.is_uninit() {
            return Err(MemoryError::Uninitialized(address));
        }
        let (base, block) = self
            .blocks
            .range(..=address.0)
            .next_back()
            .ok_or(MemoryError::Unmapped { address, len })?;
        let offset = (address.0 - base) as usize;
        if offset >= block.len().max(1) && !(offset == block.len() && len == 0) {
            return Err(MemoryError::Unmapped { address, len });
        }
        let end = offset + len;
        if end > block.len() {
            return Err(MemoryError::OutOfBounds {
                address,
                overrun: end - block.len(),
            });
        }
        Ok((*base, offset))
    }
}

impl HostMemory for ArenaMemory {
    fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult<()> {
        let (base, offset) = self.locate(address, buf.len())?;
        let block = &self.blocks[&base];
        buf.copy_from_slice(&block[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> MemoryResult<()> {
        let (base, offset) = self.locate(address, data.len())?;
        if let Some(block) = self.blocks.get_mut(&base) {
            block[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn allocate(&mut self, size: usize, align: usize) -> MemoryResult<Address> {
        if size > MAX_ALLOCATION {
            return Err(MemoryError::OutOfMemory(size));
        }
        let align = align.max(16) as u64;
        let base = self.next.div_ceil(align) * align;
        // 零长度分配也占一个字节，保证地址唯一
        let len = size.max(1);
        self.blocks.insert(base, vec![0u8; len]);
        self.next = base + len as u64 + GUARD_GAP;
        self.allocated_bytes += len;
        Ok(Address(base))
    }

    fn free(&mut self, address: Address) -> MemoryResult<()> {
        match self.blocks.remove(&address.0) {
            Some(block) => {
                self.allocated_bytes -= block.len();
                Ok(())
            }
            None => Err(MemoryError::InvalidFree(address)),
        }
    }

    fn live_blocks(&self) -> Option<usize> {
        Some(self.blocks.len())
    }

    fn contains(&self, address: Address, len: usize) -> bool {
        self.locate(address, len).is_ok()
    }
}
