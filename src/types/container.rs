//! 容器类型描述
//!
//! 宿主侧布局：
//!
//! - 值向量 / 指针向量: `{begin, end, capacity_end}`
//! - 位向量: `{data, bit_len}`
//! - 双端队列: `{data, head, len, cap}` 环形缓冲
//! - 定长缓冲: 元素内联存放

use super::TypeId;
use crate::memory::{Address, HostMemory, MemoryResult};
use std::fmt;

/// 向量头部大小
pub const VECTOR_HEADER_SIZE: usize = 24;
/// 位向量头部大小
pub const BIT_VECTOR_HEADER_SIZE: usize = 16;
/// 双端队列头部大小
pub const DEQUE_HEADER_SIZE: usize = 32;

/// 容器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    ValueVector,
    PointerVector,
    BitVector,
    FixedBuffer { len: usize },
    Deque,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::ValueVector => f.write_str("vector"),
            ContainerKind::PointerVector => f.write_str("ptr-vector"),
            ContainerKind::BitVector => f.write_str("bit-vector"),
            ContainerKind::FixedBuffer { len } => write!(f, "static-array[{}]", len),
            ContainerKind::Deque => f.write_str("deque"),
        }
    }
}

/// 容器类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub kind: ContainerKind,
    /// 元素类型；指针向量中是指针指向的类型，位向量没有
    pub item: Option<TypeId>,
    /// 下标枚举
    pub index_enum: Option<TypeId>,
    /// 只读容器拒绝 resize/erase/insert 以及元素写入
    pub read_only: bool,
}

impl ContainerIdentity {
    pub fn new(kind: ContainerKind, item: Option<TypeId>) -> Self {
        Self {
            kind,
            item,
            index_enum: None,
            read_only: false,
        }
    }

    pub fn vector(item: TypeId) -> Self {
        Self::new(ContainerKind::ValueVector, Some(item))
    }

    pub fn pointer_vector(target: TypeId) -> Self {
        Self::new(ContainerKind::PointerVector, Some(target))
    }

    pub fn bit_vector() -> Self {
        Self::new(ContainerKind::BitVector, None)
    }

    pub fn fixed(item: TypeId, len: usize) -> Self {
        Self::new(ContainerKind::FixedBuffer { len }, Some(item))
    }

    pub fn deque(item: TypeId) -> Self {
        Self::new(ContainerKind::Deque, Some(item))
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn indexed_by(mut self, index_enum: TypeId) -> Self {
        self.index_enum = Some(index_enum);
        self
    }

    /// 是否支持改变长度
    pub fn is_resizable(&self) -> bool {
        !matches!(self.kind, ContainerKind::FixedBuffer { .. })
    }

    /// 元素是否以指针形式存放
    pub fn holds_pointers(&self) -> bool {
        matches!(self.kind, ContainerKind::PointerVector)
    }
}

// ============================================================================
// 宿主侧头部
// ============================================================================

/// 向量头部 `{begin, end, capacity_end}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorHeader {
    pub begin: Address,
    pub end: Address,
    pub cap_end: Address,
}

impl VectorHeader {
    pub fn read(mem: &dyn HostMemory, at: Address) -> MemoryResult<Self> {
        Ok(Self {
            begin: mem.read_ptr(at)?,
            end: mem.read_ptr(at.offset(8))?,
            cap_end: mem.read_ptr(at.offset(16))?,
        })
    }

    pub fn write(&self, mem: &mut dyn HostMemory, at: Address) -> MemoryResult<()> {
        mem.write_ptr(at, self.begin)?;
        mem.write_ptr(at.offset(8), self.end)?;
        mem.write_ptr(at.offset(16), self.cap_end)
    }

    /// 元素个数
    pub fn len(&self, stride: usize) -> usize {
        if self.begin.is_null() || stride == 0 || self.end.0 < self.begin.0 {
            return 0;
        }
        ((self.end.0 - self.begin.0) as usize) / stride
    }

    pub fn capacity(&self, stride: usize) -> usize {
        if self.begin.is_null() || stride == 0 || self.cap_end.0 < self.begin.0 {
            return 0;
        }
        ((self.cap_end.0 - self.begin.0) as usize) / stride
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// 以 `data` 为缓冲区、长度 `len`、容量 `cap` 构造
    pub fn with_buffer(data: Address, len: usize, cap: usize, stride: usize) -> Self {
        if data.is_null() {
            return Self::default();
        }
        Self {
            begin: data,
            end: data.offset(len * stride),
            cap_end: data.offset(cap * stride),
        }
    }
}

/// 位向量头部 `{data, bit_len}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitVectorHeader {
    pub data: Address,
    pub bit_len: usize,
}

impl BitVectorHeader {
    pub fn read(mem: &dyn HostMemory, at: Address) -> MemoryResult<Self> {
        Ok(Self {
            data: mem.read_ptr(at)?,
            bit_len: mem.read_u64(at.offset(8))? as usize,
        })
    }

    pub fn write(&self, mem: &mut dyn HostMemory, at: Address) -> MemoryResult<()> {
        mem.write_ptr(at, self.data)?;
        mem.write_u64(at.offset(8), self.bit_len as u64)
    }

    /// 存放 `bits` 位需要的字节数
    pub fn bytes_for(bits: usize) -> usize {
        (bits + 7) / 8
    }
}

/// 双端队列头部 `{data, head, len, cap}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DequeHeader {
    pub data: Address,
    pub head: usize,
    pub len: usize,
    pub cap: usize,
}

impl DequeHeader {
    pub fn read(mem: &dyn HostMemory, at: Address) -> MemoryResult<Self> {
        Ok(Self {
            data: mem.read_ptr(at)?,
            head: mem.read_u64(at.offset(8))? as usize,
            len: mem.read_u64(at.offset(16))? as usize,
            cap: mem.read_u64(at.offset(24))? as usize,
        })
    }

    pub fn write(&self, mem: &mut dyn HostMemory, at: Address) -> MemoryResult<()> {
        mem.write_ptr(at, self.data)?;
        mem.write_u64(at.offset(8), self.head as u64)?;
        mem.write_u64(at.offset(16), self.len as u64)?;
        mem.write_u64(at.offset(24), self.cap as u64)
    }

    /// 逻辑下标对应的槽位
    pub fn slot(&self, index: usize) -> usize {
        if self.cap == 0 {
            0
        } else {
            (self.head + index) % self.cap
        }
    }
}
