//! 基本数值类型
//!
//! 按精确宽度和符号读写。写入时的类型检查规则：
//!
//! - 整数只接受整数值（或恰好是整数的浮点数），否则 "integer expected"
//! - `bool` 和 `uint8_t` 还接受布尔值；`bool` 另接受 nil 和数字
//! - 浮点数接受任何数字
//! - 字符串只接受字符串

use crate::access::Value;
use crate::core::error::AccessError;
use crate::memory::{read_uint, write_uint, Address, HostMemory, MemoryError};

/// 基本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// 宿主字符串，布局为 `{data, len, cap}`
    String,
}

/// 宿主字符串头部大小
pub const STRING_HEADER_SIZE: usize = 24;

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 12] = [
        PrimitiveKind::Bool,
        PrimitiveKind::I8,
        PrimitiveKind::U8,
        PrimitiveKind::I16,
        PrimitiveKind::U16,
        PrimitiveKind::I32,
        PrimitiveKind::U32,
        PrimitiveKind::I64,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
        PrimitiveKind::String,
    ];

    pub fn size(&self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::I8 | PrimitiveKind::U8 => 1,
            PrimitiveKind::I16 | PrimitiveKind::U16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
            PrimitiveKind::String => STRING_HEADER_SIZE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::I8 => "int8_t",
            PrimitiveKind::U8 => "uint8_t",
            PrimitiveKind::I16 => "int16_t",
            PrimitiveKind::U16 => "uint16_t",
            PrimitiveKind::I32 => "int32_t",
            PrimitiveKind::U32 => "uint32_t",
            PrimitiveKind::I64 => "int64_t",
            PrimitiveKind::U64 => "uint64_t",
            PrimitiveKind::F32 => "float",
            PrimitiveKind::F64 => "double",
            PrimitiveKind::String => "string",
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(
            self,
            PrimitiveKind::Bool | PrimitiveKind::F32 | PrimitiveKind::F64 | PrimitiveKind::String
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            PrimitiveKind::I8 | PrimitiveKind::I16 | PrimitiveKind::I32 | PrimitiveKind::I64
        )
    }

    /// 是否拥有堆上资源（复制和销毁需要深处理）
    pub fn owns_heap(&self) -> bool {
        matches!(self, PrimitiveKind::String)
    }

    /// 读取整数并按宽度做符号扩展
    ///
    /// `uint64_t` 超过 `i64::MAX` 的值按位回绕为负数；需要数值语义时用 [`read`](Self::read)。
    pub fn read_integer(&self, mem: &dyn HostMemory, address: Address) -> Result<i64, MemoryError> {
        let width = self.size().min(8);
        let raw = read_uint(mem, address, width)?;
        Ok(if self.is_signed() && width < 8 {
            let shift = 64 - width * 8;
            ((raw << shift) as i64) >> shift
        } else {
            raw as i64
        })
    }

    /// 写入整数的低位字节
    pub fn write_integer(
        &self,
        mem: &mut dyn HostMemory,
        address: Address,
        value: i64,
    ) -> Result<(), MemoryError> {
        write_uint(mem, address, self.size().min(8), value as u64)
    }

    /// 读取为脚本值
    pub fn read(&self, mem: &dyn HostMemory, address: Address) -> Result<Value, MemoryError> {
        Ok(match self {
            PrimitiveKind::Bool => Value::Bool(mem.read_u8(address)? != 0),
            PrimitiveKind::F32 => {
                let mut buf = [0u8; 4];
                mem.read(address, &mut buf)?;
                Value::Float(f32::from_le_bytes(buf) as f64)
            }
            PrimitiveKind::F64 => {
                let mut buf = [0u8; 8];
                mem.read(address, &mut buf)?;
                Value::Float(f64::from_le_bytes(buf))
            }
            PrimitiveKind::String => Value::Str(read_host_string(mem, address)?),
            // 超出有符号范围的值以浮点数给出
            PrimitiveKind::U64 => {
                let raw = read_uint(mem, address, 8)?;
                match i64::try_from(raw) {
                    Ok(v) => Value::Int(v),
                    Err(_) => Value::Float(raw as f64),
                }
            }
            _ => Value::Int(self.read_integer(mem, address)?),
        })
    }

    /// 从脚本值写入
    pub fn write(
        &self,
        mem: &mut dyn HostMemory,
        address: Address,
        value: &Value,
    ) -> Result<(), AccessError> {
        match self {
            PrimitiveKind::Bool => {
                let flag = match value {
                    Value::Bool(b) => *b,
                    Value::Nil => false,
                    Value::Int(i) => *i != 0,
                    Value::Float(f) => *f != 0.0,
                    _ => return Err(AccessError::Expected("boolean or number")),
                };
                mem.write(address, &[flag as u8])?;
            }
            PrimitiveKind::F32 => {
                let v = value.as_number().ok_or(AccessError::Expected("number"))?;
                mem.write(address, &(v as f32).to_le_bytes())?;
            }
            PrimitiveKind::F64 => {
                let v = value.as_number().ok_or(AccessError::Expected("number"))?;
                mem.write(address, &v.to_le_bytes())?;
            }
            PrimitiveKind::String => match value {
                Value::Str(s) => write_host_string(mem, address, s)?,
                _ => return Err(AccessError::Expected("string")),
            },
            PrimitiveKind::U8 => {
                let v = match value {
                    Value::Bool(b) => *b as i64,
                    other => other.as_int().ok_or(AccessError::Expected("integer"))?,
                };
                self.write_integer(mem, address, v)?;
            }
            _ => {
                let v = value.as_int().ok_or(AccessError::Expected("integer"))?;
                self.write_integer(mem, address, v)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// 宿主字符串
// ============================================================================

/// 单个宿主字符串的长度上限
pub const MAX_HOST_STRING: usize = 1 << 26;

/// 读取 `{data, len, cap}` 布局的字符串
///
/// 头部的长度先与上限和可访问范围核对，再分配缓冲区。
pub fn read_host_string(mem: &dyn HostMemory, address: Address) -> Result<String, MemoryError> {
    let data = mem.read_ptr(address)?;
    let len = mem.read_u64(address.offset(8))?;
    if data.is_null() || len == 0 {
        return Ok(String::new());
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_HOST_STRING)
        .ok_or(MemoryError::OutOfMemory(len as usize))?;
    if !mem.contains(data, len) {
        return Err(MemoryError::Unmapped { address: data, len });
    }
    let bytes = mem.read_bytes(data, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// 写入字符串，容量不足时重新分配缓冲区
pub fn write_host_string(
    mem: &mut dyn HostMemory,
    address: Address,
    value: &str,
) -> Result<(), MemoryError> {
    let data = mem.read_ptr(address)?;
    let cap = mem.read_u64(address.offset(16))? as usize;
    let bytes = value.as_bytes();
    let target = if !data.is_null() && cap >= bytes.len() {
        data
    } else {
        let fresh = mem.allocate(bytes.len() + 1, 1)?;
        if !data.is_null() {
            mem.free(data)?;
        }
        mem.write_ptr(address, fresh)?;
        mem.write_u64(address.offset(16), bytes.len() as u64)?;
        fresh
    };
    mem.write(target, bytes)?;
    mem.write_u64(address.offset(8), bytes.len() as u64)?;
    Ok(())
}

/// 释放字符串缓冲区并清空头部
pub fn free_host_string(mem: &mut dyn HostMemory, address: Address) -> Result<(), MemoryError> {
    let data = mem.read_ptr(address)?;
    if !data.is_null() {
        mem.free(data)?;
    }
    mem.fill(address, 0, STRING_HEADER_SIZE)
}

// ============================================================================
// 定长字符串
// ============================================================================

/// 读取定长字符缓冲区，长度不超过容量，遇到 0 字节截止
pub fn read_fixed_string(
    mem: &dyn HostMemory,
    address: Address,
    capacity: usize,
) -> Result<String, MemoryError> {
    let bytes = mem.read_bytes(address, capacity)?;
    let len = bytes.iter().position(|b| *b == 0).unwrap_or(capacity);
    Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
}

/// 写入定长字符缓冲区，超长时截断并保留结尾的 0 字节
pub fn write_fixed_string(
    mem: &mut dyn HostMemory,
    address: Address,
    capacity: usize,
    value: &str,
) -> Result<(), MemoryError> {
    if capacity == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; capacity];
    let bytes = value.as_bytes();
    let len = bytes.len().min(capacity - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    mem.write(address, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaMemory;

    fn slot(mem: &mut ArenaMemory, size: usize) -> Address {
        mem.allocate(size, 8).unwrap()
    }

    #[test]
    fn test_signed_roundtrip() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 8);
        PrimitiveKind::I16.write(&mut mem, a, &Value::Int(-2)).unwrap();
        assert_eq!(PrimitiveKind::I16.read(&mem, a).unwrap(), Value::Int(-2));
        assert_eq!(PrimitiveKind::U16.read(&mem, a).unwrap(), Value::Int(0xfffe));
    }

    #[test]
    fn test_integer_rejects_strings_and_fractions() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 4);
        let err = PrimitiveKind::I32
            .write(&mut mem, a, &Value::Str("x".into()))
            .unwrap_err();
        assert_eq!(err.to_string(), "integer expected");
        assert!(PrimitiveKind::I32.write(&mut mem, a, &Value::Float(1.5)).is_err());
        PrimitiveKind::I32.write(&mut mem, a, &Value::Float(7.0)).unwrap();
        assert_eq!(PrimitiveKind::I32.read(&mem, a).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_u64_above_signed_range_reads_as_number() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 8);
        mem.write_u64(a, u64::MAX).unwrap();
        assert_eq!(PrimitiveKind::U64.read(&mem, a).unwrap(), Value::Float(u64::MAX as f64));
        assert_eq!(PrimitiveKind::U64.read_integer(&mem, a).unwrap(), -1);
        mem.write_u64(a, i64::MAX as u64).unwrap();
        assert_eq!(PrimitiveKind::U64.read(&mem, a).unwrap(), Value::Int(i64::MAX));
    }

    #[test]
    fn test_corrupt_string_header_fails_before_allocating() {
        let mut mem = ArenaMemory::new();
        let header = slot(&mut mem, STRING_HEADER_SIZE);
        let data = slot(&mut mem, 4);
        mem.write_ptr(header, data).unwrap();

        mem.write_u64(header.offset(8), u64::MAX).unwrap();
        assert!(matches!(
            read_host_string(&mem, header),
            Err(MemoryError::OutOfMemory(_))
        ));

        mem.write_u64(header.offset(8), 4096).unwrap();
        assert!(matches!(
            read_host_string(&mem, header),
            Err(MemoryError::Unmapped { len: 4096, .. })
        ));

        mem.write(data, b"ok").unwrap();
        mem.write_u64(header.offset(8), 2).unwrap();
        assert_eq!(read_host_string(&mem, header).unwrap(), "ok");
    }

    #[test]
    fn test_byte_accepts_boolean() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 1);
        PrimitiveKind::U8.write(&mut mem, a, &Value::Bool(true)).unwrap();
        assert_eq!(PrimitiveKind::U8.read(&mem, a).unwrap(), Value::Int(1));
        PrimitiveKind::Bool.write(&mut mem, a, &Value::Nil).unwrap();
        assert_eq!(PrimitiveKind::Bool.read(&mem, a).unwrap(), Value::Bool(false));
        PrimitiveKind::Bool.write(&mut mem, a, &Value::Int(3)).unwrap();
        assert_eq!(PrimitiveKind::Bool.read(&mem, a).unwrap(), Value::Bool(true));
        let err = PrimitiveKind::Bool
            .write(&mut mem, a, &Value::Str("yes".into()))
            .unwrap_err();
        assert_eq!(err.to_string(), "boolean or number expected");
    }

    #[test]
    fn test_float_write() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 8);
        PrimitiveKind::F32.write(&mut mem, a, &Value::Int(2)).unwrap();
        assert_eq!(PrimitiveKind::F32.read(&mem, a).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn test_host_string_grows_and_frees() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, STRING_HEADER_SIZE);
        write_host_string(&mut mem, a, "ab").unwrap();
        write_host_string(&mut mem, a, "longer text").unwrap();
        assert_eq!(read_host_string(&mem, a).unwrap(), "longer text");
        write_host_string(&mut mem, a, "s").unwrap();
        assert_eq!(read_host_string(&mem, a).unwrap(), "s");
        free_host_string(&mut mem, a).unwrap();
        assert_eq!(read_host_string(&mem, a).unwrap(), "");
        assert_eq!(mem.block_count(), 1);
    }

    #[test]
    fn test_fixed_string_truncates() {
        let mut mem = ArenaMemory::new();
        let a = slot(&mut mem, 4);
        write_fixed_string(&mut mem, a, 4, "abcdef").unwrap();
        assert_eq!(read_fixed_string(&mem, a, 4).unwrap(), "abc");
        // 没有结尾 0 字节时也不越过容量
        mem.write(a, b"wxyz").unwrap();
        assert_eq!(read_fixed_string(&mem, a, 4).unwrap(), "wxyz");
    }
}
