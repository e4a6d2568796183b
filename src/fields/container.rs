//! 容器读写
//!
//! 三种计数：`Len` 为实际长度，`Read` 为可按下标读取的长度，`Write` 为
//! 可按下标写入的长度。可增长容器的 `Write` 比 `Len` 多一，写入下标
//! `Len` 的位置即追加；只读容器的 `Write` 为 0。
//!
//! 只读容器拒绝 `resize`/`erase`/`insert` 和元素写入，不做任何修改；
//! 定长缓冲拒绝改变长度。双端队列和位向量在修改前先线性化。

use super::{describe_key, read_value, write_pointer, write_value};
use crate::access::{AccessContext, ObjectRef, Value};
use crate::core::error::{AccessError, BridgeResult, ContainerError};
use crate::memory::Address;
use crate::types::container::{BitVectorHeader, DequeHeader, VectorHeader};
use crate::types::{lifecycle, ContainerIdentity, ContainerKind, TypeId, TypeShape};

/// 追加用的下标
pub const APPEND_KEY: &str = "#";

/// 计数方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    Len,
    Read,
    Write,
}

struct Target {
    name: String,
    container: ContainerIdentity,
    stride: usize,
}

fn target(ctx: &AccessContext<'_>, obj: ObjectRef) -> BridgeResult<Target> {
    let identity = ctx.types.get(obj.ty);
    let TypeShape::Container(container) = &identity.shape else {
        return Err(AccessError::InvalidIndex {
            type_name: identity.name.clone(),
            index: "container".to_string(),
        }
        .into());
    };
    let stride = match container.kind {
        ContainerKind::BitVector => 0,
        _ => ctx
            .types
            .item_stride(container)
            .ok_or_else(|| AccessError::Unsized(identity.name.clone()))?,
    };
    Ok(Target {
        name: identity.name.clone(),
        container: container.clone(),
        stride,
    })
}

fn check_mutable(t: &Target) -> Result<(), ContainerError> {
    if t.container.read_only {
        return Err(ContainerError::ReadOnly(t.name.clone()));
    }
    if !t.container.is_resizable() {
        return Err(ContainerError::FixedSize(t.name.clone()));
    }
    Ok(())
}

fn out_of_bounds(t: &Target, index: usize, len: usize) -> ContainerError {
    ContainerError::OutOfBounds {
        type_name: t.name.clone(),
        index,
        len,
    }
}

fn length(ctx: &AccessContext<'_>, obj: ObjectRef, t: &Target) -> BridgeResult<usize> {
    let len = match t.container.kind {
        ContainerKind::ValueVector | ContainerKind::PointerVector => {
            VectorHeader::read(&*ctx.mem, obj.address)?.len(t.stride)
        }
        ContainerKind::BitVector => BitVectorHeader::read(&*ctx.mem, obj.address)?.bit_len,
        ContainerKind::Deque => DequeHeader::read(&*ctx.mem, obj.address)?.len,
        ContainerKind::FixedBuffer { len } => len,
    };
    Ok(len)
}

/// 元素个数
pub fn count(ctx: &mut AccessContext<'_>, obj: ObjectRef, mode: CountMode) -> BridgeResult<usize> {
    let t = target(ctx, obj)?;
    let len = length(ctx, obj, &t)?;
    Ok(match mode {
        CountMode::Len | CountMode::Read => len,
        CountMode::Write if t.container.read_only => 0,
        CountMode::Write if t.container.is_resizable() => len + 1,
        CountMode::Write => len,
    })
}

/// 把脚本下标转为元素位置：非负整数，或下标枚举的键名
pub fn resolve_index(ctx: &mut AccessContext<'_>, obj: ObjectRef, key: &Value) -> BridgeResult<usize> {
    let t = target(ctx, obj)?;
    let invalid = || AccessError::InvalidIndex {
        type_name: t.name.clone(),
        index: describe_key(key),
    };
    let raw = match key {
        Value::Str(name) => {
            let index_enum = t.container.index_enum.ok_or_else(invalid)?;
            let identity = ctx.types.get(index_enum);
            let e = identity.as_enum().ok_or_else(invalid)?;
            e.value_of(name).ok_or_else(invalid)?
        }
        other => other.as_int().ok_or_else(invalid)?,
    };
    usize::try_from(raw).map_err(|_| invalid().into())
}

/// 元素地址，越界时报错
pub fn item_address(ctx: &mut AccessContext<'_>, obj: ObjectRef, index: usize) -> BridgeResult<Address> {
    let t = target(ctx, obj)?;
    item_address_of(ctx, obj, &t, index)
}

fn item_address_of(
    ctx: &AccessContext<'_>,
    obj: ObjectRef,
    t: &Target,
    index: usize,
) -> BridgeResult<Address> {
    let len = length(ctx, obj, t)?;
    if index >= len {
        return Err(out_of_bounds(t, index, len).into());
    }
    let address = match t.container.kind {
        ContainerKind::ValueVector | ContainerKind::PointerVector => {
            VectorHeader::read(&*ctx.mem, obj.address)?
                .begin
                .offset(index * t.stride)
        }
        ContainerKind::Deque => {
            let h = DequeHeader::read(&*ctx.mem, obj.address)?;
            h.data.offset(h.slot(index) * t.stride)
        }
        ContainerKind::FixedBuffer { .. } => obj.address.offset(index * t.stride),
        ContainerKind::BitVector => {
            return Err(ContainerError::NotSupported {
                op: "item address",
                type_name: t.name.clone(),
            }
            .into())
        }
    };
    Ok(address)
}

/// 读取元素
pub fn read_item(ctx: &mut AccessContext<'_>, obj: ObjectRef, index: usize) -> BridgeResult<Value> {
    let t = target(ctx, obj)?;
    if t.container.kind == ContainerKind::BitVector {
        let bits = read_bits(ctx, obj)?;
        return bits
            .get(index)
            .map(|b| Value::Bool(*b))
            .ok_or_else(|| out_of_bounds(&t, index, bits.len()).into());
    }
    let address = item_address_of(ctx, obj, &t, index)?;
    let item = t.container.item.ok_or_else(|| AccessError::Unsized(t.name.clone()))?;
    if t.container.holds_pointers() {
        return Ok(ctx
            .deref_pointer(address, item)?
            .map_or(Value::Nil, Value::Ref));
    }
    read_value(ctx, ObjectRef::new(address, item))
}

/// 写入元素；可增长容器上写入下标 `Len` 即追加
pub fn write_item(
    ctx: &mut AccessContext<'_>,
    obj: ObjectRef,
    index: usize,
    value: &Value,
) -> BridgeResult<()> {
    let t = target(ctx, obj)?;
    if t.container.read_only {
        return Err(ContainerError::ReadOnly(t.name.clone()).into());
    }
    let len = length(ctx, obj, &t)?;
    if index == len && t.container.is_resizable() {
        return insert(ctx, obj, Some(index), value);
    }
    if t.container.kind == ContainerKind::BitVector {
        let mut bits = read_bits(ctx, obj)?;
        let slot = bits
            .get_mut(index)
            .ok_or_else(|| out_of_bounds(&t, index, len))?;
        *slot = bit_value(value)?;
        return write_bits(ctx, obj, &bits);
    }
    store_item(ctx, obj, &t, index, value)
}

fn store_item(
    ctx: &mut AccessContext<'_>,
    obj: ObjectRef,
    t: &Target,
    index: usize,
    value: &Value,
) -> BridgeResult<()> {
    let address = item_address_of(ctx, obj, t, index)?;
    let item = t.container.item.ok_or_else(|| AccessError::Unsized(t.name.clone()))?;
    if t.container.holds_pointers() {
        write_pointer(ctx, address, Some(item), false, value)
    } else {
        write_value(ctx, ObjectRef::new(address, item), value)
    }
}

fn bit_value(value: &Value) -> BridgeResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Nil => Ok(false),
        other => other
            .as_int()
            .map(|i| i != 0)
            .ok_or_else(|| AccessError::Expected("boolean or number").into()),
    }
}

// ============================================================================
// 修改
// ============================================================================

/// 改变长度
pub fn resize(ctx: &mut AccessContext<'_>, obj: ObjectRef, new_len: usize) -> BridgeResult<()> {
    let t = target(ctx, obj)?;
    check_mutable(&t)?;
    if t.container.kind == ContainerKind::BitVector {
        let mut bits = read_bits(ctx, obj)?;
        bits.resize(new_len, false);
        return write_bits(ctx, obj, &bits);
    }

    let mut lin = load_linear(ctx, obj, &t)?;
    if new_len < lin.len {
        for i in new_len..lin.len {
            release_item(ctx, &t, lin.data.offset(i * t.stride))?;
        }
        ctx.mem
            .fill(lin.data.offset(new_len * t.stride), 0, (lin.len - new_len) * t.stride)?;
    } else if new_len > lin.len {
        if new_len > lin.cap {
            lin = grow(ctx, &t, lin, new_len)?;
        }
        for i in lin.len..new_len {
            init_item(ctx, &t, lin.data.offset(i * t.stride))?;
        }
    }
    lin.len = new_len;
    store_linear(ctx, obj, &t, lin)
}

/// 删除元素，后续元素前移一位
pub fn erase(ctx: &mut AccessContext<'_>, obj: ObjectRef, index: usize) -> BridgeResult<()> {
    let t = target(ctx, obj)?;
    check_mutable(&t)?;
    if t.container.kind == ContainerKind::BitVector {
        let mut bits = read_bits(ctx, obj)?;
        if index >= bits.len() {
            return Err(out_of_bounds(&t, index, bits.len()).into());
        }
        bits.remove(index);
        return write_bits(ctx, obj, &bits);
    }

    let mut lin = load_linear(ctx, obj, &t)?;
    if index >= lin.len {
        return Err(out_of_bounds(&t, index, lin.len).into());
    }
    let s = t.stride;
    release_item(ctx, &t, lin.data.offset(index * s))?;
    let tail = (lin.len - index - 1) * s;
    if tail > 0 {
        ctx.mem
            .copy_within(lin.data.offset(index * s), lin.data.offset((index + 1) * s), tail)?;
    }
    ctx.mem.fill(lin.data.offset((lin.len - 1) * s), 0, s)?;
    lin.len -= 1;
    store_linear(ctx, obj, &t, lin)
}

/// 在 `index` 处插入元素，`None` 表示追加
///
/// 写入新元素失败时撤销插入。
pub fn insert(
    ctx: &mut AccessContext<'_>,
    obj: ObjectRef,
    index: Option<usize>,
    value: &Value,
) -> BridgeResult<()> {
    let t = target(ctx, obj)?;
    check_mutable(&t)?;
    if t.container.kind == ContainerKind::BitVector {
        let mut bits = read_bits(ctx, obj)?;
        let index = index.unwrap_or(bits.len());
        if index > bits.len() {
            return Err(out_of_bounds(&t, index, bits.len()).into());
        }
        bits.insert(index, bit_value(value)?);
        return write_bits(ctx, obj, &bits);
    }

    let mut lin = load_linear(ctx, obj, &t)?;
    let index = index.unwrap_or(lin.len);
    if index > lin.len {
        return Err(out_of_bounds(&t, index, lin.len).into());
    }
    if lin.len + 1 > lin.cap {
        let wanted = (lin.cap * 2).max(lin.len + 1).max(4);
        lin = grow(ctx, &t, lin, wanted)?;
    }
    let s = t.stride;
    let tail = (lin.len - index) * s;
    if tail > 0 {
        ctx.mem
            .copy_within(lin.data.offset((index + 1) * s), lin.data.offset(index * s), tail)?;
    }
    init_item(ctx, &t, lin.data.offset(index * s))?;
    lin.len += 1;
    store_linear(ctx, obj, &t, lin)?;

    if let Err(e) = store_item(ctx, obj, &t, index, value) {
        erase(ctx, obj, index)?;
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// 线性缓冲区
// ============================================================================

/// 连续存放的元素缓冲区
#[derive(Debug, Clone, Copy)]
struct Linear {
    data: Address,
    len: usize,
    cap: usize,
}

fn load_linear(ctx: &mut AccessContext<'_>, obj: ObjectRef, t: &Target) -> BridgeResult<Linear> {
    match t.container.kind {
        ContainerKind::Deque => {
            let h = DequeHeader::read(&*ctx.mem, obj.address)?;
            if h.head == 0 || h.data.is_null() {
                return Ok(Linear {
                    data: h.data,
                    len: h.len,
                    cap: if h.data.is_null() { 0 } else { h.cap },
                });
            }
            // 环形缓冲线性化
            let cap = h.cap.max(h.len);
            let fresh = ctx.mem.allocate((cap * t.stride).max(1), 16)?;
            for i in 0..h.len {
                let bytes = ctx
                    .mem
                    .read_bytes(h.data.offset(h.slot(i) * t.stride), t.stride)?;
                ctx.mem.write(fresh.offset(i * t.stride), &bytes)?;
            }
            ctx.mem.free(h.data)?;
            let lin = Linear {
                data: fresh,
                len: h.len,
                cap,
            };
            store_linear(ctx, obj, t, lin)?;
            Ok(lin)
        }
        _ => {
            let h = VectorHeader::read(&*ctx.mem, obj.address)?;
            Ok(Linear {
                data: h.begin,
                len: h.len(t.stride),
                cap: h.capacity(t.stride),
            })
        }
    }
}

fn store_linear(ctx: &mut AccessContext<'_>, obj: ObjectRef, t: &Target, lin: Linear) -> BridgeResult<()> {
    match t.container.kind {
        ContainerKind::Deque => DequeHeader {
            data: lin.data,
            head: 0,
            len: lin.len,
            cap: lin.cap,
        }
        .write(ctx.mem, obj.address)?,
        _ => VectorHeader::with_buffer(lin.data, lin.len, lin.cap, t.stride)
            .write(ctx.mem, obj.address)?,
    }
    Ok(())
}

fn grow(ctx: &mut AccessContext<'_>, t: &Target, lin: Linear, cap: usize) -> BridgeResult<Linear> {
    let fresh = ctx.mem.allocate((cap * t.stride).max(1), 16)?;
    if lin.len > 0 {
        let bytes = ctx.mem.read_bytes(lin.data, lin.len * t.stride)?;
        ctx.mem.write(fresh, &bytes)?;
    }
    if !lin.data.is_null() {
        ctx.mem.free(lin.data)?;
    }
    Ok(Linear {
        data: fresh,
        len: lin.len,
        cap,
    })
}

fn item_type(t: &Target) -> Option<TypeId> {
    if t.container.holds_pointers() {
        None
    } else {
        t.container.item
    }
}

fn init_item(ctx: &mut AccessContext<'_>, t: &Target, at: Address) -> BridgeResult<()> {
    ctx.mem.fill(at, 0, t.stride)?;
    if let Some(item) = item_type(t) {
        lifecycle::construct_in_place(ctx.types, ctx.mem, at, item)?;
    }
    Ok(())
}

fn release_item(ctx: &mut AccessContext<'_>, t: &Target, at: Address) -> BridgeResult<()> {
    if let Some(item) = item_type(t) {
        if lifecycle::can_allocate(ctx.types, item) {
            lifecycle::destroy_in_place(ctx.types, ctx.mem, at, item)?;
        }
    }
    Ok(())
}

// ============================================================================
// 位向量
// ============================================================================

fn read_bits(ctx: &AccessContext<'_>, obj: ObjectRef) -> BridgeResult<Vec<bool>> {
    let h = BitVectorHeader::read(&*ctx.mem, obj.address)?;
    if h.data.is_null() || h.bit_len == 0 {
        return Ok(Vec::new());
    }
    let bytes = ctx
        .mem
        .read_bytes(h.data, BitVectorHeader::bytes_for(h.bit_len))?;
    Ok((0..h.bit_len)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

fn write_bits(ctx: &mut AccessContext<'_>, obj: ObjectRef, bits: &[bool]) -> BridgeResult<()> {
    let old = BitVectorHeader::read(&*ctx.mem, obj.address)?;
    let mut bytes = vec![0u8; BitVectorHeader::bytes_for(bits.len())];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    let data = if old.data.is_null() || BitVectorHeader::bytes_for(old.bit_len) != bytes.len() {
        let fresh = ctx.mem.allocate(bytes.len().max(1), 16)?;
        if !old.data.is_null() {
            ctx.mem.free(old.data)?;
        }
        fresh
    } else {
        old.data
    };
    ctx.mem.write(data, &bytes)?;
    BitVectorHeader {
        data,
        bit_len: bits.len(),
    }
    .write(ctx.mem, obj.address)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BridgeError;
    use crate::core::runtime::Runtime;
    use crate::memory::HostMemory;
    use crate::types::{EnumIdentity, PrimitiveKind, TypeRegistry};
    use std::sync::Arc;

    struct Fixture {
        runtime: Arc<Runtime>,
        vec_ty: TypeId,
        ro_ty: TypeId,
        deque_ty: TypeId,
        bits_ty: TypeId,
        fixed_ty: TypeId,
        str_vec_ty: TypeId,
    }

    fn fixture() -> Fixture {
        let mut b = TypeRegistry::builder();
        let i32_t = b.primitive(PrimitiveKind::I32);
        let string_t = b.primitive(PrimitiveKind::String);
        let slot = b.add(
            "slot",
            TypeShape::Enum(EnumIdentity::contiguous(
                PrimitiveKind::I32,
                0,
                &[Some("HEAD"), Some("BODY"), Some("LEGS")],
            )),
        );
        let vec_ty = b.container(ContainerIdentity::vector(i32_t));
        let ro_ty = b.container(ContainerIdentity::vector(i32_t).read_only());
        let deque_ty = b.container(ContainerIdentity::deque(i32_t));
        let bits_ty = b.container(ContainerIdentity::bit_vector());
        let fixed_ty = b.container(ContainerIdentity::fixed(i32_t, 3).indexed_by(slot));
        let str_vec_ty = b.container(ContainerIdentity::vector(string_t));
        Fixture {
            runtime: Runtime::builder().types(b.build().unwrap()).build().unwrap(),
            vec_ty,
            ro_ty,
            deque_ty,
            bits_ty,
            fixed_ty,
            str_vec_ty,
        }
    }

    fn new_obj(ctx: &mut AccessContext<'_>, ty: TypeId) -> ObjectRef {
        let address = lifecycle::allocate(ctx.types, ctx.mem, ty).unwrap();
        ObjectRef::new(address, ty)
    }

    fn ints(ctx: &mut AccessContext<'_>, obj: ObjectRef) -> Vec<i64> {
        let n = count(ctx, obj, CountMode::Len).unwrap();
        (0..n)
            .map(|i| read_item(ctx, obj, i).unwrap().as_int().unwrap())
            .collect()
    }

    #[test]
    fn test_vector_insert_erase_resize() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.vec_ty);
            for i in 0..5 {
                insert(ctx, v, None, &Value::Int(i)).unwrap();
            }
            insert(ctx, v, Some(0), &Value::Int(-1)).unwrap();
            assert_eq!(ints(ctx, v), vec![-1, 0, 1, 2, 3, 4]);
            erase(ctx, v, 2).unwrap();
            assert_eq!(ints(ctx, v), vec![-1, 0, 2, 3, 4]);
            resize(ctx, v, 2).unwrap();
            assert_eq!(ints(ctx, v), vec![-1, 0]);
            resize(ctx, v, 4).unwrap();
            assert_eq!(ints(ctx, v), vec![-1, 0, 0, 0]);
        });
    }

    #[test]
    fn test_write_count_allows_append() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.vec_ty);
            assert_eq!(count(ctx, v, CountMode::Write).unwrap(), 1);
            write_item(ctx, v, 0, &Value::Int(9)).unwrap();
            assert_eq!(count(ctx, v, CountMode::Len).unwrap(), 1);
            assert!(write_item(ctx, v, 5, &Value::Int(1)).is_err());
        });
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.ro_ty);
            let before = ctx.mem.read_bytes(v.address, 24).unwrap();
            for result in [
                resize(ctx, v, 3),
                insert(ctx, v, None, &Value::Int(1)),
                erase(ctx, v, 0),
                write_item(ctx, v, 0, &Value::Int(1)),
            ] {
                assert!(matches!(
                    result,
                    Err(BridgeError::Container(ContainerError::ReadOnly(_)))
                ));
            }
            assert_eq!(ctx.mem.read_bytes(v.address, 24).unwrap(), before);
            assert_eq!(count(ctx, v, CountMode::Write).unwrap(), 0);
        });
    }

    #[test]
    fn test_deque_linearizes_before_mutation() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let d = new_obj(ctx, f.deque_ty);
            // 手工构造一个环绕的队列：槽位 [2, 3, x, 1]，head = 3
            let data = ctx.mem.allocate(16, 16).unwrap();
            for (slot, v) in [(0usize, 2i64), (1, 3), (3, 1)] {
                PrimitiveKind::I32
                    .write_integer(ctx.mem, data.offset(slot * 4), v)
                    .unwrap();
            }
            DequeHeader {
                data,
                head: 3,
                len: 3,
                cap: 4,
            }
            .write(ctx.mem, d.address)
            .unwrap();
            assert_eq!(ints(ctx, d), vec![1, 2, 3]);
            insert(ctx, d, Some(1), &Value::Int(7)).unwrap();
            assert_eq!(ints(ctx, d), vec![1, 7, 2, 3]);
            assert_eq!(DequeHeader::read(&*ctx.mem, d.address).unwrap().head, 0);
        });
    }

    #[test]
    fn test_bit_vector() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let bv = new_obj(ctx, f.bits_ty);
            resize(ctx, bv, 10).unwrap();
            write_item(ctx, bv, 9, &Value::Bool(true)).unwrap();
            insert(ctx, bv, Some(0), &Value::Bool(true)).unwrap();
            assert_eq!(count(ctx, bv, CountMode::Len).unwrap(), 11);
            assert_eq!(read_item(ctx, bv, 0).unwrap(), Value::Bool(true));
            assert_eq!(read_item(ctx, bv, 10).unwrap(), Value::Bool(true));
            erase(ctx, bv, 0).unwrap();
            assert_eq!(read_item(ctx, bv, 9).unwrap(), Value::Bool(true));
            assert_eq!(read_item(ctx, bv, 0).unwrap(), Value::Bool(false));
        });
    }

    #[test]
    fn test_fixed_buffer_enum_index() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let a = new_obj(ctx, f.fixed_ty);
            let legs = resolve_index(ctx, a, &Value::from("LEGS")).unwrap();
            assert_eq!(legs, 2);
            write_item(ctx, a, legs, &Value::Int(5)).unwrap();
            assert_eq!(ints(ctx, a), vec![0, 0, 5]);
            assert!(matches!(
                resize(ctx, a, 4),
                Err(BridgeError::Container(ContainerError::FixedSize(_)))
            ));
            assert!(resolve_index(ctx, a, &Value::from("ARMS")).is_err());
        });
    }

    #[test]
    fn test_failed_insert_is_rolled_back() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let v = new_obj(ctx, f.str_vec_ty);
            insert(ctx, v, None, &Value::from("a")).unwrap();
            assert!(insert(ctx, v, Some(0), &Value::Int(1)).is_err());
            assert_eq!(count(ctx, v, CountMode::Len).unwrap(), 1);
            assert_eq!(read_item(ctx, v, 0).unwrap(), Value::from("a"));
        });
    }
}
