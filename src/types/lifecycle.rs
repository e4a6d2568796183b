//! 分配、复制与销毁
//!
//! 对任一身份，`allocate`/`copy`/`destroy` 要么全部支持，要么全部返回
//! [`AllocationError::NotSupported`]，支持与否只由 [`can_allocate`] 决定。
//!
//! 复制语义：先释放目标自有的资源，再逐字节复制，最后为字符串、容器
//! 缓冲区和带 [`POINTER_OWNS_TARGET`] 标志的指针目标做深拷贝，使两份
//! 对象互不共享堆上资源。
//!
//! [`POINTER_OWNS_TARGET`]: super::POINTER_OWNS_TARGET

use super::container::{
    BitVectorHeader, ContainerKind, DequeHeader, VectorHeader, BIT_VECTOR_HEADER_SIZE,
    DEQUE_HEADER_SIZE, VECTOR_HEADER_SIZE,
};
use super::primitive::{free_host_string, read_host_string, write_host_string, STRING_HEADER_SIZE};
use super::structs::FieldMode;
use super::{PrimitiveKind, TypeId, TypeRegistry, TypeShape};
use crate::core::error::{AllocationError, BridgeResult};
use crate::memory::{Address, HostMemory, MemoryError, POINTER_SIZE};

/// 嵌套深度上限，防止畸形模式造成无限递归
const MAX_DEPTH: usize = 64;

/// 分配对齐
const ALLOC_ALIGN: usize = 16;

/// 类型是否支持分配/复制/销毁
pub fn can_allocate(types: &TypeRegistry, id: TypeId) -> bool {
    can_allocate_at(types, id, 0)
}

fn can_allocate_at(types: &TypeRegistry, id: TypeId, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    let identity = types.get(id);
    match &identity.shape {
        TypeShape::Primitive(_)
        | TypeShape::Pointer { .. }
        | TypeShape::Enum(_)
        | TypeShape::Bitfield(_)
        | TypeShape::Union(_) => true,
        TypeShape::Function(_) | TypeShape::Opaque | TypeShape::Global(_) => false,
        TypeShape::Container(c) => {
            if c.holds_pointers() || c.kind == ContainerKind::BitVector {
                return true;
            }
            c.item.map_or(false, |item| can_allocate_at(types, item, depth + 1))
        }
        TypeShape::Struct(_) | TypeShape::VirtualStruct(_) => {
            if let TypeShape::VirtualStruct(s) = &identity.shape {
                // 没有虚表地址的多态类型是抽象的
                if s.dispatch.is_none() {
                    return false;
                }
            }
            types.walk_fields(id).iter().all(|w| match w.field.mode {
                FieldMode::Substruct | FieldMode::FixedArray | FieldMode::Container => w
                    .field
                    .ty
                    .map_or(false, |ty| can_allocate_at(types, ty, depth + 1)),
                _ => true,
            })
        }
    }
}

fn not_supported(types: &TypeRegistry, op: &'static str, id: TypeId) -> AllocationError {
    AllocationError::NotSupported {
        op,
        type_name: types.name(id),
    }
}

fn out_of_memory(types: &TypeRegistry, id: TypeId, source: MemoryError) -> AllocationError {
    AllocationError::OutOfMemory {
        type_name: types.name(id),
        source,
    }
}

/// 分配并构造一个新对象
pub fn allocate(types: &TypeRegistry, mem: &mut dyn HostMemory, id: TypeId) -> BridgeResult<Address> {
    if !can_allocate(types, id) {
        return Err(not_supported(types, "allocate", id).into());
    }
    let size = types
        .byte_size(id)
        .ok_or_else(|| not_supported(types, "allocate", id))?;
    let address = mem
        .allocate(size, ALLOC_ALIGN)
        .map_err(|e| out_of_memory(types, id, e))?;
    construct_in_place(types, mem, address, id)?;
    tracing::trace!(target: "types", "Allocated {} at {}", types.name(id), address);
    Ok(address)
}

/// 在已清零的存储上完成构造：写入虚表指针
pub fn construct_in_place(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
) -> BridgeResult<()> {
    construct_at(types, mem, address, id, 0)
}

fn construct_at(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
    depth: usize,
) -> BridgeResult<()> {
    if depth > MAX_DEPTH {
        return Ok(());
    }
    let identity = types.get(id);
    match &identity.shape {
        TypeShape::Struct(_) | TypeShape::VirtualStruct(_) => {
            if let TypeShape::VirtualStruct(s) = &identity.shape {
                if let Some(dispatch) = s.dispatch {
                    mem.write_ptr(address, dispatch)?;
                }
            }
            for walked in types.walk_fields(id) {
                let field = &walked.field;
                let at = address.offset(field.offset);
                match (field.mode, field.ty) {
                    (FieldMode::Substruct, Some(ty)) => construct_at(types, mem, at, ty, depth + 1)?,
                    (FieldMode::FixedArray, Some(ty)) => {
                        let stride = types.byte_size(ty).unwrap_or(0);
                        for i in 0..field.count {
                            construct_at(types, mem, at.offset(i * stride), ty, depth + 1)?;
                        }
                    }
                    (FieldMode::Container, Some(ty)) => {
                        construct_at(types, mem, at, ty, depth + 1)?
                    }
                    _ => {}
                }
            }
        }
        TypeShape::Container(c) => {
            if let (ContainerKind::FixedBuffer { len }, Some(item)) = (c.kind, c.item) {
                let stride = types.byte_size(item).unwrap_or(0);
                for i in 0..len {
                    construct_at(types, mem, address.offset(i * stride), item, depth + 1)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// 把 `src` 复制到 `dst`
pub fn copy(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    dst: Address,
    src: Address,
    id: TypeId,
) -> BridgeResult<()> {
    if !can_allocate(types, id) {
        return Err(not_supported(types, "copy", id).into());
    }
    if dst == src {
        return Ok(());
    }
    let size = types
        .byte_size(id)
        .ok_or_else(|| not_supported(types, "copy", id))?;
    release_at(types, mem, dst, id, 0)?;
    mem.copy_within(dst, src, size)?;
    duplicate_owned(types, mem, dst, id, 0)
}

/// 销毁对象并释放其存储
pub fn destroy(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
) -> BridgeResult<()> {
    if !can_allocate(types, id) {
        return Err(not_supported(types, "destroy", id).into());
    }
    release_at(types, mem, address, id, 0)?;
    mem.free(address)?;
    tracing::trace!(target: "types", "Destroyed {} at {}", types.name(id), address);
    Ok(())
}

/// 只释放对象自有的资源，不释放对象本身的存储
pub fn destroy_in_place(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
) -> BridgeResult<()> {
    if !can_allocate(types, id) {
        return Err(not_supported(types, "destroy", id).into());
    }
    release_at(types, mem, address, id, 0)
}

fn is_live(ptr: Address) -> bool {
    !ptr.is_null() && !ptr.is_uninit()
}

// ============================================================================
// 释放
// ============================================================================

fn release_at(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
    depth: usize,
) -> BridgeResult<()> {
    if depth > MAX_DEPTH {
        return Ok(());
    }
    let identity = types.get(id);
    match &identity.shape {
        TypeShape::Primitive(PrimitiveKind::String) => free_host_string(mem, address)?,
        TypeShape::Struct(_) | TypeShape::VirtualStruct(_) => {
            for walked in types.walk_fields(id) {
                let field = &walked.field;
                let at = address.offset(field.offset);
                match (field.mode, field.ty) {
                    (FieldMode::Primitive, Some(ty))
                    | (FieldMode::Substruct, Some(ty))
                    | (FieldMode::Container, Some(ty)) => release_at(types, mem, at, ty, depth + 1)?,
                    (FieldMode::FixedArray, Some(ty)) => {
                        let stride = types.byte_size(ty).unwrap_or(0);
                        for i in 0..field.count {
                            release_at(types, mem, at.offset(i * stride), ty, depth + 1)?;
                        }
                    }
                    (FieldMode::Pointer, Some(ty)) if field.owns_target() => {
                        let target = mem.read_ptr(at)?;
                        if is_live(target) && can_allocate(types, ty) {
                            release_at(types, mem, target, ty, depth + 1)?;
                            mem.free(target)?;
                        }
                        mem.write_ptr(at, Address::NULL)?;
                    }
                    (FieldMode::PointerVectorLegacy, _) => {
                        let header = VectorHeader::read(mem, at)?;
                        if is_live(header.begin) {
                            mem.free(header.begin)?;
                        }
                        VectorHeader::default().write(mem, at)?;
                    }
                    _ => {}
                }
            }
        }
        TypeShape::Container(c) => match c.kind {
            ContainerKind::ValueVector | ContainerKind::PointerVector => {
                let header = VectorHeader::read(mem, address)?;
                if is_live(header.begin) {
                    if let (false, Some(item)) = (c.holds_pointers(), c.item) {
                        let stride = types.byte_size(item).unwrap_or(0);
                        for i in 0..header.len(stride) {
                            release_at(types, mem, header.begin.offset(i * stride), item, depth + 1)?;
                        }
                    }
                    mem.free(header.begin)?;
                }
                mem.fill(address, 0, VECTOR_HEADER_SIZE)?;
            }
            ContainerKind::BitVector => {
                let header = BitVectorHeader::read(mem, address)?;
                if is_live(header.data) {
                    mem.free(header.data)?;
                }
                mem.fill(address, 0, BIT_VECTOR_HEADER_SIZE)?;
            }
            ContainerKind::Deque => {
                let header = DequeHeader::read(mem, address)?;
                if is_live(header.data) {
                    if let Some(item) = c.item {
                        let stride = types.byte_size(item).unwrap_or(0);
                        for i in 0..header.len {
                            let slot = header.data.offset(header.slot(i) * stride);
                            release_at(types, mem, slot, item, depth + 1)?;
                        }
                    }
                    mem.free(header.data)?;
                }
                mem.fill(address, 0, DEQUE_HEADER_SIZE)?;
            }
            ContainerKind::FixedBuffer { len } => {
                if let Some(item) = c.item {
                    let stride = types.byte_size(item).unwrap_or(0);
                    for i in 0..len {
                        release_at(types, mem, address.offset(i * stride), item, depth + 1)?;
                    }
                }
            }
        },
        _ => {}
    }
    Ok(())
}

// ============================================================================
// 深拷贝
// ============================================================================

/// 复制缓冲区，返回新地址
fn duplicate_buffer(mem: &mut dyn HostMemory, data: Address, len: usize) -> BridgeResult<Address> {
    let fresh = mem.allocate(len.max(1), ALLOC_ALIGN)?;
    if len > 0 {
        let bytes = mem.read_bytes(data, len)?;
        mem.write(fresh, &bytes)?;
    }
    Ok(fresh)
}

/// `address` 处的字节刚从另一个对象复制而来，把其中共享的堆资源换成独立副本
fn duplicate_owned(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    id: TypeId,
    depth: usize,
) -> BridgeResult<()> {
    if depth > MAX_DEPTH {
        return Ok(());
    }
    let identity = types.get(id);
    match &identity.shape {
        TypeShape::Primitive(PrimitiveKind::String) => {
            let text = read_host_string(mem, address)?;
            mem.fill(address, 0, STRING_HEADER_SIZE)?;
            if !text.is_empty() {
                write_host_string(mem, address, &text)?;
            }
        }
        TypeShape::Struct(_) | TypeShape::VirtualStruct(_) => {
            for walked in types.walk_fields(id) {
                let field = &walked.field;
                let at = address.offset(field.offset);
                match (field.mode, field.ty) {
                    (FieldMode::Primitive, Some(ty))
                    | (FieldMode::Substruct, Some(ty))
                    | (FieldMode::Container, Some(ty)) => {
                        duplicate_owned(types, mem, at, ty, depth + 1)?
                    }
                    (FieldMode::FixedArray, Some(ty)) => {
                        let stride = types.byte_size(ty).unwrap_or(0);
                        for i in 0..field.count {
                            duplicate_owned(types, mem, at.offset(i * stride), ty, depth + 1)?;
                        }
                    }
                    (FieldMode::Pointer, Some(ty)) if field.owns_target() => {
                        let target = mem.read_ptr(at)?;
                        if is_live(target) {
                            let fresh = allocate(types, mem, ty)?;
                            copy(types, mem, fresh, target, ty)?;
                            mem.write_ptr(at, fresh)?;
                        }
                    }
                    (FieldMode::PointerVectorLegacy, _) => {
                        duplicate_vector(types, mem, at, None, POINTER_SIZE, depth)?;
                    }
                    _ => {}
                }
            }
        }
        TypeShape::Container(c) => match c.kind {
            ContainerKind::ValueVector => {
                if let Some(item) = c.item {
                    let stride = types.byte_size(item).unwrap_or(0);
                    duplicate_vector(types, mem, address, Some(item), stride, depth)?;
                }
            }
            ContainerKind::PointerVector => {
                duplicate_vector(types, mem, address, None, POINTER_SIZE, depth)?;
            }
            ContainerKind::BitVector => {
                let mut header = BitVectorHeader::read(mem, address)?;
                if is_live(header.data) {
                    let bytes = BitVectorHeader::bytes_for(header.bit_len);
                    header.data = duplicate_buffer(mem, header.data, bytes)?;
                    header.write(mem, address)?;
                }
            }
            ContainerKind::Deque => {
                let header = DequeHeader::read(mem, address)?;
                let Some(item) = c.item else { return Ok(()) };
                if !is_live(header.data) || header.len == 0 {
                    DequeHeader::default().write(mem, address)?;
                    return Ok(());
                }
                let stride = types.byte_size(item).unwrap_or(0);
                let fresh = mem.allocate((header.len * stride).max(1), ALLOC_ALIGN)?;
                for i in 0..header.len {
                    let from = header.data.offset(header.slot(i) * stride);
                    let to = fresh.offset(i * stride);
                    let bytes = mem.read_bytes(from, stride)?;
                    mem.write(to, &bytes)?;
                    duplicate_owned(types, mem, to, item, depth + 1)?;
                }
                DequeHeader {
                    data: fresh,
                    head: 0,
                    len: header.len,
                    cap: header.len,
                }
                .write(mem, address)?;
            }
            ContainerKind::FixedBuffer { len } => {
                if let Some(item) = c.item {
                    let stride = types.byte_size(item).unwrap_or(0);
                    for i in 0..len {
                        duplicate_owned(types, mem, address.offset(i * stride), item, depth + 1)?;
                    }
                }
            }
        },
        _ => {}
    }
    Ok(())
}

fn duplicate_vector(
    types: &TypeRegistry,
    mem: &mut dyn HostMemory,
    address: Address,
    item: Option<TypeId>,
    stride: usize,
    depth: usize,
) -> BridgeResult<()> {
    let header = VectorHeader::read(mem, address)?;
    if !is_live(header.begin) {
        return VectorHeader::default().write(mem, address).map_err(Into::into);
    }
    let len = header.len(stride);
    let fresh = duplicate_buffer(mem, header.begin, len * stride)?;
    if let Some(item) = item {
        for i in 0..len {
            duplicate_owned(types, mem, fresh.offset(i * stride), item, depth + 1)?;
        }
    }
    VectorHeader::with_buffer(fresh, len, len, stride).write(mem, address)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaMemory;
    use crate::types::{
        ContainerIdentity, FieldDescriptor, StructIdentity, TypeRegistryBuilder,
        POINTER_OWNS_TARGET,
    };

    struct Fixture {
        types: TypeRegistry,
        unit: TypeId,
        opaque: TypeId,
        name_vec: TypeId,
    }

    fn fixture() -> Fixture {
        let mut b = TypeRegistryBuilder::new();
        let i32_t = b.primitive(PrimitiveKind::I32);
        let string_t = b.primitive(PrimitiveKind::String);
        let name_vec = b.container(ContainerIdentity::vector(string_t));
        let unit = b.declare("unit");
        let opaque = b.add("handle", TypeShape::Opaque);
        b.define(
            unit,
            TypeShape::Struct(StructIdentity::new(
                64,
                vec![
                    FieldDescriptor::primitive("hp", 0, i32_t),
                    FieldDescriptor::primitive("name", 8, string_t),
                    FieldDescriptor::container("aliases", 32, name_vec),
                    FieldDescriptor::pointer("leader", 56, Some(unit)).with_flags(POINTER_OWNS_TARGET),
                ],
            )),
        );
        Fixture {
            types: b.build().unwrap(),
            unit,
            opaque,
            name_vec,
        }
    }

    #[test]
    fn test_all_or_nothing() {
        let f = fixture();
        let mut mem = ArenaMemory::new();
        assert!(!can_allocate(&f.types, f.opaque));
        let scratch = mem.allocate(8, 8).unwrap();
        assert!(allocate(&f.types, &mut mem, f.opaque).is_err());
        assert!(copy(&f.types, &mut mem, scratch, scratch, f.opaque).is_err());
        assert!(destroy(&f.types, &mut mem, scratch, f.opaque).is_err());
        assert!(can_allocate(&f.types, f.unit));
        assert!(can_allocate(&f.types, f.name_vec));
    }

    #[test]
    fn test_deep_copy_does_not_share_strings() {
        let f = fixture();
        let mut mem = ArenaMemory::new();
        let a = allocate(&f.types, &mut mem, f.unit).unwrap();
        let b = allocate(&f.types, &mut mem, f.unit).unwrap();
        write_host_string(&mut mem, a.offset(8), "urist").unwrap();
        copy(&f.types, &mut mem, b, a, f.unit).unwrap();

        assert_eq!(read_host_string(&mem, b.offset(8)).unwrap(), "urist");
        assert_ne!(
            mem.read_ptr(a.offset(8)).unwrap(),
            mem.read_ptr(b.offset(8)).unwrap()
        );

        write_host_string(&mut mem, a.offset(8), "other").unwrap();
        assert_eq!(read_host_string(&mem, b.offset(8)).unwrap(), "urist");
    }

    #[test]
    fn test_owned_pointer_is_deep_copied_and_destroyed() {
        let f = fixture();
        let mut mem = ArenaMemory::new();
        let a = allocate(&f.types, &mut mem, f.unit).unwrap();
        let leader = allocate(&f.types, &mut mem, f.unit).unwrap();
        PrimitiveKind::I32.write_integer(&mut mem, leader, 99).unwrap();
        mem.write_ptr(a.offset(56), leader).unwrap();

        let b = allocate(&f.types, &mut mem, f.unit).unwrap();
        copy(&f.types, &mut mem, b, a, f.unit).unwrap();
        let copied = mem.read_ptr(b.offset(56)).unwrap();
        assert_ne!(copied, leader);
        assert_eq!(PrimitiveKind::I32.read_integer(&mem, copied).unwrap(), 99);

        let before = mem.block_count();
        destroy(&f.types, &mut mem, b, f.unit).unwrap();
        // 对象本身和深拷贝出的 leader；名字从未写入，没有缓冲区
        assert_eq!(mem.block_count(), before - 2);
        assert!(!mem.contains(copied, 4));
        assert!(mem.contains(leader, 4));
    }
}
