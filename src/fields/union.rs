//! 带标签联合体的解析
//!
//! 联合体字段本身不记录哪个成员有效，需要从同一结构体中的一个枚举
//! 字段（标签）推断。标签字段按以下顺序查找：
//!
//! 1. 字段描述中显式给出的标签字段名
//! 2. 名为 `<stem>data` 的联合体配对 `<stem>type`
//! 3. 名为 `<stem>` 的联合体配对排在它之前的 `<stem>_target`
//!
//! 标签值的键名（或字段指定的枚举属性）选出同名的成员。
//!
//! 标签与成员对不上时通常返回错误，但有两种情况只记录问题而不失败：
//! 联合体字节全为同一个未初始化字节时视为"未设置"；找不到成员但第一
//! 个成员是指针时，给出裸指针作为兜底视图。

use super::container::{self, CountMode};
use super::read_field;
use crate::access::{AccessContext, ObjectRef, Value};
use crate::core::error::{AccessError, BridgeResult, UnionTagError};
use crate::memory::{Address, UNINIT_BYTE};
use crate::types::{EnumKey, FieldMode, TypeId, TypeShape};

/// 联合体的当前状态
#[derive(Debug, Clone, PartialEq)]
pub enum UnionState {
    /// 标签选中的成员及其值
    Active { member: String, value: Value },
    /// 联合体未被写入过
    Unset,
    /// 找不到成员，第一个成员是指针时的原始指针值
    Fallback { address: Address },
    /// 无法确定
    Unresolved,
}

/// 解析结果：状态，以及解析中发现的问题
#[derive(Debug, Clone, PartialEq)]
pub struct UnionResolution {
    pub state: UnionState,
    pub issue: Option<UnionTagError>,
}

impl UnionResolution {
    fn ok(state: UnionState) -> Self {
        Self { state, issue: None }
    }

    fn failed(state: UnionState, issue: UnionTagError) -> Self {
        tracing::warn!(target: "fields", "{}", issue);
        Self {
            state,
            issue: Some(issue),
        }
    }

    /// 脚本可见的成员值；未解析时为 nil
    pub fn value(&self) -> Value {
        match &self.state {
            UnionState::Active { value, .. } => value.clone(),
            UnionState::Fallback { address } => Value::Int(address.0 as i64),
            UnionState::Unset | UnionState::Unresolved => Value::Nil,
        }
    }

    pub fn issue_message(&self) -> Option<String> {
        self.issue.as_ref().map(ToString::to_string)
    }
}

struct Tag {
    field: String,
    /// 枚举类型（单个联合体）或枚举容器（联合体容器）
    ty: TypeId,
    attr: Option<String>,
}

/// 查找联合体字段对应的标签字段
fn find_tag(ctx: &mut AccessContext<'_>, owner: ObjectRef, field_name: &str) -> BridgeResult<Option<Tag>> {
    let binding = ctx.binding(owner.ty)?;
    let field = binding
        .field(field_name)
        .ok_or_else(|| AccessError::NoSuchField {
            type_name: binding.type_name.clone(),
            name: field_name.to_string(),
        })?;
    let position = binding
        .fields()
        .iter()
        .position(|f| f.name == field_name)
        .unwrap_or(0);

    let explicit = field.descriptor.extra.union_tag_field.clone();
    let by_data = field_name
        .strip_suffix("data")
        .map(|stem| format!("{}type", stem))
        .filter(|name| binding.field(name).is_some());
    let by_target = {
        let name = format!("{}_target", field_name);
        binding
            .fields()
            .iter()
            .position(|f| f.name == name)
            .filter(|p| *p < position)
            .map(|_| name)
    };

    let Some(tag_name) = explicit.or(by_data).or(by_target) else {
        return Ok(None);
    };
    let Some(tag_field) = binding.field(&tag_name) else {
        return Ok(None);
    };
    Ok(tag_field.descriptor.ty.map(|ty| Tag {
        field: tag_name.clone(),
        ty,
        attr: field.descriptor.extra.union_tag_attr.clone(),
    }))
}

/// 解析 `owner` 上名为 `field_name` 的联合体字段
pub fn resolve_union(
    ctx: &mut AccessContext<'_>,
    owner: ObjectRef,
    field_name: &str,
) -> BridgeResult<UnionResolution> {
    let union = super::field_storage(ctx, owner, field_name)?.ok_or_else(|| {
        AccessError::NoSuchField {
            type_name: ctx.type_name(owner.ty),
            name: field_name.to_string(),
        }
    })?;
    let union_name = ctx.type_name(union.ty);
    let Some(tag) = find_tag(ctx, owner, field_name)? else {
        return Ok(UnionResolution::failed(
            UnionState::Unresolved,
            UnionTagError::NoTagField { union: union_name },
        ));
    };
    let value = read_field(ctx, owner, &tag.field)?
        .as_int()
        .ok_or(AccessError::Expected("integer"))?;
    resolve_member(ctx, union, tag.ty, value, tag.attr.as_deref())
}

/// 解析联合体容器：成员容器和标签容器按下标对应
///
/// 两者长度不同时按较短的一方迭代，长度不符只报告一次。
pub fn resolve_union_items(
    ctx: &mut AccessContext<'_>,
    owner: ObjectRef,
    field_name: &str,
) -> BridgeResult<(Vec<UnionResolution>, Option<UnionTagError>)> {
    let members = super::field_storage(ctx, owner, field_name)?.ok_or_else(|| {
        AccessError::NoSuchField {
            type_name: ctx.type_name(owner.ty),
            name: field_name.to_string(),
        }
    })?;
    let members_name = ctx.type_name(members.ty);
    let Some(tag) = find_tag(ctx, owner, field_name)? else {
        let issue = UnionTagError::NoTagField {
            union: members_name,
        };
        tracing::warn!(target: "fields", "{}", issue);
        return Ok((Vec::new(), Some(issue)));
    };
    let tags = super::field_storage(ctx, owner, &tag.field)?.ok_or_else(|| {
        AccessError::NoSuchField {
            type_name: ctx.type_name(owner.ty),
            name: tag.field.clone(),
        }
    })?;

    let union_ty = item_of(ctx, members.ty)?;
    let enum_ty = item_of(ctx, tags.ty)?;

    let member_count = container::count(ctx, members, CountMode::Len)?;
    let tag_count = container::count(ctx, tags, CountMode::Len)?;
    let mismatch = (member_count != tag_count).then(|| UnionTagError::LengthMismatch {
        union: members_name.clone(),
        members: member_count,
        tags: tag_count,
    });
    if let Some(issue) = &mismatch {
        tracing::warn!(target: "fields", "{}", issue);
    }

    let mut items = Vec::with_capacity(member_count.min(tag_count));
    for i in 0..member_count.min(tag_count) {
        let address = container::item_address(ctx, members, i)?;
        let value = container::read_item(ctx, tags, i)?
            .as_int()
            .ok_or(AccessError::Expected("integer"))?;
        items.push(resolve_member(
            ctx,
            ObjectRef::new(address, union_ty),
            enum_ty,
            value,
            tag.attr.as_deref(),
        )?);
    }
    Ok((items, mismatch))
}

fn item_of(ctx: &AccessContext<'_>, ty: TypeId) -> Result<TypeId, AccessError> {
    ctx.types
        .get(ty)
        .as_container()
        .and_then(|c| c.item)
        .ok_or_else(|| AccessError::Unsized(ctx.type_name(ty)))
}

fn resolve_member(
    ctx: &mut AccessContext<'_>,
    union: ObjectRef,
    enum_ty: TypeId,
    value: i64,
    attr: Option<&str>,
) -> BridgeResult<UnionResolution> {
    let union_identity = ctx.types.get(union.ty);
    let enum_identity = ctx.types.get(enum_ty);
    let union_name = union_identity.name.clone();
    let (TypeShape::Union(members), Some(e)) = (&union_identity.shape, enum_identity.as_enum())
    else {
        return Ok(UnionResolution::failed(
            UnionState::Unresolved,
            UnionTagError::NoTagField { union: union_name },
        ));
    };

    let key = match e.key_of(value) {
        EnumKey::OutOfRange => {
            return Ok(UnionResolution::failed(
                UnionState::Unresolved,
                UnionTagError::OutOfRange {
                    union: union_name,
                    value,
                },
            ))
        }
        EnumKey::Unnamed => {
            return Ok(UnionResolution::failed(
                UnionState::Unresolved,
                UnionTagError::Unnamed {
                    union: union_name,
                    value,
                },
            ))
        }
        EnumKey::Named(key) => key,
    };
    let member = match attr {
        Some(attr) => e
            .attrs
            .get(&value)
            .and_then(|a| a.get(attr))
            .map_or(key, String::as_str),
        None => key,
    };

    if members.member(member).is_some() {
        let value = read_field(ctx, union, member)?;
        return Ok(UnionResolution::ok(UnionState::Active {
            member: member.to_string(),
            value,
        }));
    }

    let bytes = ctx.mem.read_bytes(union.address, members.size)?;
    let blank = bytes
        .first()
        .map_or(true, |b| (*b == 0 || *b == UNINIT_BYTE) && bytes.iter().all(|x| x == b));
    if blank {
        return Ok(UnionResolution::ok(UnionState::Unset));
    }

    let issue = UnionTagError::MissingMember {
        union: union_name,
        tag: member.to_string(),
    };
    let first_is_pointer = members
        .members()
        .first()
        .is_some_and(|f| f.mode == FieldMode::Pointer);
    if first_is_pointer {
        let address = ctx.mem.read_ptr(union.address)?;
        return Ok(UnionResolution::failed(UnionState::Fallback { address }, issue));
    }
    Ok(UnionResolution::failed(UnionState::Unresolved, issue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::Runtime;
    use crate::fields::write_field;
    use crate::types::{
        lifecycle, ContainerIdentity, EnumIdentity, FieldDescriptor, PrimitiveKind, StructIdentity,
        TypeRegistry, UnionIdentity,
    };
    use std::sync::Arc;

    struct Fixture {
        runtime: Arc<Runtime>,
        event: TypeId,
        batch: TypeId,
    }

    /// event { kind: event_type @0; data: event_data @8 }
    /// event_data = union { move: int32; talk: pointer; }
    fn fixture() -> Fixture {
        let mut b = TypeRegistry::builder();
        let i32_t = b.primitive(PrimitiveKind::I32);
        let kind = b.add(
            "event_type",
            TypeShape::Enum(
                EnumIdentity::contiguous(
                    PrimitiveKind::I32,
                    0,
                    &[Some("move"), None, Some("talk"), Some("sleep")],
                )
                .with_attr(3, "payload", "move"),
            ),
        );
        let data = b.add(
            "event_data",
            TypeShape::Union(UnionIdentity::new(
                8,
                vec![
                    FieldDescriptor::pointer("talk", 0, None),
                    FieldDescriptor::primitive("move", 0, i32_t),
                ],
            )),
        );
        let event = b.add(
            "event",
            TypeShape::Struct(StructIdentity::new(
                16,
                vec![
                    FieldDescriptor::primitive("type", 0, kind),
                    FieldDescriptor::substruct("data", 8, data),
                ],
            )),
        );
        let datas = b.container(ContainerIdentity::vector(data));
        let kinds = b.container(ContainerIdentity::vector(kind));
        let batch = b.add(
            "batch",
            TypeShape::Struct(StructIdentity::new(
                48,
                vec![
                    FieldDescriptor::container("itemtype", 0, kinds),
                    FieldDescriptor::container("itemdata", 24, datas),
                ],
            )),
        );
        Fixture {
            runtime: Runtime::builder().types(b.build().unwrap()).build().unwrap(),
            event,
            batch,
        }
    }

    fn new_obj(ctx: &mut AccessContext<'_>, ty: TypeId) -> ObjectRef {
        ObjectRef::new(lifecycle::allocate(ctx.types, ctx.mem, ty).unwrap(), ty)
    }

    #[test]
    fn test_tag_selects_member() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let ev = new_obj(ctx, f.event);
            write_field(ctx, ev, "type", &Value::Int(0)).unwrap();
            ctx.mem.write(ev.address.offset(8), &7i32.to_le_bytes()).unwrap();
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert_eq!(
                r.state,
                UnionState::Active {
                    member: "move".to_string(),
                    value: Value::Int(7)
                }
            );
            assert!(r.issue.is_none());
        });
    }

    #[test]
    fn test_out_of_range_and_unnamed_tags() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let ev = new_obj(ctx, f.event);
            write_field(ctx, ev, "type", &Value::Int(9)).unwrap();
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert!(matches!(r.issue, Some(UnionTagError::OutOfRange { value: 9, .. })));
            assert_eq!(r.value(), Value::Nil);

            write_field(ctx, ev, "type", &Value::Int(1)).unwrap();
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert!(matches!(r.issue, Some(UnionTagError::Unnamed { value: 1, .. })));
        });
    }

    #[test]
    fn test_null_pointer_member_reads_nil() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let ev = new_obj(ctx, f.event);
            write_field(ctx, ev, "type", &Value::Int(2)).unwrap();
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert_eq!(r.state, UnionState::Active { member: "talk".to_string(), value: Value::Nil });
        });
    }

    #[test]
    fn test_missing_member_falls_back_to_pointer() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let ev = new_obj(ctx, f.event);
            write_field(ctx, ev, "type", &Value::Int(3)).unwrap();
            // "sleep" 没有对应成员，全零字节视为未设置
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert_eq!(r.state, UnionState::Unset);
            assert!(r.issue.is_none());

            ctx.mem.write_ptr(ev.address.offset(8), Address(0x1000)).unwrap();
            let r = resolve_union(ctx, ev, "data").unwrap();
            assert_eq!(r.state, UnionState::Fallback { address: Address(0x1000) });
            assert!(matches!(r.issue, Some(UnionTagError::MissingMember { .. })));
        });
    }

    #[test]
    fn test_union_container_reports_length_mismatch_once() {
        let f = fixture();
        f.runtime.with_access(|ctx| {
            let batch = new_obj(ctx, f.batch);
            let tags = super::super::field_storage(ctx, batch, "itemtype").unwrap().unwrap();
            let datas = super::super::field_storage(ctx, batch, "itemdata").unwrap().unwrap();
            for t in [0, 0, 3] {
                container::insert(ctx, tags, None, &Value::Int(t)).unwrap();
            }
            container::resize(ctx, datas, 2).unwrap();
            let first = container::item_address(ctx, datas, 0).unwrap();
            ctx.mem.write(first, &5i32.to_le_bytes()).unwrap();

            let (items, issue) = resolve_union_items(ctx, batch, "itemdata").unwrap();
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].value(), Value::Int(5));
            assert_eq!(
                issue,
                Some(UnionTagError::LengthMismatch {
                    union: "vector<event_data>".to_string(),
                    members: 2,
                    tags: 3
                })
            );
        });
    }
}
