//! 带标签联合体的解析

use anyhow::Result;
use std::sync::Arc;
use struct_bridge::access::{ObjectRef, Value};
use struct_bridge::core::{Runtime, UnionTagError};
use struct_bridge::fields::union::resolve_union_items;
use struct_bridge::fields::{container, field_storage};
use struct_bridge::scripting::ScriptBridge;
use struct_bridge::types::{
    lifecycle, ContainerIdentity, EnumIdentity, FieldDescriptor, PrimitiveKind, StructIdentity,
    TypeRegistry, TypeShape, UnionIdentity,
};

/// event { type: event_type @0; data: event_data @8 }
/// batch { itemtype: vector<event_type> @0; itemdata: vector<event_data> @24 }
fn runtime() -> Arc<Runtime> {
    let mut b = TypeRegistry::builder();
    let i32_t = b.primitive(PrimitiveKind::I32);
    let kind = b.add(
        "event_type",
        TypeShape::Enum(EnumIdentity::contiguous(
            PrimitiveKind::I32,
            0,
            &[Some("move"), None, Some("talk"), Some("sleep")],
        )),
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
    b.add(
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
    b.add(
        "batch",
        TypeShape::Struct(StructIdentity::new(
            48,
            vec![
                FieldDescriptor::container("itemtype", 0, kinds),
                FieldDescriptor::container("itemdata", 24, datas),
            ],
        )),
    );
    Runtime::builder()
        .types(b.build().expect("valid schema"))
        .build()
        .expect("runtime")
}

#[test]
fn test_guest_union_resolution() -> Result<()> {
    let bridge = ScriptBridge::new(runtime())?;
    let values = bridge.eval(
        r#"
        local ev = host.new(host.types.event)
        local results = {}

        ev.type = "move"
        ev.data.move = 7
        results[#results + 1] = { ev:_union("data") }

        ev.type = 9
        results[#results + 1] = { ev:_union("data") }

        ev.type = 1
        results[#results + 1] = { ev:_union("data") }

        local fresh = host.new(host.types.event)
        fresh.type = "sleep"
        results[#results + 1] = { fresh:_union("data") }

        return results[1][1], results[1][2],
               results[2][1], results[2][2],
               results[3][2],
               results[4][1], results[4][2]
        "#,
        "=unions",
    )?;

    assert_eq!(values[0], Value::Int(7));
    assert_eq!(values[1], Value::Nil);
    assert_eq!(values[2], Value::Nil);
    assert!(values[3].as_str().is_some_and(|s| s.contains("out of range")));
    assert!(values[4].as_str().is_some_and(|s| s.contains("unnamed")));
    assert_eq!(values[5], Value::Nil);
    assert_eq!(values[6], Value::Nil);
    Ok(())
}

#[test]
fn test_parallel_vectors_bound_by_shorter() {
    let runtime = runtime();
    let batch_ty = runtime.types().lookup("batch").expect("batch type");
    runtime.with_access(|ctx| {
        let address = lifecycle::allocate(ctx.types, ctx.mem, batch_ty).unwrap();
        let batch = ObjectRef::new(address, batch_ty);
        let tags = field_storage(ctx, batch, "itemtype").unwrap().unwrap();
        let datas = field_storage(ctx, batch, "itemdata").unwrap().unwrap();
        for tag in [0, 0] {
            container::insert(ctx, tags, None, &Value::Int(tag)).unwrap();
        }
        container::resize(ctx, datas, 4).unwrap();
        for (i, v) in [3i32, 4].iter().enumerate() {
            let item = container::item_address(ctx, datas, i).unwrap();
            ctx.mem.write(item, &v.to_le_bytes()).unwrap();
        }

        let (items, issue) = resolve_union_items(ctx, batch, "itemdata").unwrap();
        let values: Vec<Value> = items.iter().map(|r| r.value()).collect();
        assert_eq!(values, vec![Value::Int(3), Value::Int(4)]);
        assert_eq!(
            issue,
            Some(UnionTagError::LengthMismatch {
                union: "vector<event_data>".to_string(),
                members: 4,
                tags: 2,
            })
        );
    });
}
