use super::accessor::build_accessor;
use super::*;
use crate::access::BoundMethod;
use crate::core::runtime::Runtime;
use crate::memory::{ArenaMemory, HostMemory};
use crate::types::{
    BitDescriptor, BitfieldIdentity, CallFrame, ContainerIdentity, EnumIdentity, FieldDescriptor,
    FieldMode, FunctionIdentity, GlobalIdentity, NativeFunction, PrimitiveKind, StructIdentity,
    TypeRegistry, POINTER_OWNS_TARGET,
};
use std::collections::HashSet;
use std::sync::Arc;

struct World {
    runtime: Arc<Runtime>,
    creature: TypeId,
    coord: TypeId,
    dog: TypeId,
    kennel: TypeId,
    globals: TypeId,
}

fn greet() -> Arc<NativeFunction> {
    Arc::new(NativeFunction::new(
        "creature.greet",
        FunctionIdentity::untyped(0),
        |_, frame: &mut CallFrame| Ok(Value::Bool(frame.this.is_some())),
    ))
}

/// creature 的布局：
///
/// | 偏移 | 字段 | 模式 |
/// |---|---|---|
/// | 0 | hp | primitive |
/// | 4 | name | fixed-string[12] |
/// | 16 | leader | owned pointer |
/// | 24 | skills | int32_t[3] |
/// | 36 | flags | bitfield |
/// | 40 | job | enum |
/// | 48 | tags | vector<int32_t> |
/// | 72 | title | string |
/// | 96 | friends | legacy pointer vector |
/// | 120 | pos | substruct |
/// | 128 | raw | void* |
fn world() -> World {
    let mut b = TypeRegistry::builder();
    let i32_t = b.primitive(PrimitiveKind::I32);
    let string_t = b.primitive(PrimitiveKind::String);
    let creature = b.declare("creature");
    b.pointer(Some(creature));
    let coord = b.add(
        "coord",
        TypeShape::Struct(StructIdentity::new(
            8,
            vec![
                FieldDescriptor::primitive("x", 0, i32_t),
                FieldDescriptor::primitive("y", 4, i32_t),
            ],
        )),
    );
    let flags = b.add(
        "creature_flags",
        TypeShape::Bitfield(BitfieldIdentity::new(
            PrimitiveKind::U32,
            vec![
                BitDescriptor::named("alive", 1),
                BitDescriptor::named("poisoned", 1),
                BitDescriptor::padding(2),
                BitDescriptor::named("level", 4),
            ],
        )),
    );
    let job = b.add(
        "job_type",
        TypeShape::Enum(EnumIdentity::contiguous(
            PrimitiveKind::I32,
            0,
            &[Some("none"), Some("miner"), Some("mason")],
        )),
    );
    let tags = b.container(ContainerIdentity::vector(i32_t));
    b.define(
        creature,
        TypeShape::Struct(StructIdentity::new(
            136,
            vec![
                FieldDescriptor::primitive("hp", 0, i32_t),
                FieldDescriptor::fixed_string("name", 4, 12),
                FieldDescriptor::pointer("leader", 16, Some(creature)).with_flags(POINTER_OWNS_TARGET),
                FieldDescriptor::fixed_array("skills", 24, i32_t, 3),
                FieldDescriptor::primitive("flags", 36, flags),
                FieldDescriptor::primitive("job", 40, job),
                FieldDescriptor::container("tags", 48, tags),
                FieldDescriptor::primitive("title", 72, string_t),
                FieldDescriptor::pointer_vector_legacy("friends", 96, creature),
                FieldDescriptor::substruct("pos", 120, coord),
                FieldDescriptor::pointer("raw", 128, None),
                FieldDescriptor::object_method("greet", greet()),
                FieldDescriptor::class_method("spawn", greet()),
            ],
        )),
    );

    let animal = b.add(
        "animal",
        TypeShape::VirtualStruct(
            StructIdentity::new(16, vec![FieldDescriptor::primitive("legs", 8, i32_t)])
                .with_dispatch(Address(0x5000)),
        ),
    );
    let dog = b.add(
        "dog",
        TypeShape::VirtualStruct(
            StructIdentity::new(24, vec![FieldDescriptor::primitive("bark", 16, i32_t)])
                .with_parent(animal)
                .with_dispatch(Address(0x5100)),
        ),
    );
    let kennel = b.add(
        "kennel",
        TypeShape::Struct(StructIdentity::new(
            8,
            vec![FieldDescriptor::pointer("pet", 0, Some(animal))],
        )),
    );
    let globals = b.add(
        "global",
        TypeShape::Global(GlobalIdentity::new(vec![FieldDescriptor::primitive(
            "tick", 0, i32_t,
        )])),
    );

    let mut mem = ArenaMemory::new();
    let tick = mem.allocate(4, 4).unwrap();
    mem.write(tick, &17i32.to_le_bytes()).unwrap();
    let runtime = Runtime::builder()
        .types(b.build().unwrap())
        .memory(Box::new(mem))
        .global("tick", tick)
        .build()
        .unwrap();
    World {
        runtime,
        creature,
        coord,
        dog,
        kennel,
        globals,
    }
}

fn alloc(ctx: &mut AccessContext<'_>, ty: TypeId) -> ObjectRef {
    ObjectRef::new(lifecycle::allocate(ctx.types, ctx.mem, ty).unwrap(), ty)
}

fn table(entries: &[(&str, Value)]) -> Value {
    Value::Table(
        entries
            .iter()
            .map(|(k, v)| (Value::from(*k), v.clone()))
            .collect(),
    )
}

#[test]
fn test_primitive_field_roundtrip_and_error_message() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        write_field(ctx, c, "hp", &Value::Int(42)).unwrap();
        assert_eq!(read_field(ctx, c, "hp").unwrap(), Value::Int(42));

        let err = write_field(ctx, c, "hp", &Value::from("lots")).unwrap_err();
        assert_eq!(err.to_string(), "Cannot write field creature.hp: integer expected.");
        assert_eq!(read_field(ctx, c, "hp").unwrap(), Value::Int(42));
    });
}

#[test]
fn test_unknown_field_is_not_wrapped() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        assert!(matches!(
            read_field(ctx, c, "mana"),
            Err(BridgeError::Access(AccessError::NoSuchField { .. }))
        ));
    });
}

#[test]
fn test_fixed_string_and_host_string() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        write_field(ctx, c, "name", &Value::from("Urist")).unwrap();
        write_field(ctx, c, "title", &Value::from("the Mason")).unwrap();
        assert_eq!(read_field(ctx, c, "name").unwrap(), Value::from("Urist"));
        assert_eq!(read_field(ctx, c, "title").unwrap(), Value::from("the Mason"));

        let storage = field_storage(ctx, c, "name").unwrap().unwrap();
        assert_eq!(ctx.type_name(storage.ty), "uint8_t[12]");
        assert_eq!(index(ctx, storage, &Value::Int(0)).unwrap(), Value::Int(b'U' as i64));
    });
}

#[test]
fn test_fixed_array_through_index() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let Value::Ref(skills) = read_field(ctx, c, "skills").unwrap() else {
            panic!("expected a reference");
        };
        set_index(ctx, skills, &Value::Int(1), &Value::Int(5)).unwrap();
        assert_eq!(index(ctx, skills, &Value::Int(1)).unwrap(), Value::Int(5));
        assert_eq!(container::count(ctx, skills, CountMode::Write).unwrap(), 3);
        assert!(index(ctx, skills, &Value::Int(3)).is_err());
    });
}

#[test]
fn test_bitfield_members_and_whole() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let Value::Ref(flags) = read_field(ctx, c, "flags").unwrap() else {
            panic!("expected a reference");
        };
        set_index(ctx, flags, &Value::from("poisoned"), &Value::Bool(true)).unwrap();
        set_index(ctx, flags, &Value::from("level"), &Value::Int(5)).unwrap();
        assert_eq!(index(ctx, flags, &Value::from(WHOLE_FIELD)).unwrap(), Value::Int(82));
        assert_eq!(index(ctx, flags, &Value::from("alive")).unwrap(), Value::Bool(false));
        assert_eq!(index(ctx, flags, &Value::from("level")).unwrap(), Value::Int(5));

        write_field(ctx, c, "flags", &table(&[("alive", Value::Bool(true))])).unwrap();
        assert_eq!(index(ctx, flags, &Value::from(WHOLE_FIELD)).unwrap(), Value::Int(83));
    });
}

#[test]
fn test_enum_accepts_key_names() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        write_field(ctx, c, "job", &Value::from("mason")).unwrap();
        assert_eq!(read_field(ctx, c, "job").unwrap(), Value::Int(2));
        assert!(write_field(ctx, c, "job", &Value::from("farmer")).is_err());
    });
}

#[test]
fn test_container_assign_from_table_appends() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let items = Value::Table(vec![
            (Value::Int(1), Value::Int(10)),
            (Value::Int(2), Value::Int(20)),
        ]);
        write_field(ctx, c, "tags", &items).unwrap();
        let Value::Ref(tags) = read_field(ctx, c, "tags").unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(container::count(ctx, tags, CountMode::Len).unwrap(), 2);
        assert_eq!(index(ctx, tags, &Value::Int(1)).unwrap(), Value::Int(20));
        set_index(ctx, tags, &Value::from(container::APPEND_KEY), &Value::Int(30)).unwrap();
        assert_eq!(index(ctx, tags, &Value::Int(2)).unwrap(), Value::Int(30));
    });
}

#[test]
fn test_owned_pointer_new_and_clear() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let fresh = table(&[("new", Value::Bool(true)), ("hp", Value::Int(7))]);
        write_field(ctx, c, "leader", &fresh).unwrap();
        let Value::Ref(leader) = read_field(ctx, c, "leader").unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(leader.ty, w.creature);
        assert_eq!(read_field(ctx, leader, "hp").unwrap(), Value::Int(7));

        // 没有 new 时写入现有目标
        write_field(ctx, c, "leader", &table(&[("hp", Value::Int(8))])).unwrap();
        assert_eq!(read_field(ctx, leader, "hp").unwrap(), Value::Int(8));

        write_field(ctx, c, "leader", &Value::Nil).unwrap();
        assert_eq!(read_field(ctx, c, "leader").unwrap(), Value::Nil);
        assert!(ctx.mem.read_bytes(leader.address, 4).is_err());
    });
}

#[test]
fn test_failed_new_target_is_released() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let fresh = table(&[("new", Value::Bool(true)), ("hp", Value::from("x"))]);
        assert!(write_field(ctx, c, "leader", &fresh).is_err());
        assert_eq!(read_field(ctx, c, "leader").unwrap(), Value::Nil);
    });
}

#[test]
fn test_pointer_rejects_incompatible_reference() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let p = alloc(ctx, w.coord);
        let err = write_field(ctx, c, "leader", &Value::Ref(p)).unwrap_err();
        assert_eq!(err.root_category(), "TypeMismatchError");
    });
}

#[test]
fn test_void_pointer_accepts_raw_address() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        write_field(ctx, c, "raw", &Value::Int(0x40)).unwrap();
        assert_eq!(read_field(ctx, c, "raw").unwrap(), Value::Int(0x40));
        write_field(ctx, c, "raw", &Value::Nil).unwrap();
        assert_eq!(read_field(ctx, c, "raw").unwrap(), Value::Nil);
    });
}

#[test]
fn test_pointer_field_storage_uses_registered_pointer_type() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let slot = field_storage(ctx, c, "leader").unwrap().unwrap();
        assert_eq!(ctx.type_name(slot.ty), "creature*");
        assert_eq!(slot.address, c.address.offset(16));
        assert!(field_storage(ctx, c, "greet").unwrap().is_none());
    });
}

#[test]
fn test_methods_bind_receiver_and_are_read_only() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let Value::Method(BoundMethod { this, .. }) = read_field(ctx, c, "greet").unwrap() else {
            panic!("expected a method");
        };
        assert_eq!(this, Some(c));
        let Value::Method(BoundMethod { this, .. }) = read_field(ctx, c, "spawn").unwrap() else {
            panic!("expected a method");
        };
        assert_eq!(this, None);
        let err = write_field(ctx, c, "greet", &Value::Nil).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    });
}

#[test]
fn test_substruct_table_assign_and_copy() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let a = alloc(ctx, w.creature);
        let b = alloc(ctx, w.creature);
        write_field(ctx, a, "pos", &table(&[("x", Value::Int(1)), ("y", Value::Int(2))])).unwrap();
        write_field(ctx, a, "title", &Value::from("boss")).unwrap();

        assign(ctx, b, &Value::Ref(a)).unwrap();
        write_field(ctx, a, "title", &Value::from("ex-boss")).unwrap();
        assert_eq!(read_field(ctx, b, "title").unwrap(), Value::from("boss"));
        let Value::Ref(pos) = read_field(ctx, b, "pos").unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(read_field(ctx, pos, "y").unwrap(), Value::Int(2));

        let err = assign(ctx, pos, &Value::Ref(a)).unwrap_err();
        assert_eq!(err.category(), "TypeMismatchError");
    });
}

#[test]
fn test_scalar_value_pseudo_field() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let c = alloc(ctx, w.creature);
        let hp = field_storage(ctx, c, "hp").unwrap().unwrap();
        set_index(ctx, hp, &Value::from(VALUE_FIELD), &Value::Int(3)).unwrap();
        assert_eq!(read_field(ctx, c, "hp").unwrap(), Value::Int(3));
        assert_eq!(index(ctx, hp, &Value::from(VALUE_FIELD)).unwrap(), Value::Int(3));
    });
}

#[test]
fn test_virtual_pointer_resolves_subclass() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let k = alloc(ctx, w.kennel);
        let d = alloc(ctx, w.dog);
        write_field(ctx, d, "bark", &Value::Int(3)).unwrap();
        write_field(ctx, k, "pet", &Value::Ref(d)).unwrap();
        let Value::Ref(pet) = read_field(ctx, k, "pet").unwrap() else {
            panic!("expected a reference");
        };
        assert_eq!(pet.ty, w.dog);
        assert_eq!(read_field(ctx, pet, "bark").unwrap(), Value::Int(3));

        // 未注册的虚表地址
        ctx.mem.write_ptr(d.address, Address(0x9999)).unwrap();
        let err = read_field(ctx, k, "pet").unwrap_err();
        assert!(err.to_string().contains("Unknown subclass of animal"));
    });
}

#[test]
fn test_global_fields_resolve_by_symbol() {
    let w = world();
    w.runtime.with_access(|ctx| {
        let g = ObjectRef::new(Address::NULL, w.globals);
        assert_eq!(read_field(ctx, g, "tick").unwrap(), Value::Int(17));
        write_field(ctx, g, "tick", &Value::Int(18)).unwrap();
        assert_eq!(read_field(ctx, g, "tick").unwrap(), Value::Int(18));
    });
}

#[test]
fn test_every_field_mode_has_an_accessor() {
    let w = world();
    let types = w.runtime.types();
    let bindings = w.runtime.bindings();
    let mut seen = HashSet::new();
    for walked in types.walk_fields(w.creature) {
        let accessor =
            build_accessor(types, bindings, walked.owner, walked.index as u32, &walked.field)
                .unwrap();
        assert_eq!(accessor.mode(), walked.field.mode);
        seen.insert(walked.field.mode);
    }
    let expected: HashSet<FieldMode> = FieldMode::ALL
        .iter()
        .copied()
        .filter(|m| *m != FieldMode::End)
        .collect();
    assert_eq!(seen, expected);

    let err = build_accessor(types, bindings, w.creature, 99, &FieldDescriptor::end())
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Access(AccessError::UnhandledMode { .. })));
}
