//! 端到端：脚本读写宿主结构体

use anyhow::Result;
use std::io::Cursor;
use std::sync::Arc;
use struct_bridge::access::Value;
use struct_bridge::binding::BindingKey;
use struct_bridge::core::{Runtime, Verbosity};
use struct_bridge::scripting::{Prompt, PromptState, ScriptBridge};
use struct_bridge::types::{
    FieldDescriptor, PrimitiveKind, StructIdentity, TypeId, TypeRegistry, TypeShape,
};

/// creature { hp: int32_t @0 }
fn runtime() -> (Arc<Runtime>, TypeId) {
    let mut b = TypeRegistry::builder();
    let i32_t = b.primitive(PrimitiveKind::I32);
    let creature = b.add(
        "creature",
        TypeShape::Struct(StructIdentity::new(
            4,
            vec![FieldDescriptor::primitive("hp", 0, i32_t)],
        )),
    );
    let runtime = Runtime::builder()
        .types(b.build().expect("valid schema"))
        .build()
        .expect("runtime");
    (runtime, creature)
}

#[test]
fn test_write_read_and_binding_reuse() -> Result<()> {
    let (runtime, creature) = runtime();
    let bridge = ScriptBridge::new(Arc::clone(&runtime))?;

    let values = bridge.eval(
        r#"
        unit = host.new(host.types.creature)
        unit.hp = 42
        return unit.hp
        "#,
        "=scenario",
    )?;
    assert_eq!(values, vec![Value::Int(42)]);

    let first = runtime
        .bindings()
        .cached(BindingKey::Type(creature))
        .expect("binding built on first access");
    let builds = runtime.bindings().build_count();

    let err = bridge.exec("unit.hp = 'lots'", "=scenario").unwrap_err();
    assert!(err.has_category("AccessError"));
    assert!(err.render(Verbosity::Verbose).contains("integer expected"));

    // 写入失败不改变原值
    assert_eq!(bridge.eval("return unit.hp", "=scenario")?, vec![Value::Int(42)]);

    let second = runtime
        .bindings()
        .cached(BindingKey::Type(creature))
        .expect("binding still cached");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runtime.bindings().build_count(), builds);
    Ok(())
}

#[test]
fn test_safecall_surfaces_structured_error() -> Result<()> {
    let (runtime, _) = runtime();
    let bridge = ScriptBridge::new(runtime)?;
    let values = bridge.eval(
        r#"
        local unit = host.new(host.types.creature)
        local ok, err = host.safecall(function() unit.hp = {} end)
        return ok, err.category
        "#,
        "=scenario",
    )?;
    assert_eq!(values, vec![Value::Bool(false), Value::from("AccessError")]);
    Ok(())
}

#[test]
fn test_console_session() -> Result<()> {
    let (runtime, _) = runtime();
    let bridge = ScriptBridge::new(runtime)?;
    let mut prompt = Prompt::new(&bridge);
    let input = Cursor::new(
        "unit = host.new(host.types.creature)\nunit.hp = 'x'\nunit.hp = 7\n=unit.hp\nquit\n",
    );
    let mut output = Vec::new();
    let state = prompt.run_console(input, &mut output)?;
    assert_eq!(state, PromptState::Done);

    let text = String::from_utf8(output)?;
    assert!(text.contains("integer expected"));
    assert!(text.contains("7\n"));
    Ok(())
}
