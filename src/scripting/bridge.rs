//! 脚本桥
//!
//! [`ScriptBridge`] 拥有一个 Lua 状态，并向其中注册 `host` 命名空间：
//!
//! - `host.types.<name>`、`host.globals`: 类型句柄与全局对象
//! - `host.sizeof/new/delete/assign/cast/is_instance/displace`
//! - `host.error`、`host.safecall`、`host.onerror`
//! - `host.interpreter`、`host.lineedit`、`host.is_interactive`、`host.printerr`、`host.with_suspend`
//! - `host.persistent.get/save/delete/get_all`
//! - `host.timeout`、`host.timeout_active`
//! - `host.run_command`、`host.plugins.<plugin>.<function>`、`host.on_event`
//!
//! 每次运行都在挂起锁下进行，并登记为一次可中断的运行。中断只能由宿主
//! 发起（[`InterruptFlag::request`](crate::core::interrupt::InterruptFlag::request)），
//! 脚本看不到中断接口。

use super::proxy::{self, from_lua, raise, runtime, to_lua, values, with_ctx, RefProxy, TypeHandle};
use super::console::{self, SharedConsole};
use super::hook;
use super::safecall;
use crate::access::{self, ObjectRef, Value};
use crate::core::error::AccessError;
use crate::core::error_chain::ErrorChain;
use crate::core::runtime::Runtime;
use crate::core::scheduler::{Cadence, TimerId, TimerQueue};
use crate::fields;
use crate::memory::Address;
use crate::plugins::{PluginNotification, StateChange};
use crate::scripting::persistent::{PersistentEntry, PERSISTENT_INTS};
use crate::types::{TypeId, TypeShape};
use crossbeam_channel::Receiver;
use mlua::{
    Error as LuaError, Function, Lua, LuaOptions, MetaMethod, MultiValue, Result as LuaResult,
    StdLib, Table, UserData, UserDataMethods, Value as LuaValue, Variadic,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

type Timers = Rc<RefCell<TimerQueue<Function>>>;
type Listeners = Rc<RefCell<HashMap<(String, String), Vec<Function>>>>;

/// 脚本运行时与宿主之间的桥
pub struct ScriptBridge {
    lua: Lua,
    runtime: Arc<Runtime>,
    timers: Timers,
    listeners: Listeners,
    notifications: Receiver<PluginNotification>,
}

impl ScriptBridge {
    pub fn new(runtime: Arc<Runtime>) -> Result<Self, ErrorChain> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .map_err(|e| ErrorChain::from_lua(&e))?;
        let bridge = Self {
            lua,
            notifications: runtime.plugins().subscribe(),
            runtime,
            timers: Rc::new(RefCell::new(TimerQueue::new())),
            listeners: Rc::new(RefCell::new(HashMap::new())),
        };
        bridge
            .install()
            .map_err(|e| ErrorChain::from_lua(&e).rehome("Failed to set up scripting bridge"))?;
        tracing::info!(
            target: "script",
            "Scripting bridge ready ({} types, interrupt check every {} instructions)",
            bridge.runtime.types().len(),
            bridge.runtime.config().scripting.interrupt_interval
        );
        Ok(bridge)
    }

    fn install(&self) -> LuaResult<()> {
        let lua = &self.lua;
        lua.set_app_data(Arc::clone(&self.runtime));
        proxy::install(lua)?;

        let host = lua.create_table()?;
        install_types(lua, &host, &self.runtime)?;
        install_object_ops(lua, &host)?;
        install_persistent(lua, &host)?;
        install_timers(lua, &host, Rc::clone(&self.timers))?;
        install_plugins(lua, &host, Rc::clone(&self.listeners))?;
        safecall::install(lua, &host)?;
        console::install(lua, &host)?;
        lua.globals().set("host", host)?;

        hook::install(lua, &self.runtime);
        hook::patch_library(lua, &self.runtime)?;
        Ok(())
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// 挂上控制台，脚本进入交互模式
    pub fn attach_console(&self, console: SharedConsole) {
        self.lua.set_app_data(console);
    }

    /// 在挂起锁下执行一次可中断的运行
    pub fn run<R>(&self, f: impl FnOnce(&Lua) -> LuaResult<R>) -> Result<R, ErrorChain> {
        run_guarded(&self.lua, &self.runtime, f)
    }

    /// 执行一段脚本
    pub fn exec(&self, source: &str, chunk: &str) -> Result<(), ErrorChain> {
        self.run(|lua| lua.load(source).set_name(chunk).exec())
    }

    /// 求值一段脚本，结果转为宿主值
    pub fn eval(&self, source: &str, chunk: &str) -> Result<Vec<Value>, ErrorChain> {
        self.run(|lua| {
            let results: MultiValue = lua.load(source).set_name(chunk).eval()?;
            values(lua, &results.into_iter().collect::<Vec<_>>())
        })
    }

    /// 执行脚本文件
    pub fn exec_file(&self, path: &Path) -> Result<(), ErrorChain> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ErrorChain::from_error(&e).rehome(format!("Cannot read {}", path.display()))
        })?;
        self.exec(&source, &format!("@{}", path.display()))
    }

    /// 调用全局函数
    pub fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, ErrorChain> {
        self.run(|lua| {
            let f: Function = lua.globals().get(function)?;
            let args = args
                .iter()
                .cloned()
                .map(|a| to_lua(lua, a))
                .collect::<LuaResult<Vec<_>>>()?;
            let results: MultiValue = f.call(MultiValue::from_vec(args))?;
            values(lua, &results.into_iter().collect::<Vec<_>>())
        })
    }

    pub fn set_global(&self, name: &str, value: Value) -> Result<(), ErrorChain> {
        self.run(|lua| lua.globals().set(name, to_lua(lua, value)?))
    }

    // ========================================================================
    // 定时器与事件
    // ========================================================================

    /// 推进一个节奏单位并执行到期的回调，返回执行的个数
    ///
    /// 单个回调出错只记录日志，不影响其余回调。
    pub fn advance(&self, cadence: Cadence) -> usize {
        let due = self.timers.borrow_mut().advance(cadence);
        let mut fired = 0;
        for (id, callback) in due {
            match self.run(|_| callback.call::<()>(())) {
                Ok(()) => fired += 1,
                Err(err) => {
                    tracing::error!(target: "script", "Timer {} failed: {}", id.0, err);
                }
            }
        }
        fired
    }

    /// 每帧调用：帧定时器、插件事件、插件更新
    pub fn frame(&self) -> usize {
        let fired = self.advance(Cadence::Frames);
        self.dispatch_events();
        self.runtime.plugins().update_all(&self.runtime);
        fired
    }

    /// 模拟每推进一步调用
    pub fn tick(&self) -> usize {
        self.advance(Cadence::Ticks)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().pending_count()
    }

    /// 宿主模拟状态变化；模拟卸载时取消全部按模拟步计时的回调
    pub fn state_change(&self, change: StateChange) {
        if change == StateChange::SimulationUnloaded {
            let cancelled = self.timers.borrow_mut().cancel_simulation();
            if !cancelled.is_empty() {
                tracing::debug!(
                    target: "script",
                    "Cancelled {} tick timers on simulation unload",
                    cancelled.len()
                );
            }
        }
        self.runtime
            .plugins()
            .broadcast_state_change(&self.runtime, change);
    }

    /// 把插件发出的事件交给脚本监听者，返回成功投递的次数
    pub fn dispatch_events(&self) -> usize {
        let events = self.runtime.plugins().drain_events();
        let mut delivered = 0;
        for event in events {
            let key = (event.plugin.clone(), event.name.clone());
            let listeners = self
                .listeners
                .borrow()
                .get(&key)
                .cloned()
                .unwrap_or_default();
            for listener in listeners {
                let result = self.run(|lua| {
                    let args = event
                        .args
                        .iter()
                        .cloned()
                        .map(|a| to_lua(lua, a))
                        .collect::<LuaResult<Vec<_>>>()?;
                    listener.call::<()>(MultiValue::from_vec(args))
                });
                match result {
                    Ok(()) => delivered += 1,
                    Err(err) => tracing::error!(
                        target: "script",
                        "Listener for {}.{} failed: {}",
                        event.plugin,
                        event.name,
                        err
                    ),
                }
            }
        }
        delivered
    }

    /// 取出自上次调用以来的插件通知
    pub fn poll_notifications(&self) -> Vec<PluginNotification> {
        let notifications: Vec<PluginNotification> = self.notifications.try_iter().collect();
        for notification in &notifications {
            tracing::debug!(target: "script", "Plugin notification: {:?}", notification);
        }
        notifications
    }
}

// ============================================================================
// host 命名空间
// ============================================================================

pub(crate) fn run_guarded<R>(
    lua: &Lua,
    runtime: &Runtime,
    f: impl FnOnce(&Lua) -> LuaResult<R>,
) -> Result<R, ErrorChain> {
    let _held = runtime.suspend().lock();
    let _running = runtime.interrupt().enter_run();
    f(lua).map_err(|e| {
        let chain = ErrorChain::from_lua(&e);
        if chain.is_interrupted() && runtime.interrupt().is_pending() {
            tracing::info!(target: "script", "Guest execution interrupted");
        }
        chain
    })
}

fn install_types(lua: &Lua, host: &Table, runtime: &Runtime) -> LuaResult<()> {
    let types = lua.create_table()?;
    let mut global_type = None;
    for (name, id) in runtime.types().names() {
        if matches!(runtime.types().get(id).shape, TypeShape::Global(_)) {
            global_type.get_or_insert(id);
        }
        types.set(name, lua.create_userdata(TypeHandle(id))?)?;
    }
    host.set("types", types)?;
    // 全局对象的字段按名字解析地址，引用本身不需要地址
    if let Some(id) = global_type {
        host.set(
            "globals",
            lua.create_userdata(RefProxy(ObjectRef::new(Address::NULL, id)))?,
        )?;
    }
    Ok(())
}

/// 类型参数：类型句柄或引用
fn type_arg(value: &Value) -> Result<TypeId, AccessError> {
    match value {
        Value::Type(ty) => Ok(*ty),
        Value::Ref(r) => Ok(r.ty),
        _ => Err(AccessError::Expected("type or reference")),
    }
}

fn install_object_ops(lua: &Lua, host: &Table) -> LuaResult<()> {
    host.set(
        "sizeof",
        lua.create_function(|lua, value: LuaValue| {
            let value = from_lua(lua, &value)?;
            let (size, address) = with_ctx(lua, |ctx| proxy::sizeof(ctx, &value))?;
            Ok((to_lua(lua, size)?, to_lua(lua, address)?))
        })?,
    )?;

    host.set(
        "new",
        lua.create_function(|lua, value: LuaValue| {
            let value = from_lua(lua, &value)?;
            let created = with_ctx(lua, |ctx| proxy::new_object(ctx, &value))?;
            to_lua(lua, Value::Ref(created))
        })?,
    )?;

    host.set(
        "delete",
        lua.create_function(|lua, value: LuaValue| {
            let value = from_lua(lua, &value)?;
            with_ctx(lua, |ctx| proxy::delete_object(ctx, &value))
        })?,
    )?;

    host.set(
        "assign",
        lua.create_function(|lua, (dst, src): (LuaValue, LuaValue)| {
            let dst = from_lua(lua, &dst)?;
            let src = from_lua(lua, &src)?;
            with_ctx(lua, |ctx| {
                let dst = access::get(ctx.types, &dst, None, false)?;
                fields::assign(ctx, dst, &src)
            })
        })?,
    )?;

    host.set(
        "cast",
        lua.create_function(|lua, (ty, value): (LuaValue, LuaValue)| {
            let ty = type_arg(&from_lua(lua, &ty)?).map_err(raise)?;
            let value = from_lua(lua, &value)?;
            let cast = with_ctx(lua, |ctx| access::cast(ctx.types, ty, &value))?;
            to_lua(lua, cast.map_or(Value::Nil, Value::Ref))
        })?,
    )?;

    host.set(
        "is_instance",
        lua.create_function(|lua, (value, ty): (LuaValue, LuaValue)| {
            let value = from_lua(lua, &value)?;
            let ty = type_arg(&from_lua(lua, &ty)?).map_err(raise)?;
            with_ctx(lua, |ctx| Ok(access::is_instance(ctx, &value, ty)))
        })?,
    )?;

    host.set(
        "displace",
        lua.create_function(
            |lua, (value, index, stride): (LuaValue, i64, Option<usize>)| {
                let value = from_lua(lua, &value)?;
                let moved = with_ctx(lua, |ctx| {
                    let reference = access::get(ctx.types, &value, None, false)?;
                    access::displace(ctx.types, reference, index, stride)
                })?;
                to_lua(lua, Value::Ref(moved))
            },
        )?,
    )?;
    Ok(())
}

fn entry_table(lua: &Lua, entry: &PersistentEntry) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.set("entry_id", entry.entry_id)?;
    table.set("key", entry.key.as_str())?;
    table.set("value", entry.value.as_str())?;
    table.set("ints", lua.create_sequence_from(entry.ints.iter().copied())?)?;
    Ok(table)
}

fn install_persistent(lua: &Lua, host: &Table) -> LuaResult<()> {
    let persistent = lua.create_table()?;

    persistent.set(
        "get",
        lua.create_function(|lua, key: String| {
            let runtime = runtime(lua)?;
            let store = runtime.persistent();
            let entry = store.get(&key).map(|e| entry_table(lua, e)).transpose()?;
            Ok(entry)
        })?,
    )?;

    persistent.set(
        "get_all",
        lua.create_function(|lua, prefix: Option<String>| {
            let runtime = runtime(lua)?;
            let store = runtime.persistent();
            let entries = store
                .get_all(prefix.as_deref())
                .into_iter()
                .map(|e| entry_table(lua, e))
                .collect::<LuaResult<Vec<_>>>()?;
            lua.create_sequence_from(entries)
        })?,
    )?;

    persistent.set(
        "save",
        lua.create_function(|lua, entry: Table| {
            let key: String = entry.get("key")?;
            let value: Option<String> = entry.get("value")?;
            let mut ints = [None; PERSISTENT_INTS];
            if let Some(given) = entry.get::<Option<Table>>("ints")? {
                for (i, slot) in ints.iter_mut().enumerate() {
                    *slot = given.get::<Option<i32>>(i + 1)?;
                }
            }
            let runtime = runtime(lua)?;
            let mut store = runtime.persistent();
            let entry = store.save_entry(&key, value.as_deref().unwrap_or_default(), &ints);
            entry_table(lua, entry)
        })?,
    )?;

    persistent.set(
        "delete",
        lua.create_function(|lua, key: String| {
            let runtime = runtime(lua)?;
            let removed = runtime.persistent().delete(&key);
            Ok(removed)
        })?,
    )?;

    host.set("persistent", persistent)
}

fn install_timers(lua: &Lua, host: &Table, timers: Timers) -> LuaResult<()> {
    let schedule = Rc::clone(&timers);
    host.set(
        "timeout",
        lua.create_function(move |_, (delay, cadence, callback): (u64, String, Function)| {
            let cadence = Cadence::parse(&cadence).ok_or_else(|| {
                LuaError::RuntimeError(format!("unknown timer cadence: {}", cadence))
            })?;
            let id = schedule.borrow_mut().schedule(delay, cadence, callback);
            Ok(id.0)
        })?,
    )?;

    // timeout_active(id) 返回等待中的回调；显式传入 nil 时取消
    host.set(
        "timeout_active",
        lua.create_function(move |_, (id, rest): (u64, Variadic<LuaValue>)| {
            let mut timers = timers.borrow_mut();
            let id = TimerId(id);
            let current = timers.payload(id).cloned();
            if matches!(rest.first(), Some(LuaValue::Nil)) {
                timers.cancel(id);
            }
            Ok(current)
        })?,
    )?;
    Ok(())
}

/// `host.plugins`
struct PluginDirectory;

impl UserData for PluginDirectory {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |_, _, plugin: String| {
            Ok(PluginNamespace(plugin))
        });
    }
}

/// `host.plugins.<plugin>`
struct PluginNamespace(String);

impl UserData for PluginNamespace {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, function: String| {
            let Some(binding) = runtime(lua)?.plugins().binding(&this.0, &function) else {
                return Ok(LuaValue::Nil);
            };
            let call = lua.create_function(move |lua, args: Variadic<LuaValue>| {
                let runtime = runtime(lua)?;
                let args = values(lua, &args)?;
                let result = binding.call(&runtime, &args).map_err(raise)?;
                to_lua(lua, result)
            })?;
            Ok(LuaValue::Function(call))
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let runtime = runtime(lua)?;
            let status = runtime
                .plugins()
                .status(&this.0)
                .unwrap_or_else(|| "unknown".to_string());
            Ok(format!("<plugin {}: {}>", this.0, status))
        });
    }
}

fn install_plugins(lua: &Lua, host: &Table, listeners: Listeners) -> LuaResult<()> {
    host.set("plugins", PluginDirectory)?;

    host.set(
        "run_command",
        lua.create_function(|lua, (command, args): (String, Variadic<LuaValue>)| {
            let runtime = runtime(lua)?;
            let args = values(lua, &args)?;
            let result = runtime
                .plugins()
                .run_command(&runtime, &command, &args)
                .map_err(raise)?;
            to_lua(lua, result)
        })?,
    )?;

    host.set(
        "on_event",
        lua.create_function(
            move |_, (plugin, event, listener): (String, String, Function)| {
                listeners
                    .borrow_mut()
                    .entry((plugin, event))
                    .or_default()
                    .push(listener);
                Ok(())
            },
        )?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor, PrimitiveKind, StructIdentity, TypeRegistry};

    fn bridge() -> ScriptBridge {
        let mut b = TypeRegistry::builder();
        let i32_t = b.primitive(PrimitiveKind::I32);
        b.add(
            "creature",
            TypeShape::Struct(StructIdentity::new(
                8,
                vec![
                    FieldDescriptor::primitive("hp", 0, i32_t),
                    FieldDescriptor::primitive("mood", 4, i32_t),
                ],
            )),
        );
        let runtime = Runtime::builder().types(b.build().unwrap()).build().unwrap();
        ScriptBridge::new(runtime).unwrap()
    }

    #[test]
    fn test_host_types_and_objects() {
        let bridge = bridge();
        let result = bridge
            .eval(
                r#"
                local c = host.new(host.types.creature)
                c.hp = 42
                local copy = host.new(c)
                local same = host.is_instance(copy, host.types.creature)
                local size = host.sizeof(c)
                host.delete(c)
                return copy.hp, same, size
                "#,
                "=test",
            )
            .unwrap();
        assert_eq!(result, vec![Value::Int(42), Value::Bool(true), Value::Int(8)]);
    }

    #[test]
    fn test_write_error_is_structured() {
        let bridge = bridge();
        let err = bridge
            .exec("local c = host.new(host.types.creature); c.hp = 'lots'", "=test")
            .unwrap_err();
        assert!(err.has_category("AccessError"));
        assert!(err
            .frames()
            .iter()
            .any(|f| f.message == "Cannot write field creature.hp: integer expected."));
    }

    #[test]
    fn test_timers_by_cadence() {
        let bridge = bridge();
        bridge
            .exec(
                r#"
                fired = {}
                host.timeout(1, "frames", function() fired[#fired + 1] = "frame" end)
                host.timeout(1, "ticks", function() fired[#fired + 1] = "tick" end)
                cancelled = host.timeout(5, "frames", function() fired[#fired + 1] = "late" end)
                host.timeout_active(cancelled, nil)
                "#,
                "=test",
            )
            .unwrap();
        assert_eq!(bridge.pending_timers(), 2);
        assert_eq!(bridge.tick(), 1);
        assert_eq!(bridge.advance(Cadence::Frames), 1);
        let fired = bridge.eval("return table.concat(fired, ',')", "=test").unwrap();
        assert_eq!(fired, vec![Value::from("tick,frame")]);
    }

    #[test]
    fn test_simulation_unload_cancels_tick_timers() {
        let bridge = bridge();
        bridge
            .exec(
                r#"
                host.timeout(3, "ticks", function() end)
                host.timeout(3, "frames", function() end)
                "#,
                "=test",
            )
            .unwrap();
        bridge.state_change(StateChange::SimulationUnloaded);
        assert_eq!(bridge.pending_timers(), 1);
    }

    #[test]
    fn test_persistent_store() {
        let bridge = bridge();
        let result = bridge
            .eval(
                r#"
                local saved = host.persistent.save{ key = "alert/level", value = "high", ints = { 3 } }
                local again = host.persistent.get("alert/level")
                local all = host.persistent.get_all("alert/")
                local removed = host.persistent.delete("alert/level")
                return saved.entry_id == again.entry_id, again.ints[1], again.ints[2], #all, removed
                "#,
                "=test",
            )
            .unwrap();
        assert_eq!(
            result,
            vec![
                Value::Bool(true),
                Value::Int(3),
                Value::Int(-1),
                Value::Int(1),
                Value::Bool(true)
            ]
        );
    }

    #[test]
    fn test_interrupt_is_not_visible_to_guest() {
        let bridge = bridge();
        let result = bridge.eval("return host.interrupt", "=test").unwrap();
        assert_eq!(result, vec![Value::Nil]);
    }
}
