//! 核心宏定义
//!
//! 提供统一的宏来减少代码重复

/// 为结构体实现Default trait的宏
///
/// 使用示例:
/// ```rust
/// use struct_bridge::impl_default;
///
/// struct MyStruct {
///     field1: u32,
///     field2: String,
/// }
///
/// impl_default!(MyStruct {
///     field1: 0,
///     field2: String::new(),
/// });
/// ```
#[macro_export]
macro_rules! impl_default {
    ($struct_name:ident {
        $($field:ident: $value:expr),* $(,)?
    }) => {
        impl Default for $struct_name {
            fn default() -> Self {
                Self {
                    $($field: $value),*
                }
            }
        }
    };
}

/// 导出插件库的入口函数
///
/// 生成名为 `struct_bridge_plugin_create` 的 C ABI 函数，返回
/// `Box::into_raw` 得到的插件实例指针，由 [`LibraryLoader`](crate::plugins::LibraryLoader)
/// 收回所有权。
///
/// 使用示例:
/// ```ignore
/// struct Hello;
///
/// impl PluginModule for Hello { /* ... */ }
///
/// struct_bridge::declare_plugin!(Hello);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($constructor:expr) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn struct_bridge_plugin_create(
        ) -> *mut ::std::boxed::Box<dyn $crate::plugins::PluginModule> {
            let module: ::std::boxed::Box<dyn $crate::plugins::PluginModule> =
                ::std::boxed::Box::new($constructor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(module))
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::plugins::{PluginExports, PluginModule};

    struct TestStruct {
        field1: u32,
        field2: String,
    }

    impl_default!(TestStruct {
        field1: 7,
        field2: String::from("seven"),
    });

    #[test]
    fn test_impl_default() {
        let s = TestStruct::default();
        assert_eq!(s.field1, 7);
        assert_eq!(s.field2, "seven");
    }

    struct Sensor;

    impl PluginModule for Sensor {
        fn name(&self) -> &str {
            "sensor"
        }

        fn exports(&self) -> PluginExports {
            PluginExports::new()
        }
    }

    mod entry {
        use super::Sensor;

        declare_plugin!(Sensor);
    }

    #[test]
    fn test_declare_plugin_round_trips_ownership() {
        let raw = entry::struct_bridge_plugin_create();
        assert!(!raw.is_null());
        // SAFETY: 指针来自上面的 `Box::into_raw`
        let module = unsafe { *Box::from_raw(raw) };
        assert_eq!(module.name(), "sensor");
    }
}
