//! 插件在有在途调用时卸载和重新加载

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use struct_bridge::access::Value;
use struct_bridge::core::{BridgeError, Runtime};
use struct_bridge::plugins::{PluginExports, PluginModule, StaticLoader};
use struct_bridge::scripting::ScriptBridge;

const CALLERS: usize = 4;

/// 每次调用先报到，再等放行
struct Gate {
    started: Sender<()>,
    release: Receiver<()>,
}

impl PluginModule for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn exports(&self) -> PluginExports {
        let started = self.started.clone();
        let release = self.release.clone();
        PluginExports::new()
            .function("pass", move |_, args| {
                let _ = started.send(());
                let _ = release.recv();
                Ok(args.first().cloned().unwrap_or_default())
            })
            .function("ping", |_, _| Ok(Value::from("pong")))
    }
}

struct Fixture {
    runtime: Arc<Runtime>,
    started: Receiver<()>,
    release: Sender<()>,
}

fn fixture() -> Fixture {
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let loader = StaticLoader::new().with("gate", move || {
        Box::new(Gate {
            started: started_tx.clone(),
            release: release_rx.clone(),
        })
    });
    let runtime = Runtime::builder()
        .loader(Box::new(loader))
        .build()
        .expect("runtime");
    runtime.plugins().load(&runtime, "gate").expect("load gate");
    Fixture {
        runtime,
        started: started_rx,
        release: release_tx,
    }
}

#[test]
fn test_unload_waits_for_inflight_calls() -> Result<()> {
    let f = fixture();
    let pass = f.runtime.plugins().binding("gate", "pass").expect("binding");

    let callers: Vec<_> = (0..CALLERS)
        .map(|i| {
            let runtime = Arc::clone(&f.runtime);
            let pass = Arc::clone(&pass);
            thread::spawn(move || pass.call(&runtime, &[Value::Int(i as i64)]))
        })
        .collect();
    for _ in 0..CALLERS {
        f.started.recv_timeout(Duration::from_secs(5))?;
    }

    let (done_tx, done_rx) = unbounded();
    let unloader = {
        let runtime = Arc::clone(&f.runtime);
        thread::spawn(move || {
            let result = runtime.plugins().unload(&runtime, "gate");
            let _ = done_tx.send(());
            result
        })
    };

    // 在途调用未结束前卸载不能完成
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!f.runtime.plugins().is_loaded("gate"));

    for _ in 0..CALLERS {
        f.release.send(())?;
    }
    let mut results: Vec<i64> = callers
        .into_iter()
        .map(|h| {
            h.join()
                .expect("caller thread")
                .expect("in-flight call completes")
                .as_int()
                .expect("integer")
        })
        .collect();
    results.sort();
    assert_eq!(results, vec![0, 1, 2, 3]);

    unloader.join().expect("unloader thread")?;
    assert!(matches!(
        pass.call(&f.runtime, &[]),
        Err(BridgeError::Unloaded(_))
    ));

    f.runtime.plugins().load(&f.runtime, "gate")?;
    f.release.send(())?;
    assert_eq!(pass.call(&f.runtime, &[Value::Int(9)])?, Value::Int(9));
    Ok(())
}

#[test]
fn test_script_reference_outlives_unload() -> Result<()> {
    let f = fixture();
    let bridge = ScriptBridge::new(Arc::clone(&f.runtime))?;
    assert_eq!(
        bridge.eval("ping = host.plugins.gate.ping return ping()", "=plugins")?,
        vec![Value::from("pong")]
    );

    f.runtime.plugins().unload(&f.runtime, "gate")?;
    let err = bridge.exec("ping()", "=plugins").unwrap_err();
    assert!(err.has_category("UnloadedError"));
    assert!(err.message().contains("gate.ping"));

    f.runtime.plugins().reload(&f.runtime, "gate")?;
    assert_eq!(bridge.eval("return ping()", "=plugins")?, vec![Value::from("pong")]);
    Ok(())
}
