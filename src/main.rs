use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use struct_bridge::config::BridgeConfig;
use struct_bridge::core::logging::initialize_logging;
use struct_bridge::core::Runtime;
use struct_bridge::plugins::{HotReloadManager, LibraryLoader};
use struct_bridge::scripting::{console, Prompt, ScriptBridge};

/// 热重载检查间隔
const RELOAD_POLL: Duration = Duration::from_millis(500);

fn main() {
    if let Err(e) = run() {
        eprintln!("struct-bridge failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BridgeConfig::load_or_default();
    config.apply_env_overrides();
    initialize_logging(&config.logging);

    let directory = config.plugins.directory.clone();
    let runtime = Runtime::builder()
        .loader(Box::new(LibraryLoader::new(&directory)))
        .config(config)
        .build()?;

    for (name, err) in runtime
        .plugins()
        .autoload(&runtime, &runtime.config().plugins.autoload)
    {
        tracing::error!(target: "plugin", "Failed to autoload {}: {}", name, err);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let watcher = if runtime.config().plugins.hot_reload {
        Some(spawn_hot_reload(Arc::clone(&runtime), Arc::clone(&stop))?)
    } else {
        None
    };

    let bridge = ScriptBridge::new(Arc::clone(&runtime))?;
    let console = console::stdio();
    bridge.attach_console(console.clone());
    let mut prompt = Prompt::new(&bridge);
    let state = prompt.run(&*console)?;
    tracing::info!(target: "script", "Prompt finished: {:?}", state);

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = watcher {
        let _ = handle.join();
    }
    drop(bridge);
    runtime.shutdown()?;
    Ok(())
}

fn spawn_hot_reload(
    runtime: Arc<Runtime>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, Box<dyn std::error::Error>> {
    let mut manager = HotReloadManager::new(&runtime.config().plugins.directory)?;
    for name in runtime.plugins().names() {
        manager.track(&runtime, &name);
    }
    let handle = thread::Builder::new()
        .name("hot-reload".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                for name in manager.check_and_reload(&runtime) {
                    manager.track(&runtime, &name);
                }
                thread::sleep(RELOAD_POLL);
            }
        })?;
    Ok(handle)
}
