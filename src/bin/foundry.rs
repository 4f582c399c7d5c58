//! Foundry 主程序 - 配置驱动运行
//!
//! 通过YAML配置文件启动框架，演示线程池、跨线程事件与ECS调度

use foundry::{
    config::{generate_default_config_file, ConfigManager, FoundryConfig},
    logging::init_logging,
    AsyncTask, AsyncThread, EcsScheduler, Event, FoundryError, PluginManager, Result,
    ServiceProvider, System, SystemTick, ThreadPool,
};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "foundry_config.yaml";

/// 程序入口点
#[tokio::main]
async fn main() {
    // 运行主逻辑并处理错误
    if let Err(e) = run_main().await {
        tracing::error!("❌ Foundry failed: {}", e);
        std::process::exit(1);
    }
}

/// 主要逻辑函数
async fn run_main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        1 => run_with_config(ConfigManager::new_default()).await,
        2 => match args[1].as_str() {
            "init" => generate_config_file().await,
            "-h" | "--help" | "help" => {
                print_usage();
                Ok(())
            }
            path => run_with_config_file(path).await,
        },
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// 使用配置文件运行
async fn run_with_config_file(config_path: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        eprintln!("配置文件不存在: {}", config_path);
        eprintln!("使用 'foundry init' 生成默认配置文件");
        return Ok(());
    }

    let config_manager = ConfigManager::load_from_file(config_path).await?;
    run_with_config(config_manager).await
}

async fn run_with_config(config_manager: ConfigManager) -> Result<()> {
    let config = config_manager.get_config().clone();
    init_logging(&config.logging);
    config_manager.validate()?;

    tracing::info!("🚀 Starting {} v{}", config.framework.name, config.framework.version);

    let pool = ThreadPool::from_config(&config.thread_pool);
    let (future, _) = pool.run(|| (1..=100u64).sum::<u64>())?;
    let sum = future.await?;
    tracing::info!("🧮 Thread pool computed sum = {}", sum);

    // 异步任务循环会阻塞当前线程，放到阻塞线程池中运行
    tokio::task::spawn_blocking(move || run_task_demo(&config))
        .await
        .map_err(|e| FoundryError::internal(&format!("Demo thread panicked: {}", e)))??;

    let metrics = pool.metrics();
    tracing::info!(
        "📊 Pool metrics: submitted={}, completed={}, peak_threads={}",
        metrics.tasks_submitted,
        metrics.tasks_completed,
        metrics.peak_threads
    );
    pool.stop();

    tracing::info!("🎉 Foundry finished");
    Ok(())
}

struct Heartbeat;

impl System for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn update(&mut self, tick: &SystemTick) {
        if tick.frame % 10 == 0 {
            tracing::debug!(frame = tick.frame, elapsed = ?tick.elapsed, "💓 Heartbeat");
        }
    }
}

fn run_task_demo(config: &FoundryConfig) -> Result<()> {
    let main_task = AsyncTask::with_config("main", config.async_task.clone());
    let services = Arc::new(ServiceProvider::new());
    services.register_async_task(Arc::clone(&main_task))?;
    let plugins = PluginManager::new(Arc::clone(&services));
    tracing::info!("🔌 Plugins loaded: {}", plugins.load_plugins()?);

    // 工作线程订阅问候事件，收到后把回复投递回主任务
    let greetings: Event<String> = Event::new();
    let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
    let events = greetings.handle();
    let reply_to = Arc::clone(&main_task);
    let worker = AsyncThread::spawn("worker", move |_| {
        if let Some(subscription) = events.subscribe(move |message: &String| {
            let message = message.clone();
            tracing::info!("📨 Worker received: {}", message);
            reply_to.post(move || tracing::info!("📬 Main task got reply to: {}", message));
        }) {
            subscription.detach();
        }
        let _ = ready_tx.send(());
    })?;
    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| FoundryError::internal("Worker thread did not start"))?;

    greetings.trigger("hello from main".to_string());

    let scheduler = EcsScheduler::from_config(Arc::clone(&main_task), &config.ecs);
    scheduler.add_system(Heartbeat)?;
    scheduler.start()?;
    main_task.run_for(Duration::from_millis(250))?;
    tracing::info!("🎞️  ECS frames published: {}", scheduler.frame());

    scheduler.stop();
    worker.stop();
    plugins.unload_plugins()?;
    main_task.halt();
    Ok(())
}

/// 生成默认配置文件
async fn generate_config_file() -> Result<()> {
    generate_default_config_file(DEFAULT_CONFIG_PATH).await?;
    println!("已生成默认配置文件: {}", DEFAULT_CONFIG_PATH);
    println!("请编辑配置文件后运行: foundry {}", DEFAULT_CONFIG_PATH);
    Ok(())
}

/// 打印使用说明
fn print_usage() {
    println!("Foundry 应用基础框架");
    println!();
    println!("用法:");
    println!("  foundry                    # 使用默认配置运行");
    println!("  foundry init               # 生成默认配置文件");
    println!("  foundry <config_file>      # 使用指定配置文件运行");
    println!();
    println!("配置文件格式: YAML");
}
