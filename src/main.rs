use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use queue_throttle::{
    cli::{Cli, Commands},
    config::{self, ThrottleConfig},
    infra::{metrics, MetricsObserver},
    logging, ThrottleContext,
};
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // 不需要日志和存储的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        None => {
            Cli::command().print_help()?;
            return Ok(());
        }
        _ => {}
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    let _log_guard =
        logging::init_logging(&log_level, log_format.as_deref(), log_file.as_deref(), cli.quiet)?;

    let config = ThrottleConfig::load(&cli).context("加载配置失败")?;

    if let Some(Commands::ShowConfig) = &cli.command {
        println!("📊 最终配置（合并后的配置）:");
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if let Some(command) = &cli.command {
        if command.needs_shared_store() && config.redis.is_none() {
            anyhow::bail!(
                "该命令需要连接共享的 Redis（通过 [redis] 配置、REDIS_URL 或 --redis-url 指定）"
            );
        }
    }

    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        match metrics::init_with_listener(addr) {
            Ok(()) => tracing::info!("📈 Prometheus 指标已启用: http://{}/metrics", addr),
            Err(e) => tracing::warn!("⚠️ 指标初始化失败: {}", e),
        }
    }

    let context = match ThrottleContext::builder(config)
        .observer(Arc::new(MetricsObserver))
        .build()
        .await
    {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("❌ 限流上下文初始化失败: {}", e);
            tracing::error!("💡 请检查 Redis 连接和 [jobs] 配置后重试");
            process::exit(1);
        }
    };

    let result = run_command(&cli, &context).await;
    context.shutdown().await;
    result
}

async fn run_command(cli: &Cli, context: &ThrottleContext) -> Result<()> {
    match &cli.command {
        Some(Commands::Pause { queue }) => {
            context.pause(queue).await.context("暂停队列失败")?;
            println!("⏸️ 队列已暂停: {}", queue);
        }
        Some(Commands::Resume { queue }) => {
            context.resume(queue).await.context("恢复队列失败")?;
            println!("▶️ 队列已恢复: {}", queue);
        }
        Some(Commands::Paused) => {
            context
                .pauser()
                .sync()
                .await
                .context("读取暂停队列失败")?;
            let queues = context.paused_queues();
            if queues.is_empty() {
                println!("没有暂停的队列");
            } else {
                for queue in queues {
                    println!("{}", queue);
                }
            }
        }
        Some(Commands::Status { class, args }) => {
            let args: Vec<serde_json::Value> = match args {
                Some(raw) => serde_json::from_str(raw).context("--args 必须是 JSON 数组")?,
                None => Vec::new(),
            };
            match context.status(class, &args).await.context("查询限流状态失败")? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => println!("任务类 {} 未配置限流", class),
            }
        }
        Some(Commands::Watch) => watch(context).await?,
        _ => {}
    }
    Ok(())
}

/// 持续输出暂停队列的变化，直到 Ctrl+C
async fn watch(context: &ThrottleContext) -> Result<()> {
    context.start().await;
    println!("👀 正在监听暂停队列变化（Ctrl+C 退出）");

    let mut last: BTreeSet<String> = BTreeSet::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let current: BTreeSet<String> = context.paused_queues().into_iter().collect();
                for queue in current.difference(&last) {
                    println!("⏸️ {}", queue);
                }
                for queue in last.difference(&current) {
                    println!("▶️ {}", queue);
                }
                last = current;
            }
        }
    }
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let default_config = r#"# queue-throttle 配置文件
# 此文件由 queue-throttle generate-config 生成

[redis]
url = "redis://127.0.0.1:6379"
pool_size = 16
min_idle = 2
connection_timeout_secs = 5
idle_timeout_secs = 300
command_timeout_ms = 500

[throttle]
key_prefix = "throttled"
concurrency_ttl_secs = 900

[pause]
topic = "throttled:pause"
sync_interval_secs = 30
reconnect_backoff_min_ms = 100
reconnect_backoff_max_ms = 5000

[fetch]
# 连续 N 个任务被限流后，该队列暂时不参与取出（0 = 关闭）
cooldown_threshold = 0
cooldown_period_ms = 1000

[logging]
level = "info"
format = "compact"
# file = "./logs/throttle.log"

[metrics]
enabled = false
port = 9090

# 每个任务类一段
[jobs.ReportJob.concurrency]
limit = 2

[jobs.NotifyJob.threshold]
limit = 3
period_secs = 60

# key_args: 按第 0 个参数分别限流
[jobs.SyncTenantJob]
key_args = [0]
concurrency = { limit = 1 }
threshold = { limit = 10, period_secs = 1 }
"#;

    fs::write(path, default_config).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = ThrottleConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!(
        "  - Redis: {}",
        config.redis.as_ref().map(|r| r.url.as_str()).unwrap_or("(进程内存储)")
    );
    println!("  - Key Prefix: {}", config.throttle.key_prefix);
    println!("  - Pause Topic: {}", config.pause.topic);
    let mut classes: Vec<&String> = config.jobs.keys().collect();
    classes.sort();
    println!("  - Jobs ({}): {:?}", classes.len(), classes);

    Ok(())
}
