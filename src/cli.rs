use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// queue-throttle - 分布式后台任务队列的准入控制
#[derive(Parser, Debug, Default)]
#[command(name = "queue-throttle")]
#[command(version)]
#[command(about = "任务限流与队列暂停管理工具", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串")]
    pub redis_url: Option<String>,

    /// 限流键前缀
    #[arg(long, value_name = "PREFIX", help = "存储键前缀")]
    pub key_prefix: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径（按天滚动）")]
    pub log_file: Option<String>,

    /// 启用监控指标
    #[arg(long, help = "启用 Prometheus 监控指标")]
    pub enable_metrics: bool,

    /// 监控端口
    #[arg(long, value_name = "PORT", help = "监控指标服务端口")]
    pub metrics_port: Option<u16>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（只输出错误）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 暂停队列（所有进程停止从该队列取任务）
    Pause {
        #[arg(value_name = "QUEUE")]
        queue: String,
    },
    /// 恢复队列
    Resume {
        #[arg(value_name = "QUEUE")]
        queue: String,
    },
    /// 列出暂停中的队列
    Paused,
    /// 查看任务类的限流状态
    Status {
        /// 任务类名
        #[arg(value_name = "CLASS")]
        class: String,
        /// 任务参数（JSON 数组），用于计算带后缀的限流键
        #[arg(long, value_name = "JSON")]
        args: Option<String>,
    },
    /// 持续输出暂停队列的变化（Ctrl+C 退出）
    Watch,
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "throttle.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "throttle.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
}

impl Commands {
    /// 是否作用于集群共享状态（必须连接 Redis，进程内存储上执行没有意义）
    pub fn needs_shared_store(&self) -> bool {
        matches!(
            self,
            Commands::Pause { .. }
                | Commands::Resume { .. }
                | Commands::Paused
                | Commands::Status { .. }
                | Commands::Watch
        )
    }
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}
