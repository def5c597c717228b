//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOAPPLY__*` 覆盖（双下划线表示嵌套，如 `AUTOAPPLY__RECOVERY__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::health::HealthThresholds;
use crate::core::recovery::RecoveryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub router: RouterSection,
    pub queue: QueueSection,
    pub recovery: RecoverySection,
    pub health: HealthSection,
    pub worker: WorkerSection,
    pub gateway: GatewaySection,
}

/// [app] 段：应用名、后端地址、支持的平台
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// startApplying 未带 apiHost 时写入会话上下文的默认值
    #[serde(default)]
    pub api_host: String,
    /// 允许启动会话的平台，为空表示所有已注册平台；还需在 PlatformAdapterFactory 中注册
    #[serde(default = "default_supported_platforms")]
    pub supported_platforms: Vec<String>,
}

fn default_supported_platforms() -> Vec<String> {
    vec![
        "linkedin".into(),
        "indeed".into(),
        "glassdoor".into(),
        "ziprecruiter".into(),
        "wellfound".into(),
    ]
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            api_host: String::new(),
            supported_platforms: default_supported_platforms(),
        }
    }
}

/// [router] 段：请求与端口超时
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// worker 等待控制端回复的上限
    #[serde(default = "default_port_reply_timeout_secs")]
    pub port_reply_timeout_secs: u64,
    /// 通知广播容量
    #[serde(default = "default_port_buffer")]
    pub port_buffer: usize,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_port_reply_timeout_secs() -> u64 {
    15
}

fn default_port_buffer() -> usize {
    64
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            port_reply_timeout_secs: default_port_reply_timeout_secs(),
            port_buffer: default_port_buffer(),
        }
    }
}

/// [queue] 段
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// 剩余职位少于该值时翻页
    #[serde(default = "default_buffer_threshold")]
    pub buffer_threshold: usize,
    /// 连续空页上限，超过视为职位耗尽
    #[serde(default = "default_max_empty_pages")]
    pub max_empty_pages: u32,
}

fn default_buffer_threshold() -> usize {
    crate::queue::DEFAULT_BUFFER_THRESHOLD
}

fn default_max_empty_pages() -> u32 {
    crate::queue::DEFAULT_MAX_EMPTY_PAGES
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            buffer_threshold: default_buffer_threshold(),
            max_empty_pages: default_max_empty_pages(),
        }
    }
}

/// [recovery] 段：重试次数与各类延时（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_network_base_ms")]
    pub network_base_ms: u64,
    #[serde(default = "default_network_step_ms")]
    pub network_step_ms: u64,
    #[serde(default = "default_element_ms")]
    pub element_ms: u64,
    #[serde(default = "default_form_ms")]
    pub form_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_unknown_ms")]
    pub unknown_ms: u64,
    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,
    #[serde(default = "default_element_timeout_secs")]
    pub element_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_network_base_ms() -> u64 {
    1000
}

fn default_network_step_ms() -> u64 {
    2000
}

fn default_element_ms() -> u64 {
    2000
}

fn default_form_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_unknown_ms() -> u64 {
    1500
}

fn default_page_load_timeout_secs() -> u64 {
    30
}

fn default_element_timeout_secs() -> u64 {
    10
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            network_base_ms: default_network_base_ms(),
            network_step_ms: default_network_step_ms(),
            element_ms: default_element_ms(),
            form_ms: default_form_ms(),
            timeout_ms: default_timeout_ms(),
            unknown_ms: default_unknown_ms(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
            element_timeout_secs: default_element_timeout_secs(),
        }
    }
}

impl RecoverySection {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: self.max_retries,
            network_base_delay: Duration::from_millis(self.network_base_ms),
            network_step_delay: Duration::from_millis(self.network_step_ms),
            element_delay: Duration::from_millis(self.element_ms),
            form_delay: Duration::from_millis(self.form_ms),
            timeout_delay: Duration::from_millis(self.timeout_ms),
            unknown_delay: Duration::from_millis(self.unknown_ms),
            page_load_timeout: Duration::from_secs(self.page_load_timeout_secs),
            element_timeout: Duration::from_secs(self.element_timeout_secs),
        }
    }
}

/// [health] 段
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    /// 检查周期（毫秒）
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_error_rate_warning")]
    pub error_rate_warning: f64,
    #[serde(default = "default_response_time_warning_ms")]
    pub response_time_warning_ms: u64,
    #[serde(default = "default_memory_critical_ratio")]
    pub memory_critical_ratio: f64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_error_rate_warning() -> f64 {
    0.3
}

fn default_response_time_warning_ms() -> u64 {
    10_000
}

fn default_memory_critical_ratio() -> f64 {
    0.9
}

fn default_history_size() -> usize {
    24
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            error_rate_warning: default_error_rate_warning(),
            response_time_warning_ms: default_response_time_warning_ms(),
            memory_critical_ratio: default_memory_critical_ratio(),
            history_size: default_history_size(),
        }
    }
}

impl HealthSection {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            error_rate_warning: self.error_rate_warning,
            response_time_warning: Duration::from_millis(self.response_time_warning_ms),
            memory_critical_ratio: self.memory_critical_ratio,
            history_size: self.history_size,
            ..HealthThresholds::default()
        }
    }
}

/// [worker] 段
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// 单次 apply 的上限，超时按 timeout 类错误处理
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
}

fn default_apply_timeout_secs() -> u64 {
    180
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            apply_timeout_secs: default_apply_timeout_secs(),
        }
    }
}

/// [gateway] 段：WebSocket 控制面
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_max_connections() -> usize {
    64
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_connections: default_max_connections(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AUTOAPPLY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOAPPLY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOAPPLY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
