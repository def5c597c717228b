//! 可观测性：tracing 订阅器
//!
//! 默认 info，RUST_LOG 可覆盖（如 `RUST_LOG=autoapply=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// 未设置 RUST_LOG 时使用 default_directive
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
