#![allow(dead_code)]

pub mod test_cluster;
pub mod test_statemachine;

use tracing_subscriber::EnvFilter;

/// 安装日志输出（RUST_LOG 控制级别），重复调用无副作用
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
