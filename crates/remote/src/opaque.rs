//! 请求关联ID（opaque）生成
//!
//! 进程内单调递增、从1开始、永不复用。只有新建请求会取号，
//! 解码收到的消息和构造应答（沿用请求的ID）都不会推进计数器。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

pub trait OpaqueGenerator: Send + Sync {
    fn next_opaque(&self) -> u64;
}

/// 基于原子计数器的生成器
#[derive(Debug)]
pub struct AtomicOpaqueGenerator {
    next: AtomicU64,
}

impl AtomicOpaqueGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// 指定起始值，测试中用来得到确定的ID序列
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for AtomicOpaqueGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl OpaqueGenerator for AtomicOpaqueGenerator {
    fn next_opaque(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

static GLOBAL_GENERATOR: OnceLock<Arc<dyn OpaqueGenerator>> = OnceLock::new();

/// 进程级生成器；首次访问前可通过 [`install_global`] 替换
pub fn global() -> &'static Arc<dyn OpaqueGenerator> {
    GLOBAL_GENERATOR.get_or_init(|| Arc::new(AtomicOpaqueGenerator::new()))
}

/// 安装进程级生成器，只能在首次使用前调用一次；已初始化时返回 `false`
pub fn install_global(generator: Arc<dyn OpaqueGenerator>) -> bool {
    GLOBAL_GENERATOR.set(generator).is_ok()
}

pub fn next_opaque() -> u64 {
    global().next_opaque()
}
