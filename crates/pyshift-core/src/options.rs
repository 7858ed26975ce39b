//! 转换选项与统计信息（模块）
use std::path::PathBuf;

use crate::encoding::DEFAULT_MAX_DETECT_BYTES;
use crate::markers::MarkerPosition;

/// 转换选项
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// 源文件扩展名（不含点），默认 py
    pub extension: String,
    /// 规则文件路径（TOML）；为空则使用内置规则表
    pub rules_path: Option<PathBuf>,
    /// 探测失败时使用的编码标签
    pub default_encoding: String,
    /// 编码探测最多读取的字节数
    pub max_detect_bytes: u64,
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    /// 只报告，不写回
    pub dry_run: bool,
    /// 遇到第一个失败文件即停止
    pub fail_fast: bool,
    /// 标注块插入时机
    pub marker_position: MarkerPosition,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            extension: "py".to_string(),
            rules_path: None,
            default_encoding: "utf-8".to_string(),
            max_detect_bytes: DEFAULT_MAX_DETECT_BYTES,
            threads: None,
            dry_run: false,
            fail_fast: false,
            marker_position: MarkerPosition::default(),
        }
    }
}

/// 转换统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConvertStats {
    pub files_seen: usize,
    pub files_rewritten: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
}
