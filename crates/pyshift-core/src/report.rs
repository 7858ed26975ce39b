//! 单文件处理结果与运行报告
use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::encoding::DetectedEncoding;
use crate::options::ConvertStats;

/// 处理中的文件：路径 + 探测（或回退）得到的编码，用完即弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub encoding: DetectedEncoding,
    /// 探测未能确信，使用了默认编码
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Rewritten,
    /// dry-run 下会被改写
    WouldRewrite,
    /// 规则未改动内容（非 dry-run 时仍原样写回）
    Unchanged,
    Failed,
    /// fail-fast 中止后未处理
    Skipped,
}

/// 报告中的单个文件条目
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fallback_encoding: bool,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReport {
    pub(crate) fn done(record: &FileRecord, status: FileStatus) -> Self {
        Self {
            path: record.path.clone(),
            encoding: Some(record.encoding.name()),
            fallback_encoding: record.fallback,
            status,
            error: None,
        }
    }

    pub(crate) fn failed(path: &Path, encoding: Option<&FileRecord>, err: &anyhow::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            encoding: encoding.map(|r| r.encoding.name()),
            fallback_encoding: encoding.is_some_and(|r| r.fallback),
            status: FileStatus::Failed,
            error: Some(format!("{err:#}")),
        }
    }

    pub(crate) fn skipped(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            encoding: None,
            fallback_encoding: false,
            status: FileStatus::Skipped,
            error: None,
        }
    }
}

/// 整次运行的报告；files 按路径排序
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvertReport {
    pub stats: ConvertStats,
    pub files: Vec<FileReport>,
}

impl ConvertReport {
    pub(crate) fn push(&mut self, file: FileReport) {
        self.stats.files_seen += 1;
        match file.status {
            FileStatus::Rewritten | FileStatus::WouldRewrite => self.stats.files_rewritten += 1,
            FileStatus::Unchanged => self.stats.files_unchanged += 1,
            FileStatus::Failed => self.stats.files_failed += 1,
            FileStatus::Skipped => self.stats.files_skipped += 1,
        }
        self.files.push(file);
    }

    pub fn has_failures(&self) -> bool {
        self.stats.files_failed > 0
    }

    /// 以 JSON 写出报告
    pub fn write_json(&self, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)?;
        writeln!(out)?;
        Ok(())
    }
}
