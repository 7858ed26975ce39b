//! 目录转换主流程与并行调度
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::encoding::{self, detect_file, detect_reader, DetectedEncoding};
use crate::engine::{RewriteError, RulePipeline};
use crate::markers::{MarkerPosition, MarkerSet};
use crate::options::ConvertOptions;
use crate::persist::write_atomic;
use crate::report::{ConvertReport, FileRecord, FileReport, FileStatus};
use crate::rules::RuleConfig;

/// 转换器：流水线与标注块只读共享，可跨线程克隆
#[derive(Debug, Clone)]
pub struct Converter {
    pipeline: Arc<RulePipeline>,
    markers: Arc<MarkerSet>,
    fallback: DetectedEncoding,
    opts: ConvertOptions,
}

impl Converter {
    /// 加载并编译规则；任何配置错误都在读取文件之前报出
    pub fn from_options(opts: &ConvertOptions) -> Result<Self> {
        let cfg = match &opts.rules_path {
            Some(path) => RuleConfig::load(path)?,
            None => RuleConfig::builtin()?,
        };
        let pipeline = RulePipeline::compile(&cfg.groups).context("compile rules")?;
        let fallback = DetectedEncoding::for_label(&opts.default_encoding)
            .ok_or_else(|| anyhow!("unknown default encoding '{}'", opts.default_encoding))?;
        Ok(Self::new(pipeline, MarkerSet::new(cfg.markers), fallback, opts.clone()))
    }

    pub fn new(pipeline: RulePipeline, markers: MarkerSet, fallback: DetectedEncoding, opts: ConvertOptions) -> Self {
        Self { pipeline: Arc::new(pipeline), markers: Arc::new(markers), fallback, opts }
    }

    /// 标注插入 + 规则改写（标注只在一侧插入一次）
    pub fn transform(&self, text: &str) -> Result<String, RewriteError> {
        match self.opts.marker_position {
            MarkerPosition::BeforeRules => self.pipeline.apply(&self.markers.apply(text)),
            MarkerPosition::AfterRules => {
                let out = self.pipeline.apply(text)?;
                Ok(self.markers.apply(&out).into_owned())
            }
        }
    }

    /// 处理单个文件；失败不会向外传播，而是记录在报告条目中
    pub fn convert_file(&self, path: &Path) -> FileReport {
        let mut record = None;
        match self.rewrite_file(path, &mut record) {
            Ok(status) => match &record {
                Some(r) => FileReport::done(r, status),
                None => FileReport::failed(path, None, &anyhow!("file was not read")),
            },
            Err(err) => FileReport::failed(path, record.as_ref(), &err),
        }
    }

    fn rewrite_file(&self, path: &Path, record: &mut Option<FileRecord>) -> Result<FileStatus> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let rec = record.insert(self.record_for(path, &bytes)?);

        let decoded = encoding::decode(&bytes, rec.encoding)?;
        let rewritten = self.transform(&decoded.text)?;
        let changed = rewritten != decoded.text;
        if self.opts.dry_run {
            return Ok(if changed { FileStatus::WouldRewrite } else { FileStatus::Unchanged });
        }

        // 无改动的文件原样重新写回
        let out = if changed { encoding::encode(&rewritten, rec.encoding, decoded.bom)? } else { bytes };
        write_atomic(path, &out).with_context(|| format!("write {}", path.display()))?;
        Ok(if changed { FileStatus::Rewritten } else { FileStatus::Unchanged })
    }

    fn record_for(&self, path: &Path, bytes: &[u8]) -> Result<FileRecord> {
        let detected = detect_reader(bytes, self.opts.max_detect_bytes)?;
        let record = match detected {
            Some(encoding) => FileRecord { path: path.to_path_buf(), encoding, fallback: false },
            None => {
                debug!(file = %path.display(), fallback = %self.fallback, "encoding undetermined, using default");
                FileRecord { path: path.to_path_buf(), encoding: self.fallback, fallback: true }
            }
        };
        Ok(record)
    }

    /// 转换目录下所有候选文件
    /// 稳定性保证：文件按路径排序，并行时由收集端按序号重排，报告与进度输出顺序与串行一致
    pub fn run(&self, root: &Path) -> Result<ConvertReport> {
        let files = discover_files(root, &self.opts.extension)?;

        let threads = self.opts.threads.unwrap_or_else(num_cpus::get);
        let report = if threads > 1 && files.len() > 1 {
            self.run_parallel(&files, threads)?
        } else {
            self.run_serial(&files)
        };

        if self.opts.fail_fast {
            if let Some(f) = report.files.iter().find(|f| f.status == FileStatus::Failed) {
                bail!("{}: {}", f.path.display(), f.error.as_deref().unwrap_or("failed"));
            }
        }
        Ok(report)
    }

    fn run_serial(&self, files: &[PathBuf]) -> ConvertReport {
        let mut report = ConvertReport::default();
        let mut aborted = false;
        for path in files {
            let file = if aborted { FileReport::skipped(path) } else { self.convert_file(path) };
            if file.status == FileStatus::Failed && self.opts.fail_fast {
                aborted = true;
            }
            log_progress(&file);
            report.push(file);
        }
        report
    }

    /// 并行调度：
    /// - Rayon 线程池处理文件（读取、探测、改写、写回均在 worker 内完成）
    /// - 当前线程收集结果，按 idx 重排后写入报告
    fn run_parallel(&self, files: &[PathBuf], threads: usize) -> Result<ConvertReport> {
        use crossbeam_channel as channel;
        use rayon::prelude::*;

        type Msg = (usize /*idx*/, FileReport);
        let (tx, rx) = channel::bounded::<Msg>(256);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("build worker pool")?;
        let worker = self.clone();
        let files_vec: Vec<(usize, PathBuf)> = files.iter().cloned().enumerate().collect();

        let scan_thread = std::thread::spawn(move || {
            let abort = AtomicBool::new(false);
            pool.install(|| {
                files_vec.par_iter().for_each_with(tx, |tx, (idx, path)| {
                    let file = if abort.load(Ordering::Relaxed) {
                        FileReport::skipped(path)
                    } else {
                        worker.convert_file(path)
                    };
                    if file.status == FileStatus::Failed && worker.opts.fail_fast {
                        abort.store(true, Ordering::Relaxed);
                    }
                    let _ = tx.send((*idx, file));
                });
            });
            // 结束后 Sender 全部被丢弃，Receiver 将收到关闭信号
        });

        let mut report = ConvertReport::default();
        let mut next_idx: usize = 0;
        let mut buffer: BTreeMap<usize, FileReport> = BTreeMap::new();
        while let Ok((idx, file)) = rx.recv() {
            buffer.insert(idx, file);
            while let Some(file) = buffer.remove(&next_idx) {
                log_progress(&file);
                report.push(file);
                next_idx += 1;
            }
        }

        scan_thread.join().map_err(|_| anyhow!("worker thread panicked"))?;
        Ok(report)
    }
}

fn log_progress(file: &FileReport) {
    let encoding = file.encoding.unwrap_or("-");
    match file.status {
        FileStatus::Failed => warn!(
            file = %file.path.display(),
            encoding,
            error = file.error.as_deref().unwrap_or(""),
            "failed"
        ),
        FileStatus::Skipped => debug!(file = %file.path.display(), "skipped"),
        status => info!(
            file = %file.path.display(),
            encoding,
            fallback = file.fallback_encoding,
            ?status,
            "processed"
        ),
    }
}

/// 递归收集扩展名匹配的文件，按路径排序
pub fn discover_files(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("input directory {} does not exist", root.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(%err, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|e| e == extension) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// 单个文件的探测结果（`detect` 子命令）
#[derive(Debug, Clone)]
pub struct DetectionEntry {
    pub path: PathBuf,
    /// None 表示无法确信
    pub encoding: Option<&'static str>,
    /// 读取失败的原因
    pub error: Option<String>,
}

/// 只探测不改写
pub fn detect_tree(root: &Path, extension: &str, max_detect_bytes: u64) -> Result<Vec<DetectionEntry>> {
    let files = discover_files(root, extension)?;
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let entry = match detect_file(&path, max_detect_bytes) {
            Ok(enc) => {
                let name = enc.map(|e| e.name());
                info!(file = %path.display(), encoding = name.unwrap_or("unknown"), "detected");
                DetectionEntry { path, encoding: name, error: None }
            }
            Err(err) => {
                warn!(file = %path.display(), %err, "cannot read");
                DetectionEntry { path, encoding: None, error: Some(err.to_string()) }
            }
        };
        out.push(entry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::DEFAULT_MAX_DETECT_BYTES;
    use crate::rules::{Rule, RuleGroup};

    fn converter(markers: &[&str], position: MarkerPosition) -> Converter {
        let g = RuleGroup::new("g", vec![Rule::new("print x", "print(x)")]);
        let opts = ConvertOptions { marker_position: position, ..ConvertOptions::default() };
        Converter::new(
            RulePipeline::compile(&[g]).unwrap(),
            MarkerSet::new(markers.iter().map(|m| m.to_string()).collect()),
            DetectedEncoding::utf8(),
            opts,
        )
    }

    #[test]
    fn markers_after_rules_are_not_rewritten() {
        let c = converter(&["# print x"], MarkerPosition::AfterRules);
        assert_eq!(c.transform("print x\n").unwrap(), "# print x\nprint(x)\n");
    }

    #[test]
    fn markers_before_rules_pass_through_pipeline() {
        let c = converter(&["# print x"], MarkerPosition::BeforeRules);
        assert_eq!(c.transform("print x\n").unwrap(), "# print(x)\nprint(x)\n");
    }

    #[test]
    fn discover_filters_by_extension_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg/sub")).unwrap();
        fs::write(dir.path().join("b.py"), "").unwrap();
        fs::write(dir.path().join("pkg/sub/a.py"), "").unwrap();
        fs::write(dir.path().join("pkg/readme.txt"), "").unwrap();
        fs::write(dir.path().join("pkg/c.pyc"), "").unwrap();

        let files = discover_files(dir.path(), "py").unwrap();
        let rel: Vec<_> = files.iter().map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf()).collect();
        assert_eq!(rel, [PathBuf::from("b.py"), PathBuf::from("pkg/sub/a.py")]);
    }

    #[test]
    fn detect_tree_reports_each_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("b.py"), "s = 'é'\n").unwrap();

        let entries = detect_tree(dir.path(), "py", DEFAULT_MAX_DETECT_BYTES).unwrap();
        let got: Vec<_> = entries.iter().map(|e| (e.encoding, e.error.is_some())).collect();
        assert_eq!(got, [(Some("ascii"), false), (Some("UTF-8"), false)]);

        let entries = detect_tree(dir.path(), "py", 2).unwrap();
        assert_eq!(entries[0].encoding, None);
        assert!(entries[0].error.is_none());
    }

    #[test]
    fn discover_rejects_missing_root() {
        assert!(discover_files(Path::new("/nonexistent/modules"), "py").is_err());
    }

    #[test]
    fn undetectable_encoding_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, "print x\n".repeat(10)).unwrap();

        let mut c = converter(&[], MarkerPosition::AfterRules);
        c.opts.max_detect_bytes = 4;
        let report = c.convert_file(&path);
        assert_eq!(report.status, FileStatus::Rewritten);
        assert!(report.fallback_encoding);
        assert_eq!(report.encoding, Some("UTF-8"));
    }
}
