//! 源码方言迁移库（默认规则：Python 2 → 3）
//!
//! 设计要点：
//! - 规则按“组”组织；组严格按声明顺序执行，前一组的输出是后一组的输入。
//! - 组内规则按 pattern 文本字典序执行，与声明顺序无关，保证输出可复现。
//! - 非法 pattern 在构建流水线时即报错，不会在改写阶段静默失效。
//! - 文件编码先探测（可提前结束），严格解码，改写后以同一编码写回；写回走临时文件 + rename。
//! - 单个文件失败只影响该文件（除非开启 fail-fast）。

mod convert;
mod encoding;
mod engine;
mod markers;
mod options;
mod persist;
mod report;
mod rules;

pub use convert::{detect_tree, discover_files, Converter, DetectionEntry};
pub use encoding::{
    decode, detect_file, detect_reader, encode, CodecError, Decoded, DetectedEncoding, EncodingDetector,
    DEFAULT_MAX_DETECT_BYTES, UTF8_CONFIDENT_CHARS,
};
pub use engine::{apply, CompiledGroup, CompiledRule, RewriteError, RuleCompileError, RulePipeline};
pub use markers::{MarkerPosition, MarkerSet};
pub use options::{ConvertOptions, ConvertStats};
pub use report::{ConvertReport, FileRecord, FileReport, FileStatus};
pub use rules::{parse_rule_config, Rule, RuleConfig, RuleGroup};
