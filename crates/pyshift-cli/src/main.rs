use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pyshift_core::{
    detect_tree, Converter, ConvertOptions, MarkerPosition, RuleConfig, RulePipeline, DEFAULT_MAX_DETECT_BYTES,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{error, info};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "pyshift", version, about = "按规则表原地迁移源码方言（默认 Python 2 → 3）")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 原地改写目录下的源文件
    Convert {
        /// 输入目录
        #[arg(long, default_value = "modules")]
        input: PathBuf,

        /// 源文件扩展名（不含点）
        #[arg(long, default_value = "py")]
        ext: String,

        /// 规则文件路径（TOML），默认使用内置规则表
        #[arg(long)]
        rules: Option<PathBuf>,

        /// 线程数（"auto"=CPU 核心数；1 为串行）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 编码无法确定时使用的编码
        #[arg(long, default_value = "utf-8")]
        default_encoding: String,

        /// 编码探测最多读取的字节数
        #[arg(long, default_value_t = DEFAULT_MAX_DETECT_BYTES)]
        max_detect_bytes: u64,

        /// 只报告，不写回
        #[arg(long)]
        dry_run: bool,

        /// 同 --dry-run，且有文件需要改写时以非零状态退出
        #[arg(long)]
        check: bool,

        /// 遇到第一个失败文件即停止
        #[arg(long)]
        fail_fast: bool,

        /// 在规则改写之前插入标注块（默认在之后）
        #[arg(long)]
        markers_before_rules: bool,

        /// 将 JSON 报告写到该文件
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// 只探测并打印文件编码
    Detect {
        #[arg(long, default_value = "modules")]
        input: PathBuf,

        #[arg(long, default_value = "py")]
        ext: String,

        #[arg(long, default_value_t = DEFAULT_MAX_DETECT_BYTES)]
        max_detect_bytes: u64,
    },

    /// 按实际执行顺序列出规则
    Rules {
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            ext,
            rules,
            threads,
            default_encoding,
            max_detect_bytes,
            dry_run,
            check,
            fail_fast,
            markers_before_rules,
            report,
        } => {
            info!(?input, ?rules, "starting conversion");

            let opts = ConvertOptions {
                extension: ext,
                rules_path: rules,
                default_encoding,
                max_detect_bytes,
                threads: parse_threads(&threads),
                dry_run: dry_run || check,
                fail_fast,
                marker_position: if markers_before_rules {
                    MarkerPosition::BeforeRules
                } else {
                    MarkerPosition::AfterRules
                },
            };
            // 规则在处理任何文件之前编译
            let converter = Converter::from_options(&opts).context("load rules")?;
            let result = converter.run(&input).context("conversion failed")?;

            if let Some(path) = report {
                let mut out = BufWriter::new(File::create(&path).context("create report file")?);
                result.write_json(&mut out)?;
                out.flush().context("write report file")?;
            }

            let s = result.stats;
            info!(
                files = s.files_seen,
                rewritten = s.files_rewritten,
                unchanged = s.files_unchanged,
                failed = s.files_failed,
                dry_run = opts.dry_run,
                "conversion finished"
            );

            if result.has_failures() {
                error!(failed = s.files_failed, "some files could not be converted");
                bail!("{} file(s) failed", s.files_failed);
            }
            if check && s.files_rewritten > 0 {
                bail!("{} file(s) would be rewritten", s.files_rewritten);
            }
        }
        Commands::Detect { input, ext, max_detect_bytes } => {
            let entries = detect_tree(&input, &ext, max_detect_bytes)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for e in &entries {
                match (&e.encoding, &e.error) {
                    (Some(enc), _) => writeln!(out, "{}\t{enc}", e.path.display())?,
                    (None, Some(err)) => writeln!(out, "{}\terror: {err}", e.path.display())?,
                    (None, None) => writeln!(out, "{}\tunknown", e.path.display())?,
                }
            }
            if entries.iter().any(|e| e.error.is_some()) {
                bail!("some files could not be read");
            }
        }
        Commands::Rules { rules } => {
            let cfg = match rules {
                Some(path) => RuleConfig::load(&path)?,
                None => RuleConfig::builtin()?,
            };
            let pipeline = RulePipeline::compile(&cfg.groups)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for (i, g) in pipeline.groups().iter().enumerate() {
                writeln!(out, "[{}] {}", i + 1, g.name())?;
                for r in g.rules() {
                    let rule = r.rule();
                    let flag = if rule.case_insensitive { "i" } else { "-" };
                    writeln!(out, "    {flag} {}  =>  {}", rule.pattern, rule.replacement)?;
                }
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
