//! 规则引擎：编译规则组，并按“组顺序 → 组内 pattern 字典序”改写文本
//!
//! 匹配后端有两种：
//! - `regex`：线性时间，优先使用
//! - `fancy-regex`：仅当 pattern 需要 lookaround / 反向引用时回退使用
use std::borrow::Cow;

use thiserror::Error;
use tracing::{debug, trace};

use crate::rules::{Rule, RuleConfig, RuleGroup};

/// 规则编译错误（构建流水线时即报出，不会延迟到改写阶段）
#[derive(Debug, Error)]
pub enum RuleCompileError {
    #[error("group '{group}' has invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        group: String,
        pattern: String,
        #[source]
        source: fancy_regex::Error,
    },

    #[error("group '{group}' declares pattern '{pattern}' more than once")]
    DuplicatePattern { group: String, pattern: String },

    #[error("group '{group}' pattern '{pattern}': replacement references unknown capture group '{reference}'")]
    UnknownGroupReference {
        group: String,
        pattern: String,
        reference: String,
    },
}

/// 改写阶段的运行时错误（回溯引擎超出限制等）
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("group '{group}' pattern '{pattern}' failed while matching: {source}")]
    Backtrack {
        group: String,
        pattern: String,
        #[source]
        source: fancy_regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Matcher {
    Plain(regex::Regex),
    Fancy(fancy_regex::Regex),
}

impl Matcher {
    fn compile(pattern: &str, case_insensitive: bool) -> Result<Self, fancy_regex::Error> {
        match regex::RegexBuilder::new(pattern).case_insensitive(case_insensitive).build() {
            Ok(rx) => Ok(Self::Plain(rx)),
            Err(_) => {
                let rx = fancy_regex::RegexBuilder::new(pattern)
                    .case_insensitive(case_insensitive)
                    .build()?;
                debug!(pattern, "pattern needs backtracking engine");
                Ok(Self::Fancy(rx))
            }
        }
    }

    /// 捕获组数量（含第 0 组）
    fn captures_len(&self) -> usize {
        match self {
            Self::Plain(rx) => rx.captures_len(),
            Self::Fancy(rx) => rx.captures_len(),
        }
    }

    fn has_group_named(&self, name: &str) -> bool {
        match self {
            Self::Plain(rx) => rx.capture_names().flatten().any(|n| n == name),
            Self::Fancy(rx) => rx.capture_names().flatten().any(|n| n == name),
        }
    }

    /// 全局替换；无命中时返回 Borrowed
    fn replace_all<'t>(&self, text: &'t str, replacement: &str) -> Result<Cow<'t, str>, fancy_regex::Error> {
        match self {
            Self::Plain(rx) => Ok(rx.replace_all(text, replacement)),
            Self::Fancy(rx) => rx.try_replacen(text, 0, replacement),
        }
    }
}

/// 编译后的单条规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

impl CompiledRule {
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// 是否由回溯引擎执行
    pub fn is_backtracking(&self) -> bool {
        matches!(self.matcher, Matcher::Fancy(_))
    }
}

/// 编译后的规则组，rules 已按 pattern 文本排序
#[derive(Debug, Clone)]
pub struct CompiledGroup {
    name: String,
    rules: Vec<CompiledRule>,
}

impl CompiledGroup {
    fn compile(group: &RuleGroup) -> Result<Self, RuleCompileError> {
        let mut sorted: Vec<&Rule> = group.rules.iter().collect();
        sorted.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        if let Some(dup) = sorted.windows(2).find(|w| w[0].pattern == w[1].pattern) {
            return Err(RuleCompileError::DuplicatePattern {
                group: group.name.clone(),
                pattern: dup[0].pattern.clone(),
            });
        }

        let mut rules = Vec::with_capacity(sorted.len());
        for r in sorted {
            let matcher = Matcher::compile(&r.pattern, r.case_insensitive).map_err(|e| {
                RuleCompileError::InvalidPattern {
                    group: group.name.clone(),
                    pattern: r.pattern.clone(),
                    source: e,
                }
            })?;
            for reference in replacement_refs(&r.replacement) {
                let known = match reference.parse::<usize>() {
                    Ok(idx) => idx < matcher.captures_len(),
                    Err(_) => matcher.has_group_named(reference),
                };
                if !known {
                    return Err(RuleCompileError::UnknownGroupReference {
                        group: group.name.clone(),
                        pattern: r.pattern.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
            rules.push(CompiledRule { rule: r.clone(), matcher });
        }

        Ok(Self { name: group.name.clone(), rules })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// 组内逐条规则改写；每条规则的输入是上一条的输出
    pub fn apply(&self, text: &str) -> Result<String, RewriteError> {
        let mut current = text.to_string();
        for r in &self.rules {
            let replaced = r.matcher.replace_all(&current, &r.rule.replacement).map_err(|e| {
                RewriteError::Backtrack {
                    group: self.name.clone(),
                    pattern: r.rule.pattern.clone(),
                    source: e,
                }
            })?;
            if let Cow::Owned(next) = replaced {
                trace!(group = %self.name, pattern = %r.rule.pattern, "rule rewrote text");
                current = next;
            }
        }
        Ok(current)
    }
}

/// 规则流水线：严格按组顺序执行，每组只执行一遍（不做不动点迭代）
#[derive(Debug, Clone, Default)]
pub struct RulePipeline {
    groups: Vec<CompiledGroup>,
}

impl RulePipeline {
    /// 编译全部规则组；任一 pattern 非法即整体失败
    pub fn compile(groups: &[RuleGroup]) -> Result<Self, RuleCompileError> {
        let groups = groups.iter().map(CompiledGroup::compile).collect::<Result<Vec<_>, _>>()?;
        debug!(
            groups = groups.len(),
            rules = groups.iter().map(|g| g.rules.len()).sum::<usize>(),
            "rule pipeline compiled"
        );
        Ok(Self { groups })
    }

    /// 内置 Python 2 → 3 流水线
    pub fn builtin() -> anyhow::Result<Self> {
        let cfg = RuleConfig::builtin()?;
        Ok(Self::compile(&cfg.groups)?)
    }

    pub fn groups(&self) -> &[CompiledGroup] {
        &self.groups
    }

    pub fn apply(&self, text: &str) -> Result<String, RewriteError> {
        let mut current = text.to_string();
        for g in &self.groups {
            current = g.apply(&current)?;
        }
        Ok(current)
    }
}

/// 对文本执行整条流水线
pub fn apply(pipeline: &RulePipeline, text: &str) -> Result<String, RewriteError> {
    pipeline.apply(text)
}

/// 提取替换串中的捕获组引用（`$1` / `${1}` / `$name` / `${name}`；`$$` 为字面量）
fn replacement_refs(replacement: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = replacement;
    while let Some(i) = rest.find('$') {
        rest = &rest[i + 1..];
        if let Some(tail) = rest.strip_prefix('$') {
            rest = tail;
            continue;
        }
        if let Some(tail) = rest.strip_prefix('{') {
            if let Some(end) = tail.find('}') {
                if end > 0 {
                    refs.push(&tail[..end]);
                }
                rest = &tail[end + 1..];
            }
            continue;
        }
        let len = rest.bytes().take_while(|b| b.is_ascii_alphanumeric() || *b == b'_').count();
        if len > 0 {
            refs.push(&rest[..len]);
            rest = &rest[len..];
        }
    }
    refs
}
