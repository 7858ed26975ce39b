//! 规则文件加载（TOML）
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// 内置规则表（Python 2 → 3），随库一起编译
const BUILTIN_RULES: &str = include_str!("../rules/default.toml");

/// 单条规则的配置（支持 pattern 或 regex 字段）
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    replacement: String,
    /// 覆盖所在组的大小写设置
    #[serde(default)]
    case_insensitive: Option<bool>,
}

/// 规则组配置
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupEntry {
    name: String,
    #[serde(default)]
    case_insensitive: Option<bool>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 顶层规则文件结构
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    markers: Vec<String>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
}

/// 单条改写规则：pattern → replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: String,
    pub replacement: String,
    pub case_insensitive: bool,
}

impl Rule {
    /// 默认大小写不敏感
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self { pattern: pattern.into(), replacement: replacement.into(), case_insensitive: true }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_insensitive = false;
        self
    }
}

/// 一组语义相关的规则（声明顺序无意义，编译时按 pattern 排序）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl RuleGroup {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self { name: name.into(), rules }
    }
}

/// 归一化后的规则配置：有序规则组 + 标注块
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleConfig {
    pub groups: Vec<RuleGroup>,
    pub markers: Vec<String>,
}

impl RuleConfig {
    /// 内置 Python 2 → 3 规则表
    pub fn builtin() -> Result<Self> {
        parse_rule_config(BUILTIN_RULES).context("parse builtin rules")
    }

    /// 从 TOML 规则文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("read rules file {}", path.display()))?;
        parse_rule_config(&txt).with_context(|| format!("parse rules file {}", path.display()))
    }
}

/// 解析 TOML 文本并归一化为 RuleConfig
pub fn parse_rule_config(txt: &str) -> Result<RuleConfig> {
    let parsed: RuleFile = toml::from_str(txt)?;
    let mut groups = Vec::with_capacity(parsed.groups.len());

    for g in parsed.groups {
        let group_ci = g.case_insensitive.unwrap_or(true);
        let mut rules = Vec::with_capacity(g.rules.len());
        for (idx, e) in g.rules.into_iter().enumerate() {
            // 兼容两种字段名：pattern 或 regex
            let pattern = match (e.pattern, e.regex) {
                (Some(p), None) => p,
                (None, Some(r)) => r,
                (Some(_), Some(_)) => bail!("group '{}' rule #{idx}: both `pattern` and `regex` set", g.name),
                (None, None) => bail!("group '{}' rule #{idx}: missing `pattern`", g.name),
            };
            rules.push(Rule {
                pattern,
                replacement: e.replacement,
                case_insensitive: e.case_insensitive.unwrap_or(group_ci),
            });
        }
        groups.push(RuleGroup { name: g.name, rules });
    }

    Ok(RuleConfig { groups, markers: parsed.markers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_groups_keep_declaration_order() {
        let cfg = RuleConfig::builtin().unwrap();
        let names: Vec<_> = cfg.groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["print", "except", "raise", "general", "exec", "lib_modules", "apply"]);
        assert!(cfg.markers.is_empty());
    }

    #[test]
    fn group_flag_applies_unless_rule_overrides() {
        let cfg = parse_rule_config(
            r##"
            markers = ["# noinspection PyUnresolvedReferences"]

            [[groups]]
            name = "kw"
            case_insensitive = false

            [[groups.rules]]
            pattern = "exec"
            replacement = "exec"

            [[groups.rules]]
            regex = "xrange"
            replacement = "range"
            case_insensitive = true
            "##,
        )
        .unwrap();

        let rules = &cfg.groups[0].rules;
        assert!(!rules[0].case_insensitive);
        assert_eq!(rules[1].pattern, "xrange");
        assert!(rules[1].case_insensitive);
        assert_eq!(cfg.markers, ["# noinspection PyUnresolvedReferences"]);
    }

    #[test]
    fn rule_without_pattern_is_rejected() {
        let err = parse_rule_config(
            r#"
            [[groups]]
            name = "g"
            [[groups.rules]]
            replacement = "x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing `pattern`"));
    }

    #[test]
    fn rule_with_both_fields_is_rejected() {
        let res = parse_rule_config(
            r#"
            [[groups]]
            name = "g"
            [[groups.rules]]
            pattern = "a"
            regex = "b"
            replacement = "x"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res = parse_rule_config(
            r#"
            [[groups]]
            name = "g"
            flags = "i"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RuleConfig::load(Path::new("/nonexistent/rules.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read rules file"));
    }
}
