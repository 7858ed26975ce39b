//! 文件级标注块（如 IDE inspection 注释）
use std::borrow::Cow;

/// 何时插入标注块：规则改写之前或之后（每个文件只插入一次）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerPosition {
    BeforeRules,
    #[default]
    AfterRules,
}

/// 有序的标注块集合；按子串包含判断是否已存在
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerSet {
    blocks: Vec<String>,
}

impl MarkerSet {
    pub fn new(blocks: Vec<String>) -> Self {
        Self { blocks }
    }

    /// 任一标注块已出现在内容中则不插入；空集合从不插入
    pub fn should_insert(&self, content: &str) -> bool {
        !self.blocks.is_empty() && !self.blocks.iter().any(|b| content.contains(b.as_str()))
    }

    pub fn with_markers_prepended(&self, content: &str) -> String {
        format!("{}\n{}", self.blocks.join("\n"), content)
    }

    /// 按需插入；未插入时借用原文
    pub fn apply<'a>(&self, content: &'a str) -> Cow<'a, str> {
        if self.should_insert(content) {
            Cow::Owned(self.with_markers_prepended(content))
        } else {
            Cow::Borrowed(content)
        }
    }
}
