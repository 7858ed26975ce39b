//! 编码探测与严格编解码
//!
//! 探测器逐行喂入 `chardetng`，在以下情形提前结束（不必读完整个文件）：
//! - 流开头出现 BOM（UTF-8 / UTF-16LE / UTF-16BE）
//! - 已见到足够多的多字节 UTF-8 字符且没有任何非法序列
//!
//! 超过字节预算仍无法确定时返回 `None`，由调用方回退到配置的默认编码。
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// 默认探测字节预算
pub const DEFAULT_MAX_DETECT_BYTES: u64 = 1024 * 1024; // 1 MiB
/// 见到这么多合法的多字节 UTF-8 字符即认为“足够确信”
pub const UTF8_CONFIDENT_CHARS: usize = 6;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// 探测得到的编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEncoding {
    label: &'static str,
    encoding: &'static Encoding,
}

impl DetectedEncoding {
    /// 纯 ASCII（经 UTF-8 解码，写回时拒绝非 ASCII 字符）
    pub fn ascii() -> Self {
        Self { label: "ascii", encoding: UTF_8 }
    }

    pub fn utf8() -> Self {
        Self::from_encoding(UTF_8)
    }

    pub fn from_encoding(encoding: &'static Encoding) -> Self {
        Self { label: encoding.name(), encoding }
    }

    /// 按 WHATWG 标签解析；`ascii` / `us-ascii` 单独处理（WHATWG 将其映射为 windows-1252）
    pub fn for_label(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.eq_ignore_ascii_case("ascii") || label.eq_ignore_ascii_case("us-ascii") {
            return Some(Self::ascii());
        }
        Encoding::for_label_no_replacement(label.as_bytes()).map(Self::from_encoding)
    }

    pub fn name(&self) -> &'static str {
        self.label
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn is_ascii(&self) -> bool {
        self.label == "ascii"
    }
}

impl fmt::Display for DetectedEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

/// 增量编码探测器
pub struct EncodingDetector {
    inner: chardetng::EncodingDetector,
    max_bytes: u64,
    bytes_seen: u64,
    non_ascii: bool,
    utf8_valid: bool,
    utf8_multibyte: usize,
    /// 跨块的不完整 UTF-8 尾部
    utf8_carry: Vec<u8>,
    confident: Option<DetectedEncoding>,
}

impl EncodingDetector {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: chardetng::EncodingDetector::new(),
            max_bytes,
            bytes_seen: 0,
            non_ascii: false,
            utf8_valid: true,
            utf8_multibyte: 0,
            utf8_carry: Vec::new(),
            confident: None,
        }
    }

    /// 剩余可读取的字节数
    pub fn remaining(&self) -> u64 {
        self.max_bytes.saturating_sub(self.bytes_seen)
    }

    /// 已足够确信（之后的 feed 不再改变结果）
    pub fn is_done(&self) -> bool {
        self.confident.is_some()
    }

    /// 喂入一段字节；返回 true 表示调用方应停止读取（已确信或预算耗尽）
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.is_done() {
            return true;
        }
        if self.bytes_seen == 0 {
            if let Some((enc, _)) = Encoding::for_bom(chunk) {
                self.confident = Some(DetectedEncoding::from_encoding(enc));
                return true;
            }
        }
        self.bytes_seen = self.bytes_seen.saturating_add(chunk.len() as u64);

        if self.inner.feed(chunk, false) {
            self.non_ascii = true;
        }
        if self.utf8_valid && !chunk.is_ascii() {
            self.track_utf8(chunk);
        }
        if self.utf8_valid && self.utf8_multibyte >= UTF8_CONFIDENT_CHARS {
            self.confident = Some(DetectedEncoding::utf8());
            return true;
        }
        self.bytes_seen >= self.max_bytes
    }

    fn track_utf8(&mut self, chunk: &[u8]) {
        let mut buf = std::mem::take(&mut self.utf8_carry);
        buf.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&buf) {
            Ok(s) => s,
            Err(e) if e.error_len().is_none() => {
                // 末尾是被截断的多字节序列，留到下一块再判定
                let (head, tail) = buf.split_at(e.valid_up_to());
                self.utf8_carry = tail.to_vec();
                // valid_up_to 之前保证是合法 UTF-8
                std::str::from_utf8(head).unwrap_or_default()
            }
            Err(_) => {
                self.utf8_valid = false;
                return;
            }
        };
        self.utf8_multibyte += valid.chars().filter(|c| !c.is_ascii()).count();
    }

    /// 结束探测并给出结果；None 表示无法确信
    pub fn close(mut self) -> Option<DetectedEncoding> {
        if let Some(enc) = self.confident {
            return Some(enc);
        }
        let exhausted = self.bytes_seen >= self.max_bytes;
        if !exhausted {
            self.inner.feed(&[], true);
            if !self.utf8_carry.is_empty() {
                self.utf8_valid = false;
            }
        }
        if !self.non_ascii {
            // 预算内全是 ASCII：只有读到流末尾才能断定
            return if exhausted { None } else { Some(DetectedEncoding::ascii()) };
        }
        if self.utf8_valid && !exhausted {
            return Some(DetectedEncoding::utf8());
        }
        match self.inner.guess_assess(None, self.utf8_valid) {
            (enc, true) => Some(DetectedEncoding::from_encoding(enc)),
            (_, false) => None,
        }
    }
}

/// 逐行读取并探测；确信后立即停止读取
pub fn detect_reader<R: BufRead>(mut reader: R, max_bytes: u64) -> io::Result<Option<DetectedEncoding>> {
    let mut detector = EncodingDetector::new(max_bytes);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut reader).take(detector.remaining()).read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        if detector.feed(&line) {
            break;
        }
    }
    Ok(detector.close())
}

/// 探测文件编码；文件句柄在返回前关闭
pub fn detect_file(path: &Path, max_bytes: u64) -> io::Result<Option<DetectedEncoding>> {
    let file = File::open(path)?;
    detect_reader(BufReader::new(file), max_bytes)
}

/// 编解码错误
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("content is not valid {encoding}")]
    Malformed { encoding: &'static str },

    #[error("text contains characters not representable in {encoding}")]
    Unmappable { encoding: &'static str },

    #[error("encoding {encoding} cannot be written")]
    Unsupported { encoding: &'static str },
}

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// 原文件是否带 BOM（写回时保持）
    pub bom: bool,
}

/// 严格解码：任何非法字节都报错，不做 U+FFFD 替换
pub fn decode(bytes: &[u8], enc: DetectedEncoding) -> Result<Decoded, CodecError> {
    let (body, bom) = match Encoding::for_bom(bytes) {
        Some((bom_enc, len)) if bom_enc == enc.encoding() => (&bytes[len..], true),
        _ => (bytes, false),
    };
    if enc.is_ascii() && !body.is_ascii() {
        return Err(CodecError::Malformed { encoding: enc.name() });
    }
    let text = enc
        .encoding()
        .decode_without_bom_handling_and_without_replacement(body)
        .ok_or(CodecError::Malformed { encoding: enc.name() })?;
    Ok(Decoded { text: text.into_owned(), bom })
}

/// 严格编码：无法映射的字符报错，不写 HTML 数字实体
pub fn encode(text: &str, enc: DetectedEncoding, bom: bool) -> Result<Vec<u8>, CodecError> {
    let encoding = enc.encoding();
    if enc.is_ascii() && !text.is_ascii() {
        return Err(CodecError::Unmappable { encoding: enc.name() });
    }
    if encoding == UTF_16LE || encoding == UTF_16BE {
        return Ok(encode_utf16(text, encoding == UTF_16LE, bom));
    }
    if encoding.output_encoding() != encoding {
        return Err(CodecError::Unsupported { encoding: enc.name() });
    }

    let (bytes, _, had_errors) = encoding.encode(text);
    if had_errors {
        return Err(CodecError::Unmappable { encoding: enc.name() });
    }
    if bom && encoding == UTF_8 {
        let mut out = Vec::with_capacity(UTF8_BOM.len() + bytes.len());
        out.extend_from_slice(UTF8_BOM);
        out.extend_from_slice(&bytes);
        return Ok(out);
    }
    Ok(bytes.into_owned())
}

fn encode_utf16(text: &str, little_endian: bool, bom: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2 + 2);
    let units = bom.then_some(0xFEFF_u16).into_iter().chain(text.encode_utf16());
    for u in units {
        let b = if little_endian { u.to_le_bytes() } else { u.to_be_bytes() };
        out.extend_from_slice(&b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{SHIFT_JIS, WINDOWS_1252};
    use std::io::Cursor;

    fn detect(bytes: &[u8]) -> Option<DetectedEncoding> {
        detect_reader(Cursor::new(bytes), DEFAULT_MAX_DETECT_BYTES).unwrap()
    }

    /// 记录被读取了多少字节的 reader
    struct CountingReader<R> {
        inner: R,
        read: usize,
    }

    impl<R: Read> Read for CountingReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.read += n;
            Ok(n)
        }
    }

    #[test]
    fn pure_ascii_is_ascii() {
        assert_eq!(detect(b"print 'hello'\nx = 1\n"), Some(DetectedEncoding::ascii()));
        assert_eq!(detect(b""), Some(DetectedEncoding::ascii()));
    }

    #[test]
    fn utf8_text_is_utf8() {
        let text = "# -*- coding: utf-8 -*-\nname = 'café'\n";
        assert_eq!(detect(text.as_bytes()), Some(DetectedEncoding::utf8()));
    }

    #[test]
    fn latin1_bytes_are_not_utf8() {
        let mut bytes = b"# Fran\xE7ais: \xE9t\xE9, ".to_vec();
        bytes.extend_from_slice(b"caf\xE9 cr\xE8me br\xFBl\xE9e, na\xEFve gar\xE7on\n");
        let enc = detect(&bytes).expect("confident guess");
        assert_ne!(enc.encoding(), UTF_8);
        assert_eq!(enc.encoding(), WINDOWS_1252);
    }

    #[test]
    fn bom_decides_immediately() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"x = 1\n");
        assert_eq!(detect(&bytes), Some(DetectedEncoding::utf8()));
        assert_eq!(detect(b"\xFF\xFEx\x00\n\x00"), Some(DetectedEncoding::from_encoding(UTF_16LE)));
    }

    #[test]
    fn stops_reading_once_confident() {
        let mut data = "é".repeat(UTF8_CONFIDENT_CHARS);
        data.push('\n');
        let head_len = data.len();
        data.push_str(&"x = 1\n".repeat(100_000));

        let mut reader = CountingReader { inner: Cursor::new(data.into_bytes()), read: 0 };
        let enc = detect_reader(BufReader::with_capacity(64, &mut reader), DEFAULT_MAX_DETECT_BYTES).unwrap();
        assert_eq!(enc, Some(DetectedEncoding::utf8()));
        assert!(reader.read < head_len + 64, "read {} bytes", reader.read);
    }

    #[test]
    fn ascii_prefix_within_budget_is_unknown() {
        let data = "x = 1\n".repeat(100);
        assert_eq!(detect_reader(Cursor::new(data.as_bytes()), 64).unwrap(), None);
    }

    #[test]
    fn utf8_split_across_chunks_is_still_valid() {
        let mut d = EncodingDetector::new(DEFAULT_MAX_DETECT_BYTES);
        let bytes = "é".as_bytes();
        d.feed(&bytes[..1]);
        d.feed(&bytes[1..]);
        assert_eq!(d.close(), Some(DetectedEncoding::utf8()));
    }

    #[test]
    fn missing_file_propagates_error() {
        assert!(detect_file(Path::new("/nonexistent/a.py"), DEFAULT_MAX_DETECT_BYTES).is_err());
    }

    #[test]
    fn labels_resolve() {
        assert_eq!(DetectedEncoding::for_label("ascii"), Some(DetectedEncoding::ascii()));
        assert_eq!(DetectedEncoding::for_label("utf-8"), Some(DetectedEncoding::utf8()));
        assert_eq!(DetectedEncoding::for_label("latin1").map(|e| e.encoding()), Some(WINDOWS_1252));
        assert_eq!(DetectedEncoding::for_label("no-such-encoding"), None);
    }

    #[test]
    fn decode_is_strict() {
        let err = decode(b"caf\xE9", DetectedEncoding::utf8()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
        assert!(decode("é".as_bytes(), DetectedEncoding::ascii()).is_err());
    }

    #[test]
    fn bom_round_trips() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("é = 1\n".as_bytes());
        let d = decode(&bytes, DetectedEncoding::utf8()).unwrap();
        assert!(d.bom);
        assert_eq!(d.text, "é = 1\n");
        assert_eq!(encode(&d.text, DetectedEncoding::utf8(), d.bom).unwrap(), bytes);

        let utf16 = DetectedEncoding::from_encoding(UTF_16LE);
        let raw = b"\xFF\xFEa\x00\n\x00";
        let d = decode(raw, utf16).unwrap();
        assert_eq!(d.text, "a\n");
        assert_eq!(encode(&d.text, utf16, d.bom).unwrap(), raw);
    }

    #[test]
    fn legacy_encodings_round_trip() {
        let sjis = DetectedEncoding::from_encoding(SHIFT_JIS);
        let (bytes, _, _) = SHIFT_JIS.encode("日本語のコメント");
        let d = decode(&bytes, sjis).unwrap();
        assert_eq!(d.text, "日本語のコメント");
        assert_eq!(encode(&d.text, sjis, false).unwrap(), bytes.into_owned());
    }

    #[test]
    fn encode_rejects_unmappable() {
        let cp1252 = DetectedEncoding::from_encoding(WINDOWS_1252);
        assert!(matches!(encode("日本", cp1252, false), Err(CodecError::Unmappable { .. })));
        assert!(matches!(encode("é", DetectedEncoding::ascii(), false), Err(CodecError::Unmappable { .. })));
    }
}
