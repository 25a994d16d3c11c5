//! 增量 JSON 扫描
//!
//! 只识别结构边界（括号深度、字符串与转义），每次只缓存“当前元素”的字节，
//! 元素闭合后交给 `serde_json` 解析。内存占用上界 = 最大单个元素的大小。

use futures_util::StreamExt;
use serde_json::Value;

use crate::error::HubError;
use crate::request::JobByteStream;

pub(crate) fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_scalar_end(b: u8) -> bool {
    is_ws(b) || matches!(b, b',' | b']' | b'}' | b':')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Container,
    String,
    Scalar,
}

/// 单个 JSON 值的边界扫描器。
///
/// 调用方保证第一个喂入的字节是非空白的值起始字节。
#[derive(Debug)]
pub(crate) struct ValueScanner {
    keep: bool,
    buf: Vec<u8>,
    kind: Option<ValueKind>,
    depth: usize,
    in_string: bool,
    escape: bool,
}

/// `ValueScanner::feed` 的结果
pub(crate) enum Scan {
    /// 输入已全部消费，值尚未结束
    NeedMore,
    /// 值在输入的 `consumed` 处结束（不含分隔符）
    Done { consumed: usize },
}

impl ValueScanner {
    /// `keep = false` 时只跟踪边界，不缓存字节（用于跳过无关字段）
    pub(crate) fn new(keep: bool) -> Self {
        Self {
            keep,
            buf: Vec::new(),
            kind: None,
            depth: 0,
            in_string: false,
            escape: false,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn push(&mut self, b: u8) {
        if self.keep {
            self.buf.push(b);
        }
    }

    pub(crate) fn feed(&mut self, input: &[u8]) -> Result<Scan, HubError> {
        for (i, &b) in input.iter().enumerate() {
            let kind = match self.kind {
                Some(k) => k,
                None => {
                    let k = match b {
                        b'{' | b'[' => {
                            self.depth = 1;
                            ValueKind::Container
                        }
                        b'"' => ValueKind::String,
                        b'}' | b']' | b',' | b':' => {
                            return Err(HubError::Json(format!(
                                "unexpected '{}' where a value was expected",
                                b as char
                            )));
                        }
                        _ => ValueKind::Scalar,
                    };
                    self.kind = Some(k);
                    self.push(b);
                    continue;
                }
            };

            match kind {
                ValueKind::Scalar => {
                    if is_scalar_end(b) {
                        return Ok(Scan::Done { consumed: i });
                    }
                    self.push(b);
                }
                ValueKind::String => {
                    self.push(b);
                    if self.escape {
                        self.escape = false;
                    } else if b == b'\\' {
                        self.escape = true;
                    } else if b == b'"' {
                        return Ok(Scan::Done { consumed: i + 1 });
                    }
                }
                ValueKind::Container => {
                    self.push(b);
                    if self.in_string {
                        if self.escape {
                            self.escape = false;
                        } else if b == b'\\' {
                            self.escape = true;
                        } else if b == b'"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match b {
                        b'"' => self.in_string = true,
                        b'{' | b'[' => self.depth += 1,
                        b'}' | b']' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                return Ok(Scan::Done { consumed: i + 1 });
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(Scan::NeedMore)
    }
}

#[derive(Debug)]
enum ArrayState {
    /// 刚读到 `[`，期待值或 `]`
    Opened,
    InValue(ValueScanner),
    /// 期待 `,` 或 `]`
    AfterValue,
    /// 读到 `,`，期待下一个值
    AfterComma,
    Closed,
}

/// 数组元素切分器：`[` 已被调用方消费。
#[derive(Debug)]
pub(crate) struct ArrayDriver {
    state: ArrayState,
}

impl ArrayDriver {
    pub(crate) fn opened() -> Self {
        Self {
            state: ArrayState::Opened,
        }
    }

    /// 喂入字节；每个完整元素的原始字节交给 `on_elem`。
    ///
    /// 返回 `(已消费字节数, 数组是否已闭合)`；闭合时 `]` 计入已消费。
    pub(crate) fn feed(
        &mut self,
        input: &[u8],
        on_elem: &mut dyn FnMut(&[u8]) -> Result<(), HubError>,
    ) -> Result<(usize, bool), HubError> {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match &mut self.state {
                ArrayState::Closed => return Ok((i, true)),
                ArrayState::Opened | ArrayState::AfterComma => {
                    if is_ws(b) {
                        i += 1;
                        continue;
                    }
                    if b == b']' {
                        if matches!(self.state, ArrayState::AfterComma) {
                            return Err(HubError::Json("trailing comma in array".into()));
                        }
                        self.state = ArrayState::Closed;
                        return Ok((i + 1, true));
                    }
                    self.state = ArrayState::InValue(ValueScanner::new(true));
                }
                ArrayState::InValue(scanner) => match scanner.feed(&input[i..])? {
                    Scan::NeedMore => return Ok((input.len(), false)),
                    Scan::Done { consumed } => {
                        i += consumed;
                        on_elem(scanner.bytes())?;
                        self.state = ArrayState::AfterValue;
                    }
                },
                ArrayState::AfterValue => {
                    if is_ws(b) {
                        i += 1;
                        continue;
                    }
                    match b {
                        b',' => self.state = ArrayState::AfterComma,
                        b']' => {
                            self.state = ArrayState::Closed;
                            return Ok((i + 1, true));
                        }
                        other => {
                            return Err(HubError::Json(format!(
                                "expected ',' or ']' in array, found '{}'",
                                other as char
                            )));
                        }
                    }
                    i += 1;
                }
            }
        }
        Ok((input.len(), matches!(self.state, ArrayState::Closed)))
    }
}

#[derive(Debug)]
enum RowState {
    Start,
    Array(ArrayDriver),
    End,
}

/// 顶层 JSON 数组的行解析器：每个顶层元素回调一次，按文档顺序。
#[derive(Debug)]
pub struct RowParser {
    state: RowState,
    rows: u64,
}

impl Default for RowParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RowParser {
    pub fn new() -> Self {
        Self {
            state: RowState::Start,
            rows: 0,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn feed<F>(&mut self, input: &[u8], on_row: &mut F) -> Result<(), HubError>
    where
        F: FnMut(Value) -> Result<(), HubError>,
    {
        let mut i = 0;
        while i < input.len() {
            match &mut self.state {
                RowState::Start => {
                    let b = input[i];
                    i += 1;
                    if is_ws(b) {
                        continue;
                    }
                    if b != b'[' {
                        return Err(HubError::Json(format!(
                            "expected a JSON array, found '{}'",
                            b as char
                        )));
                    }
                    self.state = RowState::Array(ArrayDriver::opened());
                }
                RowState::Array(driver) => {
                    let rows = &mut self.rows;
                    let (consumed, closed) = driver.feed(&input[i..], &mut |raw| {
                        let value: Value = serde_json::from_slice(raw)?;
                        *rows += 1;
                        on_row(value)
                    })?;
                    i += consumed;
                    if closed {
                        self.state = RowState::End;
                    }
                }
                RowState::End => {
                    if let Some(b) = input[i..].iter().copied().find(|b| !is_ws(*b)) {
                        return Err(HubError::Json(format!(
                            "unexpected '{}' after end of array",
                            b as char
                        )));
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// 输入结束：数组未闭合视为截断
    pub fn finish(self) -> Result<u64, HubError> {
        match self.state {
            RowState::End => Ok(self.rows),
            RowState::Start => Err(HubError::Json("empty JSON document".into())),
            RowState::Array(_) => Err(HubError::Json(
                "JSON array ended prematurely".into(),
            )),
        }
    }
}

/// 消费字节流并逐行回调。回调返回 Err 时立即停止并丢弃字节流。
pub async fn parse_rows<F>(mut bytes: JobByteStream, mut on_row: F) -> Result<u64, HubError>
where
    F: FnMut(Value) -> Result<(), HubError> + Send,
{
    let mut parser = RowParser::new();
    while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        parser.feed(&chunk, &mut on_row)?;
    }
    parser.finish()
}
