//! `json_detail` 格式：`{"fields": {...}, "data": [...], "ran_at": "..."}`
//!
//! 三个区段按到达顺序回调；`data` 逐行回调，其它未知键只跟踪边界、不缓存。

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HubError;
use crate::json_stream::{ArrayDriver, Scan, ValueScanner, is_ws};
use crate::request::JobByteStream;

/// 单个字段的元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Field {
    pub fn tags(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t == tag)
    }
}

/// 查询结果的字段集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fieldset {
    #[serde(default)]
    pub dimensions: Vec<Field>,
    #[serde(default)]
    pub measures: Vec<Field>,
    #[serde(default)]
    pub filters: Vec<Field>,
    #[serde(default)]
    pub parameters: Vec<Field>,
    #[serde(default)]
    pub table_calculations: Vec<Field>,
}

impl Fieldset {
    /// 维度、度量、过滤器、参数、表计算依次拼接
    pub fn all_fields(&self) -> Vec<&Field> {
        self.dimensions
            .iter()
            .chain(&self.measures)
            .chain(&self.filters)
            .chain(&self.parameters)
            .chain(&self.table_calculations)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.all_fields().is_empty()
    }
}

/// `json_detail` 回调集合。除 `on_row` 外都有空默认实现。
pub trait JsonDetailVisitor: Send {
    fn on_row(&mut self, row: Value) -> Result<(), HubError>;

    fn on_fields(&mut self, _fields: Fieldset) -> Result<(), HubError> {
        Ok(())
    }

    fn on_ran_at(&mut self, _ran_at: String) -> Result<(), HubError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Fields,
    RanAt,
    Skip,
}

#[derive(Debug)]
enum DetailState {
    Start,
    /// 刚读到 `{`
    Opened,
    InKey(ValueScanner),
    ExpectColon(String),
    ExpectValue(String),
    InValue(Section, ValueScanner),
    InData(ArrayDriver),
    AfterValue,
    AfterComma,
    End,
}

/// `json_detail` 文档的增量解析器
#[derive(Debug)]
pub struct DetailParser {
    state: DetailState,
    rows: u64,
}

impl Default for DetailParser {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(b: u8, expected: &str) -> HubError {
    HubError::Json(format!("expected {expected}, found '{}'", b as char))
}

impl DetailParser {
    pub fn new() -> Self {
        Self {
            state: DetailState::Start,
            rows: 0,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn feed<V: JsonDetailVisitor + ?Sized>(
        &mut self,
        input: &[u8],
        visitor: &mut V,
    ) -> Result<(), HubError> {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match &mut self.state {
                DetailState::Start => {
                    i += 1;
                    if is_ws(b) {
                        continue;
                    }
                    if b != b'{' {
                        return Err(unexpected(b, "'{' at document start"));
                    }
                    self.state = DetailState::Opened;
                }
                DetailState::Opened | DetailState::AfterComma => {
                    if is_ws(b) {
                        i += 1;
                        continue;
                    }
                    if b == b'}' && matches!(self.state, DetailState::Opened) {
                        i += 1;
                        self.state = DetailState::End;
                        continue;
                    }
                    if b != b'"' {
                        return Err(unexpected(b, "an object key"));
                    }
                    self.state = DetailState::InKey(ValueScanner::new(true));
                }
                DetailState::InKey(scanner) => match scanner.feed(&input[i..])? {
                    Scan::NeedMore => return Ok(()),
                    Scan::Done { consumed } => {
                        i += consumed;
                        let key: String = serde_json::from_slice(scanner.bytes())?;
                        self.state = DetailState::ExpectColon(key);
                    }
                },
                DetailState::ExpectColon(key) => {
                    i += 1;
                    if is_ws(b) {
                        continue;
                    }
                    if b != b':' {
                        return Err(unexpected(b, "':' after object key"));
                    }
                    let key = std::mem::take(key);
                    self.state = DetailState::ExpectValue(key);
                }
                DetailState::ExpectValue(key) => {
                    if is_ws(b) {
                        i += 1;
                        continue;
                    }
                    if key.as_str() == "data" && b == b'[' {
                        i += 1;
                        self.state = DetailState::InData(ArrayDriver::opened());
                        continue;
                    }
                    let section = match key.as_str() {
                        "fields" => Section::Fields,
                        "ran_at" => Section::RanAt,
                        _ => Section::Skip,
                    };
                    self.state =
                        DetailState::InValue(section, ValueScanner::new(section != Section::Skip));
                }
                DetailState::InValue(section, scanner) => match scanner.feed(&input[i..])? {
                    Scan::NeedMore => return Ok(()),
                    Scan::Done { consumed } => {
                        i += consumed;
                        let section = *section;
                        let raw = std::mem::replace(scanner, ValueScanner::new(false)).into_bytes();
                        self.state = DetailState::AfterValue;
                        match section {
                            Section::Fields => {
                                let value: Value = serde_json::from_slice(&raw)?;
                                if !value.is_null() {
                                    let fields: Fieldset = serde_json::from_value(value)?;
                                    visitor.on_fields(fields)?;
                                }
                            }
                            Section::RanAt => {
                                if let Value::String(ran_at) = serde_json::from_slice::<Value>(&raw)? {
                                    visitor.on_ran_at(ran_at)?;
                                }
                            }
                            Section::Skip => {}
                        }
                    }
                },
                DetailState::InData(driver) => {
                    let rows = &mut self.rows;
                    let (consumed, closed) = driver.feed(&input[i..], &mut |raw| {
                        let row: Value = serde_json::from_slice(raw)?;
                        *rows += 1;
                        visitor.on_row(row)
                    })?;
                    i += consumed;
                    if closed {
                        self.state = DetailState::AfterValue;
                    }
                }
                DetailState::AfterValue => {
                    i += 1;
                    if is_ws(b) {
                        continue;
                    }
                    match b {
                        b',' => self.state = DetailState::AfterComma,
                        b'}' => self.state = DetailState::End,
                        other => return Err(unexpected(other, "',' or '}' in object")),
                    }
                }
                DetailState::End => {
                    if let Some(b) = input[i..].iter().copied().find(|b| !is_ws(*b)) {
                        return Err(unexpected(b, "end of document"));
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<u64, HubError> {
        match self.state {
            DetailState::End => Ok(self.rows),
            DetailState::Start => Err(HubError::Json("empty JSON document".into())),
            _ => Err(HubError::Json("JSON document ended prematurely".into())),
        }
    }
}

/// 消费字节流并按区段回调。任一回调返回 Err 时立即停止并丢弃字节流。
pub async fn parse_detail<V>(mut bytes: JobByteStream, visitor: &mut V) -> Result<u64, HubError>
where
    V: JsonDetailVisitor + ?Sized,
{
    let mut parser = DetailParser::new();
    while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        parser.feed(&chunk, visitor)?;
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        rows: Vec<Value>,
        fields: Vec<Fieldset>,
        ran_at: Vec<String>,
        fail_on_row: Option<usize>,
    }

    impl JsonDetailVisitor for Recorder {
        fn on_row(&mut self, row: Value) -> Result<(), HubError> {
            self.rows.push(row);
            if self.fail_on_row == Some(self.rows.len()) {
                return Err(HubError::handler("row rejected"));
            }
            Ok(())
        }
        fn on_fields(&mut self, fields: Fieldset) -> Result<(), HubError> {
            self.fields.push(fields);
            Ok(())
        }
        fn on_ran_at(&mut self, ran_at: String) -> Result<(), HubError> {
            self.ran_at.push(ran_at);
            Ok(())
        }
    }

    fn run(doc: &[u8], chunk: usize) -> Result<Recorder, HubError> {
        let mut rec = Recorder::default();
        let mut parser = DetailParser::new();
        for c in doc.chunks(chunk.max(1)) {
            parser.feed(c, &mut rec)?;
        }
        let n = parser.finish()?;
        assert_eq!(n as usize, rec.rows.len());
        Ok(rec)
    }

    #[test]
    fn sections_fire_in_arrival_order_independent_of_position() {
        let doc = json!({
            "data": [{"x": {"value": 1}}, {"x": {"value": 2}}],
            "meta": {"nested": [1, {"deep": "]}"}]},
            "ran_at": "2024-05-01T00:00:00Z",
            "fields": {"dimensions": [{"name": "x", "tags": ["email"]}], "measures": []}
        });
        let raw = serde_json::to_vec(&doc).unwrap();
        for chunk in [1, 3, 7, raw.len()] {
            let rec = run(&raw, chunk).unwrap();
            assert_eq!(rec.rows, vec![json!({"x": {"value": 1}}), json!({"x": {"value": 2}})]);
            assert_eq!(rec.ran_at, vec!["2024-05-01T00:00:00Z".to_string()]);
            assert_eq!(rec.fields.len(), 1);
            assert_eq!(rec.fields[0].dimensions[0].name, "x");
            assert!(rec.fields[0].dimensions[0].has_tag("email"));
        }
    }

    #[test]
    fn empty_data_and_missing_sections() {
        let rec = run(br#"{"data": []}"#, 2).unwrap();
        assert!(rec.rows.is_empty());
        assert!(rec.fields.is_empty());
        let rec = run(b"{}", 1).unwrap();
        assert!(rec.rows.is_empty());
    }

    #[test]
    fn pretty_printed_document_with_crlf_whitespace() {
        let raw = b"{\r\n\t\"data\" :\r\n [ {\"a\": 1} ,\t{\"a\": 2} ] ,\n \"ran_at\"\t: \"t\" \r\n}\r\n";
        for chunk in [1, 2, raw.len()] {
            let rec = run(raw, chunk).unwrap();
            assert_eq!(rec.rows, vec![json!({"a": 1}), json!({"a": 2})]);
            assert_eq!(rec.ran_at, vec!["t".to_string()]);
        }
    }

    #[test]
    fn truncated_document_is_an_error() {
        assert!(run(br#"{"fields": {}, "data": [{"a": 1}"#, 4).is_err());
        assert!(run(br#"{"data": [1], "ran_at""#, 4).is_err());
    }

    #[test]
    fn callback_error_aborts() {
        let mut rec = Recorder {
            fail_on_row: Some(1),
            ..Default::default()
        };
        let mut parser = DetailParser::new();
        let err = parser
            .feed(br#"{"data": [1, 2, 3]}"#, &mut rec)
            .unwrap_err();
        assert!(matches!(err, HubError::Handler(_)));
        assert_eq!(rec.rows.len(), 1);
    }

    #[test]
    fn all_fields_concatenates_in_order() {
        let fs: Fieldset = serde_json::from_value(json!({
            "dimensions": [{"name": "d"}],
            "measures": [{"name": "m"}],
            "filters": [{"name": "f"}],
            "parameters": [{"name": "p"}],
            "table_calculations": [{"name": "t", "tags": null}]
        }))
        .unwrap();
        let names: Vec<&str> = fs.all_fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["d", "m", "f", "p", "t"]);
    }
}
