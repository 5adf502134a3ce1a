//! The textual keyvalues2 form, version 1.
//!
//! Elements appear as `"className" { ... }` blocks; attributes as
//! `"name" "type" "value"` triples or `"name" "type_array" [ ... ]`
//! blocks. Ids are canonical 8-4-4-4-12 GUID strings. Elements referenced
//! once inline at their reference site; shared elements are written as
//! top-level blocks and referenced by GUID. Decoding is fully eager, so
//! no codec binding is left on the result.

use std::io::{BufRead, Write};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error as ThisError;
use uuid::Uuid as UUID;

use crate::attribute::{Value, ValueKind};
use crate::codec::{Codec, DeferredMode, Header};
use crate::datamodel::Datamodel;
use crate::element::ElementArray;
use crate::error::{DmError, Result};
use crate::values::{Angle, Binary, Color, Matrix4, Quaternion, Vector2, Vector3, Vector4};

#[derive(Debug, ThisError)]
pub enum Kv2Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown token '{0}' at {1},{2}")]
    UnknownToken(char, usize, usize),
    #[error("unknown escape character '{0}' at {1},{2}")]
    UnknownEscape(char, usize, usize),
    #[error("unterminated quoted string at {0},{1}")]
    UnterminatedString(usize, usize),
    #[error("expected a quoted string at {0},{1}")]
    ExpectedString(usize, usize),
    #[error("expected an open brace at {0},{1}")]
    ExpectedOpenBrace(usize, usize),
    #[error("expected an open bracket at {0},{1}")]
    ExpectedOpenBracket(usize, usize),
    #[error("unexpected token at {0},{1}")]
    UnexpectedToken(usize, usize),
    #[error("unexpected end of file")]
    UnexpectedEndOfFile,
    #[error("bad id \"{0}\" at {1},{2}")]
    BadGuid(String, usize, usize),
    #[error("bad {kind} value at {line},{column}: {message}")]
    BadValue {
        kind: &'static str,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("element id {0} appears twice")]
    DuplicateElementId(UUID),
    #[error("no elements in stream")]
    NoElements,
}

pub struct KeyValues2Codec;

impl Codec for KeyValues2Codec {
    fn encoding(&self) -> &'static str {
        "keyvalues2"
    }

    fn encode(&self, datamodel: &Datamodel, header: &Header, sink: &mut dyn Write) -> Result<()> {
        encode_datamodel(datamodel, header, sink).map_err(|error| match error {
            Kv2Error::Io(io) => DmError::Io(io),
            other => DmError::Codec {
                codec: "keyvalues2".to_string(),
                source: Box::new(other),
            },
        })
    }

    fn decode(&self, header: &Header, source: &mut dyn BufRead, _mode: DeferredMode) -> Result<Datamodel> {
        decode_datamodel(header, source).map_err(|error| match error {
            Kv2Error::Io(io) => DmError::Io(io),
            other => DmError::Codec {
                codec: "keyvalues2".to_string(),
                source: Box::new(other),
            },
        })
    }
}

// ---- writer ----------------------------------------------------------

struct Kv2Writer<'a> {
    sink: &'a mut dyn Write,
    depth: usize,
}

impl<'a> Kv2Writer<'a> {
    fn new(sink: &'a mut dyn Write) -> Self {
        Self { sink, depth: 0 }
    }

    fn write_raw(&mut self, text: &str) -> std::result::Result<(), Kv2Error> {
        self.sink.write_all(text.as_bytes())?;
        Ok(())
    }

    fn write_line(&mut self, text: &str) -> std::result::Result<(), Kv2Error> {
        for _ in 0..self.depth {
            self.sink.write_all(b"\t")?;
        }
        self.sink.write_all(text.as_bytes())?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }

    fn open_brace(&mut self) -> std::result::Result<(), Kv2Error> {
        self.write_line("{")?;
        self.depth += 1;
        Ok(())
    }

    fn close_brace(&mut self, trailing_comma: bool) -> std::result::Result<(), Kv2Error> {
        self.depth -= 1;
        self.write_line(if trailing_comma { "}," } else { "}" })
    }

    fn open_bracket(&mut self) -> std::result::Result<(), Kv2Error> {
        self.write_line("[")?;
        self.depth += 1;
        Ok(())
    }

    fn close_bracket(&mut self) -> std::result::Result<(), Kv2Error> {
        self.depth -= 1;
        self.write_line("]")
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02X}"));
    }
    hex
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Int(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Bool(value) => (*value as u8).to_string(),
        Value::String(value) => escape(value),
        Value::Binary(value) => hex_encode(&value.0),
        Value::Time(value) => value.as_secs_f64().to_string(),
        Value::Color(value) => value.to_string(),
        Value::Vector2(value) => value.to_string(),
        Value::Vector3(value) => value.to_string(),
        Value::Vector4(value) => value.to_string(),
        Value::Angle(value) => value.to_string(),
        Value::Quaternion(value) => value.to_string(),
        Value::Matrix(value) => value.to_string(),
        _ => return None,
    };
    Some(text)
}

fn array_item_texts(value: &Value) -> Option<Vec<String>> {
    let items = match value {
        Value::IntArray(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::FloatArray(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::BoolArray(values) => values.iter().map(|v| (*v as u8).to_string()).collect(),
        Value::StringArray(values) => values.iter().map(|v| escape(v)).collect(),
        Value::BinaryArray(values) => values.iter().map(|v| hex_encode(&v.0)).collect(),
        Value::TimeArray(values) => values.iter().map(|v| v.as_secs_f64().to_string()).collect(),
        Value::ColorArray(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::Vector2Array(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::Vector3Array(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::Vector4Array(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::AngleArray(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::QuaternionArray(values) => values.iter().map(|v| v.to_string()).collect(),
        Value::MatrixArray(values) => values.iter().map(|v| v.to_string()).collect(),
        _ => return None,
    };
    Some(items)
}

struct EncodePlan {
    /// Reachable non-stub elements in walk order.
    collected: IndexSet<UUID>,
    /// Elements written as top-level blocks and referenced by GUID.
    top_level: IndexSet<UUID>,
}

fn plan_encode(datamodel: &Datamodel, root: UUID) -> EncodePlan {
    let mut collected = IndexSet::new();
    let mut counts: IndexMap<UUID, usize> = IndexMap::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(element) = datamodel.element(id) else { continue };
        if element.is_stub() || !collected.insert(id) {
            continue;
        }
        for referenced in element.referenced_elements() {
            *counts.entry(referenced).or_insert(0) += 1;
            if !collected.contains(&referenced) {
                stack.push(referenced);
            }
        }
    }

    let mut top_level = IndexSet::new();
    top_level.insert(root);
    for &id in &collected {
        if counts.get(&id).copied().unwrap_or(0) >= 2 {
            top_level.insert(id);
        }
    }

    EncodePlan { collected, top_level }
}

fn encode_datamodel(datamodel: &Datamodel, header: &Header, sink: &mut dyn Write) -> std::result::Result<(), Kv2Error> {
    let root = datamodel.root().expect("save checks the root");
    let plan = plan_encode(datamodel, root);

    let mut writer = Kv2Writer::new(sink);
    writer.write_raw(&header.to_line())?;

    for &id in &plan.top_level {
        let element = datamodel.element(id).expect("collected from this datamodel");
        writer.write_line(&format!("\"{}\"", escape(element.class())))?;
        write_element_body(&mut writer, datamodel, &plan, id, false)?;
        writer.write_line("")?;
    }

    Ok(())
}

fn write_element_body(
    writer: &mut Kv2Writer<'_>,
    datamodel: &Datamodel,
    plan: &EncodePlan,
    id: UUID,
    trailing_comma: bool,
) -> std::result::Result<(), Kv2Error> {
    let element = datamodel.element(id).expect("collected from this datamodel");
    writer.open_brace()?;
    writer.write_line(&format!("\"id\" \"elementid\" \"{id}\""))?;
    writer.write_line(&format!("\"name\" \"string\" \"{}\"", escape(element.name())))?;

    for (name, attribute) in element.attributes() {
        let value = attribute.value().expect("save materializes everything");
        let name = escape(name);

        if let Some(text) = scalar_text(value) {
            writer.write_line(&format!("\"{name}\" \"{}\" \"{text}\"", value.type_name()))?;
            continue;
        }

        if let Some(items) = array_item_texts(value) {
            writer.write_line(&format!("\"{name}\" \"{}\"", value.type_name()))?;
            writer.open_bracket()?;
            for (index, item) in items.iter().enumerate() {
                let comma = if index + 1 < items.len() { "," } else { "" };
                writer.write_line(&format!("\"{item}\"{comma}"))?;
            }
            writer.close_bracket()?;
            continue;
        }

        match value {
            Value::Element(reference) => write_element_ref(writer, datamodel, plan, &name, *reference)?,
            Value::ElementArray(array) => {
                writer.write_line(&format!("\"{name}\" \"element_array\""))?;
                writer.open_bracket()?;
                let count = array.len();
                for (index, reference) in array.iter().enumerate() {
                    let last = index + 1 == count;
                    write_array_item(writer, datamodel, plan, *reference, !last)?;
                }
                writer.close_bracket()?;
            }
            _ => unreachable!("every kind is either scalar, array or element"),
        }
    }

    writer.close_brace(trailing_comma)
}

/// A scalar element attribute: inline block for single-referenced
/// elements, GUID string for shared, stub or dangling ones, empty string
/// for null.
fn write_element_ref(
    writer: &mut Kv2Writer<'_>,
    datamodel: &Datamodel,
    plan: &EncodePlan,
    name: &str,
    reference: Option<UUID>,
) -> std::result::Result<(), Kv2Error> {
    match reference {
        None => writer.write_line(&format!("\"{name}\" \"element\" \"\"")),
        Some(id) if !plan.collected.contains(&id) || plan.top_level.contains(&id) => {
            writer.write_line(&format!("\"{name}\" \"element\" \"{id}\""))
        }
        Some(id) => {
            let class = escape(datamodel.element(id).expect("collected from this datamodel").class());
            writer.write_line(&format!("\"{name}\" \"{class}\""))?;
            write_element_body(writer, datamodel, plan, id, false)
        }
    }
}

fn write_array_item(
    writer: &mut Kv2Writer<'_>,
    datamodel: &Datamodel,
    plan: &EncodePlan,
    reference: Option<UUID>,
    trailing_comma: bool,
) -> std::result::Result<(), Kv2Error> {
    let comma = if trailing_comma { "," } else { "" };
    match reference {
        None => writer.write_line(&format!("\"element\" \"\"{comma}")),
        Some(id) if !plan.collected.contains(&id) || plan.top_level.contains(&id) => {
            writer.write_line(&format!("\"element\" \"{id}\"{comma}"))
        }
        Some(id) => {
            let class = escape(datamodel.element(id).expect("collected from this datamodel").class());
            writer.write_line(&format!("\"{class}\""))?;
            write_element_body(writer, datamodel, plan, id, trailing_comma)
        }
    }
}

// ---- tokenizer -------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Text(String),
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
}

struct Tokenizer {
    characters: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
}

impl Tokenizer {
    fn new(text: &str) -> Self {
        Self {
            characters: text.chars().collect(),
            index: 0,
            line: 1,
            column: 0,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let character = self.characters.get(self.index).copied()?;
        self.index += 1;
        if character == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(character)
    }

    fn peek(&self) -> Option<char> {
        self.characters.get(self.index).copied()
    }

    fn next_token(&mut self) -> std::result::Result<Option<Token>, Kv2Error> {
        loop {
            let Some(character) = self.bump() else { return Ok(None) };

            match character {
                '"' => return self.read_quoted().map(Some),
                '{' => return Ok(Some(Token::OpenBrace)),
                '}' => return Ok(Some(Token::CloseBrace)),
                '[' => return Ok(Some(Token::OpenBracket)),
                ']' => return Ok(Some(Token::CloseBracket)),
                ',' => continue,
                '/' if self.peek() == Some('/') => {
                    while let Some(character) = self.bump() {
                        if character == '\n' {
                            break;
                        }
                    }
                }
                character if character.is_whitespace() => continue,
                character => return Err(Kv2Error::UnknownToken(character, self.line, self.column)),
            }
        }
    }

    fn read_quoted(&mut self) -> std::result::Result<Token, Kv2Error> {
        let (start_line, start_column) = (self.line, self.column);
        let mut text = String::with_capacity(32);
        loop {
            let Some(character) = self.bump() else {
                return Err(Kv2Error::UnterminatedString(start_line, start_column));
            };
            match character {
                '"' => return Ok(Token::Text(text)),
                '\\' => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('\'') => text.push('\''),
                    Some('"') => text.push('"'),
                    Some(other) => return Err(Kv2Error::UnknownEscape(other, self.line, self.column)),
                    None => return Err(Kv2Error::UnterminatedString(start_line, start_column)),
                },
                other => text.push(other),
            }
        }
    }

    fn expect_text(&mut self) -> std::result::Result<String, Kv2Error> {
        match self.next_token()? {
            Some(Token::Text(text)) => Ok(text),
            Some(_) => Err(Kv2Error::ExpectedString(self.line, self.column)),
            None => Err(Kv2Error::UnexpectedEndOfFile),
        }
    }

    fn expect_open_brace(&mut self) -> std::result::Result<(), Kv2Error> {
        match self.next_token()? {
            Some(Token::OpenBrace) => Ok(()),
            Some(_) => Err(Kv2Error::ExpectedOpenBrace(self.line, self.column)),
            None => Err(Kv2Error::UnexpectedEndOfFile),
        }
    }

    fn expect_open_bracket(&mut self) -> std::result::Result<(), Kv2Error> {
        match self.next_token()? {
            Some(Token::OpenBracket) => Ok(()),
            Some(_) => Err(Kv2Error::ExpectedOpenBracket(self.line, self.column)),
            None => Err(Kv2Error::UnexpectedEndOfFile),
        }
    }
}

// ---- parser ----------------------------------------------------------

struct ParsedElement {
    id: UUID,
    class: String,
    name: String,
    attributes: Vec<(String, Value)>,
}

struct Parser {
    tokens: Tokenizer,
    elements: Vec<ParsedElement>,
}

impl Parser {
    fn parse_guid(&self, text: &str) -> std::result::Result<UUID, Kv2Error> {
        text.parse::<UUID>()
            .map_err(|_| Kv2Error::BadGuid(text.to_string(), self.tokens.line, self.tokens.column))
    }

    /// Parse one `"class" { ... }` block whose opening brace is already
    /// consumed. Nested elements land in `self.elements` before their
    /// parent; the parent's id is returned.
    fn read_element_body(&mut self, class: String) -> std::result::Result<UUID, Kv2Error> {
        let mut id = None;
        let mut name = String::from("unnamed");
        let mut attributes = Vec::new();

        loop {
            let attribute_name = match self.tokens.next_token()? {
                Some(Token::Text(text)) => text,
                Some(Token::CloseBrace) => break,
                Some(_) => return Err(Kv2Error::UnexpectedToken(self.tokens.line, self.tokens.column)),
                None => return Err(Kv2Error::UnexpectedEndOfFile),
            };
            let type_name = self.tokens.expect_text()?;

            if attribute_name == "id" && type_name == "elementid" {
                let text = self.tokens.expect_text()?;
                id = Some(self.parse_guid(&text)?);
                continue;
            }
            if attribute_name == "name" && type_name == "string" {
                name = self.tokens.expect_text()?;
                continue;
            }

            let value = self.read_attribute_value(&type_name)?;
            attributes.push((attribute_name, value));
        }

        let id = id.unwrap_or_else(UUID::new_v4);
        self.elements.push(ParsedElement {
            id,
            class,
            name,
            attributes,
        });
        Ok(id)
    }

    fn read_attribute_value(&mut self, type_name: &str) -> std::result::Result<Value, Kv2Error> {
        match ValueKind::from_type_name(type_name) {
            Some((ValueKind::Element, false)) => {
                let text = self.tokens.expect_text()?;
                if text.is_empty() {
                    Ok(Value::Element(None))
                } else {
                    Ok(Value::Element(Some(self.parse_guid(&text)?)))
                }
            }
            Some((ValueKind::Element, true)) => {
                self.tokens.expect_open_bracket()?;
                let mut references = Vec::new();
                loop {
                    let first = match self.tokens.next_token()? {
                        Some(Token::Text(text)) => text,
                        Some(Token::CloseBracket) => break,
                        Some(_) => return Err(Kv2Error::UnexpectedToken(self.tokens.line, self.tokens.column)),
                        None => return Err(Kv2Error::UnexpectedEndOfFile),
                    };
                    match self.tokens.next_token()? {
                        Some(Token::Text(text)) => {
                            if first != "element" {
                                return Err(Kv2Error::UnexpectedToken(self.tokens.line, self.tokens.column));
                            }
                            if text.is_empty() {
                                references.push(None);
                            } else {
                                references.push(Some(self.parse_guid(&text)?));
                            }
                        }
                        Some(Token::OpenBrace) => {
                            references.push(Some(self.read_element_body(first)?));
                        }
                        Some(_) => return Err(Kv2Error::UnexpectedToken(self.tokens.line, self.tokens.column)),
                        None => return Err(Kv2Error::UnexpectedEndOfFile),
                    }
                }
                Ok(Value::ElementArray(ElementArray::from_refs(references)))
            }
            Some((kind, false)) => {
                let text = self.tokens.expect_text()?;
                self.parse_scalar(kind, &text)
            }
            Some((kind, true)) => {
                self.tokens.expect_open_bracket()?;
                let mut items = Vec::new();
                loop {
                    match self.tokens.next_token()? {
                        Some(Token::Text(text)) => items.push(text),
                        Some(Token::CloseBracket) => break,
                        Some(_) => return Err(Kv2Error::UnexpectedToken(self.tokens.line, self.tokens.column)),
                        None => return Err(Kv2Error::UnexpectedEndOfFile),
                    }
                }
                self.parse_scalar_array(kind, items)
            }
            // An unrecognized type name is an inline element block of
            // that class.
            None => {
                self.tokens.expect_open_brace()?;
                let child = self.read_element_body(type_name.to_string())?;
                Ok(Value::Element(Some(child)))
            }
        }
    }

    fn bad_value(&self, kind: &'static str, message: impl Into<String>) -> Kv2Error {
        Kv2Error::BadValue {
            kind,
            line: self.tokens.line,
            column: self.tokens.column,
            message: message.into(),
        }
    }

    fn parse_scalar(&self, kind: ValueKind, text: &str) -> std::result::Result<Value, Kv2Error> {
        let value = match kind {
            ValueKind::Element => unreachable!("handled by the caller"),
            ValueKind::Int => Value::Int(text.parse::<i32>().map_err(|error| self.bad_value("int", error.to_string()))?),
            ValueKind::Float => Value::Float(text.parse::<f32>().map_err(|error| self.bad_value("float", error.to_string()))?),
            ValueKind::Bool => Value::Bool(match text {
                "0" | "false" => false,
                "1" | "true" => true,
                other => return Err(self.bad_value("bool", format!("\"{other}\" is not a boolean"))),
            }),
            ValueKind::String => Value::String(text.to_string()),
            ValueKind::Binary => Value::Binary(Binary::new(self.parse_hex(text)?)),
            ValueKind::Time => {
                let seconds = text.parse::<f64>().map_err(|error| self.bad_value("time", error.to_string()))?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(self.bad_value("time", format!("\"{text}\" is out of range")));
                }
                Value::Time(Duration::from_secs_f64(seconds))
            }
            ValueKind::Color => Value::Color(text.parse::<Color>().map_err(|error| self.bad_value("color", error.to_string()))?),
            ValueKind::Vector2 => Value::Vector2(text.parse::<Vector2>().map_err(|error| self.bad_value("vector2", error.to_string()))?),
            ValueKind::Vector3 => Value::Vector3(text.parse::<Vector3>().map_err(|error| self.bad_value("vector3", error.to_string()))?),
            ValueKind::Vector4 => Value::Vector4(text.parse::<Vector4>().map_err(|error| self.bad_value("vector4", error.to_string()))?),
            ValueKind::Angle => Value::Angle(text.parse::<Angle>().map_err(|error| self.bad_value("qangle", error.to_string()))?),
            ValueKind::Quaternion => {
                Value::Quaternion(text.parse::<Quaternion>().map_err(|error| self.bad_value("quaternion", error.to_string()))?)
            }
            ValueKind::Matrix => Value::Matrix(text.parse::<Matrix4>().map_err(|error| self.bad_value("matrix", error.to_string()))?),
        };
        Ok(value)
    }

    fn parse_scalar_array(&self, kind: ValueKind, items: Vec<String>) -> std::result::Result<Value, Kv2Error> {
        macro_rules! collect {
            ($variant:path, $inner:path) => {{
                let mut values = Vec::with_capacity(items.len());
                for item in &items {
                    match self.parse_scalar(kind, item)? {
                        $inner(value) => values.push(value),
                        _ => unreachable!("parse_scalar returns its own kind"),
                    }
                }
                $variant(values)
            }};
        }

        let value = match kind {
            ValueKind::Element => unreachable!("handled by the caller"),
            ValueKind::Int => collect!(Value::IntArray, Value::Int),
            ValueKind::Float => collect!(Value::FloatArray, Value::Float),
            ValueKind::Bool => collect!(Value::BoolArray, Value::Bool),
            ValueKind::String => collect!(Value::StringArray, Value::String),
            ValueKind::Binary => collect!(Value::BinaryArray, Value::Binary),
            ValueKind::Time => collect!(Value::TimeArray, Value::Time),
            ValueKind::Color => collect!(Value::ColorArray, Value::Color),
            ValueKind::Vector2 => collect!(Value::Vector2Array, Value::Vector2),
            ValueKind::Vector3 => collect!(Value::Vector3Array, Value::Vector3),
            ValueKind::Vector4 => collect!(Value::Vector4Array, Value::Vector4),
            ValueKind::Angle => collect!(Value::AngleArray, Value::Angle),
            ValueKind::Quaternion => collect!(Value::QuaternionArray, Value::Quaternion),
            ValueKind::Matrix => collect!(Value::MatrixArray, Value::Matrix),
        };
        Ok(value)
    }

    fn parse_hex(&self, text: &str) -> std::result::Result<Vec<u8>, Kv2Error> {
        let digits: Vec<char> = text.chars().filter(|character| !character.is_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return Err(self.bad_value("binary", "odd number of hex digits"));
        }
        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let high = pair[0]
                .to_digit(16)
                .ok_or_else(|| self.bad_value("binary", format!("'{}' is not a hex digit", pair[0])))?;
            let low = pair[1]
                .to_digit(16)
                .ok_or_else(|| self.bad_value("binary", format!("'{}' is not a hex digit", pair[1])))?;
            bytes.push((high * 16 + low) as u8);
        }
        Ok(bytes)
    }
}

fn decode_datamodel(header: &Header, source: &mut dyn BufRead) -> std::result::Result<Datamodel, Kv2Error> {
    let mut text = String::new();
    source.read_to_string(&mut text)?;

    let mut parser = Parser {
        tokens: Tokenizer::new(&text),
        elements: Vec::new(),
    };

    // Top-level blocks; the first is the root.
    let mut root = None;
    loop {
        let class = match parser.tokens.next_token()? {
            Some(Token::Text(text)) => text,
            Some(_) => return Err(Kv2Error::UnexpectedToken(parser.tokens.line, parser.tokens.column)),
            None => break,
        };
        parser.tokens.expect_open_brace()?;
        let id = parser.read_element_body(class)?;
        root.get_or_insert(id);
    }
    let root = root.ok_or(Kv2Error::NoElements)?;

    let mut datamodel = Datamodel::new(header.format.clone(), header.format_version);
    for parsed in &parser.elements {
        datamodel
            .create_element_with_id(parsed.class.clone(), parsed.name.clone(), parsed.id)
            .map_err(|_| Kv2Error::DuplicateElementId(parsed.id))?;
    }

    // Unresolved references become stubs for a resolver to back-fill.
    for parsed in &parser.elements {
        for (_, value) in &parsed.attributes {
            let referenced: Vec<UUID> = match value {
                Value::Element(Some(id)) => vec![*id],
                Value::ElementArray(array) => array.refs().iter().filter_map(|reference| *reference).collect(),
                _ => Vec::new(),
            };
            for id in referenced {
                if !datamodel.contains(id) {
                    datamodel
                        .create_stub(id)
                        .map_err(|_| Kv2Error::DuplicateElementId(id))?;
                }
            }
        }
    }

    for parsed in parser.elements {
        for (name, value) in parsed.attributes {
            datamodel
                .set(parsed.id, name, value)
                .map_err(|error| Kv2Error::Io(std::io::Error::other(error.to_string())))?;
        }
    }

    datamodel.set_root(root).expect("root was registered above");
    Ok(datamodel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeferredMode;
    use std::io::Cursor;

    fn round_trip(build: impl FnOnce(&mut Datamodel) -> UUID) -> Datamodel {
        let mut dm = Datamodel::new("model", 1);
        let root = build(&mut dm);
        dm.set_root(root).unwrap();

        let mut buffer = Vec::new();
        dm.save(&mut buffer, "keyvalues2", 1).unwrap();

        Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap()
    }

    #[test]
    fn tokenizer_reads_strings_braces_and_comments() {
        let mut tokens = Tokenizer::new("// a comment\n\"abc\" { \"d\\\"ef\" } [ ]");
        assert_eq!(tokens.next_token().unwrap(), Some(Token::Text("abc".to_string())));
        assert_eq!(tokens.next_token().unwrap(), Some(Token::OpenBrace));
        assert_eq!(tokens.next_token().unwrap(), Some(Token::Text("d\"ef".to_string())));
        assert_eq!(tokens.next_token().unwrap(), Some(Token::CloseBrace));
        assert_eq!(tokens.next_token().unwrap(), Some(Token::OpenBracket));
        assert_eq!(tokens.next_token().unwrap(), Some(Token::CloseBracket));
        assert_eq!(tokens.next_token().unwrap(), None);
    }

    #[test]
    fn tokenizer_rejects_bare_words() {
        let mut tokens = Tokenizer::new("naked");
        assert!(matches!(tokens.next_token(), Err(Kv2Error::UnknownToken('n', 1, 1))));
    }

    #[test]
    fn scalars_round_trip() {
        let loaded = round_trip(|dm| {
            let root = dm.create_element("DmeModel", "the root");
            dm.set(root, "int", 42).unwrap();
            dm.set(root, "float", 1.25f32).unwrap();
            dm.set(root, "flag", true).unwrap();
            dm.set(root, "label", "with \"quotes\" and \\slashes\\").unwrap();
            dm.set(root, "bytes", Binary::new(vec![0xDE, 0xAD, 0xBE, 0xEF])).unwrap();
            dm.set(root, "elapsed", Duration::from_secs_f64(12.5)).unwrap();
            dm.set(root, "tint", Color::new(0, 0, 255, 255)).unwrap();
            dm.set(root, "spin", Quaternion::new(0.1, 0.2, 0.3, 0.9)).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let element = loaded.element(root).unwrap();
        assert_eq!(element.name(), "the root");
        assert_eq!(*element.get::<i32>("int").unwrap(), 42);
        assert_eq!(*element.get::<f32>("float").unwrap(), 1.25);
        assert!(*element.get::<bool>("flag").unwrap());
        assert_eq!(element.get::<String>("label").unwrap(), "with \"quotes\" and \\slashes\\");
        assert_eq!(element.get::<Binary>("bytes").unwrap().0, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(*element.get::<Duration>("elapsed").unwrap(), Duration::from_secs_f64(12.5));
        assert_eq!(*element.get::<Color>("tint").unwrap(), Color::new(0, 0, 255, 255));
    }

    #[test]
    fn arrays_round_trip_in_order() {
        let loaded = round_trip(|dm| {
            let root = dm.create_element("DmeModel", "root");
            dm.set(root, "ints", vec![3, 1, 2]).unwrap();
            dm.set(root, "names", vec!["a".to_string(), "b, c".to_string()]).unwrap();
            dm.set(
                root,
                "points",
                vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(4.0, 5.0, 6.0)],
            )
            .unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let element = loaded.element(root).unwrap();
        assert_eq!(element.get_array::<i32>("ints").unwrap(), &[3, 1, 2]);
        assert_eq!(
            element.get_array::<String>("names").unwrap(),
            &["a".to_string(), "b, c".to_string()]
        );
        assert_eq!(
            element.get_array::<Vector3>("points").unwrap(),
            &[Vector3::new(1.0, 2.0, 3.0), Vector3::new(4.0, 5.0, 6.0)]
        );
    }

    #[test]
    fn shared_elements_are_written_once_and_relinked() {
        let loaded = round_trip(|dm| {
            let root = dm.create_element("DmeModel", "root");
            let shared = dm.create_element("DmeChild", "shared");
            let single = dm.create_element("DmeChild", "single");
            dm.set(root, "left", Value::Element(Some(shared))).unwrap();
            dm.set(root, "right", Value::Element(Some(shared))).unwrap();
            dm.set(root, "only", Value::Element(Some(single))).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let element = loaded.element(root).unwrap();
        let left = element.get::<Option<UUID>>("left").unwrap().unwrap();
        let right = element.get::<Option<UUID>>("right").unwrap().unwrap();
        assert_eq!(left, right);
        assert_eq!(loaded.element(left).unwrap().name(), "shared");

        let only = element.get::<Option<UUID>>("only").unwrap().unwrap();
        assert_eq!(loaded.element(only).unwrap().name(), "single");
        assert_eq!(loaded.element_count(), 3);
    }

    #[test]
    fn element_arrays_round_trip_with_nulls() {
        let loaded = round_trip(|dm| {
            let root = dm.create_element("DmeModel", "root");
            let a = dm.create_element("DmeChild", "a");
            let b = dm.create_element("DmeChild", "b");
            dm.set(root, "children", ElementArray::from_refs([Some(a), None, Some(b)])).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let children = loaded.element(root).unwrap().get::<ElementArray>("children").unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.get(1).unwrap().is_none());
        let a = children.get(0).unwrap().unwrap();
        let b = children.get(2).unwrap().unwrap();
        assert_eq!(loaded.element(a).unwrap().name(), "a");
        assert_eq!(loaded.element(b).unwrap().name(), "b");
    }

    #[test]
    fn unresolved_references_become_stubs() {
        let header = Header::new("keyvalues2", 1, "model", 1);
        let missing = UUID::new_v4();
        let text = format!(
            "{}\"DmeModel\"\n{{\n\t\"id\" \"elementid\" \"{}\"\n\t\"name\" \"string\" \"root\"\n\t\"other\" \"element\" \"{missing}\"\n}}\n",
            header.to_line(),
            UUID::new_v4(),
        );

        let loaded = Datamodel::load(&mut Cursor::new(text.into_bytes()), DeferredMode::Disabled).unwrap();
        let root = loaded.root().unwrap();
        let reference = loaded.element(root).unwrap().get::<Option<UUID>>("other").unwrap().unwrap();
        assert_eq!(reference, missing);
        assert!(loaded.element(reference).unwrap().is_stub());
    }

    #[test]
    fn duplicate_ids_in_stream_are_rejected() {
        let header = Header::new("keyvalues2", 1, "model", 1);
        let id = UUID::new_v4();
        let block = format!("\"DmeModel\"\n{{\n\t\"id\" \"elementid\" \"{id}\"\n}}\n");
        let text = format!("{}{block}{block}", header.to_line());

        let error = Datamodel::load(&mut Cursor::new(text.into_bytes()), DeferredMode::Disabled).unwrap_err();
        assert!(error.to_string().contains("twice"));
    }
}
