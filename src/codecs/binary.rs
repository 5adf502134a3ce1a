//! The binary DMX family, encoding versions 2 through 5.
//!
//! A string table precedes the element records from version 2 on; element
//! and attribute strings are stored as table indices. Version 4 widens the
//! table count to 32 bits and moves element names and string scalars into
//! the table; version 5 widens the indices themselves. Wire type 7 holds
//! the retired objectid kind below version 5 and time from version 5 on.
//!
//! Bulk payloads (fixed-stride arrays and binary blobs) can be left as
//! deferred offsets; the decoder then stays alive behind the datamodel's
//! codec binding and re-reads single attributes on demand.

use std::io::{BufRead, Write};
use std::time::Duration;

use indexmap::IndexSet;
use log::trace;
use thiserror::Error as ThisError;
use uuid::Uuid as UUID;

use crate::attribute::{Value, ValueKind};
use crate::codec::{Codec, CodecBinding, DeferredDecoder, DeferredMode, Header};
use crate::datamodel::Datamodel;
use crate::element::ElementArray;
use crate::error::{CodecSourceError, DmError, Result};
use crate::values::{Angle, Binary, Color, Matrix4, Quaternion, Vector2, Vector3, Vector4};

/// Encoding versions this codec is registered under.
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<i32> = 2..=5;

/// Payloads at least this large stay deferred in automatic mode.
const AUTO_DEFER_BYTES: usize = 256;

#[derive(Debug, ThisError)]
pub enum BinaryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected end of stream at offset {0}")]
    UnexpectedEof(u64),
    #[error("too many elements to serialize")]
    TooManyElements,
    #[error("too many strings to serialize")]
    TooManyStrings,
    #[error("element has too many attributes to serialize")]
    TooManyAttributes,
    #[error("attribute payload too long")]
    PayloadTooLong,
    #[error("encoding version {0} is outside the supported range")]
    UnsupportedVersion(i32),
    #[error("time attributes require encoding version 5")]
    TimeUnsupported,
    #[error("objectid attributes are not supported")]
    ObjectIdUnsupported,
    #[error("string index {0} is out of range")]
    InvalidStringIndex(i32),
    #[error("string \"{0}\" missing from the string table")]
    StringNotInTable(String),
    #[error("element index {0} is out of range")]
    InvalidElementIndex(i32),
    #[error("element id {0} appears twice in the stream")]
    DuplicateElementId(UUID),
    #[error("wire type {0} is not a valid attribute type")]
    InvalidAttributeType(i8),
    #[error("offset {0} does not point at a deferrable attribute")]
    InvalidDeferredOffset(u64),
}

pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encoding(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, datamodel: &Datamodel, header: &Header, sink: &mut dyn Write) -> Result<()> {
        encode_datamodel(datamodel, header, sink).map_err(|error| match error {
            BinaryError::TimeUnsupported => DmError::type_mismatch("a kind serializable below binary version 5", "time"),
            BinaryError::Io(io) => DmError::Io(io),
            other => DmError::Codec {
                codec: "binary".to_string(),
                source: Box::new(other),
            },
        })
    }

    fn decode(&self, header: &Header, source: &mut dyn BufRead, mode: DeferredMode) -> Result<Datamodel> {
        decode_datamodel(header, source, mode).map_err(|error| match error {
            BinaryError::Io(io) => DmError::Io(io),
            other => DmError::Codec {
                codec: "binary".to_string(),
                source: Box::new(other),
            },
        })
    }
}

// ---- writer ----------------------------------------------------------

struct BinaryWriter<'a> {
    sink: &'a mut dyn Write,
    version: i32,
    string_table: IndexSet<String>,
}

impl<'a> BinaryWriter<'a> {
    fn new(sink: &'a mut dyn Write, version: i32) -> Self {
        Self {
            sink,
            version,
            string_table: IndexSet::new(),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> std::result::Result<(), BinaryError> {
        self.sink.write_all(bytes)?;
        Ok(())
    }

    fn write_i8(&mut self, value: i8) -> std::result::Result<(), BinaryError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_i16(&mut self, value: i16) -> std::result::Result<(), BinaryError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_i32(&mut self, value: i32) -> std::result::Result<(), BinaryError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_f32(&mut self, value: f32) -> std::result::Result<(), BinaryError> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_length(&mut self, value: usize) -> std::result::Result<(), BinaryError> {
        if value > i32::MAX as usize {
            return Err(BinaryError::PayloadTooLong);
        }
        self.write_i32(value as i32)
    }

    fn write_cstring(&mut self, value: &str) -> std::result::Result<(), BinaryError> {
        self.write_bytes(value.as_bytes())?;
        self.write_bytes(&[0])
    }

    fn write_uuid(&mut self, value: UUID) -> std::result::Result<(), BinaryError> {
        self.write_bytes(&value.to_bytes_le())
    }

    fn write_time(&mut self, value: &Duration) -> std::result::Result<(), BinaryError> {
        self.write_i32((value.as_secs_f64() * 10_000f64) as i32)
    }

    fn add_string(&mut self, value: &str) {
        self.string_table.insert(value.to_string());
    }

    fn write_string_table(&mut self) -> std::result::Result<(), BinaryError> {
        if self.version >= 4 {
            if self.string_table.len() > i32::MAX as usize {
                return Err(BinaryError::TooManyStrings);
            }
            self.write_i32(self.string_table.len() as i32)?;
        } else {
            if self.string_table.len() > i16::MAX as usize {
                return Err(BinaryError::TooManyStrings);
            }
            self.write_i16(self.string_table.len() as i16)?;
        }

        let strings: Vec<String> = self.string_table.iter().cloned().collect();
        for string in strings {
            self.write_cstring(&string)?;
        }
        Ok(())
    }

    fn write_string_index(&mut self, value: &str) -> std::result::Result<(), BinaryError> {
        let index = self
            .string_table
            .get_index_of(value)
            .ok_or_else(|| BinaryError::StringNotInTable(value.to_string()))?;
        if self.version >= 5 {
            self.write_i32(index as i32)
        } else {
            self.write_i16(index as i16)
        }
    }

    /// A scalar string value: table-indexed from version 4, inline before.
    fn write_scalar_string(&mut self, value: &str) -> std::result::Result<(), BinaryError> {
        if self.version >= 4 {
            self.write_string_index(value)
        } else {
            self.write_cstring(value)
        }
    }
}

fn encode_datamodel(datamodel: &Datamodel, header: &Header, sink: &mut dyn Write) -> std::result::Result<(), BinaryError> {
    let version = header.encoding_version;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(BinaryError::UnsupportedVersion(version));
    }

    let root = datamodel.root().expect("save checks the root");
    let collected = collect_elements(datamodel, root);
    if collected.len() > i32::MAX as usize {
        return Err(BinaryError::TooManyElements);
    }

    let mut writer = BinaryWriter::new(sink, version);
    writer.write_cstring(header.to_line().as_str())?;

    for &id in &collected {
        let element = datamodel.element(id).expect("collected from this datamodel");
        writer.add_string(element.class());
        if version >= 4 {
            writer.add_string(element.name());
        }
        for (name, attribute) in element.attributes() {
            writer.add_string(name);
            if version >= 4 {
                if let Some(Value::String(value)) = attribute.value() {
                    writer.add_string(value);
                }
            }
        }
    }
    writer.write_string_table()?;

    writer.write_i32(collected.len() as i32)?;
    for &id in &collected {
        let element = datamodel.element(id).expect("collected from this datamodel");
        writer.write_string_index(element.class())?;
        if version >= 4 {
            writer.write_string_index(element.name())?;
        } else {
            writer.write_cstring(element.name())?;
        }
        writer.write_uuid(id)?;
    }

    for &id in &collected {
        let element = datamodel.element(id).expect("collected from this datamodel");
        if element.attribute_count() > i32::MAX as usize {
            return Err(BinaryError::TooManyAttributes);
        }
        writer.write_i32(element.attribute_count() as i32)?;

        for (name, attribute) in element.attributes() {
            let value = attribute.value().expect("save materializes everything");
            writer.write_string_index(name)?;
            writer.write_i8(value.kind().wire_id(value.is_array()))?;
            write_value(&mut writer, &collected, value)?;
        }
    }

    Ok(())
}

/// Depth-first walk from the root, root first. Stubs stay out of the
/// element list; references to them are written as external GUIDs.
fn collect_elements(datamodel: &Datamodel, root: UUID) -> IndexSet<UUID> {
    let mut collected = IndexSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(element) = datamodel.element(id) else { continue };
        if element.is_stub() || !collected.insert(id) {
            continue;
        }
        for referenced in element.referenced_elements() {
            if !collected.contains(&referenced) {
                stack.push(referenced);
            }
        }
    }
    collected
}

fn write_element_ref(
    writer: &mut BinaryWriter<'_>,
    collected: &IndexSet<UUID>,
    reference: Option<UUID>,
) -> std::result::Result<(), BinaryError> {
    match reference {
        None => writer.write_i32(-1),
        Some(id) => match collected.get_index_of(&id) {
            Some(index) => writer.write_i32(index as i32),
            None => {
                // Stub or dangling: keep the identity as an external GUID.
                writer.write_i32(-2)?;
                writer.write_uuid(id)
            }
        },
    }
}

fn write_value(writer: &mut BinaryWriter<'_>, collected: &IndexSet<UUID>, value: &Value) -> std::result::Result<(), BinaryError> {
    match value {
        Value::Element(reference) => write_element_ref(writer, collected, *reference)?,
        Value::Int(value) => writer.write_i32(*value)?,
        Value::Float(value) => writer.write_f32(*value)?,
        Value::Bool(value) => writer.write_i8(*value as i8)?,
        Value::String(value) => writer.write_scalar_string(value)?,
        Value::Binary(value) => {
            writer.write_length(value.0.len())?;
            writer.write_bytes(&value.0)?;
        }
        Value::Time(value) => {
            if writer.version < 5 {
                return Err(BinaryError::TimeUnsupported);
            }
            writer.write_time(value)?;
        }
        Value::Color(value) => writer.write_bytes(&[value.r, value.g, value.b, value.a])?,
        Value::Vector2(value) => write_floats(writer, &value.components())?,
        Value::Vector3(value) => write_floats(writer, &value.components())?,
        Value::Vector4(value) => write_floats(writer, &value.components())?,
        Value::Angle(value) => write_floats(writer, &value.components())?,
        Value::Quaternion(value) => write_floats(writer, &value.components())?,
        Value::Matrix(value) => write_floats(writer, &value.components())?,

        Value::ElementArray(array) => {
            writer.write_length(array.len())?;
            for reference in array.iter() {
                write_element_ref(writer, collected, *reference)?;
            }
        }
        Value::IntArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_i32(*value)?;
            }
        }
        Value::FloatArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_f32(*value)?;
            }
        }
        Value::BoolArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_i8(*value as i8)?;
            }
        }
        Value::StringArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_cstring(value)?;
            }
        }
        Value::BinaryArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_length(value.0.len())?;
                writer.write_bytes(&value.0)?;
            }
        }
        Value::TimeArray(values) => {
            if writer.version < 5 {
                return Err(BinaryError::TimeUnsupported);
            }
            writer.write_length(values.len())?;
            for value in values {
                writer.write_time(value)?;
            }
        }
        Value::ColorArray(values) => {
            writer.write_length(values.len())?;
            for value in values {
                writer.write_bytes(&[value.r, value.g, value.b, value.a])?;
            }
        }
        Value::Vector2Array(values) => write_float_structs(writer, values.iter().map(Vector2::components))?,
        Value::Vector3Array(values) => write_float_structs(writer, values.iter().map(Vector3::components))?,
        Value::Vector4Array(values) => write_float_structs(writer, values.iter().map(Vector4::components))?,
        Value::AngleArray(values) => write_float_structs(writer, values.iter().map(Angle::components))?,
        Value::QuaternionArray(values) => write_float_structs(writer, values.iter().map(Quaternion::components))?,
        Value::MatrixArray(values) => write_float_structs(writer, values.iter().map(Matrix4::components))?,
    }
    Ok(())
}

fn write_floats(writer: &mut BinaryWriter<'_>, components: &[f32]) -> std::result::Result<(), BinaryError> {
    for component in components {
        writer.write_f32(*component)?;
    }
    Ok(())
}

fn write_float_structs<const N: usize>(
    writer: &mut BinaryWriter<'_>,
    items: impl ExactSizeIterator<Item = [f32; N]>,
) -> std::result::Result<(), BinaryError> {
    writer.write_length(items.len())?;
    for item in items {
        write_floats(writer, &item)?;
    }
    Ok(())
}

// ---- reader ----------------------------------------------------------

struct BinaryReader {
    data: Vec<u8>,
    pos: usize,
    version: i32,
    string_table: Vec<String>,
}

impl BinaryReader {
    fn new(data: Vec<u8>, version: i32) -> Self {
        Self {
            data,
            pos: 0,
            version,
            string_table: Vec::new(),
        }
    }

    fn take(&mut self, count: usize) -> std::result::Result<&[u8], BinaryError> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or(BinaryError::UnexpectedEof(self.pos as u64))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, count: usize) -> std::result::Result<(), BinaryError> {
        self.take(count).map(|_| ())
    }

    fn read_u8(&mut self) -> std::result::Result<u8, BinaryError> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> std::result::Result<i8, BinaryError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn read_i16(&mut self) -> std::result::Result<i16, BinaryError> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> std::result::Result<i32, BinaryError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> std::result::Result<f32, BinaryError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_count(&mut self) -> std::result::Result<usize, BinaryError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(BinaryError::InvalidElementIndex(count));
        }
        Ok(count as usize)
    }

    fn read_cstring(&mut self) -> std::result::Result<String, BinaryError> {
        let start = self.pos;
        let terminator = self.data[start..]
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(BinaryError::UnexpectedEof(start as u64))?;
        let string = String::from_utf8_lossy(&self.data[start..start + terminator]).into_owned();
        self.pos = start + terminator + 1;
        Ok(string)
    }

    fn read_uuid(&mut self) -> std::result::Result<UUID, BinaryError> {
        let bytes = self.take(16)?;
        let mut buffer = [0u8; 16];
        buffer.copy_from_slice(bytes);
        Ok(UUID::from_bytes_le(buffer))
    }

    fn read_time(&mut self) -> std::result::Result<Duration, BinaryError> {
        let ticks = self.read_i32()?;
        Ok(Duration::from_secs_f64(ticks as f64 / 10_000f64))
    }

    fn read_string_table(&mut self) -> std::result::Result<(), BinaryError> {
        let count = if self.version >= 4 {
            self.read_i32()?
        } else {
            self.read_i16()? as i32
        };
        if count < 0 {
            return Err(BinaryError::InvalidStringIndex(count));
        }
        let mut strings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            strings.push(self.read_cstring()?);
        }
        self.string_table = strings;
        Ok(())
    }

    fn read_string_index(&mut self) -> std::result::Result<String, BinaryError> {
        let index = if self.version >= 5 {
            self.read_i32()?
        } else {
            self.read_i16()? as i32
        };
        if index == -1 {
            return Ok("unnamed".to_string());
        }
        self.string_table
            .get(index as usize)
            .cloned()
            .ok_or(BinaryError::InvalidStringIndex(index))
    }

    /// A scalar string value: table-indexed from version 4, inline before.
    fn read_scalar_string(&mut self) -> std::result::Result<String, BinaryError> {
        if self.version >= 4 {
            self.read_string_index()
        } else {
            self.read_cstring()
        }
    }
}

/// Fixed payload stride for kinds whose arrays can be skipped and
/// re-read later. Strings and element references are not deferrable.
fn fixed_stride(kind: ValueKind) -> Option<usize> {
    match kind {
        ValueKind::Int | ValueKind::Float | ValueKind::Time | ValueKind::Color => Some(4),
        ValueKind::Bool => Some(1),
        ValueKind::Vector2 => Some(8),
        ValueKind::Vector3 | ValueKind::Angle => Some(12),
        ValueKind::Vector4 | ValueKind::Quaternion => Some(16),
        ValueKind::Matrix => Some(64),
        ValueKind::Element | ValueKind::String | ValueKind::Binary => None,
    }
}

fn decode_datamodel(header: &Header, source: &mut dyn BufRead, mode: DeferredMode) -> std::result::Result<Datamodel, BinaryError> {
    let version = header.encoding_version;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(BinaryError::UnsupportedVersion(version));
    }

    let mut data = Vec::new();
    source.read_to_end(&mut data)?;

    let mut reader = BinaryReader::new(data, version);
    // The header line is null terminated on the wire; the newline was
    // already consumed by the sniffer.
    reader.read_u8()?;

    reader.read_string_table()?;

    let element_count = reader.read_count()?;
    let mut datamodel = Datamodel::new(header.format.clone(), header.format_version);
    let mut ids = Vec::with_capacity(element_count);

    for _ in 0..element_count {
        let class = reader.read_string_index()?;
        let name = if version >= 4 {
            reader.read_string_index()?
        } else {
            reader.read_cstring()?
        };
        let id = reader.read_uuid()?;
        datamodel
            .create_element_with_id(class, name, id)
            .map_err(|_| BinaryError::DuplicateElementId(id))?;
        ids.push(id);
    }

    for &element in &ids {
        let attribute_count = reader.read_count()?;
        for _ in 0..attribute_count {
            let name = reader.read_string_index()?;
            let type_offset = reader.pos as u64;
            let type_id = reader.read_i8()?;
            let (kind, array) = ValueKind::from_wire_id(type_id).ok_or(BinaryError::InvalidAttributeType(type_id))?;

            if kind == ValueKind::Time && version < 5 {
                return Err(BinaryError::ObjectIdUnsupported);
            }

            if let Some(length) = deferrable_length(&mut reader, kind, array, mode)? {
                trace!("deferring \"{name}\" ({length} bytes) at offset {type_offset}");
                reader.skip(length)?;
                datamodel
                    .set_deferred(element, name, type_offset)
                    .map_err(|error| BinaryError::Io(std::io::Error::other(error.to_string())))?;
                continue;
            }

            let value = read_value(&mut reader, &mut datamodel, &ids, kind, array)?;
            datamodel
                .set(element, name, value)
                .map_err(|error| BinaryError::Io(std::io::Error::other(error.to_string())))?;
        }
    }

    if let Some(&root) = ids.first() {
        datamodel.set_root(root).expect("root was registered above");
    }

    datamodel.bind_codec(CodecBinding::new("binary", version, Box::new(BinaryDeferredDecoder { reader })));
    Ok(datamodel)
}

/// Decide whether the payload under the cursor is deferrable in the given
/// mode; returns the byte length to skip if so. The cursor is left just
/// past the type byte either way.
fn deferrable_length(
    reader: &mut BinaryReader,
    kind: ValueKind,
    array: bool,
    mode: DeferredMode,
) -> std::result::Result<Option<usize>, BinaryError> {
    if mode == DeferredMode::Disabled {
        return Ok(None);
    }

    let start = reader.pos;
    let length = match (kind, array) {
        (ValueKind::Binary, false) => {
            let length = reader.read_count()?;
            Some(length)
        }
        (ValueKind::Binary, true) => {
            // Walk the items once to measure, then rewind to just past the
            // outer count so the skip below lands at the payload end.
            let items = reader.read_count()?;
            let mut total = 0usize;
            for _ in 0..items {
                let item_start = reader.pos;
                let length = reader.read_count()?;
                reader.skip(length)?;
                total += reader.pos - item_start;
            }
            reader.pos = start;
            let _ = reader.read_count()?;
            Some(total)
        }
        (kind, true) => match fixed_stride(kind) {
            Some(stride) => {
                let items = reader.read_count()?;
                Some(items * stride)
            }
            None => None,
        },
        _ => None,
    };

    let Some(length) = length else {
        reader.pos = start;
        return Ok(None);
    };

    let keep = match mode {
        DeferredMode::Always => true,
        DeferredMode::Automatic => length >= AUTO_DEFER_BYTES,
        DeferredMode::Disabled => false,
    };

    if keep {
        // Skip from just past the length prefix for sized payloads.
        Ok(Some(length))
    } else {
        reader.pos = start;
        Ok(None)
    }
}

fn read_element_ref(
    reader: &mut BinaryReader,
    datamodel: &mut Datamodel,
    ids: &[UUID],
) -> std::result::Result<Option<UUID>, BinaryError> {
    let index = reader.read_i32()?;
    match index {
        -1 => Ok(None),
        -2 => {
            let id = reader.read_uuid()?;
            if !datamodel.contains(id) {
                datamodel
                    .create_stub(id)
                    .map_err(|_| BinaryError::InvalidElementIndex(index))?;
            }
            Ok(Some(id))
        }
        _ => ids
            .get(index as usize)
            .copied()
            .map(Some)
            .ok_or(BinaryError::InvalidElementIndex(index)),
    }
}

fn read_value(
    reader: &mut BinaryReader,
    datamodel: &mut Datamodel,
    ids: &[UUID],
    kind: ValueKind,
    array: bool,
) -> std::result::Result<Value, BinaryError> {
    if !array {
        let value = match kind {
            ValueKind::Element => Value::Element(read_element_ref(reader, datamodel, ids)?),
            ValueKind::Int => Value::Int(reader.read_i32()?),
            ValueKind::Float => Value::Float(reader.read_f32()?),
            ValueKind::Bool => Value::Bool(reader.read_u8()? != 0),
            ValueKind::String => Value::String(reader.read_scalar_string()?),
            ValueKind::Binary => {
                let length = reader.read_count()?;
                Value::Binary(Binary::new(reader.take(length)?.to_vec()))
            }
            ValueKind::Time => Value::Time(reader.read_time()?),
            ValueKind::Color => {
                let bytes = reader.take(4)?;
                Value::Color(Color::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            }
            ValueKind::Vector2 => Value::Vector2(Vector2::new(reader.read_f32()?, reader.read_f32()?)),
            ValueKind::Vector3 => Value::Vector3(Vector3::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?)),
            ValueKind::Vector4 => Value::Vector4(Vector4::new(
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
            )),
            ValueKind::Angle => Value::Angle(Angle::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?)),
            ValueKind::Quaternion => Value::Quaternion(Quaternion::new(
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
            )),
            ValueKind::Matrix => Value::Matrix(read_matrix(reader)?),
        };
        return Ok(value);
    }

    let count = reader.read_count()?;
    let value = match kind {
        ValueKind::Element => {
            let mut references = ElementArray::new();
            for _ in 0..count {
                references.push(read_element_ref(reader, datamodel, ids)?);
            }
            Value::ElementArray(references)
        }
        ValueKind::Int => Value::IntArray(read_items(count, || reader.read_i32())?),
        ValueKind::Float => Value::FloatArray(read_items(count, || reader.read_f32())?),
        ValueKind::Bool => Value::BoolArray(read_items(count, || Ok(reader.read_u8()? != 0))?),
        ValueKind::String => Value::StringArray(read_items(count, || reader.read_cstring())?),
        ValueKind::Binary => Value::BinaryArray(read_items(count, || {
            let length = reader.read_count()?;
            Ok(Binary::new(reader.take(length)?.to_vec()))
        })?),
        ValueKind::Time => Value::TimeArray(read_items(count, || reader.read_time())?),
        ValueKind::Color => Value::ColorArray(read_items(count, || {
            let bytes = reader.take(4)?;
            Ok(Color::new(bytes[0], bytes[1], bytes[2], bytes[3]))
        })?),
        ValueKind::Vector2 => Value::Vector2Array(read_items(count, || Ok(Vector2::new(reader.read_f32()?, reader.read_f32()?)))?),
        ValueKind::Vector3 => Value::Vector3Array(read_items(count, || {
            Ok(Vector3::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?))
        })?),
        ValueKind::Vector4 => Value::Vector4Array(read_items(count, || {
            Ok(Vector4::new(
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
            ))
        })?),
        ValueKind::Angle => Value::AngleArray(read_items(count, || {
            Ok(Angle::new(reader.read_f32()?, reader.read_f32()?, reader.read_f32()?))
        })?),
        ValueKind::Quaternion => Value::QuaternionArray(read_items(count, || {
            Ok(Quaternion::new(
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
                reader.read_f32()?,
            ))
        })?),
        ValueKind::Matrix => Value::MatrixArray(read_items(count, || read_matrix(reader))?),
    };
    Ok(value)
}

fn read_items<T>(
    count: usize,
    mut read_one: impl FnMut() -> std::result::Result<T, BinaryError>,
) -> std::result::Result<Vec<T>, BinaryError> {
    let mut items = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        items.push(read_one()?);
    }
    Ok(items)
}

fn read_matrix(reader: &mut BinaryReader) -> std::result::Result<Matrix4, BinaryError> {
    let mut rows = [[0.0f32; 4]; 4];
    for row in &mut rows {
        for entry in row.iter_mut() {
            *entry = reader.read_f32()?;
        }
    }
    Ok(Matrix4(rows))
}

// ---- deferred decoding -----------------------------------------------

struct BinaryDeferredDecoder {
    reader: BinaryReader,
}

impl DeferredDecoder for BinaryDeferredDecoder {
    fn decode_deferred(&mut self, offset: u64) -> std::result::Result<Value, CodecSourceError> {
        if offset == 0 || offset as usize >= self.reader.data.len() {
            return Err(Box::new(BinaryError::InvalidDeferredOffset(offset)));
        }

        self.reader.pos = offset as usize;
        let type_id = self.reader.read_i8()?;
        let (kind, array) = ValueKind::from_wire_id(type_id).ok_or(BinaryError::InvalidAttributeType(type_id))?;
        if fixed_stride(kind).is_none() && kind != ValueKind::Binary {
            return Err(Box::new(BinaryError::InvalidDeferredOffset(offset)));
        }

        // Deferred payloads never hold element references, so no datamodel
        // or element list is needed here.
        let mut scratch = Datamodel::new("", 0);
        let value = read_value(&mut self.reader, &mut scratch, &[], kind, array)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(version: i32, mode: DeferredMode, build: impl FnOnce(&mut Datamodel) -> UUID) -> Datamodel {
        let mut dm = Datamodel::new("model", 1);
        let root = build(&mut dm);
        dm.set_root(root).unwrap();

        let mut buffer = Vec::new();
        dm.save(&mut buffer, "binary", version).unwrap();

        let mut reader = Cursor::new(buffer);
        Datamodel::load(&mut reader, mode).unwrap()
    }

    #[test]
    fn scalar_round_trip_across_versions() {
        for version in SUPPORTED_VERSIONS {
            let loaded = round_trip(version, DeferredMode::Disabled, |dm| {
                let root = dm.create_element("DmeModel", "root");
                dm.set(root, "int", 42).unwrap();
                dm.set(root, "float", 1.5f32).unwrap();
                dm.set(root, "bool", true).unwrap();
                dm.set(root, "string", "hello world").unwrap();
                dm.set(root, "vector", crate::values::Vector3::new(1.0, 2.0, 3.0)).unwrap();
                root
            });

            let root = loaded.root().unwrap();
            let element = loaded.element(root).unwrap();
            assert_eq!(*element.get::<i32>("int").unwrap(), 42, "version {version}");
            assert_eq!(*element.get::<f32>("float").unwrap(), 1.5);
            assert!(*element.get::<bool>("bool").unwrap());
            assert_eq!(element.get::<String>("string").unwrap(), "hello world");
        }
    }

    #[test]
    fn root_guid_is_preserved() {
        let mut dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmeModel", "root");
        dm.set_root(root).unwrap();

        let mut buffer = Vec::new();
        dm.save(&mut buffer, "binary", 5).unwrap();
        let loaded = Datamodel::load(&mut Cursor::new(buffer), DeferredMode::Disabled).unwrap();
        assert_eq!(loaded.root(), Some(root));
    }

    #[test]
    fn element_graph_round_trips_with_null_and_shared_refs() {
        let loaded = round_trip(5, DeferredMode::Disabled, |dm| {
            let root = dm.create_element("DmeModel", "root");
            let shared = dm.create_element("DmeChild", "shared");
            dm.set(root, "first", Value::Element(Some(shared))).unwrap();
            dm.set(root, "second", Value::Element(Some(shared))).unwrap();
            dm.set(root, "nothing", Value::Element(None)).unwrap();
            dm.set(
                root,
                "children",
                ElementArray::from_refs([Some(shared), None]),
            )
            .unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let element = loaded.element(root).unwrap();
        let first = element.get::<Option<UUID>>("first").unwrap().unwrap();
        let second = element.get::<Option<UUID>>("second").unwrap().unwrap();
        assert_eq!(first, second);
        assert!(element.get::<Option<UUID>>("nothing").unwrap().is_none());

        let children = element.get::<ElementArray>("children").unwrap();
        assert_eq!(children.refs(), &[Some(first), None]);
    }

    #[test]
    fn stub_references_survive_as_guids() {
        let external = UUID::new_v4();
        let loaded = round_trip(5, DeferredMode::Disabled, |dm| {
            let root = dm.create_element("DmeModel", "root");
            dm.create_stub(external).unwrap();
            dm.set(root, "external", Value::Element(Some(external))).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        let reference = loaded.element(root).unwrap().get::<Option<UUID>>("external").unwrap().unwrap();
        assert_eq!(reference, external);
        assert!(loaded.element(external).unwrap().is_stub());
    }

    #[test]
    fn time_is_rejected_below_version_five() {
        let mut dm = Datamodel::new("model", 1);
        let root = dm.create_element("DmeModel", "root");
        dm.set(root, "duration", Duration::from_secs(300)).unwrap();
        dm.set_root(root).unwrap();

        let mut buffer = Vec::new();
        assert!(matches!(
            dm.save(&mut buffer, "binary", 4),
            Err(DmError::AttributeType { .. })
        ));

        let mut buffer = Vec::new();
        dm.save(&mut buffer, "binary", 5).unwrap();
    }

    #[test]
    fn large_arrays_defer_and_load_once() {
        let values: Vec<f32> = (0..512).map(|i| i as f32).collect();
        let mut loaded = round_trip(5, DeferredMode::Automatic, |dm| {
            let root = dm.create_element("DmeModel", "root");
            dm.set(root, "samples", values.clone()).unwrap();
            dm.set(root, "small", vec![1, 2, 3]).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        assert!(loaded.element(root).unwrap().attribute("samples").unwrap().is_deferred());
        assert!(!loaded.element(root).unwrap().attribute("small").unwrap().is_deferred());

        let value = loaded.get(root, "samples").unwrap();
        match value {
            Value::FloatArray(decoded) => assert_eq!(decoded, values),
            other => panic!("expected a float array, got {other:?}"),
        }
        assert_eq!(loaded.element(root).unwrap().attribute("samples").unwrap().offset(), 0);

        // A second access works even with the codec gone, proving the
        // first access was the only decode.
        loaded.release_codec();
        assert!(loaded.get(root, "samples").is_ok());
    }

    #[test]
    fn always_mode_defers_small_payloads_too() {
        let mut loaded = round_trip(5, DeferredMode::Always, |dm| {
            let root = dm.create_element("DmeModel", "root");
            dm.set(root, "bytes", Binary::new(vec![1, 2, 3, 4])).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        assert!(loaded.element(root).unwrap().attribute("bytes").unwrap().is_deferred());
        match loaded.get(root, "bytes").unwrap() {
            Value::Binary(binary) => assert_eq!(binary.0, vec![1, 2, 3, 4]),
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn released_codec_fails_deferred_access_and_keeps_state() {
        let mut loaded = round_trip(5, DeferredMode::Always, |dm| {
            let root = dm.create_element("DmeModel", "root");
            dm.set(root, "samples", vec![1.0f32, 2.0]).unwrap();
            root
        });

        let root = loaded.root().unwrap();
        loaded.release_codec();
        let error = loaded.get(root, "samples").unwrap_err();
        assert!(matches!(error, DmError::DeferredLoad { .. }));
        assert!(error.to_string().contains("disposed"));

        // The failure left the attribute deferred for a later retry.
        assert!(loaded.element(root).unwrap().attribute("samples").unwrap().is_deferred());
    }
}
