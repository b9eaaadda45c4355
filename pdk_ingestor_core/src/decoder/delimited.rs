//! Delimited text decoding.
//!
//! Frames are split into complete records by a quote-aware scanner before
//! they are parsed, so a frame decodes to the same records whether it arrives
//! in one piece or in arbitrary chunks.
use bytes::BytesMut;
use pdk_schema::{FieldSpec, LogicalType, SchemaDescriptor, SchemaDescriptorRef};

use crate::{
    error::DecodeError,
    record::{Record, Value},
};

const QUOTE: u8 = b'"';
const NEWLINE: u8 = b'\n';

/// Where field names come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// The first row of every frame holds the field names.
    FirstRow,
    /// Fields are named by position. A header row, if any, is skipped.
    Positional { names: Vec<String>, skip_first_row: bool },
}

#[derive(Debug, Clone)]
pub struct DelimitedOptions {
    pub delimiter: u8,
    pub header: Header,
}

#[derive(Debug, Clone)]
pub struct DelimitedDecoder {
    descriptor: SchemaDescriptorRef,
    options: DelimitedOptions,
}

/// Decoding state of a single frame.
pub struct DelimitedFrame<'a> {
    decoder: &'a DelimitedDecoder,
    names: Option<Vec<String>>,
    skip_rows: usize,
    pending: BytesMut,
    scanned: usize,
    in_quotes: bool,
}

impl Default for DelimitedOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            header: Header::FirstRow,
        }
    }
}

impl DelimitedDecoder {
    pub fn new(descriptor: SchemaDescriptorRef, options: DelimitedOptions) -> Self {
        Self {
            descriptor,
            options,
        }
    }

    pub fn descriptor(&self) -> &SchemaDescriptorRef {
        &self.descriptor
    }

    /// Starts decoding a new frame.
    pub fn frame(&self) -> DelimitedFrame<'_> {
        let (names, skip_rows) = match &self.options.header {
            Header::FirstRow => (None, 0),
            Header::Positional {
                names,
                skip_first_row,
            } => (Some(names.clone()), usize::from(*skip_first_row)),
        };

        DelimitedFrame {
            decoder: self,
            names,
            skip_rows,
            pending: BytesMut::new(),
            scanned: 0,
            in_quotes: false,
        }
    }

    /// Decodes a whole frame.
    pub fn decode(&self, data: &[u8]) -> Vec<Result<Record, DecodeError>> {
        let mut frame = self.frame();
        let mut records = frame.push(data);
        records.extend(frame.finish());
        records
    }

    /// Encodes records as a frame, header row first.
    ///
    /// Columns follow the positional names, or the sorted field names of all
    /// records when names come from the header row.
    pub fn encode(&self, records: &[Record]) -> Result<Vec<u8>, DecodeError> {
        let names = match &self.options.header {
            Header::Positional { names, .. } => names.clone(),
            Header::FirstRow => {
                let mut names: Vec<String> = records
                    .iter()
                    .flat_map(|r| r.iter().map(|(name, _)| name.clone()))
                    .collect();
                names.sort();
                names.dedup();
                names
            }
        };

        let encode_err = |err: csv::Error| DecodeError::Encode {
            message: err.to_string(),
        };

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.options.delimiter)
            .from_writer(Vec::new());
        let write_header = match &self.options.header {
            Header::FirstRow => true,
            Header::Positional { skip_first_row, .. } => *skip_first_row,
        };
        if write_header {
            writer.write_record(&names).map_err(encode_err)?;
        }

        for record in records {
            let cells = names
                .iter()
                .map(|name| encode_cell(name, record.value(name)))
                .collect::<Result<Vec<_>, _>>()?;
            writer.write_record(&cells).map_err(encode_err)?;
        }

        writer.into_inner().map_err(|err| DecodeError::Encode {
            message: err.to_string(),
        })
    }

    fn record(&self, names: &[String], row: &csv::ByteRecord) -> Result<Record, DecodeError> {
        if row.len() > names.len() {
            return Err(DecodeError::Malformed {
                message: format!("row has {} fields, expected {}", row.len(), names.len()),
            });
        }

        let mut record = Record::new();
        for (name, cell) in names.iter().zip(row.iter()) {
            let cell = std::str::from_utf8(cell).map_err(|_| DecodeError::Malformed {
                message: format!("field {name} is not valid UTF-8"),
            })?;
            let field = self.descriptor.field(name).map(|f| f.as_ref());
            record.insert(name.clone(), coerce(field, cell));
        }

        Ok(record)
    }
}

impl DelimitedFrame<'_> {
    /// Adds a chunk of the frame, returning the records it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Record, DecodeError>> {
        self.pending.extend_from_slice(chunk);

        let mut boundary = None;
        for (i, byte) in self.pending.iter().enumerate().skip(self.scanned) {
            match *byte {
                QUOTE => self.in_quotes = !self.in_quotes,
                NEWLINE if !self.in_quotes => boundary = Some(i + 1),
                _ => {}
            }
        }
        self.scanned = self.pending.len();

        let Some(boundary) = boundary else {
            return Vec::new();
        };

        let complete = self.pending.split_to(boundary);
        self.scanned -= boundary;
        self.parse(&complete)
    }

    /// Decodes the trailing record, if the frame does not end with a newline.
    pub fn finish(mut self) -> Vec<Result<Record, DecodeError>> {
        let rest = std::mem::take(&mut self.pending);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Vec::new();
        }
        self.parse(&rest)
    }

    fn parse(&mut self, data: &[u8]) -> Vec<Result<Record, DecodeError>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.decoder.options.delimiter)
            .from_reader(data);

        let mut records = Vec::new();
        let mut row = csv::ByteRecord::new();
        loop {
            match reader.read_byte_record(&mut row) {
                Ok(false) => break,
                Ok(true) => {}
                Err(err) => {
                    records.push(Err(DecodeError::Malformed {
                        message: err.to_string(),
                    }));
                    continue;
                }
            }

            if self.skip_rows > 0 {
                self.skip_rows -= 1;
                continue;
            }

            let Some(names) = &self.names else {
                self.names = Some(
                    row.iter()
                        .map(|name| String::from_utf8_lossy(name).trim().to_string())
                        .collect(),
                );
                continue;
            };

            records.push(self.decoder.record(names, &row));
        }

        records
    }
}

/// Converts a cell to the field's logical type.
///
/// Empty cells are null. Cells that do not parse stay strings and are
/// reported by the mapper.
fn coerce(field: Option<&FieldSpec>, cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }

    let trimmed = cell.trim();
    let value = match field.map(|f| f.logical_type) {
        Some(LogicalType::Bool) => parse_bool(trimmed).map(Value::Bool),
        Some(LogicalType::Int) | Some(LogicalType::Timestamp) => {
            trimmed.parse::<i64>().ok().map(Value::Int)
        }
        Some(LogicalType::Float) => trimmed.parse::<f64>().ok().map(Value::Float),
        _ => None,
    };

    value.unwrap_or_else(|| Value::String(cell.to_string()))
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn encode_cell(name: &str, value: &Value) -> Result<String, DecodeError> {
    match value.effective() {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(v) => Ok(v.to_string()),
        Value::Float(v) => Ok(v.to_string()),
        Value::String(s) => Ok(s.clone()),
        other => Err(DecodeError::Encode {
            message: format!("field {name} holds a {} value", other.kind()),
        }),
    }
}

/// Positional options for descriptors whose fields are the columns.
pub fn positional_names(descriptor: &SchemaDescriptor) -> Vec<String> {
    descriptor.field_names().map(String::from).collect()
}
