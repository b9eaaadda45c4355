//! Frame decoders.
//!
//! A decoder turns the bytes of a frame into records, together with the
//! descriptor used to map them.
use std::sync::Arc;

use pdk_schema::{SchemaDescriptor, SchemaDescriptorRef};

use crate::{error::DecodeError, record::Record};

pub mod avro;
pub mod delimited;

pub use self::{
    avro::AvroDecoder,
    delimited::{DelimitedDecoder, DelimitedOptions, Header},
};

pub enum Decoder {
    Delimited(DelimitedDecoder),
    Avro(AvroDecoder),
}

/// The records of a frame.
///
/// Malformed records are reported in place so that valid records of the same
/// frame are still mapped.
#[derive(Debug)]
pub struct DecodedFrame {
    pub descriptor: SchemaDescriptorRef,
    pub records: Vec<Result<Record, DecodeError>>,
}

impl Decoder {
    /// Decodes a whole frame.
    ///
    /// Returns an error only if the frame cannot be decoded at all and must
    /// not be acknowledged.
    pub async fn decode(&self, frame: &[u8]) -> Result<DecodedFrame, DecodeError> {
        match self {
            Decoder::Delimited(decoder) => Ok(DecodedFrame {
                descriptor: decoder.descriptor().clone(),
                records: decoder.decode(frame),
            }),
            Decoder::Avro(decoder) => match decoder.decode(frame).await {
                Ok((record, schema)) => Ok(DecodedFrame {
                    descriptor: schema.descriptor.clone(),
                    records: vec![Ok(record)],
                }),
                Err(err @ DecodeError::Malformed { .. }) => Ok(DecodedFrame {
                    descriptor: Arc::new(SchemaDescriptor::empty()),
                    records: vec![Err(err)],
                }),
                Err(err) => Err(err),
            },
        }
    }

    /// Returns the delimited decoder if frames can be decoded while they stream in.
    pub fn streaming(&self) -> Option<&DelimitedDecoder> {
        match self {
            Decoder::Delimited(decoder) => Some(decoder),
            Decoder::Avro(_) => None,
        }
    }
}

impl From<DelimitedDecoder> for Decoder {
    fn from(decoder: DelimitedDecoder) -> Self {
        Decoder::Delimited(decoder)
    }
}

impl From<AvroDecoder> for Decoder {
    fn from(decoder: AvroDecoder) -> Self {
        Decoder::Avro(decoder)
    }
}
