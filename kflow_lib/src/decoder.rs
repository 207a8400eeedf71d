//! IPFIX message decoding.
//!
//! See [RFC 7011](https://tools.ietf.org/html/rfc7011) for the message format and
//! [RFC 7012](https://tools.ietf.org/html/rfc7012) for the information elements.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Version Number          |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Export Time                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Sequence Number                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Observation Domain ID                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Set ID               |          Length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, trace};
use thiserror::Error;

use crate::fields::*;
use crate::flows::Flow;
use crate::metrics::DecoderMetrics;
use crate::templates::*;
use crate::time::*;
use crate::utils::*;

pub const IPFIX_VERSION: u16 = 10;
pub const MESSAGE_HEADER_SIZE: usize = 16;
pub const SET_HEADER_SIZE: usize = 4;

const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;
const MIN_TEMPLATE_ID: u16 = 256;
//template id + field count
const TEMPLATE_RECORD_HEADER_SIZE: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("IPFIX version mismatch: expected 10, got {0}")]
    InvalidVersion(u16),
    #[error("invalid set id {0}")]
    InvalidSetId(u16),
    #[error("invalid template id {0}")]
    InvalidTemplateId(u16),
    #[error("unknown template id {0}")]
    UnknownTemplateId(u16),
    #[error("cannot read field {field_id} of length {length}")]
    MalformedField { field_id: u16, length: u16 },
    #[error("truncated packet: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported sender: {0}")]
    Sender(#[from] AddrError),
}

impl DecodeError {
    /// Stable tag used to label the error counter.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::InvalidVersion(_) => "invalid protocol version",
            DecodeError::InvalidSetId(_) => "invalid set id",
            DecodeError::InvalidTemplateId(_) => "invalid template id",
            DecodeError::UnknownTemplateId(_) => "unknown template id",
            DecodeError::MalformedField { .. }
            | DecodeError::Truncated { .. }
            | DecodeError::Sender(_) => "malformed packet",
        }
    }
}

pub trait PacketDecoder: Send + Sync {
    /// Never fails: a bad packet yields no flows and is accounted for internally.
    fn decode(&self, payload: &[u8], sender: SocketAddr) -> Vec<Flow>;
}

/// Bounds-checked big-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count > self.remaining() {
            return Err(DecodeError::Truncated {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[derive(Clone, Copy, Debug)]
struct MessageHeader {
    version: u16,
    length: u16,
    export_time: u32,
    sequence_number: u32,
    domain_id: u32,
}

/// Decodes IPFIX messages into flows, learning templates as they arrive.
pub struct IpfixDecoder {
    templates: Arc<TemplateStore>,
    metrics: Arc<DecoderMetrics>,
}

impl IpfixDecoder {
    pub fn new(templates: Arc<TemplateStore>) -> Self {
        IpfixDecoder {
            templates,
            metrics: Arc::new(DecoderMetrics::new()),
        }
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn metrics(&self) -> &Arc<DecoderMetrics> {
        &self.metrics
    }

    /// Fallible decode step. Flows produced before an error are discarded
    /// by the caller together with the rest of the packet.
    pub fn try_decode(&self, payload: &[u8], sender: SocketAddr) -> Result<Vec<Flow>, DecodeError> {
        let exporter = convert_socket_to_address(sender)?;
        let mut packet = Reader::new(payload);

        let version = packet.read_u16()?;
        if version != IPFIX_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let header = MessageHeader {
            version,
            length: packet.read_u16()?,
            export_time: packet.read_u32()?,
            sequence_number: packet.read_u32()?,
            domain_id: packet.read_u32()?,
        };
        trace!(
            "IPFIX v{} message {} from {sender}, length {}",
            header.version,
            header.sequence_number,
            header.length
        );

        let body_length = usize::from(header.length)
            .checked_sub(MESSAGE_HEADER_SIZE)
            .ok_or(DecodeError::Truncated {
                needed: MESSAGE_HEADER_SIZE,
                available: usize::from(header.length),
            })?;
        let mut message = Reader::new(packet.take(body_length)?);

        let mut flows = Vec::new();
        while message.remaining() > 0 {
            let set_id = message.read_u16()?;
            let set_length = usize::from(message.read_u16()?);
            let set_body_length = set_length.checked_sub(SET_HEADER_SIZE).ok_or(DecodeError::Truncated {
                needed: SET_HEADER_SIZE,
                available: set_length,
            })?;
            let mut set = Reader::new(message.take(set_body_length)?);

            match set_id {
                TEMPLATE_SET_ID => self.decode_template_set(&mut set, exporter, header.domain_id, false)?,
                OPTIONS_TEMPLATE_SET_ID => self.decode_template_set(&mut set, exporter, header.domain_id, true)?,
                MIN_DATA_SET_ID..=u16::MAX => {
                    self.decode_data_set(&mut set, exporter, &header, set_id, &mut flows)?
                }
                _ => return Err(DecodeError::InvalidSetId(set_id)),
            }
        }
        Ok(flows)
    }

    fn decode_template_set(
        &self,
        set: &mut Reader<'_>,
        exporter: u32,
        domain_id: u32,
        scoped: bool,
    ) -> Result<(), DecodeError> {
        //anything shorter than a record header is padding
        while set.remaining() >= TEMPLATE_RECORD_HEADER_SIZE {
            let template_id = set.read_u16()?;
            if template_id < MIN_TEMPLATE_ID {
                return Err(DecodeError::InvalidTemplateId(template_id));
            }
            let field_count = set.read_u16()?;
            let scope_field_count = if scoped { set.read_u16()? } else { 0 };

            let mut fields = Vec::with_capacity(usize::from(field_count));
            for _ in 0..field_count {
                let raw_id = set.read_u16()?;
                let length = set.read_u16()?;
                let enterprise_number = if raw_id & ENTERPRISE_BIT != 0 {
                    Some(set.read_u32()?)
                } else {
                    None
                };
                fields.push(TemplateField::new(raw_id & !ENTERPRISE_BIT, length, enterprise_number));
            }

            let key = TemplateKey::new(exporter, u64::from(domain_id), template_id);
            debug!(
                "Template {template_id} from {} domain {domain_id}: {} fields",
                address_to_text(exporter),
                fields.len()
            );
            self.templates.put(key, Template::new(fields, scope_field_count));
        }
        Ok(())
    }

    fn decode_data_set(
        &self,
        set: &mut Reader<'_>,
        exporter: u32,
        header: &MessageHeader,
        template_id: u16,
        flows: &mut Vec<Flow>,
    ) -> Result<(), DecodeError> {
        let key = TemplateKey::new(exporter, u64::from(header.domain_id), template_id);
        let template = self
            .templates
            .get(&key)
            .ok_or(DecodeError::UnknownTemplateId(template_id))?;

        //a zero length template would never consume the set
        if template.length() == 0 {
            return Ok(());
        }

        while set.remaining() >= template.length() {
            let mut flow = Flow {
                timestamp: export_time_to_millis(header.export_time),
                sampler_address: exporter,
                ..Default::default()
            };
            for field in template.fields() {
                let field_slice = set.take(usize::from(field.length))?;
                set_field_value(field, field_slice, &mut flow)?;
            }
            flows.push(flow);
            self.metrics.flow_decoded();
        }
        Ok(())
    }
}

impl PacketDecoder for IpfixDecoder {
    fn decode(&self, payload: &[u8], sender: SocketAddr) -> Vec<Flow> {
        self.metrics.packet_received();
        match self.try_decode(payload, sender) {
            Ok(flows) => flows,
            Err(e) => {
                debug!("Dropping IPFIX packet from {sender}: {e}");
                self.metrics.decode_error(&e);
                Vec::new()
            }
        }
    }
}

fn set_field_value(field: &TemplateField, field_slice: &[u8], flow: &mut Flow) -> Result<(), DecodeError> {
    let flow_field = field.flow_field();
    if !flow_field.accepts_length(field_slice.len()) {
        return Err(DecodeError::MalformedField {
            field_id: field.id,
            length: field.length,
        });
    }
    //widths were checked above, so the narrowing casts below are exact
    let value = read_unsigned(field_slice);
    match flow_field {
        FlowField::Bytes => flow.bytes = value,
        FlowField::Packets => flow.packets = value,
        FlowField::Protocol => flow.protocol = value as u8,
        FlowField::TcpFlags => flow.flags = value as u16,
        FlowField::SrcPort => flow.source_port = value as u16,
        FlowField::SrcAddr => flow.source_address = value as u32,
        FlowField::DstPort => flow.destination_port = value as u16,
        FlowField::DstAddr => flow.destination_address = value as u32,
        FlowField::Unknown => {}
    }
    Ok(())
}
