//IPFIX information element ids, see https://www.iana.org/assignments/ipfix/ipfix.xhtml
pub const OCTET_DELTA_COUNT: u16 = 1;
pub const PACKET_DELTA_COUNT: u16 = 2;
pub const PROTOCOL_IDENTIFIER: u16 = 4;
pub const TCP_CONTROL_BITS: u16 = 6;
pub const SOURCE_TRANSPORT_PORT: u16 = 7;
pub const SOURCE_IPV4_ADDRESS: u16 = 8;
pub const DESTINATION_TRANSPORT_PORT: u16 = 11;
pub const DESTINATION_IPV4_ADDRESS: u16 = 12;

/// High bit of a field specifier id, set when an enterprise number follows.
pub const ENTERPRISE_BIT: u16 = 0x8000;

/// Fields of a flow record the decoder knows how to interpret.
/// Everything else in a template is skipped by its declared length.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FlowField {
    #[default]
    Unknown,
    Bytes,
    Packets,
    Protocol,
    TcpFlags,
    SrcPort,
    SrcAddr,
    DstPort,
    DstAddr,
}

impl FlowField {
    /// Enterprise-specific elements share the id space with IANA ones only
    /// by accident, so they are never mapped.
    pub fn from_specifier(field_id: u16, enterprise_number: Option<u32>) -> Self {
        if enterprise_number.is_some() {
            return FlowField::Unknown;
        }
        match field_id {
            OCTET_DELTA_COUNT => FlowField::Bytes,
            PACKET_DELTA_COUNT => FlowField::Packets,
            PROTOCOL_IDENTIFIER => FlowField::Protocol,
            TCP_CONTROL_BITS => FlowField::TcpFlags,
            SOURCE_TRANSPORT_PORT => FlowField::SrcPort,
            SOURCE_IPV4_ADDRESS => FlowField::SrcAddr,
            DESTINATION_TRANSPORT_PORT => FlowField::DstPort,
            DESTINATION_IPV4_ADDRESS => FlowField::DstAddr,
            _ => FlowField::Unknown,
        }
    }

    pub fn accepts_length(&self, length: usize) -> bool {
        match self {
            FlowField::Bytes | FlowField::Packets => matches!(length, 1 | 2 | 4 | 8),
            FlowField::Protocol => length == 1,
            //unsigned16 per RFC 7012, but ipt_netflow and friends export a single byte
            FlowField::TcpFlags => matches!(length, 1 | 2),
            FlowField::SrcPort | FlowField::DstPort => length == 2,
            FlowField::SrcAddr | FlowField::DstAddr => length == 4,
            FlowField::Unknown => true,
        }
    }
}

/// Big-endian unsigned read of up to eight bytes, widened to u64.
pub fn read_unsigned(field_slice: &[u8]) -> u64 {
    field_slice
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}
