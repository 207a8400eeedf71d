use serde::Serialize;

use crate::utils::*;

/// One decoded flow record. Addresses are IPv4 packed in network byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flow {
    pub sampler_address: u32,
    pub source_address: u32,
    pub source_port: u16,
    pub destination_address: u32,
    pub destination_port: u16,
    pub protocol: u8,
    pub flags: u16,
    pub bytes: u64,
    pub packets: u64,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
}

/// Wire layout handed to the sink. Field order is the key order on the wire.
#[derive(Serialize)]
struct FlowJson {
    dvc: String,
    src: String,
    srcp: u16,
    dst: String,
    dstp: u16,
    proto: u8,
    flags: u16,
    bytes: u64,
    pkts: u64,
    time: i64,
}

impl From<&Flow> for FlowJson {
    fn from(flow: &Flow) -> Self {
        FlowJson {
            dvc: address_to_text(flow.sampler_address),
            src: address_to_text(flow.source_address),
            srcp: flow.source_port,
            dst: address_to_text(flow.destination_address),
            dstp: flow.destination_port,
            proto: flow.protocol,
            flags: flow.flags,
            bytes: flow.bytes,
            pkts: flow.packets,
            time: flow.timestamp,
        }
    }
}

impl Flow {
    /// Compact ASCII JSON, e.g.
    /// `{"dvc":"9.9.9.9","src":"1.2.3.4","srcp":10,...,"time":1234567890000}`
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&FlowJson::from(self))
    }
}
