//! UDS service identifier classification
//!
//! Interprets the first byte of a reassembled message far enough to know
//! which service it concerns and whether it is a request, a positive or
//! negative response, or belongs to another protocol. Payload semantics are
//! left to the layers above.

use std::fmt;

/// Offset between a request SID and its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
/// SID of a negative response
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Known UDS services (request-side values)
///
/// Variants carry the full ISO 14229-1 service names, so the byte of each
/// is unambiguous: `DiagnosticSessionControl` is 0x10, `EcuReset` 0x11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    DiagnosticSessionControl,
    EcuReset,
    ClearDiagnosticInformation,
    ReadDtcInformation,
    ReadDataByIdentifier,
    ReadMemoryByAddress,
    ReadScalingDataByIdentifier,
    SecurityAccess,
    CommunicationControl,
    ReadDataByPeriodicIdentifier,
    DynamicallyDefineDataIdentifier,
    WriteDataByIdentifier,
    InputOutputControlByIdentifier,
    RoutineControl,
    RequestDownload,
    RequestUpload,
    TransferData,
    RequestTransferExit,
    RequestFileTransfer,
    WriteMemoryByAddress,
    TesterPresent,
    AccessTimingParameter,
    SecuredDataTransmission,
    ControlDtcSetting,
    ResponseOnEvent,
    LinkControl,
    /// Not a known UDS service
    Other,
}

const KNOWN_SERVICES: [(u8, ServiceId); 26] = [
    (0x10, ServiceId::DiagnosticSessionControl),
    (0x11, ServiceId::EcuReset),
    (0x14, ServiceId::ClearDiagnosticInformation),
    (0x19, ServiceId::ReadDtcInformation),
    (0x22, ServiceId::ReadDataByIdentifier),
    (0x23, ServiceId::ReadMemoryByAddress),
    (0x24, ServiceId::ReadScalingDataByIdentifier),
    (0x27, ServiceId::SecurityAccess),
    (0x28, ServiceId::CommunicationControl),
    (0x2A, ServiceId::ReadDataByPeriodicIdentifier),
    (0x2C, ServiceId::DynamicallyDefineDataIdentifier),
    (0x2E, ServiceId::WriteDataByIdentifier),
    (0x2F, ServiceId::InputOutputControlByIdentifier),
    (0x31, ServiceId::RoutineControl),
    (0x34, ServiceId::RequestDownload),
    (0x35, ServiceId::RequestUpload),
    (0x36, ServiceId::TransferData),
    (0x37, ServiceId::RequestTransferExit),
    (0x38, ServiceId::RequestFileTransfer),
    (0x3D, ServiceId::WriteMemoryByAddress),
    (0x3E, ServiceId::TesterPresent),
    (0x83, ServiceId::AccessTimingParameter),
    (0x84, ServiceId::SecuredDataTransmission),
    (0x85, ServiceId::ControlDtcSetting),
    (0x86, ServiceId::ResponseOnEvent),
    (0x87, ServiceId::LinkControl),
];

/// Byte-indexed lookup table, built at compile time
static SERVICE_TABLE: [ServiceId; 256] = build_service_table();

const fn build_service_table() -> [ServiceId; 256] {
    let mut table = [ServiceId::Other; 256];
    let mut i = 0;
    while i < KNOWN_SERVICES.len() {
        let (sid, service) = KNOWN_SERVICES[i];
        table[sid as usize] = service;
        i += 1;
    }
    table
}

impl ServiceId {
    /// Exact lookup of a request SID; unknown values map to `Other`
    pub fn from_byte(sid: u8) -> Self {
        SERVICE_TABLE[usize::from(sid)]
    }

    /// Request SID, `None` for `Other`
    pub fn sid(self) -> Option<u8> {
        KNOWN_SERVICES
            .iter()
            .find(|(_, service)| *service == self)
            .map(|(sid, _)| *sid)
    }

    /// Positive response SID (request SID + 0x40)
    pub fn positive_response_sid(self) -> Option<u8> {
        self.sid().map(|sid| sid + POSITIVE_RESPONSE_OFFSET)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sid() {
            Some(sid) => write!(f, "{:?} (0x{:02X})", self, sid),
            None => write!(f, "Other"),
        }
    }
}

/// Message category derived from the SID byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCategory {
    /// UDS request
    Request,
    PositiveResponse,
    NegativeResponse,
    /// Legacy OBD-II service range (< 0x10)
    Obd,
    Other,
}

/// Service identifier plus category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceClassification {
    pub service: ServiceId,
    pub category: ServiceCategory,
}

impl ServiceClassification {
    fn new(service: ServiceId, category: ServiceCategory) -> Self {
        Self { service, category }
    }
}

/// Classify a SID byte
///
/// Range edges are deliberately asymmetric: 0x3F, 0x40, 0x82, 0x89, 0xC2
/// and 0xC9 fall through to `Other`.
pub fn classify(sid: u8) -> ServiceClassification {
    use ServiceCategory::*;

    match sid {
        0x00..=0x0F => ServiceClassification::new(ServiceId::Other, Obd),
        0x10..=0x3E => ServiceClassification::new(ServiceId::from_byte(sid), Request),
        0x41..=0x7E => ServiceClassification::new(
            ServiceId::from_byte(sid - POSITIVE_RESPONSE_OFFSET),
            PositiveResponse,
        ),
        NEGATIVE_RESPONSE => ServiceClassification::new(ServiceId::Other, NegativeResponse),
        0x83..=0x88 => ServiceClassification::new(ServiceId::from_byte(sid), Request),
        0xC3..=0xC8 => ServiceClassification::new(
            ServiceId::from_byte(sid - POSITIVE_RESPONSE_OFFSET),
            PositiveResponse,
        ),
        _ => ServiceClassification::new(ServiceId::Other, Other),
    }
}

/// Classify the first byte of a message; `None` for an empty payload
pub fn classify_payload(payload: &[u8]) -> Option<ServiceClassification> {
    payload.first().copied().map(classify)
}
