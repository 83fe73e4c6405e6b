//! Typed access for the network actor.
//!
//! A transport (CoAP or anything else) never touches VM state directly: it
//! discovers work through the mapping table, moves values through the codecs
//! below and reports outcomes with [`Bridge::complete`] / [`Bridge::fail`].

use crate::error::BridgeError;
use crate::memory::{MapMethod, Memory, UrlMapping, MAP_STATUS_DONE};
use crate::opcodes::DataType;
use crate::rational::{DefaultRational, Rational};
use crate::vm::Vm;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

type Result<T> = std::result::Result<T, BridgeError>;

/// Text payloads must be shorter than this.
pub const TEXT_PAYLOAD_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentFormat {
    #[default]
    Text = 0,
    Octet = 42,
}

impl From<u16> for ContentFormat {
    fn from(value: u16) -> Self {
        if value == ContentFormat::Octet as u16 {
            ContentFormat::Octet
        } else {
            ContentFormat::Text
        }
    }
}

/// Request a client-direction mapping wants issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRequest {
    pub id: u8,
    pub method: MapMethod,
    pub host: String,
    pub port: u16,
    pub resource: String,
}

/// `<sign><int>.<4 digits>`, fraction truncated.
pub fn format_rational<R: Rational>(value: R) -> String {
    let value = value.to_f64();
    let sign = if value < 0.0 { "-" } else { "" };
    let magnitude = value.abs();
    let whole = magnitude.trunc();
    let fraction = ((magnitude - whole) * 10_000.0).trunc();
    format!("{sign}{}.{:04}", whole as u64, fraction as u64)
}

pub fn vm_status_report<R: Rational>(vm: &Vm<R>) -> [u8; 4] {
    vm.status().to_le_bytes()
}

/// Decodes a hex program, ignoring whitespace.
pub fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(BridgeError::InvalidHex(format!(
            "odd number of digits ({})",
            digits.len()
        )));
    }
    digits
        .chunks(2)
        .enumerate()
        .map(|(index, pair)| match (pair[0].to_digit(16), pair[1].to_digit(16)) {
            (Some(hi), Some(lo)) => Ok((hi * 16 + lo) as u8),
            _ => Err(BridgeError::InvalidHex(format!(
                "invalid digits {:?}{:?} at byte {index}",
                pair[0], pair[1]
            ))),
        })
        .collect()
}

pub struct Bridge<R: Rational = DefaultRational> {
    memory: Arc<Memory<R>>,
}

impl<R: Rational> Bridge<R> {
    pub fn new(memory: Arc<Memory<R>>) -> Self {
        Self { memory }
    }

    fn active(&self, id: u8) -> Result<UrlMapping> {
        self.memory
            .mapping(id)
            .filter(UrlMapping::is_active)
            .ok_or(BridgeError::NoMapping(id))
    }

    fn value_type(slot: &UrlMapping) -> Result<DataType> {
        DataType::from_optype(slot.optype).ok_or(BridgeError::UnsupportedType(slot.optype))
    }

    /// Renders the mapped value. A once-lifetime mapping is consumed by the
    /// read; in text form only when its status is clean.
    pub fn load_value(&self, format: ContentFormat, id: u8) -> Result<Vec<u8>> {
        let slot = self.active(id)?;
        let ty = Self::value_type(&slot)?;
        let address = slot.value_address;
        let payload = match format {
            ContentFormat::Octet => self.memory.read_bytes(address, ty.width::<R>())?,
            ContentFormat::Text => {
                let text = match ty {
                    DataType::Uint8 => self.memory.load(address)?.to_string(),
                    DataType::Uint16 => self.memory.load_address(address)?.to_string(),
                    DataType::Uint32 => self.memory.load_unsigned(address)?.to_string(),
                    DataType::Rational => format_rational(self.memory.load_rational(address)?),
                };
                text.into_bytes()
            }
        };
        let consumed = match format {
            ContentFormat::Octet => slot.is_once(),
            ContentFormat::Text => slot.is_once() && slot.status <= MAP_STATUS_DONE,
        };
        if consumed {
            self.memory.consume_once(id, &slot)?;
        }
        Ok(payload)
    }

    /// Writes a received value into the mapped cell. Integers given as text
    /// wrap to the cell width.
    pub fn store_value(&self, format: ContentFormat, id: u8, payload: &[u8]) -> Result<()> {
        let slot = self.active(id)?;
        let ty = Self::value_type(&slot)?;
        let address = slot.value_address;
        match format {
            ContentFormat::Octet => {
                let width = ty.width::<R>();
                if payload.len() < width {
                    return Err(BridgeError::InvalidPayload(format!(
                        "expected {width} bytes, got {}",
                        payload.len()
                    )));
                }
                self.memory.write_bytes(address, &payload[..width])?;
            }
            ContentFormat::Text => {
                if payload.len() >= TEXT_PAYLOAD_LIMIT {
                    return Err(BridgeError::PayloadTooLarge {
                        len: payload.len(),
                        max: TEXT_PAYLOAD_LIMIT - 1,
                    });
                }
                let text = std::str::from_utf8(payload)
                    .map_err(|err| BridgeError::InvalidPayload(err.to_string()))?
                    .trim();
                let invalid = |err: &dyn std::fmt::Display| {
                    BridgeError::InvalidPayload(format!("{text:?}: {err}"))
                };
                if ty == DataType::Rational {
                    let value: f64 = text.parse().map_err(|err| invalid(&err))?;
                    self.memory.store_rational(address, R::from_f64(value))?;
                } else {
                    let value: i64 = text.parse().map_err(|err| invalid(&err))?;
                    match ty {
                        DataType::Uint8 => self.memory.store(address, value as u8)?,
                        DataType::Uint16 => self.memory.store_address(address, value as u16)?,
                        _ => self.memory.store_unsigned(address, value as u32)?,
                    }
                }
            }
        }
        self.memory.consume_once(id, &slot)?;
        Ok(())
    }

    /// Id of the active mapping whose resource string is `path`.
    pub fn find_server_mapping(&self, path: &str) -> Option<u8> {
        self.memory
            .dump_map()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
            .find(|(_, slot)| {
                self.memory
                    .load_string(slot.resource_address)
                    .map(|resource| resource == path)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id as u8)
    }

    pub fn host(&self, id: u8) -> Result<String> {
        let slot = self.active(id)?;
        Ok(self.memory.load_string(slot.url_address)?)
    }

    pub fn resource(&self, id: u8) -> Result<String> {
        let slot = self.active(id)?;
        Ok(self.memory.load_string(slot.resource_address)?)
    }

    /// Client mappings that still need a request: fresh ones, plus every
    /// ever-lifetime mapping on each poll.
    pub fn pending_client_requests(&self) -> Vec<ClientRequest> {
        let mut requests = Vec::new();
        for (id, slot) in self.memory.dump_map().iter().enumerate() {
            if !slot.is_active() || !slot.is_client() {
                continue;
            }
            if slot.status != 0 && slot.is_once() {
                continue;
            }
            let Some(method) = slot.method() else {
                continue;
            };
            let strings = self
                .memory
                .load_string(slot.url_address)
                .and_then(|host| Ok((host, self.memory.load_string(slot.resource_address)?)));
            match strings {
                Ok((host, resource)) => requests.push(ClientRequest {
                    id: id as u8,
                    method,
                    host,
                    port: slot.port,
                    resource,
                }),
                Err(err) => debug!(id, %err, "skipping mapping with unreadable strings"),
            }
        }
        requests
    }

    pub fn complete(&self, id: u8) -> Result<()> {
        Ok(self.memory.map_done(id)?)
    }

    pub fn fail(&self, id: u8, code: u8) -> Result<()> {
        Ok(self.memory.map_error(id, code)?)
    }

    /// `count` followed by each slot's raw status byte.
    pub fn mapping_status_report(&self) -> Vec<u8> {
        let table = self.memory.dump_map();
        let mut report = Vec::with_capacity(table.len() + 1);
        report.push(table.len() as u8);
        report.extend(table.iter().map(|slot| slot.status));
        report
    }

    pub fn memory(&self) -> &Arc<Memory<R>> {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        MAP_OPTION_DIRECTION_CLIENT, MAP_OPTION_LIFETIME_EVER, MAP_OPTION_METHOD_GET,
        MAP_OPTION_METHOD_POST, MAP_STATUS_ERROR_TIMEOUT, MAP_STATUS_NO_MAPPING,
    };
    use crate::opcodes::{TYPE_RATIONAL, TYPE_UINT16, TYPE_UINT32, TYPE_UINT8};
    use crate::rational::Fixed8;

    const HOST: u16 = 0x200;
    const RESOURCE: u16 = 0x220;

    fn bridge() -> Bridge<Fixed8> {
        let memory = Arc::new(Memory::new(1024));
        memory.write_bytes(HOST, b"affe::1\0").unwrap();
        memory.write_bytes(RESOURCE, b"/sensor\0").unwrap();
        Bridge::new(memory)
    }

    fn map(bridge: &Bridge<Fixed8>, id: u8, ty: u8, options: u8, value: u16) {
        bridge
            .memory()
            .map(id, ty, options, value, 5683, HOST, RESOURCE)
            .unwrap();
    }

    #[test]
    fn format_rational_truncates_to_four_digits() {
        assert_eq!(format_rational(Fixed8::from_int(20)), "20.0000");
        assert_eq!(format_rational(Fixed8::from_f64(-1.5)), "-1.5000");
        assert_eq!(format_rational(Fixed8::from_raw(25)), "0.0976");
        assert_eq!(format_rational(-0.25f32), "-0.2500");
    }

    #[test]
    fn text_load_renders_each_type() {
        let bridge = bridge();
        let memory = bridge.memory().clone();
        memory.store(0x10, 200).unwrap();
        memory.store_address(0x12, 54321).unwrap();
        memory.store_unsigned(0x14, 4_000_000_000).unwrap();
        memory.store_rational(0x18, Fixed8::from_f64(21.75)).unwrap();
        map(&bridge, 0, TYPE_UINT8, MAP_OPTION_LIFETIME_EVER, 0x10);
        map(&bridge, 1, TYPE_UINT16, MAP_OPTION_LIFETIME_EVER, 0x12);
        map(&bridge, 2, TYPE_UINT32, MAP_OPTION_LIFETIME_EVER, 0x14);
        map(&bridge, 3, TYPE_RATIONAL, MAP_OPTION_LIFETIME_EVER, 0x18);

        let text = |id| String::from_utf8(bridge.load_value(ContentFormat::Text, id).unwrap()).unwrap();
        assert_eq!(text(0), "200");
        assert_eq!(text(1), "54321");
        assert_eq!(text(2), "4000000000");
        assert_eq!(text(3), "21.7500");
        assert!(memory.mapping(3).unwrap().is_active());
    }

    #[test]
    fn octet_load_returns_raw_bytes_and_consumes_once() {
        let bridge = bridge();
        bridge.memory().store_unsigned(0x10, 0x0403_0201).unwrap();
        map(&bridge, 4, TYPE_UINT32, 0, 0x10);
        assert_eq!(
            bridge.load_value(ContentFormat::Octet, 4).unwrap(),
            vec![1, 2, 3, 4]
        );
        assert!(matches!(
            bridge.load_value(ContentFormat::Octet, 4),
            Err(BridgeError::NoMapping(4))
        ));
    }

    #[test]
    fn text_load_keeps_errored_once_mapping() {
        let bridge = bridge();
        map(&bridge, 0, TYPE_UINT8, 0, 0x10);
        bridge.fail(0, MAP_STATUS_ERROR_TIMEOUT).unwrap();
        bridge.load_value(ContentFormat::Text, 0).unwrap();
        assert!(bridge.memory().mapping(0).unwrap().is_active());

        bridge.complete(0).unwrap();
        bridge.load_value(ContentFormat::Text, 0).unwrap();
        assert!(!bridge.memory().mapping(0).unwrap().is_active());
    }

    #[test]
    fn text_store_parses_and_wraps() {
        let bridge = bridge();
        let memory = bridge.memory().clone();
        map(&bridge, 0, TYPE_UINT8, MAP_OPTION_LIFETIME_EVER, 0x10);
        map(&bridge, 1, TYPE_RATIONAL, MAP_OPTION_LIFETIME_EVER, 0x14);

        bridge.store_value(ContentFormat::Text, 0, b"258").unwrap();
        assert_eq!(memory.load(0x10).unwrap(), 2);
        bridge.store_value(ContentFormat::Text, 0, b" -1\n").unwrap();
        assert_eq!(memory.load(0x10).unwrap(), 0xFF);
        bridge.store_value(ContentFormat::Text, 1, b"-3.5").unwrap();
        assert_eq!(memory.load_rational(0x14).unwrap(), Fixed8::from_f64(-3.5));
    }

    #[test]
    fn text_store_rejects_bad_payloads() {
        let bridge = bridge();
        map(&bridge, 0, TYPE_UINT16, MAP_OPTION_LIFETIME_EVER, 0x10);
        assert!(matches!(
            bridge.store_value(ContentFormat::Text, 0, b"123456789012345"),
            Err(BridgeError::PayloadTooLarge { len: 15, max: 14 })
        ));
        assert!(matches!(
            bridge.store_value(ContentFormat::Text, 0, b"warm"),
            Err(BridgeError::InvalidPayload(_))
        ));
        assert!(matches!(
            bridge.store_value(ContentFormat::Octet, 0, &[1]),
            Err(BridgeError::InvalidPayload(_))
        ));
        assert!(matches!(
            bridge.store_value(ContentFormat::Text, 9, b"1"),
            Err(BridgeError::NoMapping(9))
        ));
    }

    #[test]
    fn octet_store_consumes_once_mapping() {
        let bridge = bridge();
        map(&bridge, 2, TYPE_UINT16, 0, 0x10);
        bridge
            .store_value(ContentFormat::from(42), 2, &[0x34, 0x12, 0xFF])
            .unwrap();
        assert_eq!(bridge.memory().load_address(0x10).unwrap(), 0x1234);
        assert_eq!(bridge.memory().load(0x12).unwrap(), 0);
        assert!(!bridge.memory().mapping(2).unwrap().is_active());
    }

    #[test]
    fn server_lookup_and_strings() {
        let bridge = bridge();
        assert_eq!(bridge.find_server_mapping("/sensor"), None);
        map(&bridge, 6, TYPE_UINT8, MAP_OPTION_LIFETIME_EVER, 0x10);
        assert_eq!(bridge.find_server_mapping("/sensor"), Some(6));
        assert_eq!(bridge.find_server_mapping("/other"), None);
        assert_eq!(bridge.host(6).unwrap(), "affe::1");
        assert_eq!(bridge.resource(6).unwrap(), "/sensor");
    }

    #[test]
    fn pending_requests_follow_status_and_lifetime() {
        let bridge = bridge();
        let once_get = MAP_OPTION_DIRECTION_CLIENT | MAP_OPTION_METHOD_GET;
        let ever_post =
            MAP_OPTION_DIRECTION_CLIENT | MAP_OPTION_METHOD_POST | MAP_OPTION_LIFETIME_EVER;
        map(&bridge, 0, TYPE_UINT8, once_get, 0x10);
        map(&bridge, 1, TYPE_UINT8, ever_post, 0x11);
        map(&bridge, 2, TYPE_UINT8, MAP_OPTION_DIRECTION_CLIENT, 0x12);
        map(&bridge, 3, TYPE_UINT8, MAP_OPTION_METHOD_GET, 0x13);

        let ids: Vec<u8> = bridge.pending_client_requests().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1]);
        let request = &bridge.pending_client_requests()[1];
        assert_eq!(request.method, MapMethod::Post);
        assert_eq!(request.host, "affe::1");
        assert_eq!(request.port, 5683);

        bridge.complete(0).unwrap();
        bridge.complete(1).unwrap();
        let ids: Vec<u8> = bridge.pending_client_requests().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn mapping_report_lists_raw_status() {
        let memory = Arc::new(Memory::<Fixed8>::with_map_size(256, 3));
        let bridge = Bridge::new(memory.clone());
        memory.map(1, 0, 0, 0x10, 0, 0x20, 0x30).unwrap();
        bridge.fail(1, MAP_STATUS_ERROR_TIMEOUT).unwrap();
        assert_eq!(
            bridge.mapping_status_report(),
            vec![3, MAP_STATUS_NO_MAPPING, 0x03, MAP_STATUS_NO_MAPPING]
        );
    }

    #[test]
    fn hex_programs_decode() {
        assert_eq!(decode_hex("60 10 00\n61aB").unwrap(), vec![0x60, 0x10, 0x00, 0x61, 0xAB]);
        assert!(matches!(decode_hex("abc"), Err(BridgeError::InvalidHex(_))));
        assert!(matches!(decode_hex("zz"), Err(BridgeError::InvalidHex(_))));
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn float_pid_output_renders_as_text() {
        use crate::clock::ManualClock;
        use crate::pid::{PidBank, PidConfig, PidDirection, PidMode};

        let memory: Arc<Memory<f32>> = Arc::new(Memory::new(1024));
        let pids = PidBank::new(1, memory.clone(), Arc::new(ManualClock::new(0)));
        memory.store_rational(0x70, 18.5).unwrap();
        memory.store_rational(0x74, 20.25).unwrap();
        pids.init(
            0,
            &PidConfig {
                input: 0x70,
                output: 0x78,
                setpoint: 0x74,
                kp: 2.0,
                ki: 0.5,
                kd: 0.0,
                sample_time_ms: 1000,
                direction: PidDirection::Direct,
                lower_limit: 0.0,
                upper_limit: 100.0,
            },
        )
        .unwrap();
        pids.set_mode(0, PidMode::Automatic).unwrap();
        assert!(pids.compute(0).unwrap());

        let bridge = Bridge::new(memory.clone());
        memory
            .map(0, TYPE_RATIONAL, MAP_OPTION_LIFETIME_EVER, 0x78, 0, HOST, RESOURCE)
            .unwrap();
        assert_eq!(bridge.load_value(ContentFormat::Text, 0).unwrap(), b"4.3750".to_vec());

        memory
            .map(1, TYPE_RATIONAL, MAP_OPTION_LIFETIME_EVER, 0x74, 0, HOST, RESOURCE)
            .unwrap();
        bridge.store_value(ContentFormat::Text, 1, b"-0.125").unwrap();
        assert_eq!(memory.load_rational(0x74).unwrap(), -0.125);
        assert_eq!(bridge.load_value(ContentFormat::Text, 1).unwrap(), b"-0.1250".to_vec());
    }
}
