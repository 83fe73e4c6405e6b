//! Byte-addressable VM memory and the URL mapping table.
//!
//! Values are stored little-endian at arbitrary byte offsets, so typed cells
//! may overlap or sit misaligned. Every typed access is bounds-checked and
//! reports [`VmError::MemoryAccessViolation`] instead of panicking.
//!
//! Memory is shared between the VM thread, the PID ticker and the network
//! actor. Only the mapping table is serialized (one lock). Value bytes are
//! relaxed atomics: a concurrent writer may tear a multi-byte value, and that
//! race is accepted for control values.

use crate::error::{IdKind, Result, VmError};
use crate::rational::{DefaultRational, Rational, MAX_RATIONAL_WIDTH};
use parking_lot::Mutex;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

pub const DEFAULT_MEMORY_SIZE: usize = 1024;
pub const MAX_MEMORY_SIZE: usize = u16::MAX as usize;
/// The mapping id is a 4-bit field of the optype byte.
pub const MAP_SIZE: usize = 16;
/// Sentinel for an unused address field.
pub const NO_MAPPING: u16 = 0xFFFF;

pub const MAP_OPTION_URL_LITERAL: u8 = 0x01;
pub const MAP_OPTION_RESOURCE_LITERAL: u8 = 0x02;
pub const MAP_OPTION_LIFETIME_MASK: u8 = 0x04;
pub const MAP_OPTION_LIFETIME_ONCE: u8 = 0x00;
pub const MAP_OPTION_LIFETIME_EVER: u8 = 0x04;
pub const MAP_OPTION_DIRECTION_MASK: u8 = 0x08;
pub const MAP_OPTION_DIRECTION_SERVER: u8 = 0x00;
pub const MAP_OPTION_DIRECTION_CLIENT: u8 = 0x08;
pub const MAP_OPTION_METHOD_MASK: u8 = 0xF0;
pub const MAP_OPTION_METHOD_GET: u8 = 0x10;
pub const MAP_OPTION_METHOD_POST: u8 = 0x20;
pub const MAP_OPTION_METHOD_PUT: u8 = 0x30;

pub const MAP_STATUS_DONE: u8 = 0x01;
pub const MAP_STATUS_ERROR_TIMEOUT: u8 = 0x02;
pub const MAP_STATUS_ERROR_404: u8 = 0x04;
pub const MAP_STATUS_ERROR_SERVER: u8 = 0x08;
pub const MAP_STATUS_ERROR_STORE: u8 = 0x10;
pub const MAP_STATUS_ERROR_LOAD: u8 = 0x20;
pub const MAP_STATUS_NO_MAPPING: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MapMethod {
    Get,
    Post,
    Put,
}

impl MapMethod {
    pub fn from_options(options: u8) -> Option<Self> {
        match options & MAP_OPTION_METHOD_MASK {
            MAP_OPTION_METHOD_GET => Some(MapMethod::Get),
            MAP_OPTION_METHOD_POST => Some(MapMethod::Post),
            MAP_OPTION_METHOD_PUT => Some(MapMethod::Put),
            _ => None,
        }
    }
}

/// One entry of the mapping table, laid out as the network actor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UrlMapping {
    pub optype: u8,
    pub map_options: u8,
    pub value_address: u16,
    pub url_address: u16,
    pub resource_address: u16,
    pub port: u16,
    pub status: u8,
}

impl UrlMapping {
    pub const UNMAPPED: UrlMapping = UrlMapping {
        optype: 0,
        map_options: 0,
        value_address: NO_MAPPING,
        url_address: NO_MAPPING,
        resource_address: NO_MAPPING,
        port: 0,
        status: MAP_STATUS_NO_MAPPING,
    };

    pub fn is_active(&self) -> bool {
        self.value_address != NO_MAPPING
            && self.url_address != NO_MAPPING
            && self.resource_address != NO_MAPPING
            && self.status & MAP_STATUS_NO_MAPPING == 0
    }

    pub fn is_once(&self) -> bool {
        self.map_options & MAP_OPTION_LIFETIME_MASK == MAP_OPTION_LIFETIME_ONCE
    }

    pub fn is_client(&self) -> bool {
        self.map_options & MAP_OPTION_DIRECTION_MASK == MAP_OPTION_DIRECTION_CLIENT
    }

    pub fn method(&self) -> Option<MapMethod> {
        MapMethod::from_options(self.map_options)
    }

    /// Done with no error bits set.
    pub fn is_clean_done(&self) -> bool {
        self.status == MAP_STATUS_DONE
    }
}

impl Default for UrlMapping {
    fn default() -> Self {
        Self::UNMAPPED
    }
}

pub struct Memory<R: Rational = DefaultRational> {
    bytes: Box<[AtomicU8]>,
    mappings: Mutex<Vec<UrlMapping>>,
    _rational: PhantomData<fn() -> R>,
}

impl<R: Rational> Default for Memory<R> {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_SIZE)
    }
}

impl<R: Rational> std::fmt::Debug for Memory<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("capacity", &self.capacity())
            .field("map_size", &self.map_size())
            .field("rational", &R::NAME)
            .finish()
    }
}

impl<R: Rational> Memory<R> {
    /// Capacity is clamped to `1..=MAX_MEMORY_SIZE` so every address fits a u16.
    pub fn new(capacity: usize) -> Self {
        Self::with_map_size(capacity, MAP_SIZE)
    }

    pub fn with_map_size(capacity: usize, map_size: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_MEMORY_SIZE);
        let map_size = map_size.min(MAP_SIZE);
        Self {
            bytes: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            mappings: Mutex::new(vec![UrlMapping::UNMAPPED; map_size]),
            _rational: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn map_size(&self) -> usize {
        self.mappings.lock().len()
    }

    fn check(&self, op: &'static str, address: u16, width: usize) -> Result<usize> {
        let start = address as usize;
        if start + width > self.bytes.len() {
            return Err(VmError::MemoryAccessViolation {
                op,
                address: address as u32,
                width,
            });
        }
        Ok(start)
    }

    fn read_into(&self, op: &'static str, address: u16, out: &mut [u8]) -> Result<()> {
        let start = self.check(op, address, out.len())?;
        for (offset, byte) in out.iter_mut().enumerate() {
            *byte = self.bytes[start + offset].load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn write_from(&self, op: &'static str, address: u16, data: &[u8]) -> Result<()> {
        let start = self.check(op, address, data.len())?;
        for (offset, byte) in data.iter().enumerate() {
            self.bytes[start + offset].store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn load(&self, address: u16) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.read_into("load", address, &mut raw)?;
        Ok(raw[0])
    }

    pub fn store(&self, address: u16, value: u8) -> Result<()> {
        self.write_from("store", address, &[value])
    }

    pub fn load_address(&self, address: u16) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_into("load_address", address, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn store_address(&self, address: u16, value: u16) -> Result<()> {
        self.write_from("store_address", address, &value.to_le_bytes())
    }

    pub fn load_unsigned(&self, address: u16) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_into("load_unsigned", address, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn store_unsigned(&self, address: u16, value: u32) -> Result<()> {
        self.write_from("store_unsigned", address, &value.to_le_bytes())
    }

    pub fn load_rational(&self, address: u16) -> Result<R> {
        let mut raw = [0u8; MAX_RATIONAL_WIDTH];
        let raw = &mut raw[..R::WIDTH];
        self.read_into("load_rational", address, raw)?;
        Ok(R::decode(raw))
    }

    pub fn store_rational(&self, address: u16, value: R) -> Result<()> {
        let mut raw = [0u8; MAX_RATIONAL_WIDTH];
        let raw = &mut raw[..R::WIDTH];
        value.encode(raw);
        self.write_from("store_rational", address, raw)
    }

    /// Overlap-safe move of `len` bytes; both ranges are checked up front.
    pub fn copy(&self, src: u16, len: u8, dest: u16) -> Result<()> {
        let len = len as usize;
        let from = self.check("copy", src, len)?;
        let to = self.check("copy", dest, len)?;
        let step = |offset: usize| {
            let byte = self.bytes[from + offset].load(Ordering::Relaxed);
            self.bytes[to + offset].store(byte, Ordering::Relaxed);
        };
        if to > from {
            (0..len).rev().for_each(&step);
        } else {
            (0..len).for_each(&step);
        }
        Ok(())
    }

    pub fn write_bytes(&self, address: u16, data: &[u8]) -> Result<()> {
        self.write_from("write_bytes", address, data)
    }

    pub fn read_bytes(&self, address: u16, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into("read_bytes", address, &mut out)?;
        Ok(out)
    }

    /// Reads a NUL-terminated string; running off the end is an access violation.
    pub fn load_string(&self, address: u16) -> Result<String> {
        let start = self.check("load_string", address, 1)?;
        let mut raw = Vec::new();
        for cell in &self.bytes[start..] {
            match cell.load(Ordering::Relaxed) {
                0 => return Ok(String::from_utf8_lossy(&raw).into_owned()),
                byte => raw.push(byte),
            }
        }
        Err(VmError::MemoryAccessViolation {
            op: "load_string",
            address: address as u32,
            width: raw.len() + 1,
        })
    }

    pub fn dump(&self) -> Vec<u8> {
        self.bytes
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect()
    }

    /// Zeroes every byte and unmaps every slot.
    pub fn clear(&self) {
        for cell in self.bytes.iter() {
            cell.store(0, Ordering::Relaxed);
        }
        self.mappings
            .lock()
            .iter_mut()
            .for_each(|slot| *slot = UrlMapping::UNMAPPED);
    }

    fn slot_index(id: u8, len: usize) -> Result<usize> {
        let index = id as usize;
        if index >= len {
            return Err(VmError::IdUnavailable {
                kind: IdKind::Mapping,
                id,
            });
        }
        Ok(index)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        id: u8,
        optype: u8,
        map_options: u8,
        value_address: u16,
        port: u16,
        url_address: u16,
        resource_address: u16,
    ) -> Result<()> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        table[index] = UrlMapping {
            optype,
            map_options,
            value_address,
            url_address,
            resource_address,
            port,
            status: 0,
        };
        Ok(())
    }

    /// Raw status of an active slot, 0 for an inactive one. With
    /// `delete_after_done`, a once-lifetime slot that finished cleanly is
    /// unmapped by this call.
    pub fn check_map(&self, id: u8, delete_after_done: bool) -> Result<u8> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        let slot = table[index];
        if !slot.is_active() {
            return Ok(0);
        }
        if delete_after_done && slot.is_clean_done() && slot.is_once() {
            table[index] = UrlMapping::UNMAPPED;
        }
        Ok(slot.status)
    }

    pub fn map_done(&self, id: u8) -> Result<()> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        if table[index].is_active() {
            table[index].status = MAP_STATUS_DONE;
        }
        Ok(())
    }

    pub fn map_error(&self, id: u8, code: u8) -> Result<()> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        if table[index].is_active() {
            table[index].status |= code | MAP_STATUS_DONE;
        }
        Ok(())
    }

    pub fn unmap(&self, id: u8) -> Result<()> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        table[index] = UrlMapping::UNMAPPED;
        Ok(())
    }

    /// Drops a once-lifetime slot if it still equals `served`. Returns whether
    /// it was dropped; a slot remapped since `served` was read is left alone.
    pub fn consume_once(&self, id: u8, served: &UrlMapping) -> Result<bool> {
        let mut table = self.mappings.lock();
        let index = Self::slot_index(id, table.len())?;
        if !served.is_once() || table[index] != *served {
            return Ok(false);
        }
        table[index] = UrlMapping::UNMAPPED;
        Ok(true)
    }

    /// First slot whose value cell is `address`.
    pub fn map_for_address(&self, address: u16) -> Option<u8> {
        self.mappings
            .lock()
            .iter()
            .position(|slot| slot.value_address == address)
            .map(|index| index as u8)
    }

    pub fn mapping(&self, id: u8) -> Option<UrlMapping> {
        self.mappings.lock().get(id as usize).copied()
    }

    pub fn dump_map(&self) -> Vec<UrlMapping> {
        self.mappings.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::Fixed8;

    fn memory() -> Memory<Fixed8> {
        Memory::new(DEFAULT_MEMORY_SIZE)
    }

    #[test]
    fn typed_values_are_little_endian_and_overlap() {
        let mem = memory();
        mem.store_unsigned(0x10, 0xAABB_CCDD).unwrap();
        assert_eq!(mem.load(0x10).unwrap(), 0xDD);
        assert_eq!(mem.load_address(0x11).unwrap(), 0xBBCC);
        mem.store(0x13, 0x01).unwrap();
        assert_eq!(mem.load_unsigned(0x10).unwrap(), 0x01BB_CCDD);
    }

    #[test]
    fn last_valid_offset_depends_on_width() {
        let mem = memory();
        assert!(mem.store_unsigned(1020, 7).is_ok());
        assert_eq!(
            mem.store_unsigned(1021, 7),
            Err(VmError::MemoryAccessViolation {
                op: "store_unsigned",
                address: 1021,
                width: 4,
            })
        );
        assert!(mem.load(1023).is_ok());
        assert!(mem.load(1024).is_err());
        assert!(mem.load_address(1023).is_err());
        assert!(mem.load_rational(1021).is_err());
    }

    #[test]
    fn copy_handles_overlap_in_both_directions() {
        let mem = memory();
        mem.write_bytes(0x20, &[1, 2, 3, 4, 5]).unwrap();
        mem.copy(0x20, 5, 0x22).unwrap();
        assert_eq!(mem.read_bytes(0x20, 7).unwrap(), vec![1, 2, 1, 2, 3, 4, 5]);

        mem.copy(0x22, 5, 0x21).unwrap();
        assert_eq!(mem.read_bytes(0x20, 7).unwrap(), vec![1, 1, 2, 3, 4, 5, 5]);
    }

    #[test]
    fn copy_checks_whole_destination_range() {
        let mem = memory();
        assert!(mem.copy(0x00, 8, 1020).is_err());
        assert!(mem.copy(1020, 8, 0x00).is_err());
        assert!(mem.copy(0x00, 4, 1020).is_ok());
    }

    #[test]
    fn load_string_requires_terminator() {
        let mem: Memory<Fixed8> = Memory::new(8);
        mem.write_bytes(0, b"/x\0").unwrap();
        assert_eq!(mem.load_string(0).unwrap(), "/x");
        mem.write_bytes(4, b"abcd").unwrap();
        assert!(mem.load_string(4).is_err());
    }

    #[test]
    fn mapping_lifecycle_once() {
        let mem = memory();
        assert_eq!(mem.check_map(0, true).unwrap(), 0);

        mem.map(0, 0x04, MAP_OPTION_LIFETIME_ONCE, 0x70, 5683, 0x100, 0x120)
            .unwrap();
        assert!(mem.mapping(0).unwrap().is_active());
        assert_eq!(mem.check_map(0, true).unwrap(), 0);

        mem.map_done(0).unwrap();
        assert_eq!(mem.check_map(0, false).unwrap(), MAP_STATUS_DONE);
        assert!(mem.mapping(0).unwrap().is_active());
        assert_eq!(mem.check_map(0, true).unwrap(), MAP_STATUS_DONE);
        assert_eq!(mem.mapping(0).unwrap(), UrlMapping::UNMAPPED);
    }

    #[test]
    fn errored_mapping_is_never_auto_deleted() {
        let mem = memory();
        mem.map(3, 0x04, MAP_OPTION_LIFETIME_ONCE, 0x70, 0, 0x100, 0x120)
            .unwrap();
        mem.map_error(3, MAP_STATUS_ERROR_404).unwrap();
        for _ in 0..3 {
            assert_eq!(
                mem.check_map(3, true).unwrap(),
                MAP_STATUS_ERROR_404 | MAP_STATUS_DONE
            );
        }
        assert!(mem.mapping(3).unwrap().is_active());
    }

    #[test]
    fn ever_mapping_survives_checks() {
        let mem = memory();
        mem.map(1, 0x04, MAP_OPTION_LIFETIME_EVER, 0x70, 0, 0x100, 0x120)
            .unwrap();
        mem.map_done(1).unwrap();
        for _ in 0..4 {
            assert_eq!(mem.check_map(1, true).unwrap(), MAP_STATUS_DONE);
        }
        assert!(mem.mapping(1).unwrap().is_active());
    }

    #[test]
    fn done_and_error_ignore_inactive_slots() {
        let mem = memory();
        mem.map_done(2).unwrap();
        mem.map_error(2, MAP_STATUS_ERROR_SERVER).unwrap();
        assert_eq!(mem.mapping(2).unwrap().status, MAP_STATUS_NO_MAPPING);
    }

    #[test]
    fn map_ids_are_range_checked() {
        let mem: Memory<Fixed8> = Memory::with_map_size(64, 4);
        assert_eq!(mem.map_size(), 4);
        let err = mem.map(4, 0, 0, 1, 0, 2, 3).unwrap_err();
        assert_eq!(
            err,
            VmError::IdUnavailable {
                kind: IdKind::Mapping,
                id: 4
            }
        );
        assert!(mem.check_map(9, false).is_err());
    }

    #[test]
    fn map_for_address_finds_first_slot() {
        let mem = memory();
        assert_eq!(mem.map_for_address(0x70), None);
        mem.map(5, 0, 0, 0x70, 0, 0x100, 0x120).unwrap();
        mem.map(2, 0, 0, 0x70, 0, 0x100, 0x120).unwrap();
        assert_eq!(mem.map_for_address(0x70), Some(2));
    }

    #[test]
    fn clear_zeroes_bytes_and_unmaps() {
        let mem = memory();
        mem.store_unsigned(0, u32::MAX).unwrap();
        mem.map(0, 0, 0, 0x70, 0, 0x100, 0x120).unwrap();
        mem.clear();
        assert!(mem.dump().iter().all(|byte| *byte == 0));
        assert!(mem.dump_map().iter().all(|slot| !slot.is_active()));
    }

    #[test]
    fn consume_once_leaves_a_remapped_slot() {
        let mem = memory();
        mem.map(3, 0, MAP_OPTION_LIFETIME_ONCE, 0x70, 0, 0x100, 0x120).unwrap();
        let served = mem.mapping(3).unwrap();

        mem.unmap(3).unwrap();
        mem.map(3, 0, MAP_OPTION_LIFETIME_ONCE, 0x74, 0, 0x100, 0x120).unwrap();
        assert!(!mem.consume_once(3, &served).unwrap());
        assert_eq!(mem.mapping(3).unwrap().value_address, 0x74);

        let current = mem.mapping(3).unwrap();
        assert!(mem.consume_once(3, &current).unwrap());
        assert!(!mem.mapping(3).unwrap().is_active());
    }

    #[test]
    fn consume_once_keeps_ever_slots() {
        let mem = memory();
        mem.map(1, 0, MAP_OPTION_LIFETIME_EVER, 0x70, 0, 0x100, 0x120).unwrap();
        let served = mem.mapping(1).unwrap();
        assert!(!mem.consume_once(1, &served).unwrap());
        assert!(mem.mapping(1).unwrap().is_active());
    }
}
