//! Map from RPU addresses to host bus addresses.
//!
//! The RPU sees its memories at fixed addresses in its own 32-bit space. The
//! host reaches the same memories through a 24-bit bus window; each window has
//! its own read latency in dummy words. The per-processor memories (ROM,
//! retained RAM, scratch RAM) overlap in the RPU address space, so they can only
//! be resolved when the processor is known.

use crate::error::ProtocolViolation;
use crate::Processor;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct MemoryRegion {
    pub start: u32,
    /// Last bus address of the region, inclusive.
    pub end: u32,

    /// Number of dummy 32bit words
    pub latency: u32,

    pub rpu_mem_start: u32,
    pub rpu_mem_end: u32,
    pub processor_restriction: Option<Processor>,
}

#[rustfmt::skip]
mod table {
    use super::*;
	pub(crate) const SYSBUS       : &MemoryRegion = &MemoryRegion { start: 0x000000, end: 0x008FFF, latency: 1, rpu_mem_start: 0xA4000000, rpu_mem_end: 0xA4FFFFFF, processor_restriction: None };
	pub(crate) const EXT_SYS_BUS  : &MemoryRegion = &MemoryRegion { start: 0x009000, end: 0x03FFFF, latency: 2, rpu_mem_start: 0,          rpu_mem_end: 0,          processor_restriction: None };
	pub(crate) const PBUS         : &MemoryRegion = &MemoryRegion { start: 0x040000, end: 0x07FFFF, latency: 1, rpu_mem_start: 0xA5000000, rpu_mem_end: 0xA5FFFFFF, processor_restriction: None };
	pub(crate) const PKTRAM       : &MemoryRegion = &MemoryRegion { start: 0x0C0000, end: 0x0F0FFF, latency: 0, rpu_mem_start: 0xB0000000, rpu_mem_end: 0xB0FFFFFF, processor_restriction: None };
	pub(crate) const GRAM         : &MemoryRegion = &MemoryRegion { start: 0x080000, end: 0x091FFF, latency: 1, rpu_mem_start: 0xB7000000, rpu_mem_end: 0xB7FFFFFF, processor_restriction: None };
	pub(crate) const LMAC_ROM     : &MemoryRegion = &MemoryRegion { start: 0x100000, end: 0x133FFF, latency: 1, rpu_mem_start: 0x80000000, rpu_mem_end: 0x80033FFF, processor_restriction: Some(Processor::Lmac) }; // ROM
	pub(crate) const LMAC_RET_RAM : &MemoryRegion = &MemoryRegion { start: 0x140000, end: 0x14BFFF, latency: 1, rpu_mem_start: 0x80040000, rpu_mem_end: 0x8004BFFF, processor_restriction: Some(Processor::Lmac) }; // retained RAM
	pub(crate) const LMAC_SRC_RAM : &MemoryRegion = &MemoryRegion { start: 0x180000, end: 0x18FFFF, latency: 1, rpu_mem_start: 0x80080000, rpu_mem_end: 0x8008FFFF, processor_restriction: Some(Processor::Lmac) }; // scratch RAM
	pub(crate) const UMAC_ROM     : &MemoryRegion = &MemoryRegion { start: 0x200000, end: 0x2617FF, latency: 1, rpu_mem_start: 0x80000000, rpu_mem_end: 0x800617FF, processor_restriction: Some(Processor::Umac) }; // ROM
	pub(crate) const UMAC_RET_RAM : &MemoryRegion = &MemoryRegion { start: 0x280000, end: 0x2A3FFF, latency: 1, rpu_mem_start: 0x80080000, rpu_mem_end: 0x800A3FFF, processor_restriction: Some(Processor::Umac) }; // retained RAM
	pub(crate) const UMAC_SRC_RAM : &MemoryRegion = &MemoryRegion { start: 0x300000, end: 0x337FFF, latency: 1, rpu_mem_start: 0x80100000, rpu_mem_end: 0x80137FFF, processor_restriction: Some(Processor::Umac) }; // scratch RAM

    pub(crate) const REGIONS: [&MemoryRegion; 11] = [
        SYSBUS, EXT_SYS_BUS, PBUS, PKTRAM, GRAM, LMAC_ROM, LMAC_RET_RAM, LMAC_SRC_RAM, UMAC_ROM, UMAC_RET_RAM, UMAC_SRC_RAM
    ];
}

pub(crate) use table::*;

#[doc(alias = "pal_rpu_addr_offset_get")]
pub(crate) fn remap_global_addr_to_region_and_offset(
    rpu_addr: u32,
    processor: Option<Processor>,
) -> Result<(&'static MemoryRegion, u32), ProtocolViolation> {
    REGIONS
        .into_iter()
        .filter(|region| region.processor_restriction.is_none() || region.processor_restriction == processor)
        // EXT_SYS_BUS has no RPU-side window.
        .filter(|region| region.rpu_mem_end != 0)
        .find(|region| rpu_addr >= region.rpu_mem_start && rpu_addr <= region.rpu_mem_end)
        .map(|region| (region, rpu_addr - region.rpu_mem_start))
        .ok_or(ProtocolViolation::AddressOutOfRange(rpu_addr))
}

/// Region containing the given host bus address.
#[cfg(test)]
pub(crate) fn region_of_bus_addr(bus_addr: u32) -> Option<&'static MemoryRegion> {
    REGIONS
        .into_iter()
        .find(|region| bus_addr >= region.start && bus_addr <= region.end)
}

/// Checks that `len` bytes starting at `offs` stay inside the region.
pub(crate) fn check_span(mem: &MemoryRegion, offs: u32, len: usize) -> Result<(), ProtocolViolation> {
    let end = (mem.start as u64) + (offs as u64) + (len as u64);
    if end <= mem.end as u64 + 1 {
        Ok(())
    } else {
        Err(ProtocolViolation::AddressOutOfRange(mem.rpu_mem_start.wrapping_add(offs)))
    }
}
