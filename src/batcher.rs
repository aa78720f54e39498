//! # Batch Read Coalescing
//!
//! Turns a scattered set of point reads into the fewest physical read
//! transactions, then scatters each window's buffer back to the points.
//!
//! ## How It Works
//!
//! Items are grouped by `(function, station)`, deduplicated by address (and
//! bit, for `.bit` points) and sorted. For each group:
//!
//! 1. The lowest pending address opens a window.
//! 2. Every pending address within `window span` registers of it is a candidate
//!    (121 by default: 125 minus a 4-register safety margin).
//! 3. The window length is trimmed to end where the furthest candidate ends,
//!    so the last item's width (1, 2 or 4 registers) is always covered.
//! 4. Every item fully inside the window is extracted from it. An item
//!    straddling the window edge opens the next window.
//!
//! A bit-addressed register point (`1;3;10.3`) occupies one register and is
//! decoded as a single bit of it, so `10.3` and `10.0` stay distinct results
//! served by the same read.
//!
//! ## Example
//!
//! ```rust
//! use modbus_engine::{AddressHeader, DataType, ReadCoalescer};
//!
//! let mut coalescer = ReadCoalescer::new(121);
//! coalescer.add(&AddressHeader::new(1, 3, 0), DataType::Int16);
//! coalescer.add(&AddressHeader::new(1, 3, 5), DataType::Float);
//! coalescer.add(&AddressHeader::new(1, 3, 200), DataType::UInt16);
//!
//! let groups = coalescer.plan().unwrap();
//! let windows: Vec<_> = groups[0].windows.iter().map(|w| w.window).collect();
//! assert_eq!(windows.len(), 2);
//! assert_eq!((windows[0].start_address, windows[0].length), (0, 7));
//! assert_eq!((windows[1].start_address, windows[1].length), (200, 1));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::address::AddressHeader;
use crate::codec::ModbusCodec;
use crate::constants::{is_bit_function, is_read_function, MAX_READ_COILS, MAX_READ_REGISTERS};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::value::{DataType, ModbusValue};

/// One logical read in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub address: u16,
    pub data_type: DataType,
    /// Bit within the register for `.bit` points.
    pub bit_index: Option<u8>,
    pub bit_from_left: bool,
}

impl BatchItem {
    pub fn new(address: u16, data_type: DataType) -> Self {
        Self {
            address,
            data_type,
            bit_index: None,
            bit_from_left: false,
        }
    }

    pub fn from_header(header: &AddressHeader, data_type: DataType) -> Self {
        Self {
            address: header.address,
            data_type,
            bit_index: header.bit_index,
            bit_from_left: header.bit_from_left,
        }
    }

    fn slot(&self) -> ItemSlot {
        (self.address, self.bit_index, self.bit_from_left)
    }
}

// address, bit, bit ordering
type ItemSlot = (u16, Option<u8>, bool);

/// Result key: a value is identified by station, function, address and,
/// for bit-addressed points, the bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub station: u8,
    pub function: u8,
    pub address: u16,
    pub bit_index: Option<u8>,
    pub bit_from_left: bool,
}

impl BatchKey {
    pub fn new(station: u8, function: u8, address: u16) -> Self {
        Self {
            station,
            function,
            address,
            bit_index: None,
            bit_from_left: false,
        }
    }

    fn for_item(station: u8, function: u8, item: &BatchItem) -> Self {
        Self {
            station,
            function,
            address: item.address,
            bit_index: item.bit_index,
            bit_from_left: item.bit_from_left,
        }
    }
}

impl From<&AddressHeader> for BatchKey {
    fn from(header: &AddressHeader) -> Self {
        Self {
            station: header.station,
            function: header.function,
            address: header.address,
            bit_index: header.bit_index,
            bit_from_left: header.bit_from_left,
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.station, self.function, self.address)?;
        if let Some(bit) = self.bit_index {
            write!(f, ".{}", bit)?;
        }
        Ok(())
    }
}

/// Values produced by a batch read.
pub type BatchValues = BTreeMap<BatchKey, ModbusValue>;

/// Contiguous range read in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub start_address: u16,
    /// Registers (or coils, for bit functions).
    pub length: u16,
}

/// A window and the items it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub window: ReadWindow,
    pub items: Vec<BatchItem>,
}

impl WindowPlan {
    /// Scatter a window buffer into `out`.
    pub fn extract(
        &self,
        codec: &ModbusCodec,
        station: u8,
        function: u8,
        buffer: &[u8],
        out: &mut BatchValues,
    ) -> ModbusResult<()> {
        let bit_packed = is_bit_function(function);
        for item in &self.items {
            let value = match item.bit_index {
                Some(bit) if !bit_packed => {
                    let register = item
                        .address
                        .checked_sub(self.window.start_address)
                        .ok_or_else(|| {
                            ModbusError::invalid_data(format!(
                                "address {} precedes window start {}",
                                item.address, self.window.start_address
                            ))
                        })?;
                    ModbusValue::Bool(codec.decode_bit(
                        buffer,
                        usize::from(register),
                        bit,
                        item.bit_from_left,
                    )?)
                }
                _ => codec.extract_from_batch(
                    self.window.start_address,
                    item.address,
                    buffer,
                    item.data_type,
                    bit_packed,
                )?,
            };
            out.insert(BatchKey::for_item(station, function, item), value);
        }
        Ok(())
    }
}

/// Planned windows for one `(function, station)` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    pub station: u8,
    pub function: u8,
    pub windows: Vec<WindowPlan>,
}

impl ReadGroup {
    /// Header addressing the start of `window`.
    pub fn header_for(&self, window: &ReadWindow) -> AddressHeader {
        AddressHeader::new(self.station, self.function, window.start_address)
    }
}

/// Collects batch items and plans read windows.
#[derive(Debug, Clone)]
pub struct ReadCoalescer {
    // (function, station) -> slot -> widest requested type
    groups: BTreeMap<(u8, u8), BTreeMap<ItemSlot, DataType>>,
    register_span: u16,
    register_cap: u16,
    coil_span: u16,
    coil_cap: u16,
}

impl ReadCoalescer {
    /// Coalescer with a register window span of `register_span`.
    pub fn new(register_span: u16) -> Self {
        Self {
            groups: BTreeMap::new(),
            register_span,
            register_cap: MAX_READ_REGISTERS as u16,
            coil_span: register_span,
            coil_cap: MAX_READ_COILS as u16,
        }
    }

    /// Spans and caps derived from device limits.
    pub fn with_limits(limits: &DeviceLimits) -> Self {
        Self {
            groups: BTreeMap::new(),
            register_span: limits.batch_window(),
            register_cap: limits.max_read_registers,
            coil_span: limits
                .max_read_coils
                .saturating_sub(limits.batch_safety_margin)
                .max(1),
            coil_cap: limits.max_read_coils,
        }
    }

    pub fn add(&mut self, header: &AddressHeader, data_type: DataType) {
        self.add_item(
            header.station,
            header.function,
            BatchItem::from_header(header, data_type),
        );
    }

    /// Add an item; a repeated address (and bit) keeps the widest type.
    pub fn add_item(&mut self, station: u8, function: u8, item: BatchItem) {
        self.groups
            .entry((function, station))
            .or_default()
            .entry(item.slot())
            .and_modify(|existing| {
                if item.data_type.register_count() > existing.register_count() {
                    *existing = item.data_type;
                }
            })
            .or_insert(item.data_type);
    }

    /// Distinct items across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Plan every group.
    ///
    /// Fails with a configuration error for non-read functions, for
    /// non-bool items on coil/discrete functions and for bit-addressed
    /// register items of any type but `Bool`.
    pub fn plan(&self) -> ModbusResult<Vec<ReadGroup>> {
        self.groups
            .iter()
            .map(|(&(function, station), items)| {
                if !is_read_function(function) {
                    return Err(ModbusError::configuration(format!(
                        "function {} cannot be batch-read",
                        function
                    )));
                }
                let bit_packed = is_bit_function(function);
                if bit_packed {
                    if let Some(((address, _, _), ty)) =
                        items.iter().find(|(_, ty)| **ty != DataType::Bool)
                    {
                        return Err(ModbusError::configuration(format!(
                            "{} at {};{};{} is not readable from a coil/discrete table",
                            ty, station, function, address
                        )));
                    }
                } else if let Some(((address, Some(bit), _), ty)) = items
                    .iter()
                    .find(|((_, bit, _), ty)| bit.is_some() && **ty != DataType::Bool)
                {
                    return Err(ModbusError::configuration(format!(
                        "{} at {};{};{}.{} must be read as Bool",
                        ty, station, function, address, bit
                    )));
                }
                let (span, cap) = if bit_packed {
                    (self.coil_span, self.coil_cap)
                } else {
                    (self.register_span, self.register_cap)
                };
                let sorted: Vec<BatchItem> = items
                    .iter()
                    .map(|(&(address, bit_index, bit_from_left), &data_type)| BatchItem {
                        address,
                        data_type,
                        bit_index,
                        bit_from_left,
                    })
                    .collect();
                Ok(ReadGroup {
                    station,
                    function,
                    windows: plan_windows(&sorted, span, cap, bit_packed)?,
                })
            })
            .collect()
    }
}

fn item_width(item: &BatchItem, bit_packed: bool) -> u32 {
    if bit_packed {
        1
    } else {
        u32::from(item.data_type.register_count())
    }
}

/// Window planning over items sorted by ascending address.
///
/// `span` bounds how far past the window start a candidate may begin; `cap`
/// bounds the total window length.
pub fn plan_windows(
    items: &[BatchItem],
    span: u16,
    cap: u16,
    bit_packed: bool,
) -> ModbusResult<Vec<WindowPlan>> {
    let mut pending: Vec<BatchItem> = items.to_vec();
    let mut plans = Vec::new();

    while let Some(first) = pending.first().copied() {
        let start = u32::from(first.address);
        if item_width(&first, bit_packed) > u32::from(cap) {
            return Err(ModbusError::configuration(format!(
                "{} at {} needs more than {} registers per read",
                first.data_type, first.address, cap
            )));
        }

        let end = pending
            .iter()
            .filter(|item| {
                let offset = u32::from(item.address) - start;
                offset <= u32::from(span) && offset + item_width(item, bit_packed) <= u32::from(cap)
            })
            .map(|item| u32::from(item.address) + item_width(item, bit_packed))
            .max()
            .unwrap_or(start + item_width(&first, bit_packed));

        let (taken, rest): (Vec<BatchItem>, Vec<BatchItem>) = pending
            .into_iter()
            .partition(|item| u32::from(item.address) + item_width(item, bit_packed) <= end);

        plans.push(WindowPlan {
            window: ReadWindow {
                start_address: first.address,
                length: (end - start) as u16,
            },
            items: taken,
        });
        pending = rest;
    }

    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::DataFormat;

    fn item(address: u16, data_type: DataType) -> BatchItem {
        BatchItem::new(address, data_type)
    }

    fn windows(plans: &[WindowPlan]) -> Vec<(u16, u16)> {
        plans
            .iter()
            .map(|p| (p.window.start_address, p.window.length))
            .collect()
    }

    #[test]
    fn test_two_windows() {
        let plans = plan_windows(
            &[
                item(0, DataType::Int16),
                item(5, DataType::Float),
                item(200, DataType::UInt16),
            ],
            121,
            125,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(0, 7), (200, 1)]);
        assert_eq!(plans[0].items.len(), 2);
        assert_eq!(plans[1].items, vec![item(200, DataType::UInt16)]);
    }

    #[test]
    fn test_window_edge_includes_last_width() {
        // 121 is the last candidate; a double there stretches the window to 125
        let plans = plan_windows(
            &[item(0, DataType::Int16), item(121, DataType::Double)],
            121,
            125,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(0, 125)]);

        let plans = plan_windows(
            &[item(0, DataType::Int16), item(122, DataType::Int16)],
            121,
            125,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(0, 1), (122, 1)]);
    }

    #[test]
    fn test_wide_first_item_covers_narrow_follower() {
        let plans = plan_windows(
            &[item(10, DataType::Double), item(11, DataType::Int16)],
            121,
            125,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(10, 4)]);
        assert_eq!(plans[0].items.len(), 2);
    }

    #[test]
    fn test_straddler_opens_next_window() {
        // cap 6: the float at 5 would need 7 registers, so it starts its own window
        let plans = plan_windows(
            &[
                item(0, DataType::Int16),
                item(4, DataType::Int16),
                item(5, DataType::Float),
            ],
            5,
            6,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(0, 5), (5, 2)]);
    }

    #[test]
    fn test_high_addresses_do_not_overflow() {
        let plans = plan_windows(
            &[item(65534, DataType::Int16), item(65535, DataType::UInt16)],
            121,
            125,
            false,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(65534, 2)]);
    }

    #[test]
    fn test_coils_use_bit_width() {
        let plans = plan_windows(
            &[item(0, DataType::Bool), item(15, DataType::Bool), item(300, DataType::Bool)],
            121,
            2000,
            true,
        )
        .unwrap();
        assert_eq!(windows(&plans), vec![(0, 16), (300, 1)]);
    }

    #[test]
    fn test_dedup_keeps_widest() {
        let mut coalescer = ReadCoalescer::new(121);
        coalescer.add(&AddressHeader::new(1, 3, 10), DataType::Int16);
        coalescer.add(&AddressHeader::new(1, 3, 10), DataType::Double);
        coalescer.add(&AddressHeader::new(1, 3, 10), DataType::Float);
        assert_eq!(coalescer.len(), 1);
        let groups = coalescer.plan().unwrap();
        assert_eq!(groups[0].windows[0].items, vec![item(10, DataType::Double)]);
    }

    #[test]
    fn test_groups_by_function_and_station() {
        let mut coalescer = ReadCoalescer::with_limits(&DeviceLimits::default());
        coalescer.add(&AddressHeader::new(1, 3, 0), DataType::Int16);
        coalescer.add(&AddressHeader::new(2, 3, 0), DataType::Int16);
        coalescer.add(&AddressHeader::new(1, 4, 0), DataType::Int16);
        coalescer.add(&AddressHeader::new(1, 1, 0), DataType::Bool);
        let groups = coalescer.plan().unwrap();
        let keys: Vec<(u8, u8)> = groups.iter().map(|g| (g.function, g.station)).collect();
        assert_eq!(keys, vec![(1, 1), (3, 1), (3, 2), (4, 1)]);
        assert_eq!(groups[2].header_for(&groups[2].windows[0].window).to_string(), "2;3;0");
    }

    #[test]
    fn test_plan_rejects_bad_combinations() {
        let mut coalescer = ReadCoalescer::new(121);
        coalescer.add(&AddressHeader::new(1, 1, 0), DataType::Float);
        assert!(matches!(
            coalescer.plan(),
            Err(ModbusError::Configuration { .. })
        ));

        let mut coalescer = ReadCoalescer::new(121);
        coalescer.add(&AddressHeader::new(1, 6, 0), DataType::Int16);
        assert!(matches!(
            coalescer.plan(),
            Err(ModbusError::Configuration { .. })
        ));

        assert!(plan_windows(&[item(0, DataType::Double)], 1, 2, false).is_err());
    }

    #[test]
    fn test_extract_matches_individual_reads() {
        let codec = ModbusCodec::new(DataFormat::CDAB, false);
        let mut memory = vec![0u8; 14];
        memory[0..2].copy_from_slice(&codec.encode(&[-7i16]));
        memory[10..14].copy_from_slice(&codec.encode(&[2.5f32]));

        let plan = WindowPlan {
            window: ReadWindow {
                start_address: 0,
                length: 7,
            },
            items: vec![item(0, DataType::Int16), item(5, DataType::Float)],
        };
        let mut out = BatchValues::new();
        plan.extract(&codec, 1, 3, &memory, &mut out).unwrap();

        assert_eq!(out[&BatchKey::new(1, 3, 0)], ModbusValue::Int16(-7));
        assert_eq!(out[&BatchKey::new(1, 3, 5)], ModbusValue::Float(2.5));
        let single: f32 = codec.decode_one(&memory[10..14], 0).unwrap();
        assert_eq!(out[&BatchKey::new(1, 3, 5)], ModbusValue::Float(single));
    }

    #[test]
    fn test_bit_points_keep_their_bit() {
        let mut coalescer = ReadCoalescer::new(121);
        let low = AddressHeader::new(1, 3, 10).with_bit(0);
        let high = AddressHeader::new(1, 3, 10).with_bit(3);
        coalescer.add(&low, DataType::Bool);
        coalescer.add(&high, DataType::Bool);
        coalescer.add(&AddressHeader::new(1, 3, 10), DataType::UInt16);
        assert_eq!(coalescer.len(), 3);

        let groups = coalescer.plan().unwrap();
        assert_eq!(windows(&groups[0].windows), vec![(10, 1)]);

        let codec = ModbusCodec::new(DataFormat::ABCD, false);
        let mut out = BatchValues::new();
        groups[0].windows[0]
            .extract(&codec, 1, 3, &[0x00, 0x01], &mut out)
            .unwrap();
        assert_eq!(out[&BatchKey::from(&low)], ModbusValue::Bool(true));
        assert_eq!(out[&BatchKey::from(&high)], ModbusValue::Bool(false));
        assert_eq!(out[&BatchKey::new(1, 3, 10)], ModbusValue::UInt16(1));
        assert_eq!(BatchKey::from(&high).to_string(), "1;3;10.3");
    }

    #[test]
    fn test_bit_from_left_extraction() {
        let mut coalescer = ReadCoalescer::new(121);
        let header = AddressHeader::new(1, 4, 2).with_bit(0).with_bit_from_left(true);
        coalescer.add(&header, DataType::Bool);
        let groups = coalescer.plan().unwrap();

        let codec = ModbusCodec::new(DataFormat::ABCD, false);
        let mut out = BatchValues::new();
        groups[0].windows[0]
            .extract(&codec, 1, 4, &[0x80, 0x00], &mut out)
            .unwrap();
        assert_eq!(out[&BatchKey::from(&header)], ModbusValue::Bool(true));
    }

    #[test]
    fn test_plan_rejects_typed_bit_points() {
        let mut coalescer = ReadCoalescer::new(121);
        coalescer.add(&AddressHeader::new(1, 3, 10).with_bit(3), DataType::UInt16);
        assert!(matches!(
            coalescer.plan(),
            Err(ModbusError::Configuration { .. })
        ));
    }
}
