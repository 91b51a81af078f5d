//! Shoe records kept in tracked memory.
//!
//! A stored record is a block of field handles, one slot per field, each
//! pointing at its own tracked copy of the field.

use std::mem;

use log::trace;

use crate::{
    alloc::{meta::Handle, rawbuf::PtrStack, tracing::TrackingAlloc},
    error::{AllocError, ParseError},
};

const FIELDS: usize = 8;
const SLOT: usize = mem::size_of::<usize>();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shoe {
    /// Reference code, may be alphanumeric
    pub code: String,
    pub info: String,
    pub size: i32,
    pub available: bool,
    pub cost: i32,
    pub sale: i32,
    pub count: i32,
    pub category: String,
}

impl Shoe {
    /// Profit over every unit of this record
    pub fn profit(&self) -> i64 {
        (i64::from(self.sale) - i64::from(self.cost)) * i64::from(self.count)
    }

    /// Parse `code,info,size,Y|N,cost,sale,count,category`
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [code, info, size, available, cost, sale, count, category] = fields[..] else {
            return Err(ParseError::FieldCount {
                expected: FIELDS,
                found: fields.len(),
            });
        };

        let text = |field: &'static str, value: &str| {
            if value.is_empty() {
                Err(ParseError::Empty { field })
            } else {
                Ok(value.to_string())
            }
        };
        let number = |field: &'static str, value: &str| {
            value.parse::<i32>().map_err(|_| ParseError::NotANumber {
                field,
                value: value.to_string(),
            })
        };
        let available = match available {
            "Y" | "y" => true,
            "N" | "n" => false,
            other => {
                return Err(ParseError::Availability {
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            code: text("code", code)?,
            info: text("info", info)?,
            size: number("size", size)?,
            available,
            cost: number("cost", cost)?,
            sale: number("sale", sale)?,
            count: number("count", count)?,
            category: text("category", category)?,
        })
    }
}

/// Copy every field of `shoe` into tracked memory and return the record
/// block. On failure, whatever was already copied is released again.
pub fn store(alloc: &TrackingAlloc, shoe: &Shoe) -> Result<Handle, AllocError> {
    let mut fields: Vec<Handle> = Vec::with_capacity(FIELDS);
    let result = copy_fields(alloc, shoe, &mut fields).and_then(|()| {
        let record = alloc.allocate(FIELDS * SLOT)?;
        let mut slots = alloc.bytes_mut(record).ok_or(AllocError::Unregistered {
            address: record.addr(),
        })?;
        for (slot, field) in slots.chunks_exact_mut(SLOT).zip(&fields) {
            slot.copy_from_slice(&field.addr().to_ne_bytes());
        }
        Ok(record)
    });

    if result.is_err() {
        for field in fields {
            let _ = alloc.release(Some(field));
        }
    } else {
        trace!("stored shoe {:?}", shoe.code);
    }
    result
}

fn copy_fields(
    alloc: &TrackingAlloc,
    shoe: &Shoe,
    fields: &mut Vec<Handle>,
) -> Result<(), AllocError> {
    fields.push(alloc.copy_string(&shoe.code)?);
    fields.push(alloc.copy_string(&shoe.info)?);
    fields.push(alloc.copy_scalar(shoe.size)?);
    fields.push(alloc.copy_scalar(u8::from(shoe.available))?);
    fields.push(alloc.copy_scalar(shoe.cost)?);
    fields.push(alloc.copy_scalar(shoe.sale)?);
    fields.push(alloc.copy_scalar(shoe.count)?);
    fields.push(alloc.copy_string(&shoe.category)?);
    Ok(())
}

/// Read a record written by [`store()`]. `None` if the record or any of its
/// fields is no longer live.
pub fn load(alloc: &TrackingAlloc, record: Handle) -> Option<Shoe> {
    let slots = alloc.bytes(record)?;
    if slots.len() != FIELDS * SLOT {
        return None;
    }
    let fields: Option<Vec<Handle>> = slots
        .chunks_exact(SLOT)
        .map(|slot| {
            let mut addr = [0u8; SLOT];
            addr.copy_from_slice(slot);
            Handle::from_raw(usize::from_ne_bytes(addr) as *mut u8)
        })
        .collect();
    drop(slots);
    let fields = fields?;

    Some(Shoe {
        code: alloc.read_str(fields[0])?,
        info: alloc.read_str(fields[1])?,
        size: alloc.read_scalar(fields[2])?,
        available: alloc.read_scalar::<u8>(fields[3])? != 0,
        cost: alloc.read_scalar(fields[4])?,
        sale: alloc.read_scalar(fields[5])?,
        count: alloc.read_scalar(fields[6])?,
        category: alloc.read_str(fields[7])?,
    })
}

/// Profit summed over every record in `records`. Records that can't be
/// loaded count as zero. A single profit fits in `i64`, a sum of them may
/// not.
pub fn total_profit(alloc: &TrackingAlloc, records: &PtrStack<'_>) -> i128 {
    records
        .iter()
        .filter_map(|record| load(alloc, record))
        .map(|shoe| i128::from(shoe.profit()))
        .sum()
}
