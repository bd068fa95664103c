//! Signal decoding
//!
//! [`SignalDecoder`] turns a frame's payload into named physical values using
//! the message definitions of a [`MessageDatabase`]. The database is loaded
//! once and shared; decoding itself keeps no state between calls.

use crate::signals::{ByteOrder, MessageDatabase, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{DecodeError, DecodedSignal, Frame, Result, SignalValue};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Decodes frames against a shared message database
#[derive(Debug, Clone)]
pub struct SignalDecoder {
    database: Arc<MessageDatabase>,
}

impl SignalDecoder {
    /// Load definitions from a DBC file
    ///
    /// The file is read once; later edits on disk are not picked up.
    pub fn from_dbc(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(MessageDatabase::from_dbc(path)?))
    }

    pub fn from_database(database: MessageDatabase) -> Self {
        Self {
            database: Arc::new(database),
        }
    }

    pub fn database(&self) -> &MessageDatabase {
        &self.database
    }

    /// Decode `frame` into `signal name -> value`
    ///
    /// Fails with [`DecodeError::UnknownMessage`] when no definition exists for
    /// the arbitration id and with [`DecodeError::LengthMismatch`] when the
    /// payload is shorter than the definition. Extra trailing bytes are ignored.
    pub fn decode(&self, frame: &Frame) -> Result<BTreeMap<String, SignalValue>> {
        Ok(self
            .decode_signals(frame)?
            .into_iter()
            .map(|signal| (signal.name, signal.value))
            .collect())
    }

    /// Decode `frame` keeping unit, value label and raw value per signal
    pub fn decode_signals(&self, frame: &Frame) -> Result<Vec<DecodedSignal>> {
        let message = self
            .database
            .get_message(frame.arbitration_id)
            .ok_or(DecodeError::UnknownMessage(frame.arbitration_id))?;
        let signals = decode_message(&frame.data, message)?;
        log::trace!(
            "Decoded {} signal(s) from {} (0x{:X})",
            signals.len(),
            message.name,
            frame.arbitration_id
        );
        Ok(signals)
    }
}

/// Decode every active signal of `message` from `data`
pub fn decode_message(
    data: &[u8],
    message: &MessageDefinition,
) -> std::result::Result<Vec<DecodedSignal>, DecodeError> {
    if data.len() < message.size {
        return Err(DecodeError::LengthMismatch {
            id: message.id,
            name: message.name.clone(),
            expected: message.size,
            actual: data.len(),
        });
    }
    let data = &data[..message.size];

    let multiplexer_value = message
        .multiplexer_signal
        .as_deref()
        .and_then(|name| message.signal(name))
        .and_then(|switch| extract_signal_value(data, switch))
        .map(|value| value as u64);

    let mut decoded = Vec::with_capacity(message.signals.len());
    for signal in &message.signals {
        if let Some(mux) = &signal.multiplexer_info {
            match multiplexer_value {
                Some(current) if mux.multiplexer_values.contains(&current) => {}
                _ => continue,
            }
        }
        match decode_signal(data, signal) {
            Some(value) => decoded.push(value),
            None => log::warn!(
                "Signal '{}' does not fit in the {} byte(s) of {}",
                signal.name,
                data.len(),
                message.name
            ),
        }
    }
    Ok(decoded)
}

fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
    let raw_value = extract_signal_value(data, signal)?;

    let value = if signal.is_flag() {
        SignalValue::Boolean(raw_value != 0)
    } else if signal.is_scaled() {
        SignalValue::Float(signal.offset + signal.factor * raw_value as f64)
    } else {
        SignalValue::Integer(raw_value)
    };

    let value_description = signal
        .value_table
        .as_ref()
        .and_then(|table| table.get(&raw_value))
        .cloned();

    Some(DecodedSignal {
        name: signal.name.clone(),
        value,
        unit: signal.unit.clone(),
        value_description,
        raw_value,
    })
}

/// Raw (sign-extended when signed) value of `signal` in `data`
fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;
    if length == 0 || length > 64 {
        return None;
    }

    let raw = match signal.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, start_bit, length)?,
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length)?,
    };

    Some(match signal.value_type {
        ValueType::Unsigned => raw as i64,
        ValueType::Signed => sign_extend(raw, length),
    })
}

/// Intel layout: `start_bit` is the LSB, bits ascend through the payload
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    if start_bit + length > data.len() * 8 {
        return None;
    }
    let mut result: u64 = 0;
    for i in 0..length {
        let bit_pos = start_bit + i;
        let bit = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
        result |= u64::from(bit) << i;
    }
    Some(result)
}

/// Motorola layout: `start_bit` is the MSB in DBC sawtooth numbering
///
/// Within a byte the walk goes from bit 7 down to bit 0, then continues at
/// bit 7 of the next byte.
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut bit_pos = start_bit;
    for i in 0..length {
        let byte = *data.get(bit_pos / 8)?;
        let bit = (byte >> (bit_pos % 8)) & 0x01;
        result = (result << 1) | u64::from(bit);

        if i + 1 < length {
            bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
        }
    }
    Some(result)
}

fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }
    let sign_bit = 1u64 << (bit_length - 1);
    if value & sign_bit != 0 {
        (value | (!0u64 << bit_length)) as i64
    } else {
        value as i64
    }
}
