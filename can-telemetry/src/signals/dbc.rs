//! DBC file loader
//!
//! Parses Vector DBC files with `can-dbc` and converts them into
//! [`MessageDefinition`]s.

use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{Result, TelemetryError, MAX_EXTENDED_ID};
use std::collections::HashMap;
use std::path::Path;

/// Bit 31 of a DBC message id marks a 29-bit identifier
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return its message definitions in file order
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        TelemetryError::DbcParse(format!("Failed to read file {:?}: {}", path, e))
    })?;
    parse_dbc_bytes(&bytes, &path.display().to_string())
}

/// Parse DBC text already in memory; `origin` names it in error messages
pub fn parse_dbc_bytes(bytes: &[u8], origin: &str) -> Result<Vec<MessageDefinition>> {
    // Many tools still write Windows-1252 DBCs; Latin-1 covers their byte range
    let content = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("DBC file {} is not UTF-8, reading it as Latin-1", origin);
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        TelemetryError::DbcParse(format!("Failed to parse DBC file {}: {:?}", origin, e))
    })?;

    let messages = dbc
        .messages()
        .iter()
        .map(|msg| convert_message(&dbc, msg))
        .collect::<Result<Vec<_>>>()?;

    log::info!("Parsed {} messages from {}", messages.len(), origin);
    Ok(messages)
}

fn convert_message(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message) -> Result<MessageDefinition> {
    let raw_id = dbc_msg.message_id().0;
    let is_extended = raw_id & DBC_EXTENDED_FLAG != 0;

    let multiplexer_signal = dbc_msg
        .signals()
        .iter()
        .find(|sig| {
            matches!(
                sig.multiplexer_indicator(),
                can_dbc::MultiplexIndicator::Multiplexor
                    | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_)
            )
        })
        .map(|sig| sig.name().to_string());

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|sig| {
            let value_table = value_table(dbc, dbc_msg, sig.name());
            convert_signal(sig, multiplexer_signal.as_deref(), value_table)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        id: raw_id & MAX_EXTENDED_ID,
        is_extended,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        multiplexer_signal,
    })
}

fn value_table(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    signal_name: &str,
) -> Option<HashMap<i64, String>> {
    let descriptions = dbc.value_descriptions_for_signal(dbc_msg.message_id().clone(), signal_name)?;
    if descriptions.is_empty() {
        return None;
    }
    Some(
        descriptions
            .iter()
            .map(|vd| (*vd.a() as i64, vd.b().to_string()))
            .collect(),
    )
}

fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal: Option<&str>,
    value_table: Option<HashMap<i64, String>>,
) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let switch_value = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(value) => Some(value),
        can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(value) => Some(value),
        _ => None,
    };
    let multiplexer_info = match switch_value {
        Some(value) => {
            let switch = multiplexer_signal.ok_or_else(|| {
                TelemetryError::DbcParse(format!(
                    "Multiplexed signal '{}' but no multiplexer found",
                    dbc_sig.name()
                ))
            })?;
            Some(MultiplexerInfo {
                multiplexer_signal: switch.to_string(),
                multiplexer_values: vec![value],
            })
        }
        None => None,
    };

    let length = *dbc_sig.signal_size();
    if length == 0 || length > 64 {
        return Err(TelemetryError::DbcParse(format!(
            "Signal '{}' has unsupported length {}",
            dbc_sig.name(),
            length
        )));
    }

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: length as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        multiplexer_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BMS_DBC: &str = r#"
VERSION ""

NS_ :
    CM_
    VAL_

BS_:

BU_: BMS VCU

BO_ 256 M1_CellVoltages: 8 BMS
 SG_ Cell1 : 0|16@1+ (0.001,0) [0|5] "V" VCU
 SG_ Cell2 : 16|16@1+ (0.001,0) [0|5] "V" VCU

BO_ 512 M2_Current: 4 BMS
 SG_ PackCurrent : 0|16@1- (0.1,0) [-3276.8|3276.7] "A" VCU
 SG_ State : 16|2@1+ (1,0) [0|3] "" VCU

BO_ 2566869221 J1939Status: 8 VCU
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" BMS
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" BMS
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" BMS

VAL_ 512 State 0 "Idle" 1 "Charging" 2 "Discharging" 3 "Fault" ;
"#;

    fn write_dbc(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_parse_messages_and_signals() {
        let file = write_dbc(BMS_DBC);
        let messages = parse_dbc_file(file.path()).unwrap();
        assert_eq!(messages.len(), 3);

        let cells = &messages[0];
        assert_eq!(cells.id, 0x100);
        assert_eq!(cells.name, "M1_CellVoltages");
        assert_eq!(cells.size, 8);
        assert_eq!(cells.sender, Some("BMS".to_string()));
        assert!(!cells.is_extended);

        let cell1 = &cells.signals[0];
        assert_eq!(cell1.start_bit, 0);
        assert_eq!(cell1.length, 16);
        assert_eq!(cell1.factor, 0.001);
        assert_eq!(cell1.unit, Some("V".to_string()));

        let current = messages[1].signal("PackCurrent").unwrap();
        assert_eq!(current.value_type, ValueType::Signed);
    }

    #[test]
    fn test_extended_id_is_masked() {
        let file = write_dbc(BMS_DBC);
        let messages = parse_dbc_file(file.path()).unwrap();
        let j1939 = &messages[2];
        assert!(j1939.is_extended);
        assert_eq!(j1939.id, 0x18FF_50E5);
    }

    #[test]
    fn test_multiplexer_and_value_table() {
        let file = write_dbc(BMS_DBC);
        let messages = parse_dbc_file(file.path()).unwrap();

        let j1939 = &messages[2];
        assert_eq!(j1939.multiplexer_signal, Some("Mode".to_string()));
        let signal_b = j1939.signal("SignalB").unwrap();
        let mux = signal_b.multiplexer_info.as_ref().unwrap();
        assert_eq!(mux.multiplexer_signal, "Mode");
        assert_eq!(mux.multiplexer_values, vec![1]);

        let state = messages[1].signal("State").unwrap();
        let table = state.value_table.as_ref().unwrap();
        assert_eq!(table.get(&1), Some(&"Charging".to_string()));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_latin1_fallback() {
        let mut bytes = BMS_DBC.replace("\"A\"", "\"\u{00B0}C\"").into_bytes();
        // Re-encode the degree sign as a single Latin-1 byte
        if let Some(pos) = bytes.windows(2).position(|w| w == [0xC2, 0xB0]) {
            bytes.remove(pos);
        }
        let messages = parse_dbc_bytes(&bytes, "latin1.dbc").unwrap();
        let current = messages[1].signal("PackCurrent").unwrap();
        assert_eq!(current.unit, Some("\u{00B0}C".to_string()));
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let result = parse_dbc_file(Path::new("/nonexistent/file.dbc"));
        assert!(matches!(result, Err(TelemetryError::DbcParse(_))));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let result = parse_dbc_bytes(b"this is not a dbc file", "garbage.dbc");
        assert!(matches!(result, Err(TelemetryError::DbcParse(_))));
    }
}
