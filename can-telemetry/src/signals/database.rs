//! In-memory message definition database
//!
//! Holds every message definition loaded from a DBC file, in file order, with
//! an index by arbitration id for the decoder's per-frame lookup.

use crate::types::Result;
use std::collections::HashMap;
use std::path::Path;

/// A CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// Arbitration id (without the DBC extended-frame flag)
    pub id: u32,
    /// True for 29-bit identifiers
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Payload size in bytes
    pub size: usize,
    /// Sending node, if the DBC names one
    pub sender: Option<String>,
    pub signals: Vec<SignalDefinition>,
    /// Name of the multiplexer switch signal, if the message has one
    pub multiplexer_signal: Option<String>,
}

impl MessageDefinition {
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_signal.is_some()
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    pub name: String,
    /// Start bit in DBC numbering (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    /// Engineering unit (e.g., "V", "A", "degC")
    pub unit: Option<String>,
    /// Value table (raw value -> label)
    pub value_table: Option<HashMap<i64, String>>,
    /// Present when the signal is only valid for some multiplexer values
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// True for a single unscaled bit, decoded as a boolean
    pub fn is_flag(&self) -> bool {
        self.length == 1 && self.factor == 1.0 && self.offset == 0.0
    }

    /// True when factor/offset make the physical value non-integral
    pub fn is_scaled(&self) -> bool {
        self.factor != 1.0 || self.offset != 0.0
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Intel format
    LittleEndian,
    /// Motorola format
    BigEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// All message definitions from one DBC file
#[derive(Debug, Clone, Default)]
pub struct MessageDatabase {
    /// Definitions in file order
    messages: Vec<MessageDefinition>,
    /// Arbitration id -> index into `messages` (first definition wins)
    by_id: HashMap<u32, usize>,
    /// File the definitions were loaded from
    source: Option<String>,
}

impl MessageDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every message definition from a DBC file
    pub fn from_dbc(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let messages = crate::signals::dbc::parse_dbc_file(path)?;
        let mut db = Self::from_messages(messages);
        db.source = Some(path.display().to_string());
        Ok(db)
    }

    /// Build a database from already converted definitions
    pub fn from_messages(messages: impl IntoIterator<Item = MessageDefinition>) -> Self {
        let mut db = Self::new();
        for message in messages {
            db.add_message(message);
        }
        db
    }

    pub fn add_message(&mut self, message: MessageDefinition) {
        let index = self.messages.len();
        if let Some(existing) = self.by_id.get(&message.id) {
            log::warn!(
                "Duplicate definition for CAN ID 0x{:X}: keeping '{}', ignoring '{}' for lookups",
                message.id,
                self.messages[*existing].name,
                message.name
            );
        } else {
            self.by_id.insert(message.id, index);
        }
        self.messages.push(message);
    }

    /// Every definition, in file order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Definition for an arbitration id
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.by_id.get(&can_id).map(|index| &self.messages[*index])
    }

    pub fn get_message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages.iter().find(|m| m.name == name)
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
            num_multiplexed: self.messages.iter().filter(|m| m.is_multiplexed()).count(),
        }
    }

    /// All distinct arbitration ids, ascending
    pub fn can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub num_messages: usize,
    pub num_signals: usize,
    /// Messages with a multiplexer switch
    pub num_multiplexed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u32, name: &str) -> MessageDefinition {
        MessageDefinition {
            id,
            is_extended: false,
            name: name.to_string(),
            size: 8,
            sender: Some("BMS".to_string()),
            signals: vec![SignalDefinition {
                name: format!("{}_Value", name),
                start_bit: 0,
                length: 16,
                byte_order: ByteOrder::LittleEndian,
                value_type: ValueType::Unsigned,
                factor: 1.0,
                offset: 0.0,
                min: 0.0,
                max: 65535.0,
                unit: None,
                value_table: None,
                multiplexer_info: None,
            }],
            multiplexer_signal: None,
        }
    }

    #[test]
    fn test_empty_database() {
        let db = MessageDatabase::new();
        assert_eq!(db.stats().num_messages, 0);
        assert!(db.get_message(0x100).is_none());
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let db = MessageDatabase::from_messages(vec![
            message(0x200, "M2_Current"),
            message(0x100, "M1_CellVoltages"),
        ]);

        assert_eq!(db.get_message(0x100).unwrap().name, "M1_CellVoltages");
        assert_eq!(db.get_message_by_name("M2_Current").unwrap().id, 0x200);
        assert_eq!(db.can_ids(), vec![0x100, 0x200]);
        assert_eq!(db.messages()[0].name, "M2_Current");

        let stats = db.stats();
        assert_eq!(stats.num_messages, 2);
        assert_eq!(stats.num_signals, 2);
        assert_eq!(stats.num_multiplexed, 0);
    }

    #[test]
    fn test_duplicate_id_keeps_first_for_lookup() {
        let db = MessageDatabase::from_messages(vec![
            message(0x100, "First"),
            message(0x100, "Second"),
        ]);
        assert_eq!(db.get_message(0x100).unwrap().name, "First");
        assert_eq!(db.messages().len(), 2);
    }
}
