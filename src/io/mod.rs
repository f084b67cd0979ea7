//! I/O modules for QC set definitions and persisted properties

pub mod flag_sets;
pub mod properties;

pub use flag_sets::{read_flag_set, write_flag_set, flag_set_from_xml, flag_set_to_xml};
pub use properties::{PropertyStore, MemoryPropertyStore, TomlPropertyStore};
