pub mod core;
pub mod manual_entry;
pub mod otm_import;
pub mod reference;
