pub mod defs;
pub mod ip;
