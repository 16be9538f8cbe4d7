pub mod buffer;
pub mod config;
pub mod defs;
pub mod event;
pub mod input;
pub mod isn;
pub mod output;
pub mod packet;
pub mod port_table;
pub mod rx_sar;
pub mod seq;
pub mod service;
pub mod session_lookup;
pub mod state_table;
pub mod stats;
pub mod timer;
pub mod tx_sar;
pub mod usrreq;
