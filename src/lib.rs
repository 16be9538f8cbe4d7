pub mod l2_l3;
pub mod tcp;

pub use tcp::{config::ToeConfig, usrreq::Toe};
