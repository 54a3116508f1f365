//! Module for the application layer protocols that run on top of an
//! [crate::l2::L2Connection]. Currently SAE J1979, the OBD-II scan tool
//! protocol.

pub mod j1979;
