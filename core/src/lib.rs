pub mod bus;
pub mod controller;
pub mod device;
pub mod devices;
pub mod error;
pub mod opcode;
pub mod sense;
pub mod status;
pub mod target_set;
