#![allow(dead_code)]
#![allow(unused_imports)]

pub mod error;
pub mod util;
pub mod log;
pub mod os;
pub mod settings;
pub mod executor;
pub mod interval_map;
pub mod state;
pub mod store;
pub mod curve;
pub mod source;
pub mod layout;
pub mod tracker;
