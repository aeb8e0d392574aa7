//! 公共组件

pub mod crc;
pub mod error;
pub mod geo;
pub mod ntrip;
pub mod rtcm;
pub mod stats;
