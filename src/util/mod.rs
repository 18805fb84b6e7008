pub mod arena;
pub mod cache;
pub mod coding;
pub mod crc;
pub mod hash;
