pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod feature;
pub mod mbtiles;
pub mod pyramid;
pub mod tile;
