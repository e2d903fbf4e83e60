//! Platform abstraction layer: process enumeration, kill, and launch.

pub mod pal;
