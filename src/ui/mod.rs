//! GUI components.

pub mod controls;
