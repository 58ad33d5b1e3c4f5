pub mod bar_buffer;
pub mod csv_loader;

// Re-export the Bar types for convenient access (e.g. `use crate::market_data::Bar`).
pub use bar_buffer::{Bar, BarBuffer, BarInsert, RejectionStats};
