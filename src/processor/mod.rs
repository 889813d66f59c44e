pub mod decoder;

pub use decoder::{decode, decode_value, RideEvent};
