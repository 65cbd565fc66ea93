#![warn(rust_2018_idioms)]

pub mod header;
pub mod rapid_resynchronization_request;
pub mod transport_layer_nack;

pub use header::Header;
pub use rapid_resynchronization_request::RapidResynchronizationRequest;
pub use transport_layer_nack::{nack_pairs_from_sequence_numbers, NackPair, TransportLayerNack};
