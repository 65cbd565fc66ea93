#![warn(rust_2018_idioms)]

pub mod channel;
pub mod peer;
pub mod room;
pub mod rtp_listener;
pub mod rtp_parameters;
pub mod rtp_receiver;
pub mod transport;
pub mod worker;

pub use worker::Worker;
