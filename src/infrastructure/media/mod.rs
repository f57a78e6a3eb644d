//! Media transport

pub mod relay;

pub use relay::RtpUdpStream;
