//! `seriallink-hal` – physical serial boundary.
//!
//! The bridge daemon never touches a UART directly; it talks to the
//! [`SerialDevice`] trait so the native driver can be swapped for the
//! in-memory [`SimSerial`] in tests.
//!
//! # Modules
//!
//! - [`device`] – the [`SerialDevice`] trait.
//! - [`native`] – [`NativeSerial`], backed by the `serialport` crate.
//! - [`sim`] – [`SimSerial`], a scripted device for headless tests.

pub mod device;
pub mod native;
pub mod sim;

pub use device::SerialDevice;
pub use native::NativeSerial;
pub use sim::SimSerial;
