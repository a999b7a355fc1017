//! Bluetooth Module
//!
//! Talks to the desk over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      DeskManager                         │
//! │  (Finds the desk, owns the current session, re-arms)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │ Transport │  │  Session   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - Adapter │  │ - Connect  │  │ - UUIDs  │
//! │ - Link    │  │ - Moves    │  │ - Opcodes│
//! │ - btleplug│  │ - Position │  │ - Frames │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Desk UUIDs, motor commands and position frame decoding
//! - [`transport`] - Adapter and link traits the rest of the crate is written against
//! - [`btle`] - btleplug implementation of the transport traits
//! - [`session`] - One connected desk: connection upkeep and the move loop
//! - [`manager`] - Discovery and session ownership
//! - [`scanner`] - One-shot scan listing nearby desks

pub mod btle;
pub mod manager;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

#[cfg(test)]
pub mod mock;
