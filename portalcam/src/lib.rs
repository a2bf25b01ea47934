//! # portalcam: desktop screencast as a virtual webcam
//!
//! Negotiates a screencast with xdg-desktop-portal, receives the frames
//! over PipeWire, converts them to YUYV and writes them to a
//! `v4l2loopback` device, where any webcam application can open them.
//!
//! ## Modes
//!
//! - **Capture** (default): portal session to loopback device. Needs the
//!   `desktop` feature.
//! - **Colour bars** (`--color-bars`): a static test pattern, no session.

pub mod config;
pub mod service;
