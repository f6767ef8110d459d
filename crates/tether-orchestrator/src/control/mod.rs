//! Backend control plane

mod client;

pub use client::ControlPlaneClient;
