//! Kubernetes resource helpers shared by the controller.

pub mod common;
pub mod ingress;
