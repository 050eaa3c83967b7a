//! Docker Runtime Module
//!
//! Docker implementation of the ContainerRuntime trait.

pub mod adapter;

pub use adapter::DockerRuntime;
