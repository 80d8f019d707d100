//! Client side of tidefs: the placeholder filesystem adapter, its
//! content cache and the workers that keep the mirrored tree fresh.

pub mod adapter;
pub mod cache;
pub mod mount;
pub mod subscriber;
pub mod transport;
pub mod tree;

#[cfg(test)]
mod tests;
