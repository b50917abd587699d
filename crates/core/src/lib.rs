#![deny(warnings)]

pub mod capture;
pub mod classify;
pub mod config;
pub mod emotion;
pub mod playback;
pub mod recommend;
pub mod sampler;
pub mod session;
pub mod util;

#[cfg(test)]
mod test_support;
