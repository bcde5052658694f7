#![cfg_attr(not(test), no_std)]

pub mod family;
pub mod nat;

pub type SvcId = u32;
