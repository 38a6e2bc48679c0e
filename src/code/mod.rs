//! Hand-assembled instruction sequences, per architecture

pub mod x64;
