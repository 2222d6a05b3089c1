//! The in-memory resource graph describing the desired cloud topology of one
//! `LoadBalancerConfig`.

mod resources;
mod stack;

pub(crate) use resources::*;
pub(crate) use stack::*;
