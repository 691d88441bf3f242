//! Incoming directed message handling

mod assembler;

pub use self::assembler::{AssembledMessage, FragmentAssembler};
