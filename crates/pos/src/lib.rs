//! Proof-of-stake targets and kernel validation.

pub mod difficulty;
pub mod kernel;

pub use kernel::{
    check_kernel, KernelValidator, KernelVerdict, StakeKernel, TargetScaling, ValueWeighted,
};
