//! Custom resources served by this operator.

pub mod examples;
