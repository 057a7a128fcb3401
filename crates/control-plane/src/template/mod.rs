//! Expression evaluation for `TRANSFORM` nodes.

pub mod expression;

pub use expression::{ExpressionError, ExpressionEvaluator};
