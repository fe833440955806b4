pub mod attention;
pub mod bench;
pub mod compare;
pub mod datatype;
pub mod device;
pub mod driver;
pub mod error;
pub mod gemm;
pub mod model;
#[cfg(target_os = "macos")]
mod pipeline;
pub mod shape;
pub mod summarize;
pub mod tensor;
pub mod timer;
mod utils;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};

/// Returns `Error::Shape` from the enclosing function when the condition does not hold.
#[macro_export]
macro_rules! assert_result {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::Error::Shape(format!($($arg)+)));
        }
    };
}

/// Returns `Error::Shape` from the enclosing function when the two values differ.
#[macro_export]
macro_rules! assert_eq_result {
    ($left:expr, $right:expr, $($arg:tt)+) => {
        if $left != $right {
            return Err($crate::Error::Shape(format!($($arg)+)));
        }
    };
}
