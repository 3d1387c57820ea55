mod common;

#[cfg(feature = "int_test")]
mod process;
mod protocol;
