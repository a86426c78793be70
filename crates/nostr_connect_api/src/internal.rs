//! Internal utility functions - note, the api for anything in this module
//! is unstable and may change even for patch versions of this library.

pub mod util;
