//! Hardware access: fault signal lines (sysfs GPIO) and the PECI
//! maintenance channel to the processor sockets.

pub mod gpio;
pub mod peci;
pub mod registers;
