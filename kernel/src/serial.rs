//! Serial port driver for debug output
//!
//! UART 16550 on COM1. This is the kernel console: boot messages, the
//! logger, and writes to fds 1/2 all end up here.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// Standard COM1 port address
const SERIAL_IO_PORT: u16 = 0x3F8;

lazy_static! {
    /// Global serial port instance protected by spinlock
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_IO_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Force initialization of the serial port
pub fn init() {
    let _ = SERIAL1.lock();
}

/// Print to serial port (internal use)
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    // Disable interrupts to prevent deadlock on the port lock
    interrupts::without_interrupts(|| {
        SERIAL1.lock().write_fmt(args).ok();
    });
}

/// Write raw bytes to the console (used by write(1/2, ..))
pub fn write_bytes(bytes: &[u8]) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let mut port = SERIAL1.lock();
        for &b in bytes {
            if b == b'\n' {
                port.write_char('\r').ok();
            }
            port.send(b);
        }
    });
}

/// Print to serial port
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Print to serial port with newline
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*
    ));
}
