//! BX Runtime Library
//!
//! The two print routines that compiled BX programs call. They are exported
//! with C ABI so the assembly emitted by `bxc` can reach them by symbol name;
//! link the generated `.s` against `libbx_runtime.a` to produce a runnable
//! binary.
//!
//! # Safety Contract
//!
//! These functions are designed to be called ONLY by compiler-generated code.
//! The compiler's type checker guarantees that `__bx_print_int` receives an
//! `int` value and `__bx_print_bool` a `bool` value (0 or 1 in the low bits
//! of a 64-bit register, per the System V calling convention).

/// Write a byte slice to fd 1, ignoring short writes only at EOF.
///
/// Uses `libc::write` directly rather than `std::io::stdout` so the output
/// interleaves correctly with anything else the host program writes to fd 1.
fn write_stdout(bytes: &[u8]) {
    let mut off = 0;
    while off < bytes.len() {
        let n = unsafe {
            libc::write(
                1,
                bytes[off..].as_ptr() as *const libc::c_void,
                bytes.len() - off,
            )
        };
        if n <= 0 {
            break;
        }
        off += n as usize;
    }
}

/// Print a 64-bit signed integer followed by a newline.
#[unsafe(no_mangle)]
pub extern "C" fn __bx_print_int(value: i64) {
    let mut text = value.to_string();
    text.push('\n');
    write_stdout(text.as_bytes());
}

/// Print a boolean followed by a newline. Any nonzero value is `true`.
#[unsafe(no_mangle)]
pub extern "C" fn __bx_print_bool(value: i64) {
    if value != 0 {
        write_stdout(b"true\n");
    } else {
        write_stdout(b"false\n");
    }
}
