//! Tests for the `int 0x80` gate

use super::{io_cpu, load};
use crate::cpu_ia32::VmError;

#[test]
fn test_exit_sets_halt_and_code() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"");

    // MOV EAX, 1; MOV EBX, 42; INT 0x80
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x01, 0x00, 0x00, 0x00, //
            0xBB, 0x2A, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..3 {
        cpu.step().unwrap();
    }

    assert!(cpu.is_halted());
    assert_eq!(cpu.exit_code(), 42);
}

#[test]
fn test_exit_code_truncated_to_low_byte() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"");

    // exit(0x1FF) reports 0xFF
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x01, 0x00, 0x00, 0x00, //
            0xBB, 0xFF, 0x01, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..3 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.exit_code(), 0xFF);
}

#[test]
fn test_write_to_stdout() {
    let (mut cpu, out, err) = io_cpu(0x1000, b"");

    // write(1, 0x200, 3) with "abc" at 0x200
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x04, 0x00, 0x00, 0x00, // MOV EAX, 4
            0xBB, 0x01, 0x00, 0x00, 0x00, // MOV EBX, 1
            0xB9, 0x00, 0x02, 0x00, 0x00, // MOV ECX, 0x200
            0xBA, 0x03, 0x00, 0x00, 0x00, // MOV EDX, 3
            0xCD, 0x80,
        ],
    );
    cpu.memory.set(0x200, b"abc").unwrap();
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(out.contents(), b"abc");
    assert!(err.contents().is_empty());
    assert_eq!(cpu.eax, 3, "write returns the byte count");
}

#[test]
fn test_write_to_stderr() {
    let (mut cpu, out, err) = io_cpu(0x1000, b"");

    // write(2, 0x200, 2)
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x04, 0x00, 0x00, 0x00, //
            0xBB, 0x02, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x02, 0x00, 0x00, //
            0xBA, 0x02, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    cpu.memory.set(0x200, b"hi").unwrap();
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(err.contents(), b"hi");
    assert!(out.contents().is_empty());
}

#[test]
fn test_read_from_stdin() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"input!");

    // read(0, 0x300, 6)
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x03, 0x00, 0x00, 0x00, //
            0xBB, 0x00, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x03, 0x00, 0x00, //
            0xBA, 0x06, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.eax, 6, "read returns the byte count");
    assert_eq!(cpu.memory.get(0x300, 6).unwrap(), b"input!");
}

#[test]
fn test_read_short_input() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"xy");

    // read(0, 0x300, 16) with only two bytes available
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x03, 0x00, 0x00, 0x00, //
            0xBB, 0x00, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x03, 0x00, 0x00, //
            0xBA, 0x10, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.eax, 2, "short read reports what arrived");
    assert_eq!(cpu.memory.get(0x300, 2).unwrap(), b"xy");
}

#[test]
fn test_write_unknown_fd_returns_minus_one() {
    let (mut cpu, out, err) = io_cpu(0x1000, b"");

    // write(7, 0x200, 1)
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x04, 0x00, 0x00, 0x00, //
            0xBB, 0x07, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x02, 0x00, 0x00, //
            0xBA, 0x01, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.eax, -1i32 as u32);
    assert!(out.contents().is_empty());
    assert!(err.contents().is_empty());
    assert!(!cpu.is_halted(), "bad fd is not fatal");
}

#[test]
fn test_read_from_write_only_fd_returns_minus_one() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"data");

    // read(1, 0x300, 4): fd 1 is not readable
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x03, 0x00, 0x00, 0x00, //
            0xBB, 0x01, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x03, 0x00, 0x00, //
            0xBA, 0x04, 0x00, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..5 {
        cpu.step().unwrap();
    }

    assert_eq!(cpu.eax, -1i32 as u32);
}

#[test]
fn test_unsupported_syscall_is_fatal() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"");

    // EAX=13 (time) is outside the supported subset
    load(
        &mut cpu,
        0x100,
        &[0xB8, 0x0D, 0x00, 0x00, 0x00, 0xCD, 0x80],
    );
    cpu.step().unwrap();
    let err = cpu.step().unwrap_err();
    assert!(matches!(err, VmError::UnsupportedSyscall { eax: 13, .. }));
}

#[test]
fn test_write_with_bad_buffer_is_fatal() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"");

    // write(1, 0xFF00, 0x200): buffer extends past memory end
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x04, 0x00, 0x00, 0x00, //
            0xBB, 0x01, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0xFF, 0x00, 0x00, //
            0xBA, 0x00, 0x02, 0x00, 0x00, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..4 {
        cpu.step().unwrap();
    }
    let err = cpu.step().unwrap_err();
    assert!(matches!(err, VmError::Mem { .. }));
}

#[test]
fn test_read_with_huge_count_is_fatal() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"data");

    // read(0, 0x300, 0x7FFFFFFF): the count is rejected against memory
    // bounds before any host-side buffer is sized from it
    load(
        &mut cpu,
        0x100,
        &[
            0xB8, 0x03, 0x00, 0x00, 0x00, //
            0xBB, 0x00, 0x00, 0x00, 0x00, //
            0xB9, 0x00, 0x03, 0x00, 0x00, //
            0xBA, 0xFF, 0xFF, 0xFF, 0x7F, //
            0xCD, 0x80,
        ],
    );
    for _ in 0..4 {
        cpu.step().unwrap();
    }
    let err = cpu.step().unwrap_err();
    assert!(matches!(err, VmError::Mem { .. }));
}

#[test]
fn test_interrupt_other_than_0x80_is_fatal() {
    let (mut cpu, _out, _err) = io_cpu(0x1000, b"");

    // CD 21 = INT 0x21 (DOS), not wired to anything here
    load(&mut cpu, 0x100, &[0xCD, 0x21]);
    let err = cpu.step().unwrap_err();
    assert!(matches!(err, VmError::UnknownOpcode { .. }));
}
